use std::path::Path;

use tracing::{debug, warn};

use super::plan::external_id_for;
use super::SyncError;
use crate::hash::content_hash;
use crate::store::{FileMetadata, FileSource, Store, UploadOptions};

const QUOTA_MARKERS: [&str; 4] = ["Free tier", "quota", "rate limit", "Upgrade your plan"];

/// Whether a backend error means the account is out of capacity.
///
/// Backends only report this in free text today; keep every caller going
/// through here so a structured error code can replace the substring match.
pub fn is_quota_message(message: &str) -> bool {
    QUOTA_MARKERS.iter().any(|marker| message.contains(marker))
}

pub(crate) fn classify(err: anyhow::Error) -> SyncError {
    let message = format!("{err:#}");
    if is_quota_message(&message) {
        SyncError::QuotaExceeded(message)
    } else {
        SyncError::Store(err)
    }
}

/// Upload one file, replacing whatever the store holds for it.
///
/// Returns `Ok(false)` when nothing was uploaded: the file is empty, the store
/// found nothing to index, or the streamed upload failed and the content looks
/// binary. Text files get one retry from an in-memory copy.
pub async fn upload_file(
    store: &dyn Store,
    store_id: &str,
    path: &Path,
) -> Result<bool, SyncError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.is_empty() {
        return Ok(false);
    }

    let external_id = external_id_for(path);
    let options = UploadOptions {
        external_id: external_id.clone(),
        overwrite: true,
        metadata: Some(FileMetadata {
            path: external_id,
            hash: content_hash(&bytes),
        }),
    };

    let streamed = match FileSource::open(path).await {
        Ok(source) => store.upload_file(store_id, source, &options).await,
        Err(err) => Err(anyhow::Error::new(err)),
    };
    let stream_err = match streamed {
        Ok(indexed) => return Ok(indexed),
        Err(err) => classify(err),
    };
    if stream_err.is_quota() {
        return Err(stream_err);
    }

    if is_probably_binary(&bytes) {
        debug!(path = %path.display(), "skipping binary file");
        return Ok(false);
    }

    warn!(path = %path.display(), error = %stream_err, "streamed upload failed; retrying from memory");
    store
        .upload_file(store_id, FileSource::Bytes(bytes), &options)
        .await
        .map_err(classify)
}

fn is_probably_binary(bytes: &[u8]) -> bool {
    is_probably_binary_with_threshold(bytes, 0.33)
}

fn is_probably_binary_with_threshold(bytes: &[u8], threshold: f64) -> bool {
    if bytes.contains(&0) {
        return true;
    }
    if std::str::from_utf8(bytes).is_ok() {
        return false;
    }

    let non_printable = bytes
        .iter()
        .filter(|&&b| !(b == b'\n' || b == b'\r' || b == b'\t' || (0x20..=0x7E).contains(&b)))
        .count();
    let ratio = non_printable as f64 / bytes.len() as f64;
    ratio >= threshold.clamp(0.0, 1.0)
}
