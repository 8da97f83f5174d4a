use uuid::Uuid;

/// Content fingerprint used to decide whether a file needs re-indexing.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Stable point id for one chunk of one file.
///
/// Qdrant only accepts unsigned integers or UUIDs as ids, so the digest is
/// truncated to 16 bytes and rendered as a UUID.
pub fn point_id(external_id: &str, chunk_index: usize) -> String {
    let digest = blake3::hash(format!("{external_id}:{chunk_index}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    Uuid::from_bytes(bytes).hyphenated().to_string()
}
