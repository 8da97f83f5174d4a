//! Line-aligned text chunker.
//!
//! Chunks never split a line. Each chunk after the first is seeded with a
//! tail of the previous chunk (at least `chunk_overlap` bytes of whole lines)
//! so that retrieval hits near a boundary still carry surrounding context.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub start_line: usize,
    pub num_lines: usize,
    pub chunk_index: usize,
}

/// Split `content` into overlapping chunks of roughly `chunk_size` bytes.
///
/// The size bound is soft: a single line longer than `chunk_size` becomes its
/// own oversized chunk.
pub fn chunk_text(content: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();
    let mut buffer_len = 0usize;
    let mut start_line = 0usize;

    for (line_index, line) in content.split('\n').enumerate() {
        let line_len = line.len() + 1;

        if buffer_len + line_len > chunk_size && !buffer.is_empty() {
            push_chunk(&mut chunks, &buffer, start_line);

            let mut overlap_start = buffer.len();
            let mut overlap_len = 0usize;
            while overlap_start > 0 && overlap_len < chunk_overlap {
                overlap_start -= 1;
                overlap_len += buffer[overlap_start].len() + 1;
            }
            let carried = buffer.len() - overlap_start;

            buffer.drain(..overlap_start);
            buffer.push(line);
            buffer_len = overlap_len + line_len;
            start_line = line_index - carried;
        } else {
            if buffer.is_empty() {
                start_line = line_index;
            }
            buffer.push(line);
            buffer_len += line_len;
        }
    }

    if buffer.iter().any(|line| !line.trim().is_empty()) {
        push_chunk(&mut chunks, &buffer, start_line);
    }

    chunks
}

/// Content with nothing but whitespace produces no chunks and is never indexed.
pub fn is_blank(content: &str) -> bool {
    content.trim().is_empty()
}

fn push_chunk(chunks: &mut Vec<Chunk>, lines: &[&str], start_line: usize) {
    chunks.push(Chunk {
        text: lines.join("\n").trim_end().to_string(),
        start_line,
        num_lines: lines.len(),
        chunk_index: chunks.len(),
    });
}
