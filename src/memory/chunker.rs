use crate::error::{MemoryError, MemoryResult};

pub(crate) const CHUNK_SIZE: usize = 500;
pub(crate) const CHUNK_OVERLAP: usize = 50;

/// Split `text` into windows of `size` characters, each starting
/// `size - overlap` characters after the previous one. The last window is
/// the first one that reaches the end of the text, so it may be shorter.
///
/// `overlap` must be strictly smaller than `size`, otherwise the windows
/// would never advance.
pub(crate) fn chunk_text(text: &str, size: usize, overlap: usize) -> MemoryResult<Vec<String>> {
    if size == 0 || overlap >= size {
        return Err(MemoryError::InvalidChunking { size, overlap });
    }

    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= size {
        return Ok(vec![text.to_string()]);
    }

    let step = size - overlap;
    let mut chunks = Vec::with_capacity(chars.len().div_ceil(step));
    let mut start = 0;
    loop {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    Ok(chunks)
}
