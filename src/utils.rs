//! Small stateless helpers shared by more than one module: wall-clock
//! timestamps, content hashing for the embedding cache, and the
//! preview-truncation used by the context store's oversized-content guard.

use md5::{Digest, Md5};

/// Current wall time in milliseconds since the epoch. The worker and the
/// context store both stamp records with this rather than reaching for
/// `SystemTime` at each call site.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current wall time in whole seconds, used for retry-set scores.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Hex-encoded MD5 of `text`, used as the embedding cache's `content_hash`
/// and as the ETag fallback when an OpenAPI source provides neither ETag
/// nor Last-Modified.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Truncates `text` to at most `max_chars` characters on a char boundary,
/// for building the `preview` field of an oversized-content summary
/// envelope.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
