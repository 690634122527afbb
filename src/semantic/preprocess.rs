//! Text preparation for embedding input and stored/presented snippets.
//!
//! Every bound counts characters (Unicode scalar values), so truncation never
//! splits a multi-byte sequence.

/// Maximum content length fed to the model, before the title is prepended.
pub const MAX_EMBED_CONTENT_CHARS: usize = 5000;

/// Snippet length kept when an event is indexed.
pub const INDEX_SNIPPET_CHARS: usize = 500;

/// Hard cap on a snippet written to the store.
pub const STORED_SNIPPET_CHARS: usize = 2000;

/// Snippet length returned to API callers.
pub const PRESENTED_SNIPPET_CHARS: usize = 200;

/// Return the longest prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Build the model input for a content item: `"{title} {content}"`, trimmed,
/// with the content capped at `MAX_EMBED_CONTENT_CHARS` first.
pub fn embedding_input(title: &str, content: &str) -> String {
    let content = truncate_chars(content, MAX_EMBED_CONTENT_CHARS);
    format!("{} {}", title, content).trim().to_string()
}

/// Snippet stored alongside the embedding at index time.
pub fn index_snippet(content: &str) -> &str {
    truncate_chars(content, INDEX_SNIPPET_CHARS)
}
