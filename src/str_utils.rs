use std::borrow::Cow;

/// Returns a prefix of the string with at most `max_chars` characters,
/// respecting UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Log-friendly preview: the first `max_chars` characters plus an ellipsis when cut.
pub fn preview(s: &str, max_chars: usize) -> Cow<'_, str> {
    let head = prefix_chars(s, max_chars);
    if head.len() == s.len() {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("{}...", head))
    }
}

/// Keeps the first and last four characters of a credential.
pub fn mask_secret(key: &str) -> String {
    let count = key.chars().count();
    if count <= 8 {
        return "****************".to_string();
    }
    let tail: String = key.chars().skip(count - 4).collect();
    format!("{}****{}", prefix_chars(key, 4), tail)
}
