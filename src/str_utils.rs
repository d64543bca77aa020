/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Safely returns a suffix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn suffix_chars(s: &str, max_chars: usize) -> &str {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s;
    }
    match s.char_indices().nth(char_count - max_chars) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Masks a secret, keeping only the last `visible` characters.
/// Secrets no longer than `visible` are replaced with a fixed `****`.
pub fn mask_keep_suffix(secret: &str, visible: usize) -> String {
    let count = secret.chars().count();
    if count <= visible {
        return "****".to_string();
    }
    let mut masked = "*".repeat(count - visible);
    masked.push_str(suffix_chars(secret, visible));
    masked
}

/// Short preview for logs, with an ellipsis when cut.
pub fn preview(s: &str, max_chars: usize) -> String {
    let head = prefix_chars(s, max_chars);
    if head.len() < s.len() {
        format!("{}…", head)
    } else {
        head.to_string()
    }
}
