//! Source identifier normalization.
//!
//! Canonical names and aliases are compared case-insensitively with internal
//! whitespace collapsed: every run of whitespace becomes a single space and
//! leading/trailing whitespace is dropped. Tokens are never joined, so
//! `"3FGL  J1104.4+3812"` and `"3fgl j1104.4+3812"` share a key while
//! `"3fglj1104.4+3812"` does not.

/// Returns the lookup key for a source identifier.
///
/// # Examples
///
/// ```
/// use roi_core::normalize_name;
///
/// assert_eq!(normalize_name("  Mkn \t 421 "), "mkn 421");
/// assert_ne!(normalize_name("3FGL J1104.4+3812"), normalize_name("3fglj1104.4+3812"));
/// ```
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for token in name.split_whitespace() {
        if !key.is_empty() {
            key.push(' ');
        }
        key.extend(token.chars().flat_map(char::to_lowercase));
    }
    key
}
