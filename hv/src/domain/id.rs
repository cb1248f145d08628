//! Domain ID generation
//!
//! All IDs use the format: `{8-char-hex}-{kind}-{slug}`
//! Example: `3f9c0a21-story-add-oauth-login`

/// Generate a domain ID from a record kind and a human title
pub fn generate_id(kind: &str, title: &str) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{}-{}", short_hex(), kind)
    } else {
        format!("{}-{}-{}", short_hex(), kind, slug)
    }
}

/// Eight hex characters from the random tail of a UUIDv7
pub fn short_hex() -> String {
    let simple = uuid::Uuid::now_v7().simple().to_string();
    simple[simple.len() - 8..].to_string()
}

/// Slugify a title for use in IDs and session names
pub fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(6)
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_format() {
        let id = generate_id("story", "Add OAuth login");
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0].len(), 8);
        assert!(parts[0].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(parts[1], "story");
        assert_eq!(parts[2], "add-oauth-login");
    }

    #[test]
    fn test_generate_id_empty_title() {
        let id = generate_id("agent", "");
        assert!(id.ends_with("-agent"));
    }

    #[test]
    fn test_generate_id_unique() {
        let a = generate_id("agent", "senior");
        let b = generate_id("agent", "senior");
        assert_ne!(a, b);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Don't Panic!"), "dont-panic");
        assert_eq!(slugify("  spaces   everywhere "), "spaces-everywhere");
        assert_eq!(slugify("a b c d e f g h"), "a-b-c-d-e-f");
    }
}
