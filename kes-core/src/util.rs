//! Shared utilities.

/// Redact a secret for logging, keeping only a length indicator.
///
/// Passwords and tokens must never reach the log stream in full; call sites
/// log `redact_secret(..)` instead of the value.
pub fn redact_secret(secret: &str) -> String {
    if secret.is_empty() {
        "<empty>".to_string()
    } else {
        format!("<{} chars>", secret.chars().count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_hides_content() {
        let masked = redact_secret("abc123");
        assert!(!masked.contains("abc123"));
        assert_eq!(masked, "<6 chars>");
    }

    #[test]
    fn empty_secret_is_marked() {
        assert_eq!(redact_secret(""), "<empty>");
    }
}
