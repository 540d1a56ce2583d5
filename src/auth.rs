/// Bearer-token check for mutating endpoints. The token comparison is plain
/// string equality; the token itself is an opaque secret from config.
pub fn check_token(auth_header: Option<&str>, expected: &str) -> bool {
    match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token == expected,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_token() {
        assert!(check_token(Some("Bearer secret"), "secret"));
    }

    #[test]
    fn test_wrong_token() {
        assert!(!check_token(Some("Bearer wrong"), "secret"));
    }

    #[test]
    fn test_missing_header() {
        assert!(!check_token(None, "secret"));
    }

    #[test]
    fn test_missing_bearer_prefix() {
        assert!(!check_token(Some("secret"), "secret"));
    }
}
