//! Agent bearer tokens and registration code values.
//!
//! - Tokens are 32 random bytes, hex-encoded (64 chars)
//! - Registration codes are 16 random bytes, hex-encoded (32 chars)
//! - Stored tokens are compared in constant time

use rand::Rng;
use subtle::ConstantTimeEq;

/// Generate a cryptographically random agent token.
pub fn generate_token() -> String {
    random_hex::<32>()
}

/// Generate a registration code value.
pub fn generate_code() -> String {
    random_hex::<16>()
}

/// Constant-time check of a presented token against the stored one.
pub fn tokens_match(stored: &str, presented: &str) -> bool {
    stored.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Pull the token out of an `Authorization` header value.
///
/// Accepts `Bearer <token>` and, for older agents, the bare token.
pub fn parse_authorization(value: &str) -> Option<&str> {
    let value = value.trim();
    let token = match value.split_once(' ') {
        Some(("Bearer", token)) => token.trim(),
        Some(_) => return None,
        None => value,
    };
    if token.is_empty() { None } else { Some(token) }
}

fn random_hex<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill(&mut bytes[..]);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 64); // 32 bytes hex = 64 chars
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        assert_eq!(generate_code().len(), 32);
    }

    #[test]
    fn test_token_is_random() {
        let t1 = generate_token();
        let t2 = generate_token();
        assert_ne!(t1, t2);
    }

    #[test]
    fn test_tokens_match() {
        let token = generate_token();
        assert!(tokens_match(&token, &token.clone()));
        assert!(!tokens_match(&token, "wrong-token"));
        assert!(!tokens_match(&token, ""));
    }

    #[test]
    fn test_parse_authorization() {
        assert_eq!(parse_authorization("Bearer abc123"), Some("abc123"));
        assert_eq!(parse_authorization("abc123"), Some("abc123"));
        assert_eq!(parse_authorization("Basic dXNlcjpwYXNz"), None);
        assert_eq!(parse_authorization("Bearer "), None);
        assert_eq!(parse_authorization(""), None);
    }
}
