//! Decoding and re-encoding of `Authorization: Basic` so hooks can see
//! (and, if they choose, rewrite) the username/password pair rather than
//! an opaque base64 blob.

use base64::{engine::general_purpose::STANDARD, Engine};

pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Decodes an `Authorization: Basic <...>` header value. Returns `None`
/// for any other scheme or malformed payload; the caller leaves those
/// headers untouched.
pub fn decode(header_value: &str) -> Option<BasicCredentials> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

pub fn encode(creds: &BasicCredentials) -> String {
    let raw = format!("{}:{}", creds.username, creds.password);
    format!("Basic {}", STANDARD.encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_username_and_password() {
        let header = encode(&BasicCredentials {
            username: "alice".into(),
            password: "{{secrets.db_password}}".into(),
        });
        let decoded = decode(&header).unwrap();
        assert_eq!(decoded.username, "alice");
        assert_eq!(decoded.password, "{{secrets.db_password}}");
    }

    #[test]
    fn non_basic_scheme_is_ignored() {
        assert!(decode("Bearer abc123").is_none());
    }

    #[test]
    fn malformed_base64_is_ignored() {
        assert!(decode("Basic not-valid-base64!!").is_none());
    }
}
