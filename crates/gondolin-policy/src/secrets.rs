//! Secret placeholder definitions and the per-secret host allowlist that
//! keeps a secret from ever reaching a destination its owner did not name.

use serde::{Deserialize, Serialize};

/// A single secret the guest may reference by placeholder but never see in
/// cleartext. `value` lives only on the host side of the boundary and is
/// never logged or serialized back toward the guest.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretPolicy {
    /// Placeholder token the guest embeds, e.g. `{{secrets.github_token}}`.
    pub placeholder: String,

    /// The real value. Skipped on `Debug`/log output by callers; this type
    /// does not implement `Display`.
    #[serde(skip_serializing)]
    pub value: String,

    /// Host globs this secret may be substituted into. A request to any
    /// other host is denied rather than sent with the placeholder intact.
    pub allowed_hosts: Vec<String>,

    /// Whether this secret may additionally be substituted into URL query
    /// strings, not just headers/body. Defaults to `false`: query strings
    /// land in proxy logs and browser history far more often than headers
    /// do, so the asymmetry is deliberate and not a gap to "fix".
    #[serde(default)]
    pub replace_in_query: bool,
}

impl std::fmt::Debug for SecretValue<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Wrapper that forbids accidentally formatting a secret value into a log
/// line; the only way to get the bytes out is `expose()`.
pub struct SecretValue<'a>(&'a str);

impl<'a> SecretValue<'a> {
    pub fn new(value: &'a str) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_value_never_formats_its_contents() {
        let v = SecretValue::new("super-secret-token");
        let rendered = format!("{:?}", v);
        assert_eq!(rendered, "<redacted>");
    }

    #[test]
    fn default_replace_in_query_is_false() {
        let json = r#"{"placeholder":"{{x}}","value":"v","allowed_hosts":["api.example.com"]}"#;
        let policy: SecretPolicy = serde_json::from_str(json).unwrap();
        assert!(!policy.replace_in_query);
    }
}
