//! Placeholder substitution: replaces a secret's placeholder token with
//! its real value in headers, body and (only when explicitly opted in)
//! query strings, but only for a request bound to one of that secret's
//! allowlisted hosts. A request to any other host fails outright rather
//! than forwarding the placeholder or the value.
//!
//! This module also scans *already-decoded* outbound text for a secret's
//! raw value, independent of any placeholder — a guest that learns a
//! secret some other way (or just echoes a previously-substituted header
//! back at a different host) must not be able to smuggle it out.

use gondolin_policy::{PolicyEngine, SecretPolicy, SecretValue};

pub struct SubstitutionResult {
    pub text: String,
    /// `true` if a placeholder was found bound to a host not on that
    /// secret's allowlist. Always fails the request.
    pub host_denied: bool,
    /// The placeholder that triggered `host_denied`, so the caller can
    /// report which secret without re-scanning the text.
    pub denied_placeholder: Option<String>,
    /// `true` if a placeholder was found in a query string but that
    /// secret's `replace_in_query` is off. The placeholder is left
    /// intact and the request still goes out; this is an intentional
    /// asymmetry, not a denial.
    pub query_gated: bool,
    pub substituted: bool,
}

/// Substitutes secret placeholders in `text` for a request bound to `host`.
/// `in_query` should be `true` only when `text` is a URL query string —
/// `SecretPolicy::replace_in_query` gates substitution there specifically.
pub fn substitute(engine: &PolicyEngine, text: &str, host: &str, in_query: bool) -> SubstitutionResult {
    let mut out = text.to_string();
    let mut substituted = false;
    let mut host_denied = false;
    let mut denied_placeholder = None;
    let mut query_gated = false;

    loop {
        let Some(secret) = engine.find_secret(&out) else {
            break;
        };
        if in_query && !secret.replace_in_query {
            query_gated = true;
            break;
        }
        if !engine.secret_allowed_for_host(&secret, host) {
            host_denied = true;
            denied_placeholder = Some(secret.placeholder);
            break;
        }
        out = out.replace(&secret.placeholder, &secret.value);
        substituted = true;
    }

    SubstitutionResult { text: out, host_denied, denied_placeholder, query_gated, substituted }
}

/// Scans already-decoded text for the raw value of any secret not
/// allowlisted for `host`, catching exfiltration that never goes through
/// a placeholder at all.
pub fn find_leaked_secret(engine: &PolicyEngine, text: &str, host: &str) -> Option<SecretPolicy> {
    engine.secrets_not_allowed_for(host).into_iter().find(|secret| {
        let value = SecretValue::new(&secret.value);
        !value.expose().is_empty() && text.contains(value.expose())
    })
}
