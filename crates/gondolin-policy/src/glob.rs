//! Host-glob compilation and caching.
//!
//! Policy configs express allowed hosts as globs (`*.example.com`,
//! `api.internal`). Compiling a glob to a `Regex` on every lookup would
//! dominate the hot path, so compiled patterns are cached by their source
//! string.

use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;

/// Compiles glob patterns to anchored, case-insensitive regexes and caches
/// the result so repeated lookups against the same pattern are a hash-map
/// hit rather than a recompile.
#[derive(Default)]
pub struct GlobCache {
    compiled: DashMap<String, Arc<Regex>>,
}

impl GlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&self, pattern: &str, candidate: &str) -> bool {
        let re = self.compile(pattern);
        re.is_match(candidate)
    }

    fn compile(&self, pattern: &str) -> Arc<Regex> {
        if let Some(existing) = self.compiled.get(pattern) {
            return existing.clone();
        }
        let re = Arc::new(Regex::new(&glob_to_regex(pattern)).unwrap_or_else(|_| {
            // An unparsable pattern should never match anything rather than
            // panic the admission path.
            Regex::new("$.^").expect("static never-match regex")
        }));
        self.compiled.insert(pattern.to_string(), re.clone());
        re
    }
}

/// Translates a `*`-only glob into an anchored, case-insensitive regex.
/// `*` matches any run of characters including dots, so `*.example.com`
/// also matches `example.com` only if the pattern explicitly allows it
/// (it does not; callers that want the bare apex domain list it separately).
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2 + 8);
    out.push_str("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '.' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_subdomain_matches() {
        let cache = GlobCache::new();
        assert!(cache.matches("*.example.com", "api.example.com"));
        assert!(cache.matches("*.example.com", "a.b.example.com"));
        assert!(!cache.matches("*.example.com", "example.com"));
        assert!(!cache.matches("*.example.com", "evil-example.com"));
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let cache = GlobCache::new();
        assert!(cache.matches("Api.Example.COM", "api.example.com"));
    }

    #[test]
    fn dots_are_literal_not_wildcards() {
        let cache = GlobCache::new();
        assert!(!cache.matches("api.example.com", "apiXexampleXcom"));
    }
}
