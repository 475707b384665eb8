//! Admission policy (host allowlist, internal-IP denial) and the secret
//! substitution allowlist that backs the HTTP interceptor's placeholder
//! replacement.

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod admission;
pub mod engine;
pub mod glob;
pub mod secrets;

pub use admission::is_internal;
pub use engine::{EngineStats, PolicyConfig, PolicyEngine};
pub use glob::GlobCache;
pub use secrets::{SecretPolicy, SecretValue};
