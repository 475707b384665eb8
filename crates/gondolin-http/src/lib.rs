//! HTTP/1.x interception: head parsing, the `RequestHooks` extension
//! surface, Basic-auth decode/encode, and secret placeholder substitution
//! bound to a per-secret host allowlist.

#![warn(missing_docs)]
#![allow(dead_code)]

mod basic_auth;
mod hooks;
mod interceptor;
mod parse;
mod secrets;

pub use basic_auth::{decode as decode_basic_auth, encode as encode_basic_auth, BasicCredentials};
pub use hooks::{BufferedRequest, BufferedResponse, HookDecision, NoopHooks, RequestHooks};
pub use interceptor::{process_request, process_response, InterceptOutcome, ResponseOutcome};
pub use parse::{parse_request_head, parse_response_head, render_request_head, RequestHead, ResponseHead};
pub use secrets::{find_leaked_secret, substitute, SubstitutionResult};
