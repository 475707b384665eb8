//! The three-hook extension surface a host embedder can plug into the
//! interceptor: inspect/deny a request before its body is read, rewrite a
//! fully-buffered request, and inspect/rewrite the response. None of these
//! hooks ever run on the guest's side of the boundary, and none of them
//! receive the reasoning behind a policy decision — only the outcome.

use crate::parse::{RequestHead, ResponseHead};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Continue,
    Deny,
}

/// Buffered request body, handed to `on_request` only after the full body
/// has arrived (bounded by the connection's body size limit).
pub struct BufferedRequest {
    pub head: RequestHead,
    pub body: Vec<u8>,
}

pub struct BufferedResponse {
    pub head: ResponseHead,
    pub body: Vec<u8>,
}

/// Implemented by the host embedder. All three methods default to
/// allowing everything unmodified, matching the "no hooks configured"
/// behavior of forwarding traffic as-is.
pub trait RequestHooks: Send + Sync {
    fn on_request_head(&self, head: &RequestHead) -> HookDecision {
        let _ = head;
        HookDecision::Continue
    }

    fn on_request(&self, request: &mut BufferedRequest) -> HookDecision {
        let _ = request;
        HookDecision::Continue
    }

    fn on_response(&self, response: &mut BufferedResponse) -> HookDecision {
        let _ = response;
        HookDecision::Continue
    }
}

/// The hook set used when the host supplies none: pass everything through.
pub struct NoopHooks;

impl RequestHooks for NoopHooks {}
