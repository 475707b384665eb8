//! Drives one HTTP/1.x request through the full pipeline: admission,
//! `onRequestHead`, body buffering, secret substitution, `onRequest`,
//! the exfiltration scan, forwarding, then `onResponse` on the way back.

use crate::basic_auth::{self, BasicCredentials};
use crate::hooks::{BufferedRequest, BufferedResponse, HookDecision, RequestHooks};
use crate::parse::{parse_request_head, parse_response_head, render_request_head, ResponseHead};
use crate::secrets;
use gondolin_common::error::{GondolinError, GondolinResult};
use gondolin_policy::PolicyEngine;

pub enum InterceptOutcome {
    Forward { request_head: Vec<u8>, body: Vec<u8> },
    Deny { reason: String },
}

/// Runs admission, the hook pipeline, secret substitution and the
/// exfiltration scan over one buffered request. Does not itself perform
/// I/O — callers own reading the body off the wire and writing the
/// (possibly rewritten) request upstream.
pub fn process_request(
    engine: &PolicyEngine,
    hooks: &dyn RequestHooks,
    raw_head: &[u8],
    body: Vec<u8>,
) -> GondolinResult<InterceptOutcome> {
    let head = parse_request_head(raw_head)
        .ok_or_else(|| GondolinError::MalformedPacket("incomplete HTTP request head".into()))?;

    let Some(host) = head.host() else {
        return Ok(InterceptOutcome::Deny { reason: "missing Host header".to_string() });
    };
    let host = host.to_string();

    if !engine.is_host_allowed(&host) {
        return Ok(InterceptOutcome::Deny { reason: "host not allowed by policy".to_string() });
    }

    if hooks.on_request_head(&head) == HookDecision::Deny {
        return Ok(InterceptOutcome::Deny { reason: "denied by onRequestHead hook".to_string() });
    }

    let mut buffered = BufferedRequest { head, body };

    if hooks.on_request(&mut buffered) == HookDecision::Deny {
        return Ok(InterceptOutcome::Deny { reason: "denied by onRequest hook".to_string() });
    }

    if let Err(reason) = substitute_secrets_in_request(engine, &mut buffered, &host) {
        return Ok(InterceptOutcome::Deny { reason });
    }

    let (path, query) = split_query(&buffered.head.path);
    if let Some(query) = query {
        let result = secrets::substitute(engine, query, &host, true);
        if result.host_denied {
            let placeholder = result.denied_placeholder.unwrap_or_default();
            return Ok(InterceptOutcome::Deny { reason: policy_violation(placeholder, &host) });
        }
        buffered.head.path = match result.query_gated {
            true => format!("{path}?{query}"),
            false => format!("{path}?{}", result.text),
        };
    }

    if let Some(reason) = find_leaked_secret_value(engine, &buffered, &host) {
        return Ok(InterceptOutcome::Deny { reason });
    }

    let rendered_head = render_request_head(&buffered.head);
    Ok(InterceptOutcome::Forward { request_head: rendered_head, body: buffered.body })
}

/// Applies placeholder substitution to every header and the body, failing
/// the whole request the moment a placeholder turns out to be bound to a
/// host it isn't allowlisted for.
fn substitute_secrets_in_request(engine: &PolicyEngine, request: &mut BufferedRequest, host: &str) -> Result<(), String> {
    for (name, value) in request.head.headers.iter_mut() {
        *value = substitute_header_value(engine, name, value, host)?;
    }

    if let Ok(body_text) = std::str::from_utf8(&request.body) {
        let result = secrets::substitute(engine, body_text, host, false);
        if result.host_denied {
            let placeholder = result.denied_placeholder.unwrap_or_default();
            return Err(policy_violation(placeholder, host));
        }
        if result.substituted {
            request.body = result.text.into_bytes();
        }
    }

    Ok(())
}

/// `Authorization`/`Proxy-Authorization: Basic` carries its payload as
/// base64(`user:pass`); a plain string-replace can never reach a
/// placeholder embedded in that encoding, so these headers are
/// decoded, substituted field-by-field, and re-encoded instead.
fn is_basic_auth_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("authorization") || name.eq_ignore_ascii_case("proxy-authorization")
}

fn substitute_header_value(engine: &PolicyEngine, name: &str, value: &str, host: &str) -> Result<String, String> {
    if is_basic_auth_header(name) {
        if let Some(creds) = basic_auth::decode(value) {
            let user = secrets::substitute(engine, &creds.username, host, false);
            if user.host_denied {
                return Err(policy_violation(user.denied_placeholder.unwrap_or_default(), host));
            }
            let pass = secrets::substitute(engine, &creds.password, host, false);
            if pass.host_denied {
                return Err(policy_violation(pass.denied_placeholder.unwrap_or_default(), host));
            }
            return Ok(basic_auth::encode(&BasicCredentials { username: user.text, password: pass.text }));
        }
    }

    let result = secrets::substitute(engine, value, host, false);
    if result.host_denied {
        return Err(policy_violation(result.denied_placeholder.unwrap_or_default(), host));
    }
    Ok(result.text)
}

/// Scans the already-substituted request for a secret's raw value headed
/// to a host that secret isn't allowlisted for, catching exfiltration
/// that never went through a placeholder at all (a guest echoing a header
/// it learned the value of some other way, or simply typing the secret
/// in directly).
fn find_leaked_secret_value(engine: &PolicyEngine, request: &BufferedRequest, host: &str) -> Option<String> {
    for (name, value) in &request.head.headers {
        let candidate = if is_basic_auth_header(name) {
            basic_auth::decode(value).map(|creds| format!("{}:{}", creds.username, creds.password))
        } else {
            Some(value.clone())
        };
        if let Some(candidate) = candidate {
            if let Some(secret) = secrets::find_leaked_secret(engine, &candidate, host) {
                return Some(policy_violation(secret.placeholder, host));
            }
        }
    }
    None
}

fn policy_violation(secret_placeholder: String, host: &str) -> String {
    let err = GondolinError::SecretPolicyViolation { secret: secret_placeholder, host: host.to_string() };
    tracing::warn!(error = %err, "blocking request");
    err.to_string()
}

fn split_query(path: &str) -> (&str, Option<&str>) {
    match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    }
}

pub enum ResponseOutcome {
    Forward { head: Vec<u8>, body: Vec<u8> },
    Deny,
}

pub fn process_response(hooks: &dyn RequestHooks, raw_head: &[u8], body: Vec<u8>) -> GondolinResult<ResponseOutcome> {
    let head = parse_response_head(raw_head)
        .ok_or_else(|| GondolinError::MalformedPacket("incomplete HTTP response head".into()))?;

    let mut buffered = BufferedResponse { head, body };
    if hooks.on_response(&mut buffered) == HookDecision::Deny {
        return Ok(ResponseOutcome::Deny);
    }

    Ok(ResponseOutcome::Forward { head: render_response_head(&buffered.head), body: buffered.body })
}

fn render_response_head(head: &ResponseHead) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {} {}\r\n", head.status, status_text(head.status)).into_bytes();
    for (name, value) in &head.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}
