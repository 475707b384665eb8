//! HTTP/1.x request/response parsing, grounded on `httparse` the way most
//! of the ecosystem wires it up: a fixed header array, a single `parse`
//! call, and a body offset the caller slices out of the raw buffer itself.

const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body_offset: usize,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host").map(|h| h.split(':').next().unwrap_or(h))
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

/// Parses a request head from `data`. Returns `None` if the headers are
/// not yet complete (caller should buffer more bytes and retry).
pub fn parse_request_head(data: &[u8]) -> Option<RequestHead> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw_headers);
    match req.parse(data).ok()? {
        httparse::Status::Complete(body_offset) => Some(RequestHead {
            method: req.method?.to_string(),
            path: req.path?.to_string(),
            version: req.version?,
            headers: req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect(),
            body_offset,
        }),
        httparse::Status::Partial => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body_offset: usize,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

pub fn parse_response_head(data: &[u8]) -> Option<ResponseHead> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut raw_headers);
    match resp.parse(data).ok()? {
        httparse::Status::Complete(body_offset) => Some(ResponseHead {
            status: resp.code?,
            headers: resp
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect(),
            body_offset,
        }),
        httparse::Status::Partial => None,
    }
}

/// Re-serializes a request head with a (possibly rewritten) header list,
/// preserving the request line verbatim.
pub fn render_request_head(head: &RequestHead) -> Vec<u8> {
    let version = if head.version == 1 { "HTTP/1.1" } else { "HTTP/1.0" };
    let mut out = format!("{} {} {}\r\n", head.method, head.path, version).into_bytes();
    for (name, value) in &head.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_request_with_host_header() {
        let raw = b"GET /path HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\n\r\n";
        let head = parse_request_head(raw).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/path");
        assert_eq!(head.host(), Some("example.com"));
    }

    #[test]
    fn partial_request_returns_none() {
        assert!(parse_request_head(b"GET /path HTTP/1.1\r\nHost: exam").is_none());
    }

    #[test]
    fn render_round_trips_request_line_and_headers() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: a.example.com\r\nContent-Length: 4\r\n\r\nbody";
        let head = parse_request_head(raw).unwrap();
        let rendered = render_request_head(&head);
        let rendered_str = String::from_utf8(rendered).unwrap();
        assert!(rendered_str.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(rendered_str.contains("Host: a.example.com\r\n"));
    }

    #[test]
    fn parses_response_status_line() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let head = parse_response_head(raw).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length(), Some(5));
    }
}
