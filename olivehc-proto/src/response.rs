//! Response rendering, grounded on `http.c`'s `http_make_200_response_header`
//! / `http_make_206_response_header` / `http_code_page`.
//!
//! Headers are built as an in-memory prefix; the body (when it's a stored
//! item) is sent separately via `sendfile` so it never passes through user
//! space. `TCP_CORK` fuses the two writes into one TCP segment boundary —
//! see `olivehc-server`'s worker loop for where that's applied; this
//! module only formats bytes.

use olivehc_common::strutil::numlen;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const PARTIAL_CONTENT: StatusCode = StatusCode(206);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const LENGTH_REQUIRED: StatusCode = StatusCode(411);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const RANGE_NOT_SATISFIABLE: StatusCode = StatusCode(416);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    fn reason(self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            206 => "Partial Content",
            400 => "Bad Request",
            404 => "Not Found",
            411 => "Length Required",
            413 => "Payload Too Large",
            416 => "Range Not Satisfiable",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }
}

/// `http_code_page`: canned HTML bodies for error responses, so a failure
/// path never needs to touch a device.
pub fn code_page(status: StatusCode) -> &'static [u8] {
    match status.0 {
        400 => b"<html><body><h1>400 Bad Request</h1></body></html>",
        404 => b"<html><body><h1>404 Not Found</h1></body></html>",
        411 => b"<html><body><h1>411 Length Required</h1></body></html>",
        413 => b"<html><body><h1>413 Payload Too Large</h1></body></html>",
        416 => b"<html><body><h1>416 Range Not Satisfiable</h1></body></html>",
        500 => b"<html><body><h1>500 Internal Server Error</h1></body></html>",
        503 => b"<html><body><h1>503 Service Unavailable</h1></body></html>",
        _ => b"<html><body><h1>Error</h1></body></html>",
    }
}

/// Builds a canned error response (status line + minimal headers + body)
/// in one shot, since these never need `sendfile` or `Range`.
pub fn error_response(status: StatusCode) -> Vec<u8> {
    let body = code_page(status);
    let mut out = Vec::with_capacity(128 + body.len());
    write_status_line(&mut out, status);
    write_header(&mut out, b"Content-Type", b"text/html");
    write_content_length(&mut out, body.len() as u64);
    write_header(&mut out, b"Connection", b"close");
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// `http_make_200_response_header`: a full, non-ranged body follows.
pub fn ok_header(content_length: u64, headers_len: u16, extra_headers: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + headers_len as usize);
    write_status_line(&mut out, StatusCode::OK);
    write_content_length(&mut out, content_length);
    for (name, value) in extra_headers {
        write_header(&mut out, name, value);
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// `http_make_206_response_header`: a `Range` request was satisfiable;
/// `total_len` is the full stored body length, `(start, end)` the resolved
/// inclusive byte range being served.
pub fn partial_header(start: u64, end: u64, total_len: u64, extra_headers: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut out = Vec::with_capacity(160);
    write_status_line(&mut out, StatusCode::PARTIAL_CONTENT);
    write_content_length(&mut out, end - start + 1);
    let range_value = format!("bytes {start}-{end}/{total_len}");
    write_header(&mut out, b"Content-Range", range_value.as_bytes());
    for (name, value) in extra_headers {
        write_header(&mut out, name, value);
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// A bare status line with no body and no `Content-Length` header, for
/// 201/204 acks (`http_make_status_response_header` with `content_length`
/// set to -1 in the original: those two codes never carry a length line
/// at all, not even a zero one).
pub fn empty_response(status: StatusCode) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    write_status_line(&mut out, status);
    out.extend_from_slice(b"\r\n");
    out
}

fn write_status_line(out: &mut Vec<u8>, status: StatusCode) {
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.0.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.reason().as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn write_header(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    out.extend_from_slice(name);
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

fn write_content_length(out: &mut Vec<u8>, length: u64) {
    let mut buf = Vec::with_capacity(numlen(length));
    buf.extend_from_slice(length.to_string().as_bytes());
    write_header(out, b"Content-Length", &buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_header_reports_content_length() {
        let header = ok_header(42, 0, &[]);
        let text = String::from_utf8(header).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 42\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn partial_header_reports_content_range() {
        let header = partial_header(10, 19, 100, &[]);
        let text = String::from_utf8(header).unwrap();
        assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(text.contains("Content-Range: bytes 10-19/100\r\n"));
        assert!(text.contains("Content-Length: 10\r\n"));
    }

    #[test]
    fn empty_response_omits_content_length() {
        assert_eq!(empty_response(StatusCode::CREATED), b"HTTP/1.1 201 Created\r\n\r\n");
        assert_eq!(empty_response(StatusCode::NO_CONTENT), b"HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[test]
    fn error_response_carries_a_matching_code_page() {
        let resp = error_response(StatusCode::NOT_FOUND);
        let text = String::from_utf8(resp).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("404 Not Found"));
    }
}
