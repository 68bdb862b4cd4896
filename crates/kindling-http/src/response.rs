use std::path::PathBuf;

use bytes::{BufMut, Bytes, BytesMut};

use crate::Headers;

/// Source of a response body.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum Body {
    #[default]
    Empty,
    Inline(Bytes),
    /// Bytes of a `FileCache` entry, by path.
    ///
    /// The connection borrows the entry only while it writes the response, inside the same
    /// callback that produced it. Eviction runs on the same thread between callbacks, so the
    /// entry can't disappear mid-write. That no longer holds if a cache is ever shared between
    /// threads.
    Cached(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Body,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(200)
    }
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
        }
    }

    pub fn with_body(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Inline(body.into()),
        }
    }

    /// Respond with the contents of a cached file.
    pub fn cached(status: u16, path: impl Into<PathBuf>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Cached(path.into()),
        }
    }

    pub fn reason(&self) -> &'static str {
        reason_phrase(self.status)
    }

    /// Serialize the status line and header fields.
    ///
    /// `Content-Length` is filled in from `content_length`, unless the headers already carry
    /// one, as responses to `HEAD` do.
    pub(crate) fn dump_header(&self, content_length: usize) -> BytesMut {
        let mut data = BytesMut::with_capacity(256);

        data.put(&b"HTTP/1.1 "[..]);
        data.put(self.status.to_string().as_bytes());
        data.put_u8(b' ');
        data.put(self.reason().as_bytes());
        data.put(&b"\r\n"[..]);

        for (name, value) in self.headers.iter() {
            data.put(name.as_bytes());
            data.put(&b": "[..]);
            data.put(value.as_bytes());
            data.put(&b"\r\n"[..]);
        }

        if !self.headers.contains("content-length") {
            data.put(&b"Content-Length: "[..]);
            data.put(content_length.to_string().as_bytes());
            data.put(&b"\r\n"[..]);
        }

        data.put(&b"\r\n"[..]);
        data
    }
}

/// Standard reason phrase of a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "<unknown status code>",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_dump_fills_in_content_length() {
        let mut response = Response::with_body(404, "Not Found");
        response.headers.set("Content-Type", "text/plain");

        let header = response.dump_header(9);
        assert_eq!(
            &header[..],
            b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\n"
        );
    }

    #[test]
    fn explicit_content_length_is_kept() {
        let mut response = Response::new(200);
        response.headers.set("Content-Length", "1234");

        let header = response.dump_header(0);
        assert_eq!(&header[..], b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n");
    }
}
