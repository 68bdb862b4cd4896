use std::mem;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tracing::{event, Level};

use crate::{Headers, Method, Request, Version};

const MAX_LINE_LENGTH: usize = 8 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_BODY_LENGTH: usize = 64 * 1024 * 1024;

/// Where the parser is in the current message.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParserState {
    /// Nothing but optional empty lines received yet.
    MessageBegin,
    RequestLine,
    Headers,
    Body,
    /// A full request is available through `take_request`.
    MessageComplete,
}

/// Malformed request data.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    #[error("invalid HTTP method")]
    InvalidMethod,
    #[error("invalid URL")]
    InvalidUrl,
    #[error("invalid HTTP version")]
    InvalidVersion,
    #[error("invalid header field")]
    InvalidHeader,
    #[error("LF expected after CR")]
    LfExpected,
    #[error("invalid Content-Length header")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding")]
    UnsupportedTransferEncoding,
    #[error("request line or header fields too large")]
    HeaderOverflow,
    #[error("request body too large")]
    BodyOverflow,
}

/// Incremental HTTP/1.x request decoder.
///
/// Bytes can be fed in arbitrary chunks, the result doesn't depend on where the chunks are
/// split. Everything needed later is copied out of the fed slices.
pub struct HttpParser {
    state: ParserState,
    error: Option<ParseError>,

    line: BytesMut,
    has_cr: bool,

    method: Option<Method>,
    url: String,
    version: Version,
    headers: Headers,
    content_length: usize,
    body: BytesMut,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self {
            state: ParserState::MessageBegin,
            error: None,

            line: BytesMut::new(),
            has_cr: false,

            method: None,
            url: String::new(),
            version: Version::Http11,
            headers: Headers::new(),
            content_length: 0,
            body: BytesMut::new(),
        }
    }
}

impl HttpParser {
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// The error that stopped the parser, `None` while the data is well-formed.
    pub fn error(&self) -> Option<ParseError> {
        self.error
    }

    /// Consume bytes into the parser, returns how many were consumed.
    ///
    /// Stops early when a message completes or an error is found. Once either happened, no
    /// further bytes are consumed until `reset`.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        if self.error.is_some() || self.state == ParserState::MessageComplete {
            return 0;
        }

        let mut consumed = 0;
        while consumed < bytes.len() {
            if self.state == ParserState::Body {
                let remaining = self.content_length - self.body.len();
                let take = remaining.min(bytes.len() - consumed);
                self.body.put_slice(&bytes[consumed..consumed + take]);
                consumed += take;

                if self.body.len() == self.content_length {
                    self.state = ParserState::MessageComplete;
                    break;
                }
                continue;
            }

            if let Err(error) = self.consume_byte(bytes[consumed]) {
                event!(Level::TRACE, %error, "request data malformed");
                self.error = Some(error);
                break;
            }
            consumed += 1;

            if self.state == ParserState::MessageComplete {
                break;
            }
        }

        consumed
    }

    /// Take the completed request out of the parser.
    pub fn take_request(&mut self) -> Option<Request> {
        if self.state != ParserState::MessageComplete {
            return None;
        }

        let request = Request {
            method: self.method.take()?,
            url: mem::take(&mut self.url),
            version: self.version,
            headers: mem::take(&mut self.headers),
            body: self.body.split().freeze(),
        };
        Some(request)
    }

    /// Return to the initial state, ready for the next message on the same connection.
    pub fn reset(&mut self) {
        self.state = ParserState::MessageBegin;
        self.error = None;

        self.line.clear();
        self.has_cr = false;

        self.method = None;
        self.url.clear();
        self.version = Version::Http11;
        self.headers.clear();
        self.content_length = 0;
        self.body.clear();
    }

    fn consume_byte(&mut self, byte: u8) -> Result<(), ParseError> {
        match byte {
            // CRLF is the required newline, so remember CR until LF follows
            b'\r' => {
                if self.has_cr {
                    return Err(ParseError::LfExpected);
                }
                self.has_cr = true;
                Ok(())
            }
            // A standalone LF is tolerated as a newline
            b'\n' => {
                self.has_cr = false;
                self.end_line()
            }
            _ => {
                if self.has_cr {
                    return Err(ParseError::LfExpected);
                }

                if self.state == ParserState::MessageBegin {
                    self.state = ParserState::RequestLine;
                }
                if self.state == ParserState::RequestLine {
                    self.check_method_byte(byte)?;
                }

                if self.line.len() >= MAX_LINE_LENGTH {
                    return Err(ParseError::HeaderOverflow);
                }
                self.line.put_u8(byte);

                Ok(())
            }
        }
    }

    /// Reject unknown methods as soon as their first invalid byte arrives.
    fn check_method_byte(&mut self, byte: u8) -> Result<(), ParseError> {
        if self.method.is_some() {
            return Ok(());
        }

        if byte == b' ' {
            let method = Method::from_bytes(&self.line).ok_or(ParseError::InvalidMethod)?;
            self.method = Some(method);
            return Ok(());
        }

        if !Method::continues(&self.line, byte) {
            return Err(ParseError::InvalidMethod);
        }

        Ok(())
    }

    fn end_line(&mut self) -> Result<(), ParseError> {
        let line = self.line.split().freeze();

        match self.state {
            // Empty lines before a request are ignored
            ParserState::MessageBegin => Ok(()),
            ParserState::RequestLine => {
                self.parse_request_line(&line)?;
                self.state = ParserState::Headers;
                Ok(())
            }
            ParserState::Headers => {
                if line.is_empty() {
                    self.finish_headers()
                } else {
                    self.parse_field(&line)
                }
            }
            ParserState::Body | ParserState::MessageComplete => Ok(()),
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        // The method token has been validated while it came in
        if self.method.is_none() {
            return Err(ParseError::InvalidMethod);
        }

        let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidUrl)?;
        let mut parts = line.split(' ').skip(1);

        let url = parts
            .next()
            .filter(|url| !url.is_empty())
            .ok_or(ParseError::InvalidUrl)?;
        if url.bytes().any(|byte| byte.is_ascii_control()) {
            return Err(ParseError::InvalidUrl);
        }

        let version = match parts.next() {
            Some("HTTP/1.1") => Version::Http11,
            Some("HTTP/1.0") => Version::Http10,
            _ => return Err(ParseError::InvalidVersion),
        };
        if parts.next().is_some() {
            return Err(ParseError::InvalidVersion);
        }

        self.url.push_str(url);
        self.version = version;

        Ok(())
    }

    fn parse_field(&mut self, line: &[u8]) -> Result<(), ParseError> {
        if self.headers.len() >= MAX_HEADERS {
            return Err(ParseError::HeaderOverflow);
        }

        let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidHeader)?;
        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;

        let valid_name = !name.is_empty()
            && name
                .bytes()
                .all(|byte| byte.is_ascii_graphic() && byte != b':');
        if !valid_name {
            return Err(ParseError::InvalidHeader);
        }

        let value = value.trim_matches(&[' ', '\t'][..]);
        self.headers.append(name, value);

        Ok(())
    }

    fn finish_headers(&mut self) -> Result<(), ParseError> {
        if let Some(encoding) = self.headers.get("transfer-encoding") {
            if !encoding.eq_ignore_ascii_case("identity") {
                return Err(ParseError::UnsupportedTransferEncoding);
            }
        }

        self.content_length = match self.headers.get("content-length") {
            Some(value) => value
                .parse()
                .map_err(|_| ParseError::InvalidContentLength)?,
            None => 0,
        };
        if self.content_length > MAX_BODY_LENGTH {
            return Err(ParseError::BodyOverflow);
        }

        if self.content_length == 0 {
            self.state = ParserState::MessageComplete;
        } else {
            self.body.reserve(self.content_length.min(64 * 1024));
            self.state = ParserState::Body;
        }

        Ok(())
    }
}
