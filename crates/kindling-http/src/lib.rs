//! HTTP/1.x connection handling: an incremental request decoder, the per-connection state
//! machine, and the file cache responses can be served from.
//!
//! Nothing in this crate touches sockets. A `HttpHandler` writes through a `Transport`, which
//! the server implements on top of its event loop.

mod cache;
mod connection;
mod headers;
mod parser;
mod request;
mod response;
mod service;
mod static_files;

pub use self::{
    cache::{CacheEntry, FileCache},
    connection::{ConnectionState, HttpHandler, Transport, SEND_IN_ONE_PACKET_LIMIT},
    headers::Headers,
    parser::{HttpParser, ParseError, ParserState},
    request::{Method, Request, Version},
    response::{reason_phrase, Body, Response},
    service::Service,
    static_files::StaticFiles,
};
