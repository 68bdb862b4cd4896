use std::{
    cell::RefCell,
    net::SocketAddr,
    ops::ControlFlow,
    rc::Rc,
    sync::Arc,
    time::SystemTime,
};

use anyhow::{anyhow, Context, Error};
use bytes::BufMut;
use tracing::{event, Level};

use crate::{Body, FileCache, HttpParser, ParserState, Request, Response, Service};

/// Largest body that gets copied behind the header and sent in a single write.
pub const SEND_IN_ONE_PACKET_LIMIT: usize = 1 << 20;

/// Where a connection's serialized responses go.
pub trait Transport {
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnectionState {
    AwaitingData,
    Parsing,
    RequestComplete,
    Responding,
    /// Response sent, handler reset in place for the next request.
    KeepAliveReset,
    Closed,
}

/// Drives one HTTP connection, from the first received byte to close.
///
/// The handler is reused for every request of a keep-alive connection, and dropped when the
/// connection closes.
pub struct HttpHandler {
    peer_addr: String,
    peer_port: u16,

    parser: HttpParser,
    request: Option<Request>,
    response: Response,

    files: Rc<RefCell<FileCache>>,
    service: Arc<dyn Service>,

    state: ConnectionState,
    served: usize,
}

impl HttpHandler {
    pub fn new(peer: SocketAddr, service: Arc<dyn Service>, files: Rc<RefCell<FileCache>>) -> Self {
        let peer_addr = peer.ip().to_string();
        let peer_port = peer.port();
        event!(Level::DEBUG, peer = %peer_addr, port = peer_port, "connection opened");

        Self {
            peer_addr,
            peer_port,

            parser: HttpParser::default(),
            request: None,
            response: Response::default(),

            files,
            service,

            state: ConnectionState::AwaitingData,
            served: 0,
        }
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of requests answered on this connection.
    pub fn served(&self) -> usize {
        self.served
    }

    /// The request currently being answered, if any.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// Handle bytes received on the connection.
    ///
    /// Every complete request in `data` is answered through `transport`. Returns `Break` when
    /// the connection has to be closed.
    pub fn on_read<T>(&mut self, mut data: &[u8], transport: &mut T) -> ControlFlow<()>
    where
        T: Transport + ?Sized,
    {
        if self.state == ConnectionState::Closed {
            return ControlFlow::Break(());
        }

        event!(Level::TRACE, bytes = data.len(), "received data");

        while !data.is_empty() {
            let consumed = self.parser.feed(data);

            if let Some(error) = self.parser.error() {
                event!(
                    Level::ERROR,
                    peer = %self.peer_addr,
                    port = self.peer_port,
                    "http parser error: {}",
                    error
                );
                self.close();
                return ControlFlow::Break(());
            }

            match self.parser.state() {
                ParserState::MessageComplete => {}
                ParserState::MessageBegin => {
                    // Only empty lines so far
                    return ControlFlow::Continue(());
                }
                _ => {
                    self.state = ConnectionState::Parsing;

                    if consumed != data.len() {
                        event!(
                            Level::ERROR,
                            peer = %self.peer_addr,
                            port = self.peer_port,
                            "http parser error: {} unconsumed bytes",
                            data.len() - consumed
                        );
                        self.close();
                        return ControlFlow::Break(());
                    }

                    return ControlFlow::Continue(());
                }
            }

            data = &data[consumed..];
            self.state = ConnectionState::RequestComplete;

            let keep_alive = match self.respond(transport) {
                Ok(keep_alive) => keep_alive,
                Err(error) => {
                    event!(
                        Level::ERROR,
                        peer = %self.peer_addr,
                        port = self.peer_port,
                        ?error,
                        "failed to respond"
                    );
                    self.close();
                    return ControlFlow::Break(());
                }
            };

            if !keep_alive {
                self.close();
                return ControlFlow::Break(());
            }

            // Pipelined requests continue from the remainder
            self.reset();
        }

        ControlFlow::Continue(())
    }

    /// Reinitialize per-request state, keeping the connection.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.request = None;
        self.response = Response::default();
        self.state = ConnectionState::KeepAliveReset;
    }

    /// Mark the handler closed, further reads are refused.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    fn respond<T>(&mut self, transport: &mut T) -> Result<bool, Error>
    where
        T: Transport + ?Sized,
    {
        let request = self
            .parser
            .take_request()
            .ok_or_else(|| anyhow!("parser completed without a request"))?;
        let keep_alive = request.is_keep_alive();

        // The cache borrow ends before the body is looked up again for writing
        self.response = {
            let mut files = self.files.borrow_mut();
            self.service.handle(&request, &mut files)
        };
        self.state = ConnectionState::Responding;

        let date = httpdate::fmt_http_date(SystemTime::now());
        self.response.headers.set("Date", date);
        let connection = if keep_alive { "keep-alive" } else { "close" };
        self.response.headers.set("Connection", connection);

        self.send_response(transport)?;
        self.served += 1;

        event!(
            Level::INFO,
            peer = %self.peer_addr,
            port = self.peer_port,
            method = %request.method,
            url = %request.url,
            status = self.response.status,
            reason = self.response.reason(),
            "request served"
        );

        self.request = Some(request);
        Ok(keep_alive)
    }

    fn send_response<T>(&self, transport: &mut T) -> Result<(), Error>
    where
        T: Transport + ?Sized,
    {
        let files = self.files.borrow();
        let body: &[u8] = match &self.response.body {
            Body::Empty => &[],
            Body::Inline(bytes) => &bytes[..],
            Body::Cached(path) => {
                let entry = files
                    .get(path)
                    .with_context(|| format!("cached body {:?} no longer in cache", path))?;
                &entry.bytes()[..]
            }
        };

        let mut data = self.response.dump_header(body.len());

        if body.len() <= SEND_IN_ONE_PACKET_LIMIT {
            data.put_slice(body);
            transport.write(&data)?;
        } else {
            transport.write(&data)?;
            transport.write(body)?;
        }

        Ok(())
    }
}

impl Drop for HttpHandler {
    fn drop(&mut self) {
        event!(
            Level::DEBUG,
            peer = %self.peer_addr,
            port = self.peer_port,
            served = self.served,
            "closing"
        );
    }
}
