use std::{
    cell::RefCell,
    net::SocketAddr,
    ops::ControlFlow,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Error};
use kindling_http::{
    CacheEntry, ConnectionState, FileCache, HttpHandler, Request, Response, Service, Transport,
    SEND_IN_ONE_PACKET_LIMIT,
};
use tracing_test::traced_test;

#[derive(Default)]
struct RecordingTransport {
    writes: Vec<Vec<u8>>,
    fail: bool,
}

impl Transport for RecordingTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.fail {
            bail!("connection reset");
        }

        self.writes.push(data.to_vec());
        Ok(())
    }
}

fn given_handler<S: Service>(service: S) -> (HttpHandler, Rc<RefCell<FileCache>>) {
    let files = Rc::new(RefCell::new(FileCache::new(Duration::from_secs(10))));
    let peer: SocketAddr = "192.0.2.7:40123".parse().unwrap();
    let handler = HttpHandler::new(peer, Arc::new(service), files.clone());

    (handler, files)
}

fn hello(_: &Request, _: &mut FileCache) -> Response {
    Response::with_body(200, "hello")
}

fn request(connection: Option<&str>) -> Vec<u8> {
    let mut data = b"GET /hello HTTP/1.1\r\nHost: localhost\r\n".to_vec();
    if let Some(value) = connection {
        data.extend_from_slice(format!("Connection: {}\r\n", value).as_bytes());
    }
    data.extend_from_slice(b"\r\n");
    data
}

fn header_of(write: &[u8]) -> String {
    let end = write
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("header terminator");
    String::from_utf8_lossy(&write[..end + 4]).into_owned()
}

#[test]
#[traced_test]
fn keep_alive_in_any_case_resets_connection() {
    for value in ["keep-alive", "Keep-Alive", "KEEP-ALIVE"] {
        let (mut handler, _) = given_handler(hello);
        let mut transport = RecordingTransport::default();

        let flow = handler.on_read(&request(Some(value)), &mut transport);
        assert_eq!(flow, ControlFlow::Continue(()), "{}", value);
        assert_eq!(handler.state(), ConnectionState::KeepAliveReset);
        assert_eq!(transport.writes.len(), 1);

        let header = header_of(&transport.writes[0]);
        assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(header.contains("Connection: keep-alive\r\n"));
        assert!(transport.writes[0].ends_with(b"hello"));

        // The same handler serves a second request
        let flow = handler.on_read(&request(Some(value)), &mut transport);
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(transport.writes.len(), 2);
        assert_eq!(handler.served(), 2);
    }
}

#[test]
#[traced_test]
fn other_connection_values_close() {
    for value in [None, Some("close"), Some("keep-alive, Upgrade"), Some("")] {
        let (mut handler, _) = given_handler(hello);
        let mut transport = RecordingTransport::default();

        let flow = handler.on_read(&request(value), &mut transport);
        assert_eq!(flow, ControlFlow::Break(()), "{:?}", value);
        assert_eq!(handler.state(), ConnectionState::Closed);
        assert_eq!(transport.writes.len(), 1);
        assert!(header_of(&transport.writes[0]).contains("Connection: close\r\n"));

        // Nothing more is accepted once closed
        let flow = handler.on_read(&request(None), &mut transport);
        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(transport.writes.len(), 1);
    }
}

#[test]
#[traced_test]
fn body_at_limit_is_sent_in_one_write() {
    let (mut handler, _) = given_handler(|_: &Request, _: &mut FileCache| {
        Response::with_body(200, vec![b'x'; SEND_IN_ONE_PACKET_LIMIT])
    });
    let mut transport = RecordingTransport::default();

    handler.on_read(&request(None), &mut transport);

    assert_eq!(transport.writes.len(), 1);
    let header = header_of(&transport.writes[0]);
    assert!(header.contains(&format!("Content-Length: {}\r\n", SEND_IN_ONE_PACKET_LIMIT)));
    assert_eq!(
        transport.writes[0].len(),
        header.len() + SEND_IN_ONE_PACKET_LIMIT
    );
}

#[test]
#[traced_test]
fn body_over_limit_is_sent_in_two_writes() {
    let (mut handler, _) = given_handler(|_: &Request, _: &mut FileCache| {
        Response::with_body(200, vec![b'x'; SEND_IN_ONE_PACKET_LIMIT + 1])
    });
    let mut transport = RecordingTransport::default();

    handler.on_read(&request(None), &mut transport);

    assert_eq!(transport.writes.len(), 2);
    let header = header_of(&transport.writes[0]);
    assert_eq!(header.len(), transport.writes[0].len());
    assert_eq!(transport.writes[1].len(), SEND_IN_ONE_PACKET_LIMIT + 1);
}

#[test]
#[traced_test]
fn every_response_has_a_gmt_date() -> Result<(), Error> {
    let (mut handler, _) = given_handler(hello);
    let mut transport = RecordingTransport::default();

    handler.on_read(&request(None), &mut transport);

    let header = header_of(&transport.writes[0]);
    let Some(date) = header
        .lines()
        .find_map(|line| line.strip_prefix("Date: "))
    else {
        bail!("no Date header in {:?}", header);
    };

    assert!(date.ends_with(" GMT"));
    httpdate::parse_http_date(date)?;

    Ok(())
}

#[test]
#[traced_test]
fn invalid_method_closes_without_response() {
    let (mut handler, _) = given_handler(hello);
    let mut transport = RecordingTransport::default();

    let flow = handler.on_read(b"BREW /pot HTTP/1.1\r\n\r\n", &mut transport);

    assert_eq!(flow, ControlFlow::Break(()));
    assert_eq!(handler.state(), ConnectionState::Closed);
    assert!(transport.writes.is_empty());
    assert!(logs_contain("http parser error"));
}

#[test]
#[traced_test]
fn truncated_header_waits_for_more() {
    let (mut handler, _) = given_handler(hello);
    let mut transport = RecordingTransport::default();

    let flow = handler.on_read(b"GET /hello HTTP/1.1\r\nHost: loc", &mut transport);

    assert_eq!(flow, ControlFlow::Continue(()));
    assert_eq!(handler.state(), ConnectionState::Parsing);
    assert!(transport.writes.is_empty());

    let flow = handler.on_read(b"alhost\r\n\r\n", &mut transport);
    assert_eq!(flow, ControlFlow::Break(()));
    assert_eq!(transport.writes.len(), 1);
}

#[test]
#[traced_test]
fn request_split_across_reads() {
    let (mut handler, _) = given_handler(hello);
    let mut transport = RecordingTransport::default();
    let data = request(Some("keep-alive"));

    for chunk in data.chunks(3) {
        assert_eq!(handler.on_read(chunk, &mut transport), ControlFlow::Continue(()));
    }

    assert_eq!(transport.writes.len(), 1);
    assert_eq!(handler.served(), 1);
}

#[test]
#[traced_test]
fn pipelined_requests_in_one_read() {
    let (mut handler, _) = given_handler(|request: &Request, _: &mut FileCache| {
        Response::with_body(200, request.url.clone())
    });
    let mut transport = RecordingTransport::default();

    let data = b"GET /a HTTP/1.1\r\nConnection: keep-alive\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
    let flow = handler.on_read(data, &mut transport);

    assert_eq!(flow, ControlFlow::Break(()));
    assert_eq!(transport.writes.len(), 2);
    assert!(transport.writes[0].ends_with(b"/a"));
    assert!(transport.writes[1].ends_with(b"/b"));
}

#[test]
#[traced_test]
fn cached_body_is_borrowed_from_cache() {
    let (mut handler, files) = given_handler(|_: &Request, files: &mut FileCache| {
        files.insert(CacheEntry::new("/srv/page.html", "<p>cached</p>", Instant::now()));
        Response::cached(200, "/srv/page.html")
    });
    let mut transport = RecordingTransport::default();

    handler.on_read(&request(None), &mut transport);

    assert_eq!(transport.writes.len(), 1);
    assert!(transport.writes[0].ends_with(b"<p>cached</p>"));
    assert_eq!(files.borrow().len(), 1);
}

#[test]
#[traced_test]
fn missing_cache_entry_closes_connection() {
    let (mut handler, _) = given_handler(|_: &Request, _: &mut FileCache| {
        Response::cached(200, "/srv/evicted.html")
    });
    let mut transport = RecordingTransport::default();

    let flow = handler.on_read(&request(Some("keep-alive")), &mut transport);

    assert_eq!(flow, ControlFlow::Break(()));
    assert!(transport.writes.is_empty());
    assert!(logs_contain("failed to respond"));
}

#[test]
#[traced_test]
fn transport_failure_closes_connection() {
    let (mut handler, _) = given_handler(hello);
    let mut transport = RecordingTransport {
        fail: true,
        ..Default::default()
    };

    let flow = handler.on_read(&request(Some("keep-alive")), &mut transport);

    assert_eq!(flow, ControlFlow::Break(()));
    assert_eq!(handler.state(), ConnectionState::Closed);
}
