use anyhow::Error;
use kindling_http::{FileCache, Request, Response};
use kindling_server::{Server, ServerConfig};

fn main() -> Result<(), Error> {
    devutils::init_logging("debug");

    let config = ServerConfig {
        listen_addr: "127.0.0.1:1234".parse()?,
        ..ServerConfig::default()
    };

    let mut server = Server::new(config).service(hello);
    server.run(false)?;

    Ok(())
}

fn hello(request: &Request, _files: &mut FileCache) -> Response {
    let mut response = Response::with_body(200, RESPONSE);
    response
        .headers
        .set("Content-Type", "text/html; charset=utf-8");

    if request.query().is_some() {
        response.headers.set("Cache-Control", "no-store");
    }

    response
}

const RESPONSE: &str = "<!DOCTYPE html><html><body><h1>Hello, World!</h1></body></html>";
