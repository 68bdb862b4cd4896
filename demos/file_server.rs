use anyhow::Error;
use kindling_server::{Server, ServerConfig};
use tracing::{event, Level};

fn main() -> Result<(), Error> {
    devutils::init_logging("info");

    // KINDLING_ROOT, KINDLING_WORKERS and friends override the defaults
    let config = ServerConfig::from_env()?;
    event!(
        Level::INFO,
        root = ?config.document_root,
        workers = config.worker_processes,
        "starting file server"
    );

    let mut server = Server::new(config);
    server.run(true)?;

    Ok(())
}
