#![cfg(unix)]

use std::{
    fs,
    io::{Read, Write},
    net::TcpStream,
    time::Duration,
};

use anyhow::Error;
use kindling_server::{Server, ServerConfig};

/// Runs alone in its binary, children are forked from a process with few threads.
#[test]
fn forked_workers_serve_and_are_reaped() -> Result<(), Error> {
    let root = std::env::temp_dir().join(format!("kindling-fork-{}", std::process::id()));
    fs::create_dir_all(&root)?;
    fs::write(root.join("index.html"), "forked")?;

    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse()?,
        worker_processes: 2,
        document_root: root,
        program_name: "kindling-fork".to_string(),
        ..ServerConfig::default()
    };
    let mut server = Server::new(config);
    server.run(false)?;

    let mut pids = server.supervisor().pids();
    assert_eq!(pids.len(), 2);
    assert!(pids.iter().all(|pid| *pid != std::process::id()));

    let addr = server.local_addr().expect("server not listening");
    let mut client = TcpStream::connect(addr)?;
    client.set_read_timeout(Some(Duration::from_secs(5)))?;
    client.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let mut response = String::new();
    client.read_to_string(&mut response)?;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("forked"));

    #[cfg(target_os = "linux")]
    for pid in &pids {
        assert_worker_title(*pid, "kindling-fork: worker process")?;
    }

    server.shutdown();
    let mut reaped = server.join(Duration::from_secs(5))?;

    reaped.sort_unstable();
    pids.sort_unstable();
    assert_eq!(reaped, pids);
    assert!(server.supervisor().pids().is_empty());

    Ok(())
}

/// Wait for a worker to take its title, as shown in its command line.
#[cfg(target_os = "linux")]
fn assert_worker_title(pid: u32, title: &str) -> Result<(), Error> {
    let path = format!("/proc/{}/cmdline", pid);
    let mut cmdline = String::new();

    for _ in 0..100 {
        cmdline = String::from_utf8_lossy(&fs::read(&path)?).into_owned();
        if cmdline.starts_with(title) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    anyhow::bail!("worker {} has command line {:?}", pid, cmdline)
}
