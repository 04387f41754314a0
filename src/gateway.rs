//! Thin TCP acceptor. HTTP request parsing and URL-to-handler routing
//! are treated as external collaborators with named contracts only and
//! have no counterpart here. This module owns a `TcpListener`, spawns
//! one thread per accepted connection, and for each connection
//! allocates a [`Connection`] from the [`Dispatcher`] and pumps lines
//! of text between the socket and `Connection::execute`. It does not
//! parse HTTP and has no URL tree — those remain out of scope.
//!
//! Grounded on the `TcpListener`-per-thread acceptor shape in
//! `examples/other_examples/69ad1f60_zelshahawy-fairydb__src-server-src-server.rs.rs`'s
//! `Server::run_server`/`handle_client_request`, adapted from its
//! length-prefixed `serde_cbor` frames to slotdb's newline-delimited
//! ASCII request lines.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::dispatcher::Dispatcher;
use crate::driver::Connection;

pub struct Gateway {
    dispatcher: Arc<Dispatcher>,
    stopping: Arc<AtomicBool>,
}

impl Gateway {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher, stopping: Arc::new(AtomicBool::new(false)) }
    }

    /// Binds `addr` and serves connections until [`Gateway::stop`] is
    /// called or the listener errors out. Blocks the calling thread.
    pub fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr)?;
        tracing::info!(addr, "gateway listening");
        for stream in listener.incoming() {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    thread::spawn(move || handle_client(dispatcher, stream));
                }
                Err(err) => {
                    tracing::warn!(%err, "failed to accept connection");
                }
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }
}

fn handle_client(dispatcher: Arc<Dispatcher>, stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    tracing::info!(?peer, "accepted connection");

    let connection = match Connection::open(dispatcher) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(%err, "failed to allocate a session for new socket");
            return;
        }
    };

    let mut reader = BufReader::new(stream.try_clone().expect("clone tcp stream for reading"));
    let mut writer = stream;
    let mut line = String::new();
    loop {
        line.clear();
        let n = match reader.read_line(&mut line) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(%err, "socket read error");
                break;
            }
        };
        if n == 0 {
            break;
        }
        let request = line.trim_end_matches(['\r', '\n']);
        if request.is_empty() {
            continue;
        }

        let response = match connection.execute(request) {
            Ok(text) => text,
            Err(err) => err.to_string(),
        };
        if writer.write_all(response.as_bytes()).is_err() || writer.write_all(b"\n").is_err() {
            break;
        }
        if request.eq_ignore_ascii_case("please:close") {
            break;
        }
    }
    tracing::info!(?peer, "connection closed");
}
