// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

use crate::config::Config;
use crate::detect::{Protocol, detect, has_http_method};
use crate::error::{Error, ErrorClass};
use crate::framed::{FIRST_CHUNK_SIZE, PrefixedStream};
use crate::http;
use crate::http::Outcome;
use crate::registry::{ConnectionGuard, Phase, Registry};
use crate::relay::Tunnel;
use crate::socks5;
use log::{debug, error};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time;

/// State shared by every connection of one server.
pub struct Context {
    pub config: Config,
    pub registry: Arc<Registry>,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::new()),
        }
    }
}

/// HTTP and SOCKS5 proxy listening on a single port.
pub struct Server {
    listener: TcpListener,
    context: Arc<Context>,
    shutdown: Arc<Notify>,
}

impl Server {
    /// Binds to `config.listen`. This is the only failure that should stop the
    /// process.
    pub async fn bind(config: Config) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(Self::from_listener(listener, config))
    }

    pub fn from_listener(listener: TcpListener, config: Config) -> Self {
        Self {
            listener,
            context: Arc::new(Context::new(config)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.context.registry.clone()
    }

    /// Accepts connections until [`Server::shutdown`] is called. Each
    /// connection is served on its own task.
    pub async fn serve(&self) {
        loop {
            tokio::select! {
                v = self.listener.accept() => {
                    match v {
                        Ok((stream, client_addr)) => {
                            stream.set_nodelay(true).unwrap_or_default();
                            tokio::spawn(handle_conn(stream, client_addr, self.context.clone()));
                        }
                        Err(err) => {
                            error!("failed to accept tcp connection from a client: {err}");
                        }
                    }
                }
                _ = self.shutdown.notified() => return,
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Serves one accepted connection from sniffing to teardown. Failures are
/// logged and counted here and never reach the listener.
pub async fn handle_conn(stream: TcpStream, client_addr: SocketAddr, context: Arc<Context>) {
    let mut conn = context.registry.open(client_addr);
    debug!("client {client_addr} connected");
    if let Err(err) = serve_conn(stream, &mut conn, &context.config).await {
        if err.is_counted() {
            context.registry.record_error();
        }
        match err.class() {
            ErrorClass::Policy => {}
            ErrorClass::Transport => debug!("tunnel for client {client_addr} closed: {err}"),
            ErrorClass::Protocol | ErrorClass::Upstream => {
                error!("failed to handle request from client {client_addr}: {err}")
            }
        }
    }
    drop(conn);
    debug!("client {client_addr} disconnected");
}

async fn serve_conn(
    stream: TcpStream,
    conn: &mut ConnectionGuard,
    config: &Config,
) -> Result<(), Error> {
    let client_addr = conn.peer();
    let mut stream = time::timeout(
        config.handshake_timeout,
        PrefixedStream::read_first(stream, FIRST_CHUNK_SIZE),
    )
    .await
    .map_err(|_| Error::HandshakeTimeout)??;

    let remote = match detect(stream.prefix()) {
        Protocol::Socks5 => {
            debug!("handle socks5 request from client {client_addr}");
            conn.set_phase(Phase::Socks5Handshake);
            conn.registry().record_socks5_connection();
            socks5::handshake(&mut stream, client_addr, config).await?
        }
        Protocol::Http => {
            if has_http_method(stream.prefix()) {
                debug!("handle http request from client {client_addr}");
            } else {
                debug!("unrecognized first packet from client {client_addr}, trying http");
            }
            conn.set_phase(Phase::HttpHandshake);
            match http::handshake(&mut stream, conn, config).await? {
                Outcome::Tunnel(remote) => remote,
                Outcome::Done => return Ok(()),
            }
        }
    };

    conn.set_phase(Phase::Tunneling);
    let stats = Tunnel::new(stream, remote).run(config.idle_timeout).await?;
    debug!(
        "tunnel for client {client_addr} closed: {} bytes up, {} bytes down",
        stats.client_to_target, stats.target_to_client
    );
    Ok(())
}
