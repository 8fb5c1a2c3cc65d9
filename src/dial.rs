// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

use crate::error::Error;
use log::debug;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io;
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// Formats `host` and `port` as a connectable address, bracketing IPv6
/// literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Opens a TCP connection to `host:port`, giving up after `timeout`.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, Error> {
    let remote_addr = join_host_port(host, port);
    match time::timeout(timeout, TcpStream::connect(&remote_addr)).await {
        Ok(Ok(remote)) => {
            remote.set_nodelay(true).unwrap_or_default();
            debug!("tcp://{remote_addr} connected");
            Ok(remote)
        }
        Ok(Err(err)) => Err(Error::Connect(remote_addr, err)),
        Err(_) => Err(Error::Timeout(remote_addr)),
    }
}

fn tls_connector() -> TlsConnector {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    let config = CONFIG.get_or_init(|| {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Arc::new(config)
    });
    TlsConnector::from(config.clone())
}

/// Opens a TCP connection to `host:port` and runs a TLS client handshake over
/// it, verifying the server against the webpki root store. Connecting and the
/// handshake are each bounded by `timeout`.
pub async fn dial_tls(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, Error> {
    let remote_addr = join_host_port(host, port);
    let server_name = ServerName::try_from(host.to_string()).map_err(|err| {
        Error::Connect(
            remote_addr.clone(),
            io::Error::new(io::ErrorKind::InvalidInput, err.to_string()),
        )
    })?;
    let remote = dial(host, port, timeout).await?;
    match time::timeout(timeout, tls_connector().connect(server_name, remote)).await {
        Ok(Ok(remote)) => {
            debug!("tls://{remote_addr} connected");
            Ok(remote)
        }
        Ok(Err(err)) => Err(Error::Connect(remote_addr, err)),
        Err(_) => Err(Error::Timeout(remote_addr)),
    }
}
