// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

use crate::config::Config;
use crate::dial::{dial, join_host_port};
use crate::error::Error;
use crate::http::request::{RequestHead, split_host_port};
use crate::http::{Status, send_status};
use log::info;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const DEFAULT_PORT: u16 = 443;

/// Opens the CONNECT target and answers the client. Bytes the client sent
/// after the request head are passed on to the target.
pub(super) async fn handle<S>(
    stream: &mut S,
    client_addr: SocketAddr,
    head: &RequestHead,
    body: &[u8],
    config: &Config,
) -> Result<TcpStream, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = split_host_port(&head.target, DEFAULT_PORT);
    let remote_addr = join_host_port(&host, port);

    if !config.is_allowed(&host, port) {
        info!(
            "http connect request from client {client_addr} to tcp://{remote_addr} rejected: destination not allowed"
        );
        send_status(stream, Status::Forbidden, &[])
            .await
            .unwrap_or_default();
        return Err(Error::DestinationNotAllowed(remote_addr));
    }

    info!("http connect request from client {client_addr} to tcp://{remote_addr} accepted");
    let mut remote = match dial(&host, port, config.connect_timeout).await {
        Ok(v) => v,
        Err(err) => {
            send_status(stream, Status::BadGateway, &[])
                .await
                .unwrap_or_default();
            return Err(err);
        }
    };
    send_status(stream, Status::ConnectionEstablished, &[]).await?;
    if !body.is_empty() {
        remote.write_all(body).await.map_err(Error::Tunnel)?;
    }
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn client_addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn connect_head(target: &str) -> RequestHead {
        RequestHead::parse(format!("CONNECT {target} HTTP/1.1\r\n\r\n").as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn establishes_and_forwards_early_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let (mut client, mut server) = io::duplex(256);

        let head = connect_head(&target.to_string());
        let remote = handle(&mut server, client_addr(), &head, b"\x16\x03", &Config::default())
            .await
            .unwrap();
        drop(remote);

        let (mut accepted, _) = listener.accept().await.unwrap();
        let mut early = Vec::new();
        accepted.read_to_end(&mut early).await.unwrap();
        assert_eq!(early, b"\x16\x03");

        let mut reply = [0u8; 39];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.1 200 Connection Established\r\n\r\n");
    }

    #[tokio::test]
    async fn unreachable_target_gets_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        drop(listener);
        let (mut client, mut server) = io::duplex(256);

        let head = connect_head(&target.to_string());
        let result = handle(&mut server, client_addr(), &head, b"", &Config::default()).await;
        assert!(matches!(result, Err(Error::Connect(..))));
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
    }

    #[tokio::test]
    async fn disallowed_target_gets_forbidden() {
        let config = Config {
            allowed_destinations: Some(vec!["example.com".into()]),
            ..Config::default()
        };
        let (mut client, mut server) = io::duplex(256);

        let head = connect_head("internal.example:22");
        let result = handle(&mut server, client_addr(), &head, b"", &config).await;
        assert!(matches!(result, Err(Error::DestinationNotAllowed(_))));
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"HTTP/1.1 403 Forbidden\r\n\r\n");
    }
}
