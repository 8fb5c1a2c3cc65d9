// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

mod connect;
mod forward;
pub mod request;

use crate::config::Config;
use crate::error::Error;
use crate::http::request::{MAX_HEAD_SIZE, RequestHead};
use crate::registry::ConnectionGuard;
use tokio::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

/// Value of the `X-Proxy-Via` header added to forwarded responses.
pub const PROXY_VIA: &str = "mixproxy";

const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    (
        "Access-Control-Allow-Methods",
        "GET, POST, PUT, DELETE, HEAD, OPTIONS",
    ),
    ("Access-Control-Allow-Headers", "*"),
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    ConnectionEstablished,
    NoContent,
    BadRequest,
    Forbidden,
    BadGateway,
    GatewayTimeout,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::ConnectionEstablished => 200,
            Status::NoContent => 204,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::BadGateway => 502,
            Status::GatewayTimeout => 504,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::ConnectionEstablished => "Connection Established",
            Status::NoContent => "No Content",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::BadGateway => "Bad Gateway",
            Status::GatewayTimeout => "Gateway Timeout",
        }
    }
}

/// What the connection does once the HTTP exchange has been handled.
pub enum Outcome {
    /// A CONNECT tunnel was established to the returned stream.
    Tunnel(TcpStream),
    /// The request was answered in full.
    Done,
}

async fn send_status<W>(writer: &mut W, status: Status, headers: &[(&str, &str)]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response = format!("HTTP/1.1 {} {}\r\n", status.code(), status.reason());
    for (key, value) in headers {
        response.push_str(&format!("{key}: {value}\r\n"));
    }
    response.push_str("\r\n");
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

/// Reads and dispatches one HTTP request from `stream`.
///
/// CONNECT requests yield [`Outcome::Tunnel`]; anything else is forwarded to
/// the target URL and fully relayed before returning [`Outcome::Done`].
pub async fn handshake<S>(
    stream: &mut S,
    conn: &mut ConnectionGuard,
    config: &Config,
) -> Result<Outcome, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let read = time::timeout(
        config.handshake_timeout,
        request::read_head(stream, MAX_HEAD_SIZE, request::check_request_start),
    )
    .await;
    let (head, body) = match read {
        Ok(Ok(v)) => v,
        Ok(Err(err)) => {
            if !matches!(err, Error::Io(_)) {
                send_status(stream, Status::BadRequest, &[])
                    .await
                    .unwrap_or_default();
            }
            return Err(err);
        }
        Err(_) => return Err(Error::HandshakeTimeout),
    };
    let head = match RequestHead::parse(&head) {
        Ok(v) => v,
        Err(err) => {
            send_status(stream, Status::BadRequest, &[])
                .await
                .unwrap_or_default();
            return Err(err);
        }
    };
    conn.registry().record_http_request();

    if head.is_connect() {
        let remote = connect::handle(stream, conn.peer(), &head, &body, config).await?;
        conn.registry().record_connect_tunnel();
        Ok(Outcome::Tunnel(remote))
    } else {
        forward::handle(stream, conn, &head, body, config).await?;
        Ok(Outcome::Done)
    }
}
