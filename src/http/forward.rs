// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

//! Plain (non-CONNECT) proxying of `http://` and `https://` requests. The
//! client side is always plaintext; `https` targets are reached over TLS.

use crate::config::Config;
use crate::dial::{dial, dial_tls};
use crate::error::Error;
use crate::http::request::{MAX_HEAD_SIZE, RequestHead, read_head};
use crate::http::{CORS_HEADERS, PROXY_VIA, Status, send_status};
use crate::registry::{ConnectionGuard, Phase};
use crate::relay::{Activity, pipe};
use log::{debug, info};
use std::future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time;
use url::{Host, Position, Url};

/// Header naming the target when the request line does not carry one.
pub const TARGET_HEADER: &str = "X-Target-URL";

/// Query parameter naming the target, e.g. `/proxy?url=http://host/path`.
pub const TARGET_PARAM: &str = "url";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "upgrade",
];

const MAX_RESPONSE_HEADERS: usize = 128;

const IDENTIFYING: [&str; 6] = [
    "via",
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-real-ip",
];

/// Headers sent on every response the proxy writes itself.
fn proxy_headers() -> Vec<(&'static str, &'static str)> {
    let mut headers = CORS_HEADERS.to_vec();
    headers.push(("X-Proxy-Via", PROXY_VIA));
    headers.push(("Content-Length", "0"));
    headers.push(("Connection", "close"));
    headers
}

/// Finds the URL a request should be forwarded to: an absolute request target,
/// then the target header, then the `url` query parameter.
pub fn resolve_target(head: &RequestHead) -> Result<Option<Url>, Error> {
    let raw = if has_scheme(&head.target) {
        Some(head.target.clone())
    } else if let Some(value) = head.header(TARGET_HEADER) {
        Some(value.trim().to_string())
    } else {
        let base = Url::parse("http://localhost/").map_err(|_| Error::MalformedRequest("invalid url"))?;
        base.join(&head.target)
            .ok()
            .and_then(|url| {
                url.query_pairs()
                    .find(|(key, _)| key == TARGET_PARAM)
                    .map(|(_, value)| value.into_owned())
            })
    };
    let Some(raw) = raw else {
        return Ok(None);
    };
    let url = Url::parse(&raw).map_err(|_| Error::MalformedRequest("invalid target url"))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::MalformedRequest("only http:// and https:// targets can be forwarded"));
    }
    if url.host().is_none() {
        return Err(Error::MalformedRequest("target url has no host"));
    }
    Ok(Some(url))
}

fn has_scheme(target: &str) -> bool {
    let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn dial_host(url: &Url) -> String {
    match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        None => String::new(),
    }
}

/// Builds the upstream request head: origin-form target, client headers minus
/// hop-by-hop and identifying ones, and a `Host` header for the target.
pub fn build_request(head: &RequestHead, url: &Url) -> Vec<u8> {
    let path = &url[Position::BeforePath..Position::AfterQuery];
    let path = if path.is_empty() { "/" } else { path };
    let mut out = format!("{} {} {}\r\n", head.method, path, head.version);
    for (key, value) in &head.headers {
        let lower = key.to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str())
            || IDENTIFYING.contains(&lower.as_str())
            || lower == "host"
            || key.eq_ignore_ascii_case(TARGET_HEADER)
        {
            continue;
        }
        out.push_str(&format!("{key}: {value}\r\n"));
    }
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => out.push_str(&format!("Host: {host}:{port}\r\n")),
        None => out.push_str(&format!("Host: {host}\r\n")),
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

/// Rewrites the upstream response head. The status line and every header are
/// copied byte for byte, except that `Access-Control-Allow-*` headers are
/// replaced by permissive ones and `X-Proxy-Via` is appended. Returns `None`
/// when the head is not an HTTP response.
pub fn rewrite_response(head: &[u8]) -> Option<Vec<u8>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }
    let status_end = head.iter().position(|b| *b == b'\n')? + 1;

    let mut out = Vec::with_capacity(head.len() + 256);
    out.extend_from_slice(&head[..status_end]);
    for header in response.headers.iter() {
        let lower = header.name.to_ascii_lowercase();
        if lower.starts_with("access-control-allow-") || lower == "x-proxy-via" {
            continue;
        }
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value);
        out.extend_from_slice(b"\r\n");
    }
    for (key, value) in CORS_HEADERS {
        out.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(format!("X-Proxy-Via: {PROXY_VIA}\r\n\r\n").as_bytes());
    Some(out)
}

fn upstream_failure(err: &Error) -> Status {
    match err {
        Error::Timeout(_) => Status::GatewayTimeout,
        _ => Status::BadGateway,
    }
}

pub(super) async fn handle<S>(
    stream: &mut S,
    conn: &mut ConnectionGuard,
    head: &RequestHead,
    body: Vec<u8>,
    config: &Config,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_addr = conn.peer();
    let url = match resolve_target(head) {
        Ok(Some(v)) => v,
        Ok(None) if head.method.eq_ignore_ascii_case("OPTIONS") => {
            debug!("answering cors preflight from client {client_addr}");
            send_status(stream, Status::NoContent, &proxy_headers()).await?;
            return Ok(());
        }
        Ok(None) => {
            send_status(stream, Status::BadRequest, &proxy_headers())
                .await
                .unwrap_or_default();
            return Err(Error::MalformedRequest("no target url"));
        }
        Err(err) => {
            send_status(stream, Status::BadRequest, &proxy_headers())
                .await
                .unwrap_or_default();
            return Err(err);
        }
    };
    let host = dial_host(&url);
    let port = url.port_or_known_default().unwrap_or(80);

    if !config.is_allowed(&host, port) {
        info!(
            "http {} request from client {client_addr} to {url} rejected: destination not allowed",
            head.method
        );
        send_status(stream, Status::Forbidden, &proxy_headers())
            .await
            .unwrap_or_default();
        return Err(Error::DestinationNotAllowed(url.to_string()));
    }

    info!("http {} request from client {client_addr} to {url} accepted", head.method);
    let request = build_request(head, &url);
    if url.scheme() == "https" {
        match dial_tls(&host, port, config.connect_timeout).await {
            Ok(upstream) => {
                proxy_request(stream, conn, upstream, &request, &body, &url, config).await
            }
            Err(err) => {
                send_status(stream, upstream_failure(&err), &proxy_headers())
                    .await
                    .unwrap_or_default();
                Err(err)
            }
        }
    } else {
        match dial(&host, port, config.connect_timeout).await {
            Ok(upstream) => {
                proxy_request(stream, conn, upstream, &request, &body, &url, config).await
            }
            Err(err) => {
                send_status(stream, upstream_failure(&err), &proxy_headers())
                    .await
                    .unwrap_or_default();
                Err(err)
            }
        }
    }
}

async fn proxy_request<S, U>(
    stream: &mut S,
    conn: &mut ConnectionGuard,
    mut upstream: U,
    request: &[u8],
    body: &[u8],
    url: &Url,
    config: &Config,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(err) = send_request(&mut upstream, request, body).await {
        send_status(stream, Status::BadGateway, &proxy_headers())
            .await
            .unwrap_or_default();
        return Err(Error::Connect(url.to_string(), err));
    }
    conn.set_phase(Phase::Tunneling);
    exchange(stream, upstream, conn.peer(), url, config).await
}

async fn send_request<U>(upstream: &mut U, request: &[u8], body: &[u8]) -> io::Result<()>
where
    U: AsyncWrite + Unpin,
{
    upstream.write_all(request).await?;
    upstream.write_all(body).await?;
    upstream.flush().await
}

/// Streams the rest of the request body upstream while relaying the response
/// back. The exchange ends when the upstream finishes its response, either
/// side fails, or nothing moves for the idle timeout.
async fn exchange<S, U>(
    stream: &mut S,
    upstream: U,
    client_addr: SocketAddr,
    url: &Url,
    config: &Config,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let activity = Activity::new();
    let upload = AtomicU64::new(0);
    let download = AtomicU64::new(0);
    let (mut upstream_reader, mut upstream_writer) = io::split(upstream);
    let (mut client_reader, mut client_writer) = io::split(stream);

    let request_side = async {
        pipe(&mut client_reader, &mut upstream_writer, &upload, &activity).await?;
        upstream_writer.shutdown().await.unwrap_or_default();
        future::pending::<Result<(), Error>>().await
    };
    let response_side = async {
        let read = time::timeout(
            config.connect_timeout,
            read_head(&mut upstream_reader, MAX_HEAD_SIZE, |_: &[u8]| Ok(())),
        )
        .await;
        let (head, rest) = match read {
            Ok(Ok(v)) => v,
            Ok(Err(err)) => {
                send_status(&mut client_writer, Status::BadGateway, &proxy_headers())
                    .await
                    .unwrap_or_default();
                return Err(match err {
                    Error::Io(err) => Error::Connect(url.to_string(), err),
                    err => err,
                });
            }
            Err(_) => {
                send_status(&mut client_writer, Status::GatewayTimeout, &proxy_headers())
                    .await
                    .unwrap_or_default();
                return Err(Error::Timeout(url.to_string()));
            }
        };
        let Some(response) = rewrite_response(&head) else {
            send_status(&mut client_writer, Status::BadGateway, &proxy_headers())
                .await
                .unwrap_or_default();
            return Err(Error::Connect(
                url.to_string(),
                io::Error::new(io::ErrorKind::InvalidData, "invalid response from upstream"),
            ));
        };
        client_writer.write_all(&response).await.map_err(Error::Tunnel)?;
        client_writer.write_all(&rest).await.map_err(Error::Tunnel)?;
        activity.touch();
        pipe(&mut upstream_reader, &mut client_writer, &download, &activity).await
    };

    let result = tokio::select! {
        v = request_side => v,
        v = response_side => v,
        _ = activity.idle(config.idle_timeout) => Err(Error::Timeout(url.to_string())),
    };
    client_writer.shutdown().await.unwrap_or_default();
    debug!(
        "http request from client {client_addr} to {url} finished: {} bytes up, {} bytes down",
        upload.load(Ordering::Relaxed),
        download.load(Ordering::Relaxed)
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> RequestHead {
        RequestHead::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn target_from_absolute_uri() {
        let head = parse("GET http://example.com:8080/a?b=c HTTP/1.1\r\n\r\n");
        let url = resolve_target(&head).unwrap().unwrap();
        assert_eq!(url.as_str(), "http://example.com:8080/a?b=c");
    }

    #[test]
    fn target_from_header() {
        let head = parse("GET / HTTP/1.1\r\nX-Target-URL: http://example.com/x\r\n\r\n");
        let url = resolve_target(&head).unwrap().unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.path(), "/x");
    }

    #[test]
    fn target_from_query_parameter() {
        let head = parse("GET /proxy?url=http%3A%2F%2Fexample.com%2Fdata%3Fq%3D1 HTTP/1.1\r\n\r\n");
        let url = resolve_target(&head).unwrap().unwrap();
        assert_eq!(url.as_str(), "http://example.com/data?q=1");
    }

    #[test]
    fn https_target_defaults_to_port_443() {
        let head = parse("GET /proxy?url=https://example.com/feed HTTP/1.1\r\n\r\n");
        let url = resolve_target(&head).unwrap().unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.port_or_known_default(), Some(443));
        let request = String::from_utf8(build_request(&head, &url)).unwrap();
        assert!(request.starts_with("GET /feed HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com\r\n"));
    }

    #[test]
    fn missing_or_unsupported_targets() {
        assert!(resolve_target(&parse("GET /index.html HTTP/1.1\r\n\r\n")).unwrap().is_none());
        assert!(resolve_target(&parse("GET /?url=ftp://example.com/ HTTP/1.1\r\n\r\n")).is_err());
        assert!(resolve_target(&parse("GET /?url=http:// HTTP/1.1\r\n\r\n")).is_err());
    }

    #[test]
    fn request_strips_proxy_headers_and_rewrites_host() {
        let head = parse(concat!(
            "POST http://example.com:8080/submit?x=1 HTTP/1.1\r\n",
            "Host: proxy.local\r\n",
            "Proxy-Connection: keep-alive\r\n",
            "Proxy-Authorization: Basic Zm9vOmJhcg==\r\n",
            "X-Forwarded-For: 10.0.0.1\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Length: 5\r\n",
            "\r\n",
        ));
        let url = resolve_target(&head).unwrap().unwrap();
        let request = String::from_utf8(build_request(&head, &url)).unwrap();
        assert_eq!(
            request,
            concat!(
                "POST /submit?x=1 HTTP/1.1\r\n",
                "Content-Type: text/plain\r\n",
                "Content-Length: 5\r\n",
                "Host: example.com:8080\r\n",
                "Connection: close\r\n",
                "\r\n",
            )
        );
    }

    #[test]
    fn response_gets_cors_and_via_headers() {
        let head = b"HTTP/1.1 404 Not Found\r\nContent-Length: 3\r\nAccess-Control-Allow-Origin: https://a.example\r\n\r\n";
        let response = String::from_utf8(rewrite_response(head).unwrap()).unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\nContent-Length: 3\r\n"));
        assert!(response.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(!response.contains("a.example"));
        assert!(response.ends_with("X-Proxy-Via: mixproxy\r\n\r\n"));
    }

    #[test]
    fn response_headers_are_copied_byte_for_byte() {
        let head = b"HTTP/1.1 200 OK\r\nContent-Length:5\r\nX-Name: caf\xe9\r\n\r\n";
        let response = rewrite_response(head).unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Name: caf\xe9\r\n"));
        assert!(response.ends_with(b"X-Proxy-Via: mixproxy\r\n\r\n"));
    }

    #[test]
    fn non_http_response_is_rejected() {
        assert!(rewrite_response(b"SSH-2.0-OpenSSH\r\n\r\n").is_none());
    }
}
