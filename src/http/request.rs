// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

use crate::error::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Request line and headers of an HTTP request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        let (request_line, headers) = split_head(buf);
        let mut parts = request_line.splitn(3, ' ');
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::MalformedRequest("incomplete request line"));
        };
        if !is_token(method.as_bytes()) {
            return Err(Error::MalformedRequest("invalid method"));
        }
        if target.is_empty() || !version.starts_with("HTTP/") {
            return Err(Error::MalformedRequest("invalid request line"));
        }
        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Splits a head into its start line and `key: value` headers. Header lines
/// without the `: ` separator are skipped.
fn split_head(buf: &[u8]) -> (String, Vec<(String, String)>) {
    let text = String::from_utf8_lossy(buf);
    let mut lines = text.split("\r\n");
    let start_line = lines.next().unwrap_or_default().to_string();
    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(": "))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    (start_line, headers)
}

/// Reads until the blank line ending a head. Returns the head (terminator
/// included) and whatever was read past it.
///
/// `check` sees the bytes buffered so far after every read and can abort early
/// when they cannot be the start of a valid head.
pub async fn read_head<R, F>(reader: &mut R, limit: usize, check: F) -> Result<(Vec<u8>, Vec<u8>), Error>
where
    R: AsyncRead + Unpin,
    F: Fn(&[u8]) -> Result<(), Error>,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let len = reader.read(&mut chunk).await?;
        if len == 0 {
            return Err(Error::MalformedRequest("connection closed inside head"));
        }
        let searched = buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        buf.extend_from_slice(&chunk[..len]);
        check(&buf)?;
        if let Some(pos) = find(&buf[searched..], HEAD_TERMINATOR) {
            let end = searched + pos + HEAD_TERMINATOR.len();
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > limit {
            return Err(Error::HeaderTooLarge);
        }
    }
}

/// Rejects buffers whose first word cannot be an HTTP method.
pub fn check_request_start(buf: &[u8]) -> Result<(), Error> {
    let word = match buf.iter().position(|b| *b == b' ') {
        Some(0) => return Err(Error::MalformedRequest("invalid method")),
        Some(pos) => &buf[..pos],
        None => buf,
    };
    if is_token(word) {
        Ok(())
    } else {
        Err(Error::MalformedRequest("invalid method"))
    }
}

/// Splits an authority such as `host:port` or `[::1]:443`. The port falls back
/// to `default_port` when missing or unparseable.
pub fn split_host_port(target: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match target.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => (target.to_string(), default_port),
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(default_port)),
        None => (target.to_string(), default_port),
    }
}

fn is_token(word: &[u8]) -> bool {
    !word.is_empty()
        && word.iter().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(b)
        })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
