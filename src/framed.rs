// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

use crate::error::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

pub const FIRST_CHUNK_SIZE: usize = 4096;

/// A stream whose first chunk has already been read for protocol sniffing.
///
/// The chunk is handed back to readers before anything else, so handlers see
/// the connection exactly as the client sent it.
pub struct PrefixedStream<S> {
    inner: S,
    prefix: Vec<u8>,
    pos: usize,
}

impl<S: AsyncRead + Unpin> PrefixedStream<S> {
    /// Performs a single read of at most `capacity` bytes from `inner`.
    pub async fn read_first(mut inner: S, capacity: usize) -> Result<Self, Error> {
        let mut prefix = vec![0u8; capacity];
        let len = inner.read(&mut prefix).await?;
        if len == 0 {
            return Err(Error::EmptyRequest);
        }
        prefix.truncate(len);
        Ok(Self {
            inner,
            prefix,
            pos: 0,
        })
    }
}

impl<S> PrefixedStream<S> {
    /// The bytes captured by the first read, whether or not they have been
    /// replayed yet.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let len = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..len]);
            self.pos += len;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
