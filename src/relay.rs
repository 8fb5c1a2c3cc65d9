// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

use crate::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Instant};

const BUFFER_SIZE: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TunnelStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
}

/// A client stream paired with the target stream it was connected to.
///
/// Both streams live and die together: as soon as one direction ends, for any
/// reason, both write halves are shut down and both streams are dropped.
pub struct Tunnel<A, B> {
    client: A,
    target: B,
}

impl<A, B> Tunnel<A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(client: A, target: B) -> Self {
        Self { client, target }
    }

    pub async fn run(self, idle_timeout: Duration) -> Result<TunnelStats, Error> {
        let activity = Activity::new();
        let upload = AtomicU64::new(0);
        let download = AtomicU64::new(0);
        let (mut client_reader, mut client_writer) = io::split(self.client);
        let (mut target_reader, mut target_writer) = io::split(self.target);

        let result = tokio::select! {
            v = pipe(&mut client_reader, &mut target_writer, &upload, &activity) => v,
            v = pipe(&mut target_reader, &mut client_writer, &download, &activity) => v,
            _ = activity.idle(idle_timeout) => {
                Err(Error::Timeout(format!("idle tunnel after {}s", idle_timeout.as_secs())))
            }
        };

        client_writer.shutdown().await.unwrap_or_default();
        target_writer.shutdown().await.unwrap_or_default();

        result.map(|()| TunnelStats {
            client_to_target: upload.load(Ordering::Relaxed),
            target_to_client: download.load(Ordering::Relaxed),
        })
    }
}

pub(crate) async fn pipe<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    activity: &Activity,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let len = reader.read(&mut buf).await.map_err(Error::Tunnel)?;
        if len == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..len]).await.map_err(Error::Tunnel)?;
        counter.fetch_add(len as u64, Ordering::Relaxed);
        activity.touch();
    }
}

/// Last time either direction moved data, in milliseconds since creation.
pub(crate) struct Activity {
    created: Instant,
    last: AtomicU64,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    pub(crate) fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last.store(now, Ordering::Relaxed);
    }

    pub(crate) async fn idle(&self, timeout: Duration) {
        loop {
            let last = self.created + Duration::from_millis(self.last.load(Ordering::Relaxed));
            let deadline = last + timeout;
            if Instant::now() >= deadline {
                return;
            }
            time::sleep_until(deadline).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relays_both_directions() {
        let (mut client, client_side) = io::duplex(1024);
        let (mut target, target_side) = io::duplex(1024);
        let handle = tokio::spawn(
            Tunnel::new(client_side, target_side).run(Duration::from_secs(60)),
        );

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.client_to_target, 4);
        assert_eq!(stats.target_to_client, 5);
    }

    #[tokio::test]
    async fn closing_client_closes_target() {
        let (client, client_side) = io::duplex(1024);
        let (mut target, target_side) = io::duplex(1024);
        let handle = tokio::spawn(
            Tunnel::new(client_side, target_side).run(Duration::from_secs(60)),
        );

        drop(client);
        let mut buf = Vec::new();
        let read = time::timeout(Duration::from_secs(5), target.read_to_end(&mut buf)).await;
        assert_eq!(read.unwrap().unwrap(), 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closing_target_closes_client() {
        let (mut client, client_side) = io::duplex(1024);
        let (target, target_side) = io::duplex(1024);
        let handle = tokio::spawn(
            Tunnel::new(client_side, target_side).run(Duration::from_secs(60)),
        );

        drop(target);
        let mut buf = Vec::new();
        let read = time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf)).await;
        assert_eq!(read.unwrap().unwrap(), 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_tunnel_times_out() {
        let (_client, client_side) = io::duplex(1024);
        let (_target, target_side) = io::duplex(1024);
        let result = Tunnel::new(client_side, target_side)
            .run(Duration::from_secs(300))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
