// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

use crate::config::Credentials;
use crate::error::Error;
use tokio::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const USER_PASS_VERSION: u8 = 0x01u8;

#[derive(Clone, Copy)]
#[repr(u8)]
enum Method {
    NoAuth = 0x00u8,
    UserPass = 0x02u8,
    NoAcceptable = 0xFFu8,
}

#[derive(Clone, Copy)]
#[repr(u8)]
enum Status {
    Success = 0x00u8,
    Failure = 0x01u8,
}

async fn send_response<W: AsyncWrite + Unpin>(writer: &mut W, method: Method) -> io::Result<()> {
    writer.write_all(&[5u8, method as u8]).await?;
    writer.flush().await
}

async fn send_status<W: AsyncWrite + Unpin>(writer: &mut W, status: Status) -> io::Result<()> {
    writer.write_all(&[USER_PASS_VERSION, status as u8]).await?;
    writer.flush().await
}

/// Runs method selection (the version byte has already been read) and, when
/// credentials are configured, the username/password sub-negotiation.
pub async fn authenticate<RW>(stream: &mut RW, credentials: Option<&Credentials>) -> Result<(), Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    let len = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; len];
    stream.read_exact(&mut methods).await?;
    let wanted = match credentials {
        Some(_) => Method::UserPass,
        None => Method::NoAuth,
    };
    if !methods.contains(&(wanted as u8)) {
        send_response(stream, Method::NoAcceptable)
            .await
            .unwrap_or_default();
        return Err(Error::NoAcceptableAuthMethod);
    }
    send_response(stream, wanted).await?;
    match credentials {
        Some(credentials) => verify(stream, credentials).await,
        None => Ok(()),
    }
}

async fn verify<RW>(stream: &mut RW, credentials: &Credentials) -> Result<(), Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    if stream.read_u8().await? != USER_PASS_VERSION {
        return Err(Error::VersionMismatch);
    }
    let len = stream.read_u8().await? as usize;
    let mut username = vec![0u8; len];
    stream.read_exact(&mut username).await?;
    let len = stream.read_u8().await? as usize;
    let mut password = vec![0u8; len];
    stream.read_exact(&mut password).await?;
    if credentials.matches(&username, &password) {
        send_status(stream, Status::Success).await?;
        Ok(())
    } else {
        send_status(stream, Status::Failure).await.unwrap_or_default();
        Err(Error::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(input: &[u8], credentials: Option<Credentials>) -> (Result<(), Error>, Vec<u8>) {
        let (mut client, mut server) = io::duplex(256);
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();
        let result = authenticate(&mut server, credentials.as_ref()).await;
        drop(server);
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        (result, reply)
    }

    #[tokio::test]
    async fn selects_no_auth() {
        let (result, reply) = run(&[0x01, 0x00], None).await;
        assert!(result.is_ok());
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn rejects_user_pass_only_without_credentials() {
        let (result, reply) = run(&[0x01, 0x02], None).await;
        assert!(matches!(result, Err(Error::NoAcceptableAuthMethod)));
        assert_eq!(reply, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn rejects_no_auth_when_credentials_required() {
        let creds = Credentials::new("user", "pass");
        let (result, reply) = run(&[0x01, 0x00], Some(creds)).await;
        assert!(matches!(result, Err(Error::NoAcceptableAuthMethod)));
        assert_eq!(reply, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn accepts_matching_credentials() {
        let creds = Credentials::new("user", "pass");
        let input = [
            0x02, 0x00, 0x02, 0x01, 4, b'u', b's', b'e', b'r', 4, b'p', b'a', b's', b's',
        ];
        let (result, reply) = run(&input, Some(creds)).await;
        assert!(result.is_ok());
        assert_eq!(reply, [0x05, 0x02, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn rejects_wrong_password() {
        let creds = Credentials::new("user", "pass");
        let input = [0x01, 0x02, 0x01, 4, b'u', b's', b'e', b'r', 3, b'b', b'a', b'd'];
        let (result, reply) = run(&input, Some(creds)).await;
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
        assert_eq!(reply, [0x05, 0x02, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn short_greeting_is_an_error() {
        let (result, reply) = run(&[0x03, 0x00], None).await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(reply.is_empty());
    }
}
