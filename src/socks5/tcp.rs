// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

use crate::error::Error;
use crate::socks5::Address;
use tokio::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00u8,
    NotAllowed = 0x02u8,
    ConnectionRefused = 0x05u8,
    CommandNotSupported = 0x07u8,
    AddressTypeNotSupported = 0x08u8,
}

const CONNECT: u8 = 0x01;

/// Reply to a request. The bind address is always reported as `0.0.0.0:0`.
pub struct Reply {
    rep: ReplyCode,
}

impl Reply {
    pub fn new(rep: ReplyCode) -> Self {
        Self { rep }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer
            .write_all(&[5u8, self.rep as u8, 0u8, 1u8, 0u8, 0u8, 0u8, 0u8, 0u8, 0u8])
            .await?;
        writer.flush().await
    }
}

#[derive(Debug)]
pub struct Request {
    addr: Address,
}

impl Request {
    /// Reads a request. Unsupported commands and address types are answered
    /// with the matching reply code before the error is returned.
    pub async fn read_from<RW>(stream: &mut RW) -> Result<Self, Error>
    where
        RW: AsyncRead + AsyncWrite + Unpin,
    {
        let version = stream.read_u8().await?;
        if version != 5u8 {
            return Err(Error::VersionMismatch);
        }
        let cmd = stream.read_u8().await?;
        if cmd != CONNECT {
            Reply::new(ReplyCode::CommandNotSupported)
                .write_to(stream)
                .await
                .unwrap_or_default();
            return Err(Error::CommandNotSupported(cmd));
        }
        let _rsv = stream.read_u8().await?;
        let addr = match Address::read_from(stream).await {
            Ok(v) => v,
            Err(Error::AddressTypeNotSupported(atyp)) => {
                Reply::new(ReplyCode::AddressTypeNotSupported)
                    .write_to(stream)
                    .await
                    .unwrap_or_default();
                return Err(Error::AddressTypeNotSupported(atyp));
            }
            Err(err) => {
                return Err(err);
            }
        };
        Ok(Self { addr })
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }
}
