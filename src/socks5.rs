// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

mod auth;
mod tcp;

use crate::config::Config;
use crate::dial::dial;
use crate::error::Error;
use log::info;
use std::fmt;
use std::fmt::Display;
use std::net::{Ipv6Addr, SocketAddr};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time;

pub use crate::socks5::tcp::{Reply, ReplyCode, Request};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum AddrType {
    IPv4 = 0x01u8,
    DomainName = 0x03u8,
    IPv6 = 0x04u8,
}

impl TryFrom<u8> for AddrType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value == AddrType::IPv4 as u8 {
            Ok(AddrType::IPv4)
        } else if value == AddrType::DomainName as u8 {
            Ok(AddrType::DomainName)
        } else if value == AddrType::IPv6 as u8 {
            Ok(AddrType::IPv6)
        } else {
            Err(Error::AddressTypeNotSupported(value))
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Reads ATYP, the address and the big-endian port. IPv6 targets are
    /// recognised but refused.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, Error> {
        let addr_type = reader.read_u8().await?.try_into()?;
        match addr_type {
            AddrType::IPv4 => {
                let mut ip = [0u8; 4];
                reader.read_exact(&mut ip).await?;
                let port = reader.read_u16().await?;
                Ok(Self::Socket(SocketAddr::new(ip.into(), port)))
            }
            AddrType::DomainName => {
                let len = reader.read_u8().await? as usize;
                if len < 1 {
                    return Err(Error::InvalidDomainName);
                }
                let mut domain = vec![0u8; len];
                reader.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain).map_err(|_| Error::InvalidDomainName)?;
                let port = reader.read_u16().await?;
                Ok(Self::Domain(domain, port))
            }
            AddrType::IPv6 => Err(Error::AddressTypeNotSupported(AddrType::IPv6 as u8)),
        }
    }

    pub fn host(&self) -> String {
        match self {
            Self::Socket(addr) => addr.ip().to_string(),
            Self::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Socket(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(addr) => addr.fmt(f),
            Self::Domain(domain, port) => {
                if let Ok(addr) = Ipv6Addr::from_str(domain) {
                    write!(f, "[{addr}]:{port}")
                } else {
                    write!(f, "{domain}:{port}")
                }
            }
        }
    }
}

/// Drives the SOCKS5 handshake on `stream` and returns the connected target.
///
/// Method selection, authentication and the request must complete within the
/// configured handshake timeout; connecting to the target is bounded by the
/// connect timeout. Every failure that has a SOCKS5 reply is answered before
/// the error is returned.
pub async fn handshake<RW>(
    stream: &mut RW,
    client_addr: SocketAddr,
    config: &Config,
) -> Result<TcpStream, Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    let request = time::timeout(config.handshake_timeout, negotiate(stream, config))
        .await
        .map_err(|_| Error::HandshakeTimeout)?;
    let request = match request {
        Ok(v) => v,
        Err(err @ (Error::NoAcceptableAuthMethod | Error::AuthenticationFailed)) => {
            info!("socks5 request from client {client_addr} rejected: {err}");
            return Err(err);
        }
        Err(err) => return Err(err),
    };
    let addr = request.addr();
    let remote_addr = addr.to_string();

    if !config.is_allowed(&addr.host(), addr.port()) {
        info!(
            "socks5 connect request from client {client_addr} to tcp://{remote_addr} rejected: destination not allowed"
        );
        Reply::new(ReplyCode::NotAllowed)
            .write_to(stream)
            .await
            .unwrap_or_default();
        return Err(Error::DestinationNotAllowed(remote_addr));
    }

    info!("socks5 connect request from client {client_addr} to tcp://{remote_addr} accepted");
    match dial(&addr.host(), addr.port(), config.connect_timeout).await {
        Ok(remote) => {
            Reply::new(ReplyCode::Succeeded).write_to(stream).await?;
            Ok(remote)
        }
        Err(err) => {
            Reply::new(ReplyCode::ConnectionRefused)
                .write_to(stream)
                .await
                .unwrap_or_default();
            Err(err)
        }
    }
}

async fn negotiate<RW>(stream: &mut RW, config: &Config) -> Result<Request, Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    if stream.read_u8().await? != 5u8 {
        return Err(Error::VersionMismatch);
    }
    auth::authenticate(stream, config.socks5_auth.as_ref()).await?;
    Request::read_from(stream).await
}
