// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

use std::{error, fmt, io};

/// How a failed connection is accounted for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Malformed handshake or request bytes.
    Protocol,
    /// The destination could not be reached.
    Upstream,
    /// The request was understood and refused.
    Policy,
    /// A socket failed after the handshake completed.
    Transport,
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    EmptyRequest,
    VersionMismatch,
    InvalidDomainName,
    CommandNotSupported(u8),
    AddressTypeNotSupported(u8),
    MalformedRequest(&'static str),
    HeaderTooLarge,
    NoAcceptableAuthMethod,
    AuthenticationFailed,
    DestinationNotAllowed(String),
    Connect(String, io::Error),
    HandshakeTimeout,
    Timeout(String),
    Tunnel(io::Error),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        use Error::*;
        match self {
            NoAcceptableAuthMethod | AuthenticationFailed | DestinationNotAllowed(_) => {
                ErrorClass::Policy
            }
            Connect(..) | Timeout(_) => ErrorClass::Upstream,
            Tunnel(_) => ErrorClass::Transport,
            _ => ErrorClass::Protocol,
        }
    }

    /// Whether the failure is counted in the `errors` statistic.
    pub fn is_counted(&self) -> bool {
        matches!(self.class(), ErrorClass::Protocol | ErrorClass::Upstream)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            Io(err) => err.fmt(f),
            EmptyRequest => f.write_str("connection closed before sending any data"),
            VersionMismatch => f.write_str("version mismatch"),
            InvalidDomainName => f.write_str("invalid domain name"),
            CommandNotSupported(cmd) => write!(f, "command 0x{cmd:02x} not supported"),
            AddressTypeNotSupported(atyp) => write!(f, "address type 0x{atyp:02x} not supported"),
            MalformedRequest(reason) => write!(f, "malformed request: {reason}"),
            HeaderTooLarge => f.write_str("request header too large"),
            NoAcceptableAuthMethod => f.write_str("no acceptable authentication methods"),
            AuthenticationFailed => f.write_str("authentication failed"),
            DestinationNotAllowed(dest) => write!(f, "destination {dest} not allowed"),
            Connect(dest, err) => write!(f, "failed to connect to {dest}: {err}"),
            HandshakeTimeout => f.write_str("client did not complete the handshake in time"),
            Timeout(dest) => write!(f, "timed out waiting for {dest}"),
            Tunnel(err) => write!(f, "tunnel closed: {err}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(err) | Self::Connect(_, err) | Self::Tunnel(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
