// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

//! HTTP/HTTPS and SOCKS5 proxy on a single port.
//!
//! The first packet of every connection decides which protocol handler owns
//! it; after a successful CONNECT or SOCKS5 handshake the connection becomes a
//! byte-transparent tunnel to the requested destination.

pub mod config;
pub mod detect;
pub mod dial;
pub mod error;
pub mod framed;
pub mod http;
pub mod registry;
pub mod relay;
pub mod server;
pub mod socks5;

pub use config::{Config, Credentials};
pub use error::{Error, ErrorClass};
pub use registry::{ConnectionInfo, Phase, Registry, Stats};
pub use server::{Context, Server, handle_conn};
