// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

use clap::Parser;
use mixproxy::config::DEFAULT_PORT;
use mixproxy::{Config, Credentials, Server};
use std::net::{IpAddr, SocketAddr};
use std::process;
use std::time::Duration;

#[derive(Parser)]
#[command(version, about)]
pub struct Args {
    #[arg(
        help = "specify bind address [default: 0.0.0.0]",
        long = "bind",
        short = 'b'
    )]
    pub address: Option<IpAddr>,

    #[arg(help = "specify bind port", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(
        help = "require socks5 username/password authentication",
        long = "user",
        short = 'u',
        requires = "password"
    )]
    pub username: Option<String>,

    #[arg(
        help = "password for socks5 authentication",
        long = "password",
        short = 'p',
        requires = "username"
    )]
    pub password: Option<String>,

    #[arg(
        help = "only allow these destinations (host or host:port) besides port 443",
        long = "allow",
        short = 'a',
        value_delimiter = ','
    )]
    pub allow: Vec<String>,

    #[arg(help = "seconds to wait for a destination to accept", long, default_value_t = 30)]
    pub connect_timeout: u64,

    #[arg(help = "seconds a tunnel may stay silent before it is closed", long, default_value_t = 300)]
    pub idle_timeout: u64,
}

impl Args {
    fn into_config(self) -> Config {
        let address = self.address.unwrap_or(IpAddr::from([0u8, 0u8, 0u8, 0u8]));
        let socks5_auth = match (self.username, self.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        };
        Config {
            listen: SocketAddr::new(address, self.port),
            socks5_auth,
            allowed_destinations: (!self.allow.is_empty()).then_some(self.allow),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            ..Config::default()
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let config = Args::parse().into_config();
    let addr = config.listen;

    let server = Server::bind(config).await.unwrap_or_else(|err| {
        eprintln!("error: failed to bind to tcp://{addr}: {err}");
        process::exit(1);
    });
    println!("Serving HTTP and SOCKS5 on {addr}");

    server.serve().await;
}
