// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;

/// Static username/password accepted by the SOCKS5 handler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn matches(&self, username: &[u8], password: &[u8]) -> bool {
        self.username.as_bytes() == username && self.password.as_bytes() == password
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub listen: SocketAddr,
    pub socks5_auth: Option<Credentials>,
    /// When set, only these hosts (or `host:port` entries) and port 443 may be
    /// reached. `None` allows every destination.
    pub allowed_destinations: Option<Vec<String>>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new([0u8, 0u8, 0u8, 0u8].into(), DEFAULT_PORT),
            socks5_auth: None,
            allowed_destinations: None,
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    pub fn is_allowed(&self, host: &str, port: u16) -> bool {
        let Some(allowed) = &self.allowed_destinations else {
            return true;
        };
        if port == 443 {
            return true;
        }
        let host = host.trim_matches(|c| c == '[' || c == ']');
        allowed.iter().any(|entry| match split_entry(entry) {
            (name, Some(p)) => p == port && name.eq_ignore_ascii_case(host),
            (name, None) => name.eq_ignore_ascii_case(host),
        })
    }
}

fn split_entry(entry: &str) -> (&str, Option<u16>) {
    if let Some((name, port)) = entry.rsplit_once(':') {
        if !name.contains(':') || name.ends_with(']') {
            if let Ok(port) = port.parse() {
                return (name.trim_matches(|c| c == '[' || c == ']'), Some(port));
            }
        }
    }
    (entry.trim_matches(|c| c == '[' || c == ']'), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restricted(list: &[&str]) -> Config {
        Config {
            allowed_destinations: Some(list.iter().map(|s| s.to_string()).collect()),
            ..Config::default()
        }
    }

    #[test]
    fn no_allow_list_permits_everything() {
        assert!(Config::default().is_allowed("internal.example", 22));
    }

    #[test]
    fn allow_list_matches_hosts_and_port_443() {
        let config = restricted(&["api.example.com", "cache.local:6379", "[::1]:8080"]);
        assert!(config.is_allowed("API.example.com", 80));
        assert!(config.is_allowed("anything.example", 443));
        assert!(config.is_allowed("cache.local", 6379));
        assert!(!config.is_allowed("cache.local", 6380));
        assert!(config.is_allowed("::1", 8080));
        assert!(!config.is_allowed("other.example", 80));
    }

    #[test]
    fn credentials_compare_bytes() {
        let creds = Credentials::new("alice", "s3cret");
        assert!(creds.matches(b"alice", b"s3cret"));
        assert!(!creds.matches(b"alice", b"wrong"));
    }
}
