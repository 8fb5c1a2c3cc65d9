// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

//! Live connection table and process-wide counters.
//!
//! Counters are plain atomics. The connection table sits behind a mutex that is
//! only taken when a connection is opened, changes phase or closes, never while
//! bytes are being relayed.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Detecting,
    HttpHandshake,
    Socks5Handshake,
    Tunneling,
    Closed,
}

impl Phase {
    /// Tunneling is terminal until close; nothing leaves `Closed`.
    pub fn can_transition_to(self, next: Phase) -> bool {
        match (self, next) {
            (Phase::Closed, _) => false,
            (_, Phase::Closed) => true,
            (Phase::Tunneling, _) => false,
            (Phase::Detecting, _) => true,
            (Phase::HttpHandshake | Phase::Socks5Handshake, Phase::Tunneling) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Detecting => "detecting",
            Phase::HttpHandshake => "http-handshake",
            Phase::Socks5Handshake => "socks5-handshake",
            Phase::Tunneling => "tunneling",
            Phase::Closed => "closed",
        })
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub phase: Phase,
    pub age: Duration,
}

/// Point-in-time copy of the counters for a reporting layer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub http_requests: u64,
    pub socks5_connections: u64,
    pub connect_tunnels: u64,
    pub errors: u64,
    pub active_connections: u64,
    pub uptime: Duration,
}

struct Entry {
    peer: SocketAddr,
    phase: Phase,
    opened: Instant,
}

pub struct Registry {
    started: Instant,
    next_id: AtomicU64,
    http_requests: AtomicU64,
    socks5_connections: AtomicU64,
    connect_tunnels: AtomicU64,
    errors: AtomicU64,
    connections: Mutex<HashMap<u64, Entry>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            next_id: AtomicU64::new(1),
            http_requests: AtomicU64::new(0),
            socks5_connections: AtomicU64::new(0),
            connect_tunnels: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new connection in the `Detecting` phase. The entry is
    /// removed when the returned guard is dropped.
    pub fn open(self: &Arc<Self>, peer: SocketAddr) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.table().insert(
            id,
            Entry {
                peer,
                phase: Phase::Detecting,
                opened: Instant::now(),
            },
        );
        ConnectionGuard {
            id,
            peer,
            phase: Phase::Detecting,
            registry: self.clone(),
        }
    }

    pub fn record_http_request(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_socks5_connection(&self) {
        self.socks5_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_tunnel(&self) {
        self.connect_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.table().len() as u64
    }

    pub fn stats(&self) -> Stats {
        Stats {
            http_requests: self.http_requests.load(Ordering::Relaxed),
            socks5_connections: self.socks5_connections.load(Ordering::Relaxed),
            connect_tunnels: self.connect_tunnels.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            active_connections: self.active_connections(),
            uptime: self.started.elapsed(),
        }
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<_> = self
            .table()
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                id: *id,
                peer: entry.peer,
                phase: entry.phase,
                age: entry.opened.elapsed(),
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    // A panic in another connection's task must not take the table down with it.
    fn table(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to one registered connection, owned by the task serving it.
pub struct ConnectionGuard {
    id: u64,
    peer: SocketAddr,
    phase: Phase,
    registry: Arc<Registry>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Moves the connection to `next`. Returns `false` and leaves the phase
    /// untouched when the transition is not allowed.
    pub fn set_phase(&mut self, next: Phase) -> bool {
        if !self.phase.can_transition_to(next) {
            return false;
        }
        self.phase = next;
        if let Some(entry) = self.registry.table().get_mut(&self.id) {
            entry.phase = next;
        }
        true
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.phase = Phase::Closed;
        self.registry.table().remove(&self.id);
    }
}
