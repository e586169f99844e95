//! Bootstrap file persistence (§4.4): a flat text file of
//! `dotted-ipv4 decimal-port` lines, used only to seed the routing table on
//! startup and to give future restarts a chance of avoiding a cold DHT
//! join.
//!
//! The source's positional-cursor iteration (§9, "store reload and getPeer
//! iteration") is replaced here by a plain `Vec<Endpoint>` snapshot.

use crate::id::Endpoint;
use log::warn;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Entries are retained even past `PeerStore::capacity` entries are not
/// permitted in, so this is simultaneously the bound and the "≥ 90%"
/// threshold denominator from §4.4.
const DEFAULT_CAPACITY: usize = 500;

pub struct PeerStore {
    path: Option<PathBuf>,
    capacity: usize,
    entries: Vec<Endpoint>,
}

impl PeerStore {
    pub fn new(capacity: usize) -> Self {
        PeerStore {
            path: None,
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Loads entries from `path`. Non-parsing lines are skipped; any I/O
    /// failure (missing file, permissions) logs a warning and leaves the
    /// store empty rather than propagating (§7, "File I/O").
    pub fn load(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.path = Some(path.to_path_buf());
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("could not load bootstrap file {:?}: {}", path, e);
                return;
            }
        };
        for line in contents.lines() {
            if let Some(endpoint) = parse_line(line) {
                self.add(endpoint);
            }
        }
    }

    /// Adds (or refreshes) a contact's endpoint. Any prior entry for the
    /// same endpoint is removed first so duplicates are never retained,
    /// then the endpoint is appended as the most-recently-seen entry. The
    /// store never exceeds its capacity; the oldest entry is dropped to
    /// make room.
    pub fn add(&mut self, endpoint: Endpoint) {
        self.entries.retain(|e| *e != endpoint);
        self.entries.push(endpoint);
        while self.entries.len() > self.capacity {
            self.entries.remove(0);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current contents, most-recently-seen last.
    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.entries.clone()
    }

    /// Rewrites the backing file wholesale. Only called by the manager once
    /// the store is at least 90% full (§4.4: "delay avoids early
    /// empty-state writes"); a write failure is logged and otherwise
    /// ignored (§7).
    pub fn persist(&self) {
        let path = match &self.path {
            Some(p) => p,
            None => return,
        };
        if !self.should_persist() {
            return;
        }
        let mut buf = String::new();
        for e in &self.entries {
            buf.push_str(&format!("{} {}\n", e.ip, e.port));
        }
        if let Err(e) = write_atomic(path, buf.as_bytes()) {
            warn!("could not persist bootstrap file {:?}: {}", path, e);
        }
    }

    pub fn should_persist(&self) -> bool {
        self.entries.len() * 10 >= self.capacity * 9
    }
}

fn parse_line(line: &str) -> Option<Endpoint> {
    let line = line.trim();
    let mut parts = line.split_whitespace();
    let ip: Ipv4Addr = parts.next()?.parse().ok()?;
    let port: u16 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(Endpoint::new(ip, port))
}

fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}
