//! Address book: scored peer addresses, ban list, and local address
//! advertisement. Persists as flat bincode files under the data dir.

use crate::net::types::NetAddress;
use crate::types::now;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Bound on stored addresses; beyond it, a random stale entry makes room.
const MAX_ENTRIES: usize = 20_000;

/// Reject persisted files past this size before deserializing.
const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024;

/// Addr timestamps more than this far in the future are suspicious.
const MAX_FUTURE_DRIFT: u64 = 10 * 60;

/// Suspicious entries are re-dated this far back.
const REDATE_AGE: u64 = 5 * 24 * 60 * 60;

/// Default ban span.
pub const BAN_TIME: u64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum AddrManError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt address file: {0}")]
    Corrupt(String),
}

/// One known address with connection history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrEntry {
    pub addr: NetAddress,
    /// Who told us about it (source diversity).
    pub src: Option<NetAddress>,
    pub last_attempt: u64,
    pub last_success: u64,
    pub attempts: u32,
}

impl AddrEntry {
    fn new(addr: NetAddress, src: Option<NetAddress>) -> Self {
        Self { addr, src, last_attempt: 0, last_success: 0, attempts: 0 }
    }

    /// Deprioritize addresses that keep failing or have gone stale.
    pub fn is_stale(&self) -> bool {
        let now = now();
        if self.addr.time > now.saturating_add(MAX_FUTURE_DRIFT) {
            return true;
        }
        if self.last_attempt > now.saturating_sub(60) {
            return self.attempts >= 3;
        }
        if self.last_success == 0 && self.attempts >= 3 {
            return true;
        }
        self.addr.time < now.saturating_sub(30 * 24 * 60 * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEntry {
    pub host: String,
    pub banned_at: u64,
    pub ban_until: u64,
}

impl BanEntry {
    fn is_expired(&self) -> bool {
        now() >= self.ban_until
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalAddr {
    addr: NetAddress,
    score: u32,
}

#[derive(Default, Serialize, Deserialize)]
struct PersistedState {
    addrs: Vec<AddrEntry>,
    bans: Vec<BanEntry>,
}

/// The address book. All methods are synchronous; the pool serializes
/// access behind its own lock.
pub struct AddrMan {
    entries: HashMap<String, AddrEntry>,
    /// Parallel key list for O(1) random sampling.
    keys: Vec<String>,
    bans: HashMap<String, BanEntry>,
    local: Vec<LocalAddr>,
    /// Statically configured peers, tried before any sampling.
    pub nodes: Vec<SocketAddr>,
    pub dns_seeds: Vec<String>,
    path: Option<PathBuf>,
}

impl AddrMan {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            keys: Vec::new(),
            bans: HashMap::new(),
            local: Vec::new(),
            nodes: Vec::new(),
            dns_seeds: Vec::new(),
            path: None,
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load persisted state, if a path was configured.
    pub fn open(&mut self, path: Option<&Path>) -> Result<(), AddrManError> {
        self.path = path.map(|p| p.to_path_buf());
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let meta = std::fs::metadata(path)?;
        if meta.len() > MAX_FILE_SIZE {
            return Err(AddrManError::Corrupt(format!("{} bytes", meta.len())));
        }
        let data = std::fs::read(path)?;
        let state: PersistedState =
            bincode::deserialize(&data).map_err(|e| AddrManError::Corrupt(e.to_string()))?;
        for entry in state.addrs.into_iter().take(MAX_ENTRIES) {
            let key = entry.addr.hostname();
            if self.entries.insert(key.clone(), entry).is_none() {
                self.keys.push(key);
            }
        }
        for ban in state.bans {
            if !ban.is_expired() {
                self.bans.insert(ban.host.clone(), ban);
            }
        }
        info!("address book loaded: {} addrs, {} bans", self.size(), self.bans.len());
        Ok(())
    }

    /// Persist and drop in-memory state.
    pub fn close(&mut self) -> Result<(), AddrManError> {
        self.flush()?;
        self.entries.clear();
        self.keys.clear();
        Ok(())
    }

    pub fn flush(&self) -> Result<(), AddrManError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let state = PersistedState {
            addrs: self.entries.values().cloned().collect(),
            bans: self.bans.values().filter(|b| !b.is_expired()).cloned().collect(),
        };
        let data = bincode::serialize(&state)
            .map_err(|e| AddrManError::Corrupt(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Insert or refresh an address. Timestamps are clamped: future
    /// drift beyond ten minutes re-dates the entry five days back.
    pub fn add(&mut self, mut addr: NetAddress, src: Option<NetAddress>) -> bool {
        let time_now = now();
        if addr.time > time_now.saturating_add(MAX_FUTURE_DRIFT) || addr.time == 0 {
            addr.time = time_now.saturating_sub(REDATE_AGE);
        }

        let key = addr.hostname();
        if let Some(existing) = self.entries.get_mut(&key) {
            if addr.time > existing.addr.time {
                existing.addr.time = addr.time;
            }
            existing.addr.services |= addr.services;
            return false;
        }

        if self.entries.len() >= MAX_ENTRIES && !self.evict_one() {
            return false;
        }
        self.entries.insert(key.clone(), AddrEntry::new(addr, src));
        self.keys.push(key);
        true
    }

    /// Drop a random stale entry; falls back to any random entry.
    fn evict_one(&mut self) -> bool {
        if self.keys.is_empty() {
            return false;
        }
        let mut rng = rand::thread_rng();
        for _ in 0..8 {
            let i = rng.gen_range(0..self.keys.len());
            let stale = self
                .entries
                .get(&self.keys[i])
                .map(|e| e.is_stale())
                .unwrap_or(true);
            if stale {
                let key = self.keys.swap_remove(i);
                self.entries.remove(&key);
                return true;
            }
        }
        let i = rng.gen_range(0..self.keys.len());
        let key = self.keys.swap_remove(i);
        self.entries.remove(&key);
        true
    }

    /// Uniform random sample.
    pub fn get_host(&self) -> Option<&AddrEntry> {
        if self.keys.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..self.keys.len());
        self.entries.get(&self.keys[i])
    }

    pub fn get(&self, host: &str) -> Option<&AddrEntry> {
        self.entries.get(host)
    }

    pub fn mark_attempt(&mut self, host: &str) {
        if let Some(entry) = self.entries.get_mut(host) {
            entry.last_attempt = now();
            entry.attempts += 1;
        }
    }

    pub fn mark_success(&mut self, host: &str) {
        if let Some(entry) = self.entries.get_mut(host) {
            entry.last_success = now();
            entry.attempts = 0;
            entry.addr.time = now();
        }
    }

    /// Handshake completed; remember the services the peer advertised.
    pub fn mark_ack(&mut self, host: &str, services: u64) {
        if let Some(entry) = self.entries.get_mut(host) {
            entry.addr.services |= services;
            entry.last_success = now();
            entry.attempts = 0;
        }
    }

    pub fn ban(&mut self, host: &str) {
        self.ban_for(host, BAN_TIME);
    }

    pub fn ban_for(&mut self, host: &str, secs: u64) {
        let entry = BanEntry {
            host: host.to_string(),
            banned_at: now(),
            ban_until: now().saturating_add(secs),
        };
        debug!("banning {} until {}", host, entry.ban_until);
        self.bans.insert(host.to_string(), entry);
    }

    pub fn unban(&mut self, host: &str) -> bool {
        self.bans.remove(host).is_some()
    }

    pub fn is_banned(&self, host: &str) -> bool {
        match self.bans.get(host) {
            Some(ban) => !ban.is_expired(),
            None => false,
        }
    }

    pub fn expire_bans(&mut self) {
        self.bans.retain(|_, ban| !ban.is_expired());
    }

    /// Advertise one of our own addresses.
    pub fn add_local(&mut self, addr: NetAddress, score: u32) {
        if self.local.iter().any(|l| l.addr.socket_addr() == addr.socket_addr()) {
            return;
        }
        self.local.push(LocalAddr { addr, score });
    }

    /// Best local address to put in a `version` message for this peer:
    /// highest score within the same address family.
    pub fn get_local(&self, peer: &NetAddress) -> Option<NetAddress> {
        self.local
            .iter()
            .filter(|l| l.addr.ip.is_ipv4() == peer.ip.is_ipv4())
            .max_by_key(|l| l.score)
            .map(|l| l.addr)
    }

    /// Random addresses for a `getaddr` response, freshest bias not
    /// required — the caller filters through the peer's addr filter.
    pub fn sample(&self, max: usize) -> Vec<NetAddress> {
        let mut rng = rand::thread_rng();
        let mut keys = self.keys.clone();
        let count = max.min(keys.len());
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let i = rng.gen_range(0..keys.len());
            let key = keys.swap_remove(i);
            if let Some(entry) = self.entries.get(&key) {
                out.push(entry.addr);
            }
        }
        out
    }
}

impl Default for AddrMan {
    fn default() -> Self {
        Self::new()
    }
}
