//! # Proxy Pool
//!
//! Thread-safe registry of proxy endpoints with checkout/return/ban
//! semantics. Every state transition happens inside one mutex so that
//! selection and the `Busy` flip are atomic for concurrent workers.
//!
//! A checked-out proxy is represented by a [`ProxyHandle`]. Handles are
//! consumed by exactly one of [`ProxyPool::return_proxy`],
//! [`ProxyPool::ban`] or [`ProxyPool::mark_bad`], which keeps the
//! `hooked` counter honest.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::domain::proxy::{ProxyEndpoint, ProxyProtocol, ProxyStatus};

pub type ProxyId = u64;

#[derive(Debug)]
struct PoolEntry {
    id: ProxyId,
    raw: String,
    endpoint: Arc<ProxyEndpoint>,
    status: ProxyStatus,
    uses: u32,
    hooked: u32,
    last_used: Option<Instant>,
    clearance: HashMap<String, String>,
}

impl PoolEntry {
    fn new(id: ProxyId, endpoint: ProxyEndpoint) -> Self {
        Self {
            id,
            raw: endpoint.to_string(),
            endpoint: Arc::new(endpoint),
            status: ProxyStatus::Available,
            uses: 0,
            hooked: 0,
            last_used: None,
            clearance: HashMap::new(),
        }
    }

    const fn worn_out(&self, max_uses: u32) -> bool {
        max_uses > 0 && self.uses >= max_uses
    }

    fn release(&mut self) {
        self.hooked = self.hooked.saturating_sub(1);
        self.uses += 1;
        self.last_used = Some(Instant::now());
    }
}

/// Proof of checkout for one proxy
#[derive(Debug)]
pub struct ProxyHandle {
    id: ProxyId,
    endpoint: Arc<ProxyEndpoint>,
    raw: String,
}

impl ProxyHandle {
    #[must_use]
    pub const fn id(&self) -> ProxyId {
        self.id
    }

    #[must_use]
    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Derived views over the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub total: usize,
    pub alive: usize,
    pub available: usize,
    pub busy: usize,
    pub bad: usize,
    pub banned: usize,
}

/// Point-in-time copy of one entry, for hosts and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxySnapshot {
    pub proxy: String,
    pub status: ProxyStatus,
    pub uses: u32,
    pub hooked: u32,
}

#[derive(Debug, Default)]
struct PoolInner {
    entries: Vec<PoolEntry>,
    next_id: ProxyId,
}

#[derive(Debug, Default)]
pub struct ProxyPool {
    inner: Mutex<PoolInner>,
}

impl ProxyPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = ProxyEndpoint>) -> Self {
        let pool = Self::new();
        pool.load(endpoints);
        pool
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the whole pool content
    pub fn load(&self, endpoints: impl IntoIterator<Item = ProxyEndpoint>) {
        let mut inner = self.lock();
        let mut next_id = inner.next_id;
        inner.entries = endpoints
            .into_iter()
            .map(|endpoint| {
                next_id += 1;
                PoolEntry::new(next_id, endpoint)
            })
            .collect();
        inner.next_id = next_id;
        info!("🔄 Proxy pool loaded with {} proxies", inner.entries.len());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Checks out the first eligible proxy in list order.
    ///
    /// With `max_uses > 0`, a candidate that already reached the limit is
    /// banned and `None` is returned for this call; under `never_ban` such
    /// candidates are skipped instead.
    pub fn get_proxy(&self, allow_busy: bool, max_uses: u32, never_ban: bool) -> Option<ProxyHandle> {
        let mut inner = self.lock();

        let entry = inner.entries.iter_mut().find(|entry| {
            let selectable = match entry.status {
                ProxyStatus::Available => true,
                ProxyStatus::Busy => allow_busy,
                ProxyStatus::Bad | ProxyStatus::Banned => false,
            };
            selectable && !(never_ban && entry.worn_out(max_uses))
        })?;

        if entry.worn_out(max_uses) {
            debug!("Proxy {} reached {} uses, banning", entry.raw, entry.uses);
            entry.status = ProxyStatus::Banned;
            entry.last_used = Some(Instant::now());
            return None;
        }

        entry.status = ProxyStatus::Busy;
        entry.hooked += 1;
        Some(ProxyHandle {
            id: entry.id,
            endpoint: Arc::clone(&entry.endpoint),
            raw: entry.raw.clone(),
        })
    }

    /// Releases a checkout; the proxy becomes `Available` once nobody holds it
    pub fn return_proxy(&self, handle: ProxyHandle) {
        self.release_with(handle, |entry| {
            if entry.status == ProxyStatus::Busy && entry.hooked == 0 {
                entry.status = ProxyStatus::Available;
            }
        });
    }

    /// Releases a checkout and bans the proxy
    pub fn ban(&self, handle: ProxyHandle) {
        debug!("Banning proxy {}", handle.raw);
        self.release_with(handle, |entry| entry.status = ProxyStatus::Banned);
    }

    /// Releases a checkout and marks the proxy as not working
    pub fn mark_bad(&self, handle: ProxyHandle) {
        debug!("Marking proxy {} as bad", handle.raw);
        self.release_with(handle, |entry| entry.status = ProxyStatus::Bad);
    }

    fn release_with(&self, handle: ProxyHandle, transition: impl FnOnce(&mut PoolEntry)) {
        let mut inner = self.lock();
        // Entries from before a reload are simply gone
        if let Some(entry) = inner.entries.iter_mut().find(|entry| entry.id == handle.id) {
            entry.release();
            transition(entry);
        }
    }

    /// Nothing left that could ever be handed out again without a reload.
    ///
    /// Under `never_ban` a worn-out proxy stays alive but is skipped by
    /// [`get_proxy`](Self::get_proxy), so it does not count as usable.
    #[must_use]
    pub fn is_exhausted(&self, max_uses: u32, never_ban: bool) -> bool {
        !self
            .lock()
            .entries
            .iter()
            .any(|entry| entry.status.is_alive() && !(never_ban && entry.worn_out(max_uses)))
    }

    /// Restores every bad or banned proxy, resets use counters and forgets
    /// cached clearances
    pub fn unban_all(&self) -> usize {
        let mut inner = self.lock();
        let mut restored = 0;
        for entry in &mut inner.entries {
            if !entry.status.is_alive() {
                entry.status = if entry.hooked > 0 {
                    ProxyStatus::Busy
                } else {
                    ProxyStatus::Available
                };
                restored += 1;
            }
            entry.uses = 0;
            entry.clearance.clear();
        }
        if restored > 0 {
            info!("🔄 Unbanned {} proxies", restored);
        }
        restored
    }

    /// Restores banned proxies whose last use is older than `ban_duration`
    pub fn unban_expired(&self, ban_duration: Duration) -> usize {
        let mut inner = self.lock();
        let mut restored = 0;
        for entry in &mut inner.entries {
            let expired = entry
                .last_used
                .is_none_or(|last_used| last_used.elapsed() >= ban_duration);
            if entry.status == ProxyStatus::Banned && expired {
                entry.status = if entry.hooked > 0 {
                    ProxyStatus::Busy
                } else {
                    ProxyStatus::Available
                };
                entry.uses = 0;
                entry.clearance.clear();
                restored += 1;
            }
        }
        restored
    }

    /// Drops later entries whose endpoint string was already seen
    pub fn remove_duplicates(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        let mut seen = HashSet::new();
        inner.entries.retain(|entry| seen.insert(entry.raw.clone()));
        before - inner.entries.len()
    }

    pub fn shuffle(&self) {
        let mut inner = self.lock();
        fastrand::shuffle(&mut inner.entries);
    }

    /// Keeps only proxies whose first hop speaks one of `allowed`; an empty
    /// list allows everything
    pub fn retain_protocols(&self, allowed: &[ProxyProtocol]) -> usize {
        if allowed.is_empty() {
            return 0;
        }
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|entry| allowed.contains(&entry.endpoint.protocol));
        before - inner.entries.len()
    }

    #[must_use]
    pub fn counts(&self) -> PoolCounts {
        let inner = self.lock();
        inner
            .entries
            .iter()
            .fold(PoolCounts::default(), |mut counts, entry| {
                counts.total += 1;
                match entry.status {
                    ProxyStatus::Available => counts.available += 1,
                    ProxyStatus::Busy => counts.busy += 1,
                    ProxyStatus::Bad => counts.bad += 1,
                    ProxyStatus::Banned => counts.banned += 1,
                }
                if entry.status.is_alive() {
                    counts.alive += 1;
                }
                counts
            })
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ProxySnapshot> {
        self.lock()
            .entries
            .iter()
            .map(|entry| ProxySnapshot {
                proxy: entry.raw.clone(),
                status: entry.status,
                uses: entry.uses,
                hooked: entry.hooked,
            })
            .collect()
    }

    /// Clearance cookies cached for a proxy, keyed by name
    #[must_use]
    pub fn clearance(&self, id: ProxyId) -> HashMap<String, String> {
        self.lock()
            .entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.clearance.clone())
            .unwrap_or_default()
    }

    pub fn store_clearance(&self, id: ProxyId, cookies: impl IntoIterator<Item = (String, String)>) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.iter_mut().find(|entry| entry.id == id) {
            entry.clearance.extend(cookies);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(lines: &[&str]) -> ProxyPool {
        ProxyPool::from_endpoints(lines.iter().map(|line| line.parse().unwrap()))
    }

    #[test]
    fn checkout_flips_to_busy_and_return_counts_a_use() {
        let pool = pool(&["a:1"]);
        let handle = pool.get_proxy(false, 0, false).unwrap();
        assert_eq!(pool.snapshot()[0].status, ProxyStatus::Busy);
        assert!(pool.get_proxy(false, 0, false).is_none());

        pool.return_proxy(handle);
        let snap = &pool.snapshot()[0];
        assert_eq!(snap.status, ProxyStatus::Available);
        assert_eq!(snap.uses, 1);
        assert_eq!(snap.hooked, 0);
    }

    #[test]
    fn allow_busy_shares_a_proxy_until_the_last_holder_returns() {
        let pool = pool(&["a:1"]);
        let first = pool.get_proxy(true, 0, false).unwrap();
        let second = pool.get_proxy(true, 0, false).unwrap();
        assert_eq!(pool.snapshot()[0].hooked, 2);

        pool.return_proxy(first);
        assert_eq!(pool.snapshot()[0].status, ProxyStatus::Busy);
        pool.return_proxy(second);
        assert_eq!(pool.snapshot()[0].status, ProxyStatus::Available);
    }

    #[test]
    fn worn_out_proxy_is_banned_on_selection() {
        let pool = pool(&["a:1"]);
        let handle = pool.get_proxy(false, 1, false).unwrap();
        pool.return_proxy(handle);

        assert!(pool.get_proxy(false, 1, false).is_none());
        assert_eq!(pool.snapshot()[0].status, ProxyStatus::Banned);
    }

    #[test]
    fn never_ban_skips_worn_out_proxies() {
        let pool = pool(&["a:1", "b:2"]);
        let handle = pool.get_proxy(false, 1, true).unwrap();
        assert_eq!(handle.as_str(), "a:1");
        pool.return_proxy(handle);

        let handle = pool.get_proxy(false, 1, true).unwrap();
        assert_eq!(handle.as_str(), "b:2");
        assert_eq!(pool.snapshot()[0].status, ProxyStatus::Available);
        assert!(!pool.is_exhausted(1, true));

        pool.return_proxy(handle);
        assert!(pool.get_proxy(false, 1, true).is_none());
        assert!(pool.is_exhausted(1, true));
        assert!(!pool.is_exhausted(0, true));
        assert!(!pool.is_exhausted(1, false));
    }

    #[test]
    fn unban_all_resets_uses_of_alive_proxies() {
        let pool = pool(&["a:1"]);
        let handle = pool.get_proxy(false, 1, true).unwrap();
        pool.return_proxy(handle);
        assert!(pool.is_exhausted(1, true));

        assert_eq!(pool.unban_all(), 0);
        assert_eq!(pool.snapshot()[0].uses, 0);
        assert!(pool.get_proxy(false, 1, true).is_some());
    }

    #[test]
    fn ban_and_bad_take_proxies_out_of_rotation_until_unban() {
        let pool = pool(&["a:1", "b:2"]);
        let a = pool.get_proxy(false, 0, false).unwrap();
        let b = pool.get_proxy(false, 0, false).unwrap();
        pool.ban(a);
        pool.mark_bad(b);

        let counts = pool.counts();
        assert_eq!((counts.banned, counts.bad, counts.alive), (1, 1, 0));
        assert!(pool.is_exhausted(0, false));

        assert_eq!(pool.unban_all(), 2);
        assert_eq!(pool.counts().available, 2);
    }

    #[test]
    fn unban_expired_respects_duration() {
        let pool = pool(&["a:1"]);
        let handle = pool.get_proxy(false, 0, false).unwrap();
        pool.ban(handle);

        assert_eq!(pool.unban_expired(Duration::from_secs(3600)), 0);
        assert_eq!(pool.unban_expired(Duration::ZERO), 1);
        assert_eq!(pool.counts().available, 1);
    }

    #[test]
    fn duplicates_and_protocol_filter() {
        let pool = pool(&["a:1", "a:1", "(socks5)b:2"]);
        assert_eq!(pool.remove_duplicates(), 1);
        assert_eq!(pool.retain_protocols(&[ProxyProtocol::Socks5]), 1);
        assert_eq!(pool.snapshot()[0].proxy, "(socks5)b:2");
        assert_eq!(pool.retain_protocols(&[]), 0);
    }

    #[test]
    fn clearance_is_cached_per_proxy_and_cleared_on_unban() {
        let pool = pool(&["a:1"]);
        let handle = pool.get_proxy(false, 0, false).unwrap();
        let id = handle.id();
        pool.store_clearance(id, [("cf_clearance".to_string(), "x".to_string())]);
        assert_eq!(pool.clearance(id).get("cf_clearance").map(String::as_str), Some("x"));

        pool.ban(handle);
        pool.unban_all();
        assert!(pool.clearance(id).is_empty());
    }

    #[test]
    fn returning_after_reload_is_harmless() {
        let pool = pool(&["a:1"]);
        let handle = pool.get_proxy(false, 0, false).unwrap();
        pool.load(["b:2".parse().unwrap()]);
        pool.return_proxy(handle);
        assert_eq!(pool.snapshot()[0].uses, 0);
    }
}
