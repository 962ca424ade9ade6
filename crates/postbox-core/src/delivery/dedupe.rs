//! Message-ID deduplication cache
//!
//! Maps a message identifier to the mailboxes it has already been delivered
//! to. The backing map is either size-bounded LRU ([`LruMap`]) or
//! age-bounded ([`TimeoutMap`]), chosen from the live [`DedupeConfig`]
//! before every use.

use postbox_common::config::DedupeConfig;
use postbox_common::types::MailboxId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone)]
struct Entry {
    mailboxes: HashSet<MailboxId>,
    /// Access stamp, larger is more recent
    stamp: u64,
    inserted: Instant,
}

/// Access-ordered entry table shared by both map flavours
#[derive(Debug, Default)]
struct Ordered {
    entries: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
    clock: u64,
}

impl Ordered {
    fn touch(&mut self, key: &str) {
        self.clock += 1;
        let stamp = self.clock;
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.stamp);
            entry.stamp = stamp;
            self.order.insert(stamp, key.to_string());
        }
    }

    fn get(&mut self, key: &str) -> Option<&HashSet<MailboxId>> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|e| &e.mailboxes)
    }

    fn put(&mut self, key: &str, mailboxes: HashSet<MailboxId>, now: Instant) {
        self.clock += 1;
        let stamp = self.clock;
        if let Some(old) = self.entries.remove(key) {
            self.order.remove(&old.stamp);
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                mailboxes,
                stamp,
                inserted: now,
            },
        );
        self.order.insert(stamp, key.to_string());
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.stamp);
        Some(entry)
    }

    fn pop_oldest(&mut self) -> Option<(String, Entry)> {
        let (_, key) = self.order.pop_first()?;
        let entry = self.entries.remove(&key)?;
        Some((key, entry))
    }

    /// Drain everything, least recently accessed first
    fn drain_oldest_first(&mut self) -> Vec<(String, HashSet<MailboxId>)> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some((key, entry)) = self.pop_oldest() {
            out.push((key, entry.mailboxes));
        }
        out
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Keeps at most `capacity` keys, evicting the least recently used
#[derive(Debug)]
pub struct LruMap {
    capacity: usize,
    inner: Ordered,
}

impl LruMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Ordered::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&mut self, key: &str) -> Option<&HashSet<MailboxId>> {
        self.inner.get(key)
    }

    pub fn put(&mut self, key: &str, mailboxes: HashSet<MailboxId>) {
        self.inner.put(key, mailboxes, Instant::now());
        while self.inner.len() > self.capacity {
            self.inner.pop_oldest();
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<HashSet<MailboxId>> {
        self.inner.remove(key).map(|e| e.mailboxes)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

/// Drops keys older than `timeout` since they were stored
#[derive(Debug)]
pub struct TimeoutMap {
    timeout: Duration,
    inner: Ordered,
}

impl TimeoutMap {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            inner: Ordered::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn get(&mut self, key: &str) -> Option<&HashSet<MailboxId>> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&mut self, key: &str, now: Instant) -> Option<&HashSet<MailboxId>> {
        self.expire(now);
        self.inner.get(key)
    }

    pub fn put(&mut self, key: &str, mailboxes: HashSet<MailboxId>) {
        let now = Instant::now();
        self.expire(now);
        self.inner.put(key, mailboxes, now);
    }

    pub fn remove(&mut self, key: &str) -> Option<HashSet<MailboxId>> {
        self.inner.remove(key).map(|e| e.mailboxes)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    fn expire(&mut self, now: Instant) {
        let timeout = self.timeout;
        let expired: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.inserted) >= timeout)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.inner.remove(&key);
        }
    }
}

#[derive(Debug)]
enum Store {
    Lru(LruMap),
    Timeout(TimeoutMap),
}

impl Store {
    fn for_config(config: &DedupeConfig) -> Self {
        if config.entry_timeout_ms == 0 {
            Store::Lru(LruMap::new(config.cache_size))
        } else {
            Store::Timeout(TimeoutMap::new(Duration::from_millis(config.entry_timeout_ms)))
        }
    }

    fn get(&mut self, key: &str) -> Option<&HashSet<MailboxId>> {
        match self {
            Store::Lru(m) => m.get(key),
            Store::Timeout(m) => m.get(key),
        }
    }

    fn put(&mut self, key: &str, mailboxes: HashSet<MailboxId>) {
        match self {
            Store::Lru(m) => m.put(key, mailboxes),
            Store::Timeout(m) => m.put(key, mailboxes),
        }
    }

    fn remove(&mut self, key: &str) -> Option<HashSet<MailboxId>> {
        match self {
            Store::Lru(m) => m.remove(key),
            Store::Timeout(m) => m.remove(key),
        }
    }

    fn drain_oldest_first(&mut self) -> Vec<(String, HashSet<MailboxId>)> {
        match self {
            Store::Lru(m) => m.inner.drain_oldest_first(),
            Store::Timeout(m) => m.inner.drain_oldest_first(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Store::Lru(m) => m.len(),
            Store::Timeout(m) => m.len(),
        }
    }
}

#[derive(Debug)]
struct CacheState {
    config: DedupeConfig,
    store: Store,
}

/// Process-wide dedupe cache owned by the delivery coordinator
#[derive(Debug)]
pub struct DedupeCache {
    state: Mutex<CacheState>,
}

impl DedupeCache {
    pub fn new(config: DedupeConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                store: Store::for_config(&config),
                config,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a possibly changed configuration.
    ///
    /// A new map is built when the map type or the LRU size changes, and
    /// retained entries are copied into it least recently accessed first.
    /// A timeout change on an age-bounded map is applied in place.
    pub fn reconfigure(&self, config: DedupeConfig) {
        let mut state = self.state();
        if state.config == config {
            return;
        }

        let rebuild = match (&mut state.store, config.entry_timeout_ms) {
            (Store::Lru(m), 0) => m.capacity() != config.cache_size,
            (Store::Timeout(m), ms) if ms > 0 => {
                m.set_timeout(Duration::from_millis(ms));
                false
            }
            _ => true,
        };

        if rebuild {
            let mut store = Store::for_config(&config);
            for (key, mailboxes) in state.store.drain_oldest_first() {
                store.put(&key, mailboxes);
            }
            info!(
                cache_size = config.cache_size,
                entry_timeout_ms = config.entry_timeout_ms,
                entries = store.len(),
                "Rebuilt dedupe cache"
            );
            state.store = store;
        }
        state.config = config;
    }

    /// `message_id` already delivered to `mailbox`
    pub fn contains(&self, message_id: &str, mailbox: MailboxId) -> bool {
        self.state()
            .store
            .get(message_id)
            .is_some_and(|set| set.contains(&mailbox))
    }

    pub fn record(&self, message_id: &str, mailbox: MailboxId) {
        let mut state = self.state();
        let mut set = state.store.get(message_id).cloned().unwrap_or_default();
        set.insert(mailbox);
        state.store.put(message_id, set);
    }

    /// Undo a `record` for one mailbox
    pub fn remove(&self, message_id: &str, mailbox: MailboxId) {
        let mut state = self.state();
        let Some(mut set) = state.store.remove(message_id) else {
            return;
        };
        set.remove(&mailbox);
        if !set.is_empty() {
            state.store.put(message_id, set);
        }
    }

    /// Number of message identifiers held
    pub fn len(&self) -> usize {
        self.state().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_age_bounded(&self) -> bool {
        matches!(self.state().store, Store::Timeout(_))
    }
}
