//! In-process store
//!
//! Redis-shaped primitives over concurrent maps. Sorted-set members are
//! ordered by (score, insertion sequence), so equal-score entries keep
//! strict FIFO order. `hupdate` runs a closure under the entry lock and is
//! the compare-and-set primitive the matching engine builds `consume` on.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// One sorted set: score-ordered view plus a member index for O(log n)
/// removal.
#[derive(Default)]
struct SortedSet {
    by_score: BTreeMap<(i64, u64), String>,
    index: HashMap<String, (i64, u64)>,
}

pub struct MemoryStore {
    zsets: DashMap<String, SortedSet>,
    hashes: DashMap<String, HashMap<String, String>>,
    lists: DashMap<String, Vec<String>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    sequence: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            zsets: DashMap::new(),
            hashes: DashMap::new(),
            lists: DashMap::new(),
            channels: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    // ==================== Sorted Set Operations ====================

    /// Add a member with a fresh insertion sequence as tiebreaker. Re-adding
    /// an existing member moves it to the back of its score (the sequence is
    /// re-assigned). Returns the assigned sequence.
    pub fn zadd(&self, key: &str, score: i64, member: &str) -> u64 {
        let seq = self.next_sequence();
        self.zadd_at(key, score, seq, member);
        seq
    }

    /// Add a member with an explicit sequence; used to restore an entry at
    /// its original priority after a rolled-back consume.
    pub fn zadd_at(&self, key: &str, score: i64, seq: u64, member: &str) {
        let mut set = self.zsets.entry(key.to_string()).or_default();
        if let Some(old) = set.index.remove(member) {
            set.by_score.remove(&old);
        }
        set.by_score.insert((score, seq), member.to_string());
        set.index.insert(member.to_string(), (score, seq));
    }

    pub fn zrem(&self, key: &str, member: &str) -> bool {
        let Some(mut set) = self.zsets.get_mut(key) else {
            return false;
        };
        match set.index.remove(member) {
            Some(entry) => {
                set.by_score.remove(&entry);
                true
            }
            None => false,
        }
    }

    /// Members in (score, sequence) order. Indices are Redis-style: negative
    /// counts from the end, `stop` is inclusive.
    pub fn zrange(&self, key: &str, start: isize, stop: isize) -> Vec<String> {
        let Some(set) = self.zsets.get(key) else {
            return Vec::new();
        };
        let len = set.by_score.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i
            }
        };
        let (start, stop) = (norm(start), norm(stop).min(len - 1));
        if len == 0 || start > stop {
            return Vec::new();
        }
        set.by_score
            .values()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect()
    }

    pub fn zcard(&self, key: &str) -> usize {
        self.zsets.get(key).map(|s| s.by_score.len()).unwrap_or(0)
    }

    /// Current (score, sequence) of a member, if present.
    pub fn zscore(&self, key: &str, member: &str) -> Option<(i64, u64)> {
        self.zsets.get(key).and_then(|s| s.index.get(member).copied())
    }

    // ==================== Hash Operations ====================

    /// Set fields on a hash, creating it if absent. Existing fields not
    /// named are left alone.
    pub fn hset_all(&self, key: &str, fields: &[(String, String)]) {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
    }

    pub fn hget(&self, key: &str, field: &str) -> Option<String> {
        self.hashes.get(key).and_then(|h| h.get(field).cloned())
    }

    pub fn hgetall(&self, key: &str) -> Option<HashMap<String, String>> {
        self.hashes.get(key).map(|h| h.clone())
    }

    pub fn hexists(&self, key: &str) -> bool {
        self.hashes.contains_key(key)
    }

    /// Remove the whole hash.
    pub fn hdel_all(&self, key: &str) -> bool {
        self.hashes.remove(key).is_some()
    }

    /// Run a closure against the hash under its entry lock. This is the
    /// scripted-atomic primitive: check-then-mutate inside `f` cannot
    /// interleave with another writer of the same key. Returns `None` when
    /// the key does not exist.
    pub fn hupdate<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, String>) -> T) -> Option<T> {
        let mut entry = self.hashes.get_mut(key)?;
        Some(f(entry.value_mut()))
    }

    // ==================== List Operations ====================

    pub fn rpush(&self, key: &str, value: &str) -> usize {
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push(value.to_string());
        list.len()
    }

    pub fn lrange(&self, key: &str, start: isize, stop: isize) -> Vec<String> {
        let Some(list) = self.lists.get(key) else {
            return Vec::new();
        };
        let len = list.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i
            }
        };
        let (start, stop) = (norm(start), norm(stop).min(len - 1));
        if len == 0 || start > stop {
            return Vec::new();
        }
        list[start as usize..=stop as usize].to_vec()
    }

    pub fn llen(&self, key: &str) -> usize {
        self.lists.get(key).map(|l| l.len()).unwrap_or(0)
    }

    // ==================== Pub/Sub Operations ====================

    /// Publish to a channel; returns the subscriber count at publish time.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        match self.channels.get(channel) {
            Some(sender) => sender.send(payload.to_string()).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribe to a channel, creating it on first use.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    // ==================== Administrative ====================

    /// Keys across all namespaces matching a `*` glob pattern.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for entry in self.zsets.iter() {
            if glob_match(pattern, entry.key()) {
                out.push(entry.key().clone());
            }
        }
        for entry in self.hashes.iter() {
            if glob_match(pattern, entry.key()) {
                out.push(entry.key().clone());
            }
        }
        for entry in self.lists.iter() {
            if glob_match(pattern, entry.key()) {
                out.push(entry.key().clone());
            }
        }
        out
    }

    /// Remove every key matching the pattern; returns how many were removed.
    pub fn clear_pattern(&self, pattern: &str) -> usize {
        let matched = self.keys(pattern);
        let mut removed = 0;
        for key in &matched {
            if self.zsets.remove(key).is_some() {
                removed += 1;
            }
            if self.hashes.remove(key).is_some() {
                removed += 1;
            }
            if self.lists.remove(key).is_some() {
                removed += 1;
            }
        }
        removed
    }
}

/// Minimal `*`-only glob: segments between stars must appear in order.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == candidate;
    }
    let mut rest = candidate;
    let segments: Vec<&str> = pattern.split('*').collect();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}
