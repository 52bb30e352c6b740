//! Priority queue of pending tray syncs.
//!
//! Entries are keyed by node id, so a tray is queued at most once. Time is
//! passed in as milliseconds so tests can drive it explicitly.

use crate::config::{SyncConfig, millis};
use crate::node::TrayNode;
use std::collections::HashMap;
use std::time::Duration;

/// Largest share of the priority score coming from creation recency.
pub const RECENCY_WEIGHT: i64 = 50;
/// Largest share of the priority score coming from subtree size.
pub const SIZE_WEIGHT: i64 = 30;
/// Bonus for trays whose name carries hooks.
pub const HOOK_BONUS: i64 = 20;

const RECENCY_HORIZON_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// One pending sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncQueueEntry {
    pub node_id: String,
    /// Higher syncs sooner
    pub priority: i64,
    /// Consecutive transport failures
    pub retry_count: u32,
    pub last_attempt_at: Option<u64>,
    pub enqueued_at: u64,
    /// Backoff gate: not dispatched before this time
    pub next_attempt_at: u64,
}

impl SyncQueueEntry {
    pub fn new(node_id: impl Into<String>, priority: i64, now: u64) -> Self {
        Self {
            node_id: node_id.into(),
            priority,
            retry_count: 0,
            last_attempt_at: None,
            enqueued_at: now,
            next_attempt_at: now,
        }
    }

    pub fn is_ready(&self, now: u64) -> bool {
        self.next_attempt_at <= now
    }
}

/// Delay before retry number `retry_count` (1-based): `base * 2^(n-1)`, capped.
pub fn calculate_backoff(retry_count: u32, config: &SyncConfig) -> Duration {
    let delay_secs = config.backoff_base.as_secs_f64()
        * 2f64.powi(retry_count.saturating_sub(1).min(62) as i32);

    Duration::from_secs_f64(delay_secs.min(config.backoff_max.as_secs_f64()))
}

/// Additive priority: recency of creation (up to 50, decaying to zero over a
/// week), subtree size (up to 30) and a flat 20 when the tray has hooks.
pub fn priority_score(node: &TrayNode, subtree_size: usize, now: u64) -> i64 {
    let age = now.saturating_sub(node.created_at).min(RECENCY_HORIZON_MS);
    let recency = RECENCY_WEIGHT * (RECENCY_HORIZON_MS - age) as i64 / RECENCY_HORIZON_MS as i64;
    let size = (subtree_size as i64).min(SIZE_WEIGHT);
    let hooks = if node.hooks().is_empty() { 0 } else { HOOK_BONUS };
    recency + size + hooks
}

#[derive(Debug, Clone, Default)]
pub struct SyncQueue {
    entries: HashMap<String, SyncQueueEntry>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.entries.contains_key(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<&SyncQueueEntry> {
        self.entries.get(node_id)
    }

    /// Queue a tray, or refresh the priority of an already queued one.
    ///
    /// Returns true if the tray was not queued before.
    pub fn upsert(&mut self, node_id: &str, priority: i64, now: u64) -> bool {
        match self.entries.get_mut(node_id) {
            Some(entry) => {
                entry.priority = priority;
                false
            }
            None => {
                self.entries
                    .insert(node_id.to_string(), SyncQueueEntry::new(node_id, priority, now));
                true
            }
        }
    }

    /// Put an entry back, e.g. after a failed attempt.
    pub fn insert(&mut self, entry: SyncQueueEntry) {
        self.entries.insert(entry.node_id.clone(), entry);
    }

    pub fn remove(&mut self, node_id: &str) -> Option<SyncQueueEntry> {
        self.entries.remove(node_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop entries older than `max_age`, then keep only the `max_len`
    /// highest-priority ones. Returns the dropped ids.
    pub fn prune(&mut self, now: u64, max_age: Duration, max_len: usize) -> Vec<String> {
        let max_age = millis(max_age);
        let mut dropped: Vec<String> = self
            .entries
            .values()
            .filter(|entry| now.saturating_sub(entry.enqueued_at) > max_age)
            .map(|entry| entry.node_id.clone())
            .collect();
        for id in &dropped {
            self.entries.remove(id);
        }

        if self.entries.len() > max_len {
            let ordered = self.ordered();
            let overflow: Vec<String> = ordered[max_len..]
                .iter()
                .map(|entry| entry.node_id.clone())
                .collect();
            for id in &overflow {
                self.entries.remove(id);
            }
            dropped.extend(overflow);
        }
        dropped
    }

    /// Entries whose backoff gate has passed, highest priority first.
    pub fn ready(&self, now: u64) -> Vec<&SyncQueueEntry> {
        self.ordered()
            .into_iter()
            .filter(|entry| entry.is_ready(now))
            .collect()
    }

    /// Descending priority; older entries first on ties, then by id.
    fn ordered(&self) -> Vec<&SyncQueueEntry> {
        let mut entries: Vec<&SyncQueueEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        entries
    }
}
