//! Tunables for the sync engine.

use std::time::Duration;

/// Configuration for the sync scheduler.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often the driver ticks (default: 60s)
    pub tick_interval: Duration,
    /// Maximum syncs in flight at once (default: 3)
    pub max_concurrent: usize,
    /// Transport failures before a tray is parked in Error (default: 3)
    pub max_retries: u32,
    /// Delay after the first failure (default: 1s)
    pub backoff_base: Duration,
    /// Upper bound on the retry delay (default: 30s)
    pub backoff_max: Duration,
    /// Queue entries older than this are dropped (default: 10 min)
    pub queue_max_age: Duration,
    /// Queue is trimmed to this many highest-priority entries (default: 100)
    pub queue_max_len: usize,
    /// Creation-time drift tolerated before a timestamp conflict (default: 1s)
    pub conflict_window: Duration,
    /// Undrained notifications kept (default: 50)
    pub notification_cap: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            max_concurrent: 3,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            queue_max_age: Duration::from_secs(10 * 60),
            queue_max_len: 100,
            conflict_window: Duration::from_millis(1000),
            notification_cap: 50,
        }
    }
}

/// How long and how many backups are kept.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Backups older than this are deleted (default: 7 days)
    pub max_age: Duration,
    /// Newest backups kept per tray (default: 10)
    pub max_per_tray: usize,
    /// Newest backups kept overall (default: 100)
    pub max_total: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_per_tray: 10,
            max_total: 100,
        }
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
