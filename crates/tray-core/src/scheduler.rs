//! SyncScheduler: background synchronization of network-bound trays.
//!
//! Per tray: `Idle → Queued → Syncing → {Synced | Error}`.
//!
//! A tick prunes the queue, discovers eligible trays, and dispatches up to
//! `max_concurrent` of the highest-priority ready entries. Each dispatched
//! sync takes a backup, validates, fetches the remote copy, classifies and
//! applies the decision. Transport failures back off exponentially and park
//! the tray in `Error` after `max_retries`. Validation failures and conflicts
//! park it immediately; a conflict waits for [`SyncScheduler::resolve_conflict`].
//!
//! Locking: the tree lock and the state mutex are never held across an
//! `.await`, and the tree lock is always taken before the state mutex.
//! Stopping bumps a generation counter; completions from an older generation
//! are discarded without touching scheduler state.

use crate::baseline::{BaselineError, BaselineSnapshot, BaselineStore};
use crate::config::{SyncConfig, millis};
use crate::conflict::{ConflictDetector, ConflictKind, Resolution, SyncAction, resolve};
use crate::credentials::CredentialStore;
use crate::events::{EventBus, NotificationLevel, SyncEvent, SyncStatus};
use crate::graph::{GraphError, SharedTree, TreeGraph};
use crate::integrity::{BackupOperation, IntegrityManager};
use crate::node::TrayTree;
use crate::queue::{SyncQueue, SyncQueueEntry, calculate_backoff, priority_score};
use crate::serializer::{SerializeError, TraySerializer};
use crate::transport::{Transport, TransportError};
use futures::future::join_all;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Tray not found: {0}")]
    NotFound(String),

    #[error("Tray is not bound to a server: {0}")]
    NotNetworkBound(String),

    #[error("Tray is already syncing: {0}")]
    AlreadySyncing(String),

    #[error("Tray has an unresolved conflict: {0}")]
    ConflictPending(String),

    #[error("No pending conflict for tray: {0}")]
    NoPendingConflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(ConflictKind),

    #[error("Remote copy could not be decoded: {0}")]
    RemoteUndecodable(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Serialization(#[from] SerializeError),

    #[error(transparent)]
    Baseline(#[from] BaselineError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl SyncError {
    /// Errors that go through backoff instead of parking the tray.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(e) => e.is_retryable(),
            SyncError::RemoteUndecodable(_)
            | SyncError::Serialization(_)
            | SyncError::Baseline(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// What a completed sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Uploaded,
    Downloaded,
    UpToDate,
    /// Both sides changed; recorded as a pending conflict
    Conflict(ConflictKind),
    /// Completed after a stop, or the tray was removed meanwhile
    Discarded,
}

/// A dispatched sync. The generation ties it to one start/stop cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTicket {
    pub node_id: String,
    generation: u64,
}

/// A conflict waiting for the user's decision.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingConflict {
    pub node_id: String,
    pub kind: ConflictKind,
    pub local: TrayTree,
    pub remote: TrayTree,
    /// Pre-conflict backup, if it could be taken
    pub backup_id: Option<String>,
    pub detected_at: u64,
}

impl PendingConflict {
    pub fn options(&self) -> [Resolution; 3] {
        Resolution::ALL
    }
}

/// A queued message for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub node_id: String,
    pub level: NotificationLevel,
    pub message: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued: usize,
    pub in_flight: usize,
    /// Trays parked in Error until requeued or resolved
    pub parked: usize,
    pub pending_conflicts: usize,
    pub uploads: u64,
    pub downloads: u64,
    pub up_to_date: u64,
    pub failures: u64,
    pub conflicts_detected: u64,
}

/// Collaborators the scheduler talks to.
#[derive(Clone)]
pub struct SyncServices {
    pub transport: Arc<dyn Transport>,
    pub credentials: Arc<dyn CredentialStore>,
    pub baselines: Arc<dyn BaselineStore>,
    pub integrity: Arc<IntegrityManager>,
    pub serializer: Arc<dyn TraySerializer>,
    pub events: Arc<EventBus>,
}

struct InFlight {
    entry: SyncQueueEntry,
    generation: u64,
}

#[derive(Default)]
struct SchedulerState {
    queue: SyncQueue,
    in_flight: HashMap<String, InFlight>,
    statuses: HashMap<String, SyncStatus>,
    parked: HashSet<String>,
    conflicts: HashMap<String, PendingConflict>,
    notifications: VecDeque<Notification>,
    stats: SchedulerStats,
}

/// Events are collected under the state lock and emitted after it is
/// released, so subscribers may call back into the scheduler.
#[derive(Default)]
struct Outbox(Vec<SyncEvent>);

impl Outbox {
    fn status(&mut self, node_id: &str, status: SyncStatus, timestamp: u64) {
        self.0.push(SyncEvent::StatusChanged {
            node_id: node_id.to_string(),
            status,
            timestamp,
        });
    }
}

/// Result of one run, before it is recorded.
struct Completed {
    outcome: SyncOutcome,
    /// Set for `SyncOutcome::Conflict`; stored only if the run is current
    conflict: Option<PendingConflict>,
}

impl From<SyncOutcome> for Completed {
    fn from(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            conflict: None,
        }
    }
}

struct LocalSnapshot {
    tree: TrayTree,
    host_url: String,
    file_name: String,
}

pub struct SyncScheduler {
    tree: SharedTree,
    services: SyncServices,
    detector: ConflictDetector,
    config: SyncConfig,
    running: AtomicBool,
    auto_sync_enabled: AtomicBool,
    generation: AtomicU64,
    force: Notify,
    state: Mutex<SchedulerState>,
}

impl SyncScheduler {
    pub fn new(tree: SharedTree, services: SyncServices, config: SyncConfig) -> Self {
        Self {
            tree,
            services,
            detector: ConflictDetector::new(millis(config.conflict_window)),
            config,
            running: AtomicBool::new(false),
            auto_sync_enabled: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            force: Notify::new(),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, TreeGraph> {
        self.tree.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_tree(&self) -> RwLockWriteGuard<'_, TreeGraph> {
        self.tree.write().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, outbox: Outbox) {
        for event in outbox.0 {
            self.services.events.emit(event);
        }
    }

    // ==================== Lifecycle ====================

    /// Start scheduling. Idempotent.
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("Sync scheduler started");
        }
    }

    /// Stop scheduling. Idempotent.
    ///
    /// Clears the queue and the in-flight set. Syncs already dispatched keep
    /// running, but their completions are discarded.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock_state();
        state.queue.clear();
        let aborted: Vec<String> = state.in_flight.drain().map(|(id, _)| id).collect();
        for status in state.statuses.values_mut() {
            if matches!(status, SyncStatus::Queued | SyncStatus::Syncing) {
                *status = SyncStatus::Idle;
            }
        }
        drop(state);

        info!(
            "Sync scheduler stopped ({} syncs left to finish unobserved)",
            aborted.len()
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Global auto-sync switch, on by default.
    pub fn set_auto_sync_enabled(&self, enabled: bool) {
        self.auto_sync_enabled.store(enabled, Ordering::SeqCst);
        info!("Auto-sync {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_auto_sync_enabled(&self) -> bool {
        self.auto_sync_enabled.load(Ordering::SeqCst)
    }

    /// Ask the driver for an immediate tick.
    pub fn force_sync(&self) {
        self.force.notify_one();
    }

    /// Resolves when [`force_sync`](Self::force_sync) is called.
    pub async fn forced(&self) {
        self.force.notified().await;
    }

    // ==================== Ticks ====================

    /// Plan one tick and run the dispatched syncs to completion.
    pub async fn tick(&self, now: u64) -> Vec<(String, Result<SyncOutcome>)> {
        let tickets = self.plan_tick(now);
        let runs = tickets.into_iter().map(|ticket| async move {
            let node_id = ticket.node_id.clone();
            (node_id, self.execute(ticket, now).await)
        });
        join_all(runs).await
    }

    /// Prune, discover and dispatch without running anything.
    ///
    /// The returned tickets are already marked in flight; hand each to
    /// [`execute`](Self::execute).
    pub fn plan_tick(&self, now: u64) -> Vec<SyncTicket> {
        if !self.is_running() {
            return Vec::new();
        }

        let candidates = if self.is_auto_sync_enabled() {
            self.discover(now)
        } else {
            Vec::new()
        };
        let generation = self.generation.load(Ordering::SeqCst);

        let mut outbox = Outbox::default();
        let mut state = self.lock_state();

        let pruned = state
            .queue
            .prune(now, self.config.queue_max_age, self.config.queue_max_len);
        for id in &pruned {
            if state.statuses.get(id) == Some(&SyncStatus::Queued) {
                state.statuses.insert(id.clone(), SyncStatus::Idle);
            }
        }
        if !pruned.is_empty() {
            debug!("Pruned {} stale queue entries", pruned.len());
        }

        for (node_id, priority) in candidates {
            if state.in_flight.contains_key(&node_id)
                || state.parked.contains(&node_id)
                || state.conflicts.contains_key(&node_id)
            {
                continue;
            }
            if state.queue.upsert(&node_id, priority, now) {
                state.statuses.insert(node_id, SyncStatus::Queued);
            }
        }

        let slots = self
            .config
            .max_concurrent
            .saturating_sub(state.in_flight.len());
        let ready: Vec<String> = state
            .queue
            .ready(now)
            .into_iter()
            .filter(|entry| !state.in_flight.contains_key(&entry.node_id))
            .take(slots)
            .map(|entry| entry.node_id.clone())
            .collect();

        let mut tickets = Vec::with_capacity(ready.len());
        for node_id in ready {
            let Some(mut entry) = state.queue.remove(&node_id) else {
                continue;
            };
            entry.last_attempt_at = Some(now);
            state
                .in_flight
                .insert(node_id.clone(), InFlight { entry, generation });
            state.statuses.insert(node_id.clone(), SyncStatus::Syncing);
            outbox.status(&node_id, SyncStatus::Syncing, now);
            tickets.push(SyncTicket {
                node_id,
                generation,
            });
        }
        drop(state);
        self.emit(outbox);

        if !tickets.is_empty() {
            debug!("Dispatched {} syncs", tickets.len());
        }
        tickets
    }

    /// Eligible trays and their priority, read from the tree.
    fn discover(&self, now: u64) -> Vec<(String, i64)> {
        let tree = self.read_tree();
        tree.network_nodes()
            .into_iter()
            .filter_map(|id| {
                let node = tree.get(&id)?;
                node.auto_sync
                    .then(|| (id.clone(), priority_score(node, tree.subtree_size(&id), now)))
            })
            .collect()
    }

    /// Sync one tray now, outside the tick, regardless of auto-sync flags.
    pub async fn sync_node(&self, node_id: &str, now: u64) -> Result<SyncOutcome> {
        if !self.is_running() {
            return Err(SyncError::NotRunning);
        }
        let priority = {
            let tree = self.read_tree();
            let node = tree
                .get(node_id)
                .ok_or_else(|| SyncError::NotFound(node_id.to_string()))?;
            if !node.is_network_bound() {
                return Err(SyncError::NotNetworkBound(node_id.to_string()));
            }
            priority_score(node, tree.subtree_size(node_id), now)
        };

        let generation = self.generation.load(Ordering::SeqCst);
        let mut outbox = Outbox::default();
        {
            let mut state = self.lock_state();
            if state.in_flight.contains_key(node_id) {
                return Err(SyncError::AlreadySyncing(node_id.to_string()));
            }
            if state.conflicts.contains_key(node_id) {
                return Err(SyncError::ConflictPending(node_id.to_string()));
            }
            state.parked.remove(node_id);
            let mut entry = state
                .queue
                .remove(node_id)
                .unwrap_or_else(|| SyncQueueEntry::new(node_id, priority, now));
            entry.last_attempt_at = Some(now);
            state
                .in_flight
                .insert(node_id.to_string(), InFlight { entry, generation });
            state
                .statuses
                .insert(node_id.to_string(), SyncStatus::Syncing);
            outbox.status(node_id, SyncStatus::Syncing, now);
        }
        self.emit(outbox);

        self.execute(
            SyncTicket {
                node_id: node_id.to_string(),
                generation,
            },
            now,
        )
        .await
    }

    // ==================== Execution ====================

    /// Run one dispatched sync and record its result.
    ///
    /// Errors are isolated to this tray; they are recorded in its status
    /// and returned for the caller's information.
    pub async fn execute(&self, ticket: SyncTicket, now: u64) -> Result<SyncOutcome> {
        let result = self.run(&ticket, now).await;
        match result {
            Ok(completed) => Ok(self.finish_success(&ticket, completed, now)),
            Err(err) => {
                self.finish_failure(&ticket, &err, now);
                Err(err)
            }
        }
    }

    async fn run(&self, ticket: &SyncTicket, now: u64) -> Result<Completed> {
        let node_id = ticket.node_id.as_str();
        let Some(local) = self.snapshot(node_id)? else {
            return Ok(SyncOutcome::Discarded.into());
        };

        if let Err(e) = self
            .services
            .integrity
            .backup(&local.tree, BackupOperation::PreSync, now)
            .await
        {
            warn!("Pre-sync backup of {} failed, continuing: {}", node_id, e);
        }

        let report = self.services.integrity.validate(&local.tree, now);
        for warning in &report.warnings {
            debug!("Validation warning for {}: {}", node_id, warning);
        }
        if !report.is_valid {
            return Err(SyncError::Validation(report.error_summary()));
        }

        let credential = self.services.credentials.secret_for(&local.host_url);
        let fetched = self
            .services
            .transport
            .fetch(&local.host_url, &local.file_name, credential.as_deref())
            .await?;
        let remote = match fetched {
            Some(bytes) => Some(self.decode_remote(&bytes, &local.tree)?),
            None => None,
        };

        let baseline = self.services.baselines.get(node_id)?;
        let decision = self.detector.classify(
            &local.tree.node,
            remote.as_ref().map(|tree| &tree.node),
            baseline.as_ref(),
        );
        debug!("{}: {:?} ({})", node_id, decision.action, decision.reason);

        match decision.action {
            SyncAction::Nothing => Ok(SyncOutcome::UpToDate.into()),
            SyncAction::Upload => {
                let data = self.services.serializer.serialize(&local.tree)?;
                self.services
                    .transport
                    .push(
                        &local.host_url,
                        &local.file_name,
                        credential.as_deref(),
                        data.as_bytes(),
                    )
                    .await?;
                if !self.is_current(ticket) {
                    return Ok(SyncOutcome::Discarded.into());
                }
                self.services
                    .baselines
                    .put(BaselineSnapshot::capture(&local.tree.node, now))?;
                Ok(SyncOutcome::Uploaded.into())
            }
            SyncAction::Download => {
                let Some(remote) = remote else {
                    return Ok(SyncOutcome::UpToDate.into());
                };
                if !self.is_current(ticket) {
                    return Ok(SyncOutcome::Discarded.into());
                }
                self.apply_locally(node_id, &remote, now).await?;
                Ok(SyncOutcome::Downloaded.into())
            }
            SyncAction::Conflict(kind) => {
                let Some(remote) = remote else {
                    return Ok(SyncOutcome::UpToDate.into());
                };
                warn!(
                    "Conflict on {} ({}): local changed {:?}, remote changed {:?}",
                    node_id, kind, decision.local_changes, decision.remote_changes
                );
                let backup_id = match self
                    .services
                    .integrity
                    .backup(&local.tree, BackupOperation::PreConflict, now)
                    .await
                {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!("Pre-conflict backup of {} failed: {}", node_id, e);
                        None
                    }
                };
                Ok(Completed {
                    outcome: SyncOutcome::Conflict(kind),
                    conflict: Some(PendingConflict {
                        node_id: node_id.to_string(),
                        kind,
                        local: local.tree,
                        remote,
                        backup_id,
                        detected_at: now,
                    }),
                })
            }
        }
    }

    /// Export the tray and its binding; `None` if it no longer exists or is
    /// no longer network-bound.
    fn snapshot(&self, node_id: &str) -> Result<Option<LocalSnapshot>> {
        let tree = self.read_tree();
        let Some(node) = tree.get(node_id) else {
            return Ok(None);
        };
        let Some((host_url, file_name)) = node.network_binding() else {
            return Ok(None);
        };
        let (host_url, file_name) = (host_url.to_string(), file_name.to_string());
        Ok(Some(LocalSnapshot {
            tree: tree.export_subtree(node_id)?,
            host_url,
            file_name,
        }))
    }

    /// Decode a fetched file and give its root the local identity, so that
    /// only real differences show up in the comparison.
    fn decode_remote(&self, bytes: &[u8], local: &TrayTree) -> Result<TrayTree> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| SyncError::RemoteUndecodable(e.to_string()))?;
        let mut remote = self
            .services
            .serializer
            .deserialize(text)
            .map_err(|e| SyncError::RemoteUndecodable(e.to_string()))?;
        remote.node.id = local.node.id.clone();
        remote.node.parent_id = local.node.parent_id.clone();
        for child in &mut remote.children {
            child.node.parent_id = Some(local.node.id.clone());
        }
        Ok(remote)
    }

    /// Replace the local subtree with `tree`, capture a baseline and forget
    /// trays that disappeared.
    ///
    /// The baseline is taken under the same write lock as the replace, so a
    /// reader never sees the new tree with the old baseline.
    async fn apply_locally(&self, node_id: &str, tree: &TrayTree, now: u64) -> Result<()> {
        let removed = {
            let mut graph = self.write_tree();
            let removed = graph.replace_subtree(node_id, tree)?;
            let node = graph
                .get(node_id)
                .ok_or_else(|| SyncError::NotFound(node_id.to_string()))?;
            self.services
                .baselines
                .put(BaselineSnapshot::capture(node, now))?;
            removed
        };
        if !removed.is_empty() {
            self.forget_nodes(&removed).await;
        }
        Ok(())
    }

    fn is_current(&self, ticket: &SyncTicket) -> bool {
        self.is_running()
            && self.generation.load(Ordering::SeqCst) == ticket.generation
            && self
                .lock_state()
                .in_flight
                .get(&ticket.node_id)
                .is_some_and(|f| f.generation == ticket.generation)
    }

    /// Take the ticket's in-flight entry if its completion still counts.
    fn take_in_flight(
        &self,
        state: &mut SchedulerState,
        ticket: &SyncTicket,
    ) -> Option<SyncQueueEntry> {
        if !self.is_running() || self.generation.load(Ordering::SeqCst) != ticket.generation {
            return None;
        }
        match state.in_flight.get(&ticket.node_id) {
            Some(f) if f.generation == ticket.generation => {
                state.in_flight.remove(&ticket.node_id).map(|f| f.entry)
            }
            _ => None,
        }
    }

    fn notify(
        &self,
        state: &mut SchedulerState,
        outbox: &mut Outbox,
        node_id: &str,
        level: NotificationLevel,
        message: String,
        timestamp: u64,
    ) {
        while state.notifications.len() >= self.config.notification_cap.max(1) {
            state.notifications.pop_front();
        }
        state.notifications.push_back(Notification {
            node_id: node_id.to_string(),
            level,
            message: message.clone(),
            timestamp,
        });
        outbox.0.push(SyncEvent::Notification {
            node_id: node_id.to_string(),
            level,
            message,
            timestamp,
        });
    }

    /// Record a completed run. Returns `Discarded` for stale completions,
    /// which leave no trace in scheduler state.
    fn finish_success(&self, ticket: &SyncTicket, completed: Completed, now: u64) -> SyncOutcome {
        let node_id = ticket.node_id.as_str();
        let Completed { outcome, conflict } = completed;
        let mut outbox = Outbox::default();
        let mut state = self.lock_state();
        if self.take_in_flight(&mut state, ticket).is_none() {
            debug!("Discarding stale completion for {}", node_id);
            return SyncOutcome::Discarded;
        }

        match outcome {
            SyncOutcome::Conflict(kind) => {
                if let Some(conflict) = conflict {
                    state.conflicts.insert(node_id.to_string(), conflict);
                }
                state.parked.insert(node_id.to_string());
                state.stats.conflicts_detected += 1;
                state.statuses.insert(node_id.to_string(), SyncStatus::Error);
                outbox.status(node_id, SyncStatus::Error, now);
                self.notify(
                    &mut state,
                    &mut outbox,
                    node_id,
                    NotificationLevel::Warning,
                    format!("Sync conflict ({kind}); choose keep local, keep remote or merge"),
                    now,
                );
            }
            SyncOutcome::Discarded => {
                state.statuses.remove(node_id);
            }
            SyncOutcome::Uploaded | SyncOutcome::Downloaded | SyncOutcome::UpToDate => {
                match outcome {
                    SyncOutcome::Uploaded => state.stats.uploads += 1,
                    SyncOutcome::Downloaded => state.stats.downloads += 1,
                    _ => state.stats.up_to_date += 1,
                }
                state.statuses.insert(node_id.to_string(), SyncStatus::Synced);
                outbox.status(node_id, SyncStatus::Synced, now);
                info!("Synced {} ({:?})", node_id, outcome);
            }
        }
        drop(state);
        self.emit(outbox);
        outcome
    }

    fn finish_failure(&self, ticket: &SyncTicket, err: &SyncError, now: u64) {
        let node_id = ticket.node_id.as_str();
        let mut outbox = Outbox::default();
        let mut state = self.lock_state();
        let Some(mut entry) = self.take_in_flight(&mut state, ticket) else {
            debug!("Discarding stale failure for {}: {}", node_id, err);
            return;
        };

        state.stats.failures += 1;

        if !err.is_retryable() {
            error!("Sync of {} failed: {}", node_id, err);
            state.parked.insert(node_id.to_string());
            state.statuses.insert(node_id.to_string(), SyncStatus::Error);
            outbox.status(node_id, SyncStatus::Error, now);
            self.notify(
                &mut state,
                &mut outbox,
                node_id,
                NotificationLevel::Error,
                format!("Sync failed: {err}"),
                now,
            );
        } else {
            entry.retry_count += 1;
            entry.last_attempt_at = Some(now);
            if entry.retry_count >= self.config.max_retries {
                error!(
                    "Sync of {} failed {} times, giving up: {}",
                    node_id, entry.retry_count, err
                );
                state.parked.insert(node_id.to_string());
                state.statuses.insert(node_id.to_string(), SyncStatus::Error);
                outbox.status(node_id, SyncStatus::Error, now);
                self.notify(
                    &mut state,
                    &mut outbox,
                    node_id,
                    NotificationLevel::Error,
                    format!("Sync failed after {} attempts: {err}", entry.retry_count),
                    now,
                );
            } else {
                let delay = calculate_backoff(entry.retry_count, &self.config);
                entry.next_attempt_at = now + millis(delay);
                warn!(
                    "Sync of {} failed (attempt {}), retrying in {:?}: {}",
                    node_id, entry.retry_count, delay, err
                );
                self.notify(
                    &mut state,
                    &mut outbox,
                    node_id,
                    NotificationLevel::Warning,
                    format!("Sync failed, retrying in {}s: {err}", delay.as_secs()),
                    now,
                );
                state.queue.insert(entry);
                state.statuses.insert(node_id.to_string(), SyncStatus::Queued);
                outbox.status(node_id, SyncStatus::Queued, now);
            }
        }
        drop(state);
        self.emit(outbox);
    }

    // ==================== External control ====================

    /// Put a parked tray back in the queue with a fresh retry budget.
    ///
    /// Returns false for unknown or unbound trays, trays in flight and trays
    /// with an unresolved conflict.
    pub fn requeue(&self, node_id: &str, now: u64) -> bool {
        let priority = {
            let tree = self.read_tree();
            match tree.get(node_id) {
                Some(node) if node.is_network_bound() => {
                    priority_score(node, tree.subtree_size(node_id), now)
                }
                _ => return false,
            }
        };

        let mut state = self.lock_state();
        if state.in_flight.contains_key(node_id) || state.conflicts.contains_key(node_id) {
            return false;
        }
        state.parked.remove(node_id);
        state
            .queue
            .insert(SyncQueueEntry::new(node_id, priority, now));
        state.statuses.insert(node_id.to_string(), SyncStatus::Queued);
        info!("Requeued {}", node_id);
        true
    }

    /// Apply the user's choice for a pending conflict.
    ///
    /// Keep-remote writes the remote copy locally. Keep-local and merge write
    /// the result locally and push it. The baseline is updated to the result
    /// either way.
    pub async fn resolve_conflict(
        &self,
        node_id: &str,
        choice: Resolution,
        now: u64,
    ) -> Result<SyncOutcome> {
        let conflict = self
            .lock_state()
            .conflicts
            .remove(node_id)
            .ok_or_else(|| SyncError::NoPendingConflict(node_id.to_string()))?;

        match self.apply_resolution(&conflict, choice, now).await {
            Ok(outcome) => {
                let mut outbox = Outbox::default();
                let mut state = self.lock_state();
                state.parked.remove(node_id);
                state.statuses.insert(node_id.to_string(), SyncStatus::Synced);
                outbox.status(node_id, SyncStatus::Synced, now);
                drop(state);
                self.emit(outbox);
                info!("Resolved conflict on {} ({:?})", node_id, choice);
                Ok(outcome)
            }
            Err(err) => {
                warn!("Resolving conflict on {} failed: {}", node_id, err);
                self.lock_state()
                    .conflicts
                    .insert(node_id.to_string(), conflict);
                Err(err)
            }
        }
    }

    async fn apply_resolution(
        &self,
        conflict: &PendingConflict,
        choice: Resolution,
        now: u64,
    ) -> Result<SyncOutcome> {
        let node_id = conflict.node_id.as_str();
        let local = self
            .snapshot(node_id)?
            .ok_or_else(|| SyncError::NotFound(node_id.to_string()))?;
        let resolved = resolve(&local.tree, &conflict.remote, choice);

        if choice == Resolution::KeepRemote {
            self.apply_locally(node_id, &resolved, now).await?;
            return Ok(SyncOutcome::Downloaded);
        }

        let data = self.services.serializer.serialize(&resolved)?;
        let credential = self.services.credentials.secret_for(&local.host_url);
        self.services
            .transport
            .push(
                &local.host_url,
                &local.file_name,
                credential.as_deref(),
                data.as_bytes(),
            )
            .await?;

        if choice == Resolution::Merge {
            self.apply_locally(node_id, &resolved, now).await?;
        } else {
            self.services
                .baselines
                .put(BaselineSnapshot::capture(&resolved.node, now))?;
        }
        Ok(SyncOutcome::Uploaded)
    }

    /// Drop all sync state for removed trays: queue, in-flight, status,
    /// conflicts, baselines and backups.
    pub async fn forget_nodes(&self, node_ids: &[String]) {
        {
            let mut state = self.lock_state();
            for id in node_ids {
                state.queue.remove(id);
                state.in_flight.remove(id);
                state.statuses.remove(id);
                state.parked.remove(id);
                state.conflicts.remove(id);
            }
        }
        for id in node_ids {
            if let Err(e) = self.services.baselines.remove(id) {
                warn!("Could not remove baseline of {}: {}", id, e);
            }
        }
        if let Err(e) = self.services.integrity.forget(node_ids).await {
            warn!("Could not remove backups of removed trays: {}", e);
        }
        debug!("Forgot sync state of {} trays", node_ids.len());
    }

    /// Apply the backup retention policy.
    pub async fn prune_backups(&self, now: u64) {
        match self.services.integrity.cleanup(now).await {
            Ok(report) if report.deleted() > 0 => {
                debug!(
                    "Pruned {} backups, {} remain",
                    report.deleted(),
                    report.remaining
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Backup cleanup failed: {}", e),
        }
    }

    // ==================== Queries ====================

    pub fn status(&self, node_id: &str) -> SyncStatus {
        self.lock_state()
            .statuses
            .get(node_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn statuses(&self) -> HashMap<String, SyncStatus> {
        self.lock_state().statuses.clone()
    }

    /// Pending conflicts, oldest first.
    pub fn pending_conflicts(&self) -> Vec<PendingConflict> {
        let mut conflicts: Vec<PendingConflict> =
            self.lock_state().conflicts.values().cloned().collect();
        conflicts.sort_by(|a, b| {
            a.detected_at
                .cmp(&b.detected_at)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        conflicts
    }

    /// Take all queued notifications, oldest first.
    pub fn drain_notifications(&self) -> Vec<Notification> {
        self.lock_state().notifications.drain(..).collect()
    }

    pub fn queue_entry(&self, node_id: &str) -> Option<SyncQueueEntry> {
        self.lock_state().queue.get(node_id).cloned()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock_state();
        SchedulerStats {
            queued: state.queue.len(),
            in_flight: state.in_flight.len(),
            parked: state.parked.len(),
            pending_conflicts: state.conflicts.len(),
            ..state.stats.clone()
        }
    }
}
