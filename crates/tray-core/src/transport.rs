//! Transport trait for moving serialized trays to and from servers.
//!
//! Implementations:
//! - `InMemoryTransport` - For testing
//! - `DirTransport` (in tray-daemon) - One directory per server on local disk

use crate::credentials::normalize_server_url;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Authentication failed for {0}")]
    AuthFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    /// The host/file pair can never be reached; retrying will not help
    #[error("Invalid remote target: {0}")]
    InvalidTarget(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::InvalidTarget(_))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Remote file access, one file per network-bound tray.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch a remote file. `Ok(None)` means the server has no such file.
    async fn fetch(
        &self,
        host_url: &str,
        file_name: &str,
        credential: Option<&str>,
    ) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite a remote file.
    async fn push(
        &self,
        host_url: &str,
        file_name: &str,
        credential: Option<&str>,
        data: &[u8],
    ) -> Result<()>;
}

/// In-memory servers for testing.
///
/// Supports per-server secrets, injected failures, an artificial latency and
/// records the peak number of concurrent calls.
#[derive(Default)]
pub struct InMemoryTransport {
    files: RwLock<HashMap<(String, String), Vec<u8>>>,
    secrets: RwLock<HashMap<String, String>>,
    failures: Mutex<VecDeque<TransportError>>,
    latency: Mutex<Option<Duration>>,
    fetch_count: AtomicUsize,
    push_count: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(host_url: &str, file_name: &str) -> (String, String) {
        (normalize_server_url(host_url), file_name.to_string())
    }

    /// Require `secret` for every call to `host_url`.
    pub fn set_secret(&self, host_url: &str, secret: impl Into<String>) {
        self.secrets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize_server_url(host_url), secret.into());
    }

    /// Place a file on a server directly.
    pub fn put_file(&self, host_url: &str, file_name: &str, data: impl Into<Vec<u8>>) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(Self::key(host_url, file_name), data.into());
    }

    pub fn file(&self, host_url: &str, file_name: &str) -> Option<Vec<u8>> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&Self::key(host_url, file_name))
            .cloned()
    }

    pub fn remove_file(&self, host_url: &str, file_name: &str) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&Self::key(host_url, file_name));
    }

    /// Make the next `count` calls fail with `error`.
    pub fn fail_next(&self, count: usize, error: TransportError) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = Some(latency);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn push_count(&self) -> usize {
        self.push_count.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, host_url: &str, credential: Option<&str>) -> Result<()> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let injected = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(error) = injected {
            return Err(error);
        }

        let host = normalize_server_url(host_url);
        let expected = self
            .secrets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&host)
            .cloned();
        match expected {
            Some(secret) if credential != Some(secret.as_str()) => {
                Err(TransportError::AuthFailed(host))
            }
            _ => Ok(()),
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn fetch(
        &self,
        host_url: &str,
        file_name: &str,
        credential: Option<&str>,
    ) -> Result<Option<Vec<u8>>> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let entered = self.enter(host_url, credential).await;
        self.leave();
        entered?;
        Ok(self.file(host_url, file_name))
    }

    async fn push(
        &self,
        host_url: &str,
        file_name: &str,
        credential: Option<&str>,
        data: &[u8],
    ) -> Result<()> {
        self.push_count.fetch_add(1, Ordering::SeqCst);
        let entered = self.enter(host_url, credential).await;
        self.leave();
        entered?;
        self.put_file(host_url, file_name, data);
        Ok(())
    }
}
