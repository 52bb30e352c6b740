//! Shared secrets per server.
//!
//! Each server has at most one shared secret. Lookups go through
//! [`normalize_server_url`] so `HTTPS://Example.com:443/` and
//! `https://example.com` find the same entry.

use std::collections::BTreeMap;
use std::sync::RwLock;
use url::Url;

/// Canonical form of a server URL used as a credential key.
///
/// Parsed with [`Url`]: scheme and host are lowercased, the scheme's default
/// port is dropped, and userinfo, query and fragment are discarded. Trailing
/// slashes of the path are stripped. Input that does not parse as an
/// absolute URL with a host is only trimmed and lowercased.
pub fn normalize_server_url(url: &str) -> String {
    let url = url.trim();
    match Url::parse(url) {
        Ok(parsed) if parsed.has_host() => {
            let host = parsed.host_str().unwrap_or_default();
            let port = parsed.port().map(|p| format!(":{p}")).unwrap_or_default();
            let path = parsed.path().trim_end_matches('/');
            format!("{}://{host}{port}{path}", parsed.scheme())
        }
        _ => url.trim_end_matches('/').to_ascii_lowercase(),
    }
}

/// Lookup of the shared secret for a server.
///
/// Implementations:
/// - `StaticCredentials` - In memory, also used by tests
/// - `credentials.json` (in tray-daemon) - Loaded into `StaticCredentials`
pub trait CredentialStore: Send + Sync {
    /// Secret for `server_url`, if any. The URL need not be normalized.
    fn secret_for(&self, server_url: &str) -> Option<String>;
}

/// In-memory credential table keyed by normalized server URL.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    secrets: RwLock<BTreeMap<String, String>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        let store = Self::new();
        for (url, secret) in entries {
            store.insert(&url, secret);
        }
        store
    }

    pub fn insert(&self, server_url: &str, secret: impl Into<String>) {
        self.secrets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize_server_url(server_url), secret.into());
    }

    pub fn remove(&self, server_url: &str) -> Option<String> {
        self.secrets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&normalize_server_url(server_url))
    }

    /// All entries, keyed by normalized URL.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.secrets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl CredentialStore for StaticCredentials {
    fn secret_for(&self, server_url: &str) -> Option<String> {
        self.secrets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&normalize_server_url(server_url))
            .cloned()
    }
}
