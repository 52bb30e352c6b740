//! Directory-backed transport using tokio::fs.
//!
//! Each server maps to one directory under the remote root, named after its
//! normalized URL. A `.secret` file in that directory holds the server's
//! shared secret; without one the server accepts any caller.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tray_core::credentials::normalize_server_url;
use tray_core::transport::{Result, Transport, TransportError};

const SECRET_FILE: &str = ".secret";

pub struct DirTransport {
    root: PathBuf,
}

impl DirTransport {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Directory holding one server's files.
    pub fn server_dir(&self, host_url: &str) -> PathBuf {
        let name: String = normalize_server_url(host_url)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.root.join(name)
    }

    fn file_path(&self, host_url: &str, file_name: &str) -> Result<PathBuf> {
        let invalid = file_name.is_empty()
            || file_name == "."
            || file_name == ".."
            || file_name == SECRET_FILE
            || file_name.contains(['/', '\\']);
        if invalid {
            return Err(TransportError::InvalidTarget(format!(
                "invalid remote file name {file_name:?}"
            )));
        }
        Ok(self.server_dir(host_url).join(file_name))
    }

    async fn authorize(&self, host_url: &str, credential: Option<&str>) -> Result<()> {
        let secret_path = self.server_dir(host_url).join(SECRET_FILE);
        match fs::read_to_string(&secret_path).await {
            Ok(secret) if credential == Some(secret.trim()) => Ok(()),
            Ok(_) => Err(TransportError::AuthFailed(normalize_server_url(host_url))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransportError::Network(e.to_string())),
        }
    }
}

#[async_trait]
impl Transport for DirTransport {
    async fn fetch(
        &self,
        host_url: &str,
        file_name: &str,
        credential: Option<&str>,
    ) -> Result<Option<Vec<u8>>> {
        let path = self.file_path(host_url, file_name)?;
        self.authorize(host_url, credential).await?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransportError::Network(e.to_string())),
        }
    }

    async fn push(
        &self,
        host_url: &str,
        file_name: &str,
        credential: Option<&str>,
        data: &[u8],
    ) -> Result<()> {
        let path = self.file_path(host_url, file_name)?;
        self.authorize(host_url, credential).await?;

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::Network(e.to_string()))?;
        }

        fs::write(&path, data)
            .await
            .map_err(|e| TransportError::Network(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOST: &str = "https://trays.example.com";

    #[tokio::test]
    async fn test_push_then_fetch() {
        let temp_dir = TempDir::new().unwrap();
        let transport = DirTransport::new(temp_dir.path().to_path_buf());

        assert_eq!(transport.fetch(HOST, "a.json", None).await.unwrap(), None);
        transport.push(HOST, "a.json", None, b"{}").await.unwrap();

        let fetched = transport
            .fetch("HTTPS://Trays.Example.com:443/", "a.json", None)
            .await
            .unwrap();
        assert_eq!(fetched.as_deref(), Some(&b"{}"[..]));
        assert!(temp_dir
            .path()
            .join("https___trays.example.com")
            .join("a.json")
            .exists());
    }

    #[tokio::test]
    async fn test_secret_file_is_enforced() {
        let temp_dir = TempDir::new().unwrap();
        let transport = DirTransport::new(temp_dir.path().to_path_buf());
        let dir = transport.server_dir(HOST);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(SECRET_FILE), "hunter2\n").unwrap();

        let err = transport.push(HOST, "a.json", None, b"{}").await.unwrap_err();
        assert!(matches!(err, TransportError::AuthFailed(_)));
        let err = transport
            .fetch(HOST, "a.json", Some("wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::AuthFailed(_)));

        transport
            .push(HOST, "a.json", Some("hunter2"), b"{}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_escapes() {
        let temp_dir = TempDir::new().unwrap();
        let transport = DirTransport::new(temp_dir.path().to_path_buf());

        for name in ["../evil.json", "..", "", SECRET_FILE, "a/b.json"] {
            let err = transport.push(HOST, name, None, b"x").await.unwrap_err();
            assert!(matches!(err, TransportError::InvalidTarget(_)));
            assert!(!err.is_retryable());
        }
    }
}
