//! Credential daemon client
//!
//! The daemon holds the master password in memory and serves decrypted
//! signing keys over a local socket; this client speaks its
//! newline-delimited JSON protocol. The password itself never crosses
//! the socket. The daemon signals readiness by touching a ready-file.

use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::KeyringConfig;
use crate::errors::{Error, Result};

#[derive(Serialize)]
struct KeyRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(rename = "accountName")]
    account_name: &'a str,
}

#[derive(Deserialize)]
struct KeyResponse {
    success: bool,
    #[serde(rename = "privateKey")]
    private_key: Option<String>,
    error: Option<String>,
}

/// Client for one worker's credential lookups.
pub struct KeyClient {
    cfg: KeyringConfig,
}

impl KeyClient {
    pub fn new(cfg: KeyringConfig) -> Self {
        Self { cfg }
    }

    /// Wait for the daemon's ready-file to appear.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.cfg.ready_path.exists() {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Keyring(format!(
                    "daemon ready-file {:?} did not appear within {timeout:?}",
                    self.cfg.ready_path
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        debug!("credential daemon ready");
        Ok(())
    }

    /// Request the decrypted signing key for the configured account.
    #[cfg(unix)]
    pub async fn private_key(&self) -> Result<String> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let stream = tokio::net::UnixStream::connect(&self.cfg.socket_path)
            .await
            .map_err(|e| Error::Keyring(format!("connect {:?}: {e}", self.cfg.socket_path)))?;
        let (read_half, mut write_half) = stream.into_split();

        let request = serde_json::to_string(&KeyRequest {
            kind: "private-key",
            account_name: &self.cfg.account_name,
        })
        .map_err(|e| Error::Keyring(e.to_string()))?;
        write_half
            .write_all(request.as_bytes())
            .await
            .map_err(|e| Error::Keyring(e.to_string()))?;
        write_half
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Keyring(e.to_string()))?;

        let mut line = String::new();
        BufReader::new(read_half)
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Keyring(e.to_string()))?;
        let response: KeyResponse =
            serde_json::from_str(line.trim()).map_err(|e| Error::Keyring(e.to_string()))?;

        if response.success {
            response
                .private_key
                .ok_or_else(|| Error::Keyring("daemon replied success without a key".into()))
        } else {
            Err(Error::Keyring(
                response.error.unwrap_or_else(|| "unspecified daemon error".into()),
            ))
        }
    }

    #[cfg(not(unix))]
    pub async fn private_key(&self) -> Result<String> {
        Err(Error::Unsupported("credential daemon socket"))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    fn config(dir: &std::path::Path) -> KeyringConfig {
        KeyringConfig {
            socket_path: dir.join("daemon.sock"),
            ready_path: dir.join("daemon.ready"),
            account_name: "trader".into(),
        }
    }

    async fn spawn_daemon(cfg: &KeyringConfig, reply: String) {
        let listener = UnixListener::bind(&cfg.socket_path).unwrap();
        std::fs::write(&cfg.ready_path, b"").unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read_half).read_line(&mut line).await.unwrap();
            let request: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
            assert_eq!(request["type"], "private-key");
            assert_eq!(request["accountName"], "trader");
            write_half.write_all(reply.as_bytes()).await.unwrap();
            write_half.write_all(b"\n").await.unwrap();
        });
    }

    #[tokio::test]
    async fn test_key_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        spawn_daemon(
            &cfg,
            "{\"success\":true,\"privateKey\":\"5Kabcdef\"}".to_string(),
        )
        .await;

        let client = KeyClient::new(cfg);
        client.wait_ready(Duration::from_secs(1)).await.unwrap();
        assert_eq!(client.private_key().await.unwrap(), "5Kabcdef");
    }

    #[tokio::test]
    async fn test_daemon_error_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        spawn_daemon(
            &cfg,
            "{\"success\":false,\"error\":\"unknown account\"}".to_string(),
        )
        .await;

        let client = KeyClient::new(cfg);
        client.wait_ready(Duration::from_secs(1)).await.unwrap();
        match client.private_key().await {
            Err(Error::Keyring(msg)) => assert!(msg.contains("unknown account")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let client = KeyClient::new(cfg);
        assert!(client
            .wait_ready(Duration::from_millis(150))
            .await
            .is_err());
    }
}
