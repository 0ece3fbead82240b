//! Worker runner
//!
//! Wires one worker to its chain adapter: logging, the credential
//! daemon handshake, the fill subscription, maintenance timers, and
//! the shutdown signal. The adapter itself is constructed by the
//! embedding process; this crate only consumes the trait.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;

use crate::chain::ChainAdapter;
use crate::config::Settings;
use crate::errors::{Error, Result};
use crate::keyring::KeyClient;
use crate::sync::cancel_pair;
use crate::worker::{Worker, WorkerEvent};

/// Seconds between spread/divergence maintenance passes.
const MAINTENANCE_INTERVAL_SECS: u64 = 60;

/// How long to wait for the credential daemon at startup.
const DAEMON_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// External control over a running worker.
#[derive(Clone)]
pub struct WorkerControl {
    tx: mpsc::Sender<WorkerEvent>,
}

impl WorkerControl {
    /// Tear the grid down and rebuild it from config.
    pub async fn reset(&self) -> Result<()> {
        self.tx
            .send(WorkerEvent::Reset)
            .await
            .map_err(|_| Error::Cancelled)
    }

    /// Drain in-flight work, flush persistence, stop.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(WorkerEvent::Shutdown)
            .await
            .map_err(|_| Error::Cancelled)
    }
}

/// Runner for one trading pair's worker.
pub struct WorkerRunner {
    settings: Settings,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,
}

impl WorkerRunner {
    /// Load settings from a configuration file.
    pub fn new(config_path: impl AsRef<Path>) -> Result<Self> {
        let path = config_path
            .as_ref()
            .to_str()
            .ok_or_else(|| Error::Config("config path is not valid UTF-8".into()))?;
        Ok(Self::from_settings(Settings::load(path)?))
    }

    pub fn from_settings(settings: Settings) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            settings,
            events_tx,
            events_rx,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Handle for reset/shutdown commands while the worker runs.
    pub fn controller(&self) -> WorkerControl {
        WorkerControl {
            tx: self.events_tx.clone(),
        }
    }

    /// Marker file that tells the supervisor to skip this pair.
    fn disable_marker(&self) -> std::path::PathBuf {
        self.settings
            .bot
            .state_dir
            .join(format!("{}.disabled", self.settings.bot.bot_key))
    }

    /// Mark this pair inactive; the next startup is skipped.
    pub fn disable(&self) -> Result<()> {
        std::fs::write(self.disable_marker(), b"")?;
        Ok(())
    }

    pub fn is_disabled(&self) -> bool {
        self.disable_marker().exists()
    }

    /// Run the worker to completion against the given chain adapter.
    pub async fn run(self, chain: Arc<dyn ChainAdapter>) -> Result<()> {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", &self.settings.log.level);
        }
        env_logger::try_init().ok();

        if self.is_disabled() {
            info!(
                "{}: disabled marker present; not starting",
                self.settings.bot.bot_key
            );
            return Ok(());
        }

        if let Some(keyring_cfg) = &self.settings.keyring {
            // prove the signing path works before any order leaves
            let keys = KeyClient::new(keyring_cfg.clone());
            keys.wait_ready(DAEMON_READY_TIMEOUT).await?;
            keys.private_key().await?;
            info!("credential daemon verified for {}", keyring_cfg.account_name);
        }

        let mut worker = Worker::bootstrap(self.settings.bot.clone(), chain.clone()).await?;

        // thin callbacks: everything funnels into the event queue
        let mut fills = chain
            .subscribe_fills()
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;
        let fill_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(fill) = fills.recv().await {
                if fill_tx.send(WorkerEvent::Fill(fill)).await.is_err() {
                    break;
                }
            }
            warn!("fill subscription closed");
        });

        let maintenance_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
            tick.tick().await; // the interval fires immediately once
            loop {
                tick.tick().await;
                if maintenance_tx.send(WorkerEvent::SpreadCheck).await.is_err()
                    || maintenance_tx
                        .send(WorkerEvent::DivergenceCheck)
                        .await
                        .is_err()
                {
                    break;
                }
            }
        });

        let signal_tx = self.events_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = signal_tx.send(WorkerEvent::Shutdown).await;
            }
        });

        let (_cancel_handle, cancel) = cancel_pair();
        worker.run(self.events_rx, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::config::{LogConfig, Settings};

    fn settings(dir: &std::path::Path) -> Settings {
        let mut bot = test_config();
        bot.state_dir = dir.to_path_buf();
        Settings {
            bot,
            log: LogConfig::default(),
            keyring: None,
        }
    }

    #[test]
    fn test_disable_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let runner = WorkerRunner::from_settings(settings(dir.path()));
        assert!(!runner.is_disabled());
        runner.disable().unwrap();
        assert!(runner.is_disabled());
    }

    #[tokio::test]
    async fn test_disabled_pair_does_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let runner = WorkerRunner::from_settings(settings(dir.path()));
        runner.disable().unwrap();
        // no chain calls happen for a disabled pair
        let chain = Arc::new(crate::chain::mock::MockChain::new("A", 4, "B", 8, 1000.0));
        runner.run(chain).await.unwrap();
    }

    #[tokio::test]
    async fn test_controller_shutdown_signal() {
        let dir = tempfile::tempdir().unwrap();
        let runner = WorkerRunner::from_settings(settings(dir.path()));
        let control = runner.controller();
        // the queue accepts control events before the worker starts
        control.shutdown().await.unwrap();
    }
}
