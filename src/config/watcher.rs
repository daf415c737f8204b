//! Configuration file watcher for hot reload.
//!
//! Watches the configuration file for changes and hands every valid new
//! configuration to the runtime over a channel.

use crate::config::{Config, load_config};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Configuration file watcher.
pub struct ConfigWatcher {
    /// Path to the config file.
    config_path: PathBuf,
    /// Receives each configuration that loaded and validated.
    reload_tx: tokio::sync::mpsc::Sender<Config>,
}

impl ConfigWatcher {
    /// Create a new config watcher.
    pub fn new(config_path: PathBuf, reload_tx: tokio::sync::mpsc::Sender<Config>) -> Self {
        Self {
            config_path,
            reload_tx,
        }
    }

    /// Get the path being watched.
    pub fn path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Run the config watcher.
    ///
    /// This watches for:
    /// - File changes to the config file
    /// - SIGHUP signal for manual reload
    pub async fn run(self, shutdown: CancellationToken) {
        info!(path = %self.config_path.display(), "config watcher starting");

        let (tx, rx) = mpsc::channel();

        let watcher_result: Result<RecommendedWatcher, _> = Watcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        );

        let mut watcher = match watcher_result {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "failed to create file watcher");
                shutdown.cancelled().await;
                return;
            }
        };

        // Watch the parent directory so editors that replace the file are seen
        if let Some(parent) = self.config_path.parent() {
            let parent = if parent.as_os_str().is_empty() {
                std::path::Path::new(".")
            } else {
                parent
            };
            if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
                error!(error = %e, "failed to watch config directory");
                shutdown.cancelled().await;
                return;
            }
        }

        #[cfg(unix)]
        let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "failed to setup SIGHUP handler");
                None
            }
        };

        info!("config watcher ready, watching for changes");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    let mut changed = false;
                    while let Ok(event) = rx.try_recv() {
                        changed |= self.should_reload(&event);
                    }
                    if changed {
                        self.try_reload().await;
                    }
                }

                _ = async {
                    #[cfg(unix)]
                    {
                        if let Some(ref mut sig) = sighup {
                            sig.recv().await
                        } else {
                            std::future::pending::<Option<()>>().await
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        std::future::pending::<Option<()>>().await
                    }
                } => {
                    info!("received SIGHUP, reloading configuration");
                    self.try_reload().await;
                }

                _ = shutdown.cancelled() => {
                    info!("config watcher shutting down");
                    break;
                }
            }
        }
    }

    /// Check if this event should trigger a reload.
    fn should_reload(&self, event: &Event) -> bool {
        let is_our_file = event
            .paths
            .iter()
            .any(|p| p.file_name() == self.config_path.file_name());

        let is_modify_or_create = matches!(
            event.kind,
            notify::EventKind::Modify(_) | notify::EventKind::Create(_)
        );

        is_our_file && is_modify_or_create
    }

    /// Load the file and forward it; invalid files keep the current config.
    async fn try_reload(&self) {
        info!(path = %self.config_path.display(), "attempting config reload");

        let new_config = match load_config(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to load new config, keeping current");
                return;
            }
        };

        info!(
            layer = %new_config.layer(),
            algorithm = %new_config.algorithm,
            "configuration loaded, applying"
        );

        if self.reload_tx.send(new_config).await.is_err() {
            warn!("reload receiver dropped, configuration not applied");
        }
    }
}
