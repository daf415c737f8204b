//! waypoint - backend registry and selection engine
//!
//! Usage:
//!     waypoint --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use waypoint::config::{Config, ConfigWatcher, ManagerConfig, load_config};
use waypoint::manager::LifecycleManager;
use waypoint::registry::{BackendRegistry, Registry, RemoteRegistry};
use waypoint::state::AppState;
use waypoint::util::{ServiceHandle, ShutdownSignal, init_logging};

/// Backend registry, health tracking and selection for Layer 4/7 load balancing.
#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);
    init_logging(log_level, &config.global.log_format);

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Layer: {}", config.layer());
        println!("  Algorithm: {}", config.algorithm);
        println!("  Listen: {}", config.listen.socket_addr());
        println!(
            "  Health checks: {} every {:?}",
            if config.healthcheck.enabled { "on" } else { "off" },
            config.healthcheck.interval
        );
        if config.manager.enabled {
            println!(
                "  Manager: {} backends from port {}",
                config.manager.initial_backends, config.manager.base_port
            );
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        layer = %config.layer(),
        algorithm = %config.algorithm,
        listen = %config.listen.socket_addr(),
        "waypoint starting"
    );

    run(cli.config, config)
}

fn run(config_path: PathBuf, config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run_async(config_path, config))
}

async fn run_async(config_path: PathBuf, config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();

    let state = AppState::start(config.clone(), shutdown.clone())
        .await
        .context("failed to start registry")?;

    let (reload_tx, reload_rx) = mpsc::channel(4);
    let watcher = ConfigWatcher::new(config_path, reload_tx);
    let watcher = ServiceHandle::spawn("config-watcher", &shutdown.token(), |token| {
        watcher.run(token)
    });

    let reload_state = Arc::clone(&state);
    let reloader = ServiceHandle::spawn("config-reloader", &shutdown.token(), move |token| {
        apply_reloads(reload_state, reload_rx, token)
    });

    let manager = if config.manager.enabled {
        Some(Manager::start(&config.manager, &state, &shutdown).await?)
    } else {
        None
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    // Unregister managed backends while the registry still serves.
    if let Some(manager) = manager {
        manager.shutdown().await;
    }

    shutdown.shutdown();
    watcher.stop().await;
    reloader.stop().await;
    state.stop().await;

    info!("waypoint shut down complete");
    Ok(())
}

async fn apply_reloads(
    state: Arc<AppState>,
    mut reload_rx: mpsc::Receiver<Config>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = reload_rx.recv() => match next {
                Some(config) => {
                    if let Err(e) = state.apply_reload(config).await {
                        error!(error = %e, "reload rejected, keeping previous configuration");
                    }
                }
                None => break,
            },
        }
    }
}

/// Lifecycle manager bound to whichever registry the config selects.
enum Manager {
    Embedded(LifecycleManager<BackendRegistry>),
    Remote(LifecycleManager<RemoteRegistry>),
}

impl Manager {
    async fn start(
        config: &ManagerConfig,
        state: &AppState,
        shutdown: &ShutdownSignal,
    ) -> Result<Self> {
        let token = shutdown.token();
        let manager = match &config.registry_url {
            Some(url) => {
                let remote = RemoteRegistry::new(url)
                    .with_context(|| format!("invalid manager registry url '{url}'"))?;
                Manager::Remote(LifecycleManager::new(Arc::new(remote), config.clone(), &token))
            }
            None => Manager::Embedded(LifecycleManager::new(
                Arc::clone(state.registry()),
                config.clone(),
                &token,
            )),
        };

        match &manager {
            Manager::Embedded(m) => provision(m, config.initial_backends).await,
            Manager::Remote(m) => provision(m, config.initial_backends).await,
        }
        Ok(manager)
    }

    async fn shutdown(self) {
        match self {
            Manager::Embedded(m) => m.shutdown().await,
            Manager::Remote(m) => m.shutdown().await,
        }
    }
}

async fn provision<R: Registry>(manager: &LifecycleManager<R>, count: u32) {
    for _ in 0..count {
        match manager.add_server().await {
            Ok(server) => info!(name = %server.name, url = %server.url, "provisioned backend"),
            Err(e) => {
                warn!(error = %e, "failed to provision backend");
                break;
            }
        }
    }
}
