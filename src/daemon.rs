//! Long-running service
//!
//! Wires the coordinator to the HTTP API and the cycle scheduler, restores
//! persisted observations and history at startup, and saves them again on
//! shutdown.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::scheduler::CycleScheduler;
use crate::server::{self, ServerState};

const OBSERVATIONS_FILE: &str = "observations.json";
const HISTORY_FILE: &str = "history.json";

pub struct Daemon {
    config: Config,
    coordinator: Arc<Coordinator>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub async fn new(config: Config) -> Result<Self> {
        let coordinator = Arc::new(Coordinator::from_config(&config).await?);
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            coordinator,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    fn storage_dir(&self) -> Result<Option<PathBuf>> {
        if !self.config.storage.persist {
            return Ok(None);
        }
        let dir = self.config.storage.resolve_dir()?;
        std::fs::create_dir_all(&dir).context("Failed to create data directory")?;
        Ok(Some(dir))
    }

    async fn restore(&self) -> Result<()> {
        let Some(dir) = self.storage_dir()? else {
            return Ok(());
        };

        let observations = dir.join(OBSERVATIONS_FILE);
        if observations.exists() {
            let count = self.coordinator.store().load(&observations).await?;
            info!("Restored {} observations from {:?}", count, observations);
        }

        let history = dir.join(HISTORY_FILE);
        if history.exists() {
            let count = self.coordinator.dispatcher().load_history(&history).await?;
            info!("Restored {} activation records from {:?}", count, history);
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let Some(dir) = self.storage_dir()? else {
            return Ok(());
        };
        self.coordinator
            .store()
            .save(&dir.join(OBSERVATIONS_FILE))
            .await?;
        self.coordinator
            .dispatcher()
            .save_history(&dir.join(HISTORY_FILE))
            .await?;
        Ok(())
    }

    /// Start the API and, if enabled, the scheduler
    pub async fn start(&mut self) -> Result<()> {
        self.restore().await?;

        let scheduler_state = if self.config.scheduler.enabled {
            let scheduler =
                CycleScheduler::new(self.coordinator.clone(), self.config.scheduler.clone());
            let state = scheduler.state();
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.tasks.push(tokio::spawn(async move {
                scheduler.run(shutdown_rx).await;
            }));
            Some(state)
        } else {
            None
        };

        let state = ServerState {
            coordinator: self.coordinator.clone(),
            scheduler: scheduler_state,
        };
        let host = self.config.server.host.clone();
        let port = self.config.server.port;
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server::start(state, &host, port, shutdown_rx).await {
                warn!("API server error: {:#}", e);
            }
        }));

        info!(
            "Service running on {}:{} (scheduler: {})",
            self.config.server.host, self.config.server.port, self.config.scheduler.enabled
        );
        Ok(())
    }

    /// Signal shutdown, wait for the tasks and persist state
    pub async fn stop(&mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Service task ended abnormally: {}", e);
            }
        }
        self.persist().await?;
        info!("Service stopped");
        Ok(())
    }

    /// Run until Ctrl+C
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        println!("feedback-coordinator is running.");
        println!(
            "  API: http://{}:{}/api/status",
            self.config.server.host, self.config.server.port
        );
        println!("Press Ctrl+C to stop.");

        tokio::signal::ctrl_c().await?;
        println!("\nShutting down...");

        self.stop().await
    }
}
