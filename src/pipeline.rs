//! Wires discovery, labeling and dispatch together.
//!
//! Discovered files become jobs on the image pool. Each job labels one file
//! and, on success, moves the resulting envelope into a job on the network
//! pool, which resolves the envelope's client and dispatches it. The two
//! pools share nothing but the registry.

use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::classify_types::{ClientId, LabelResult};
use crate::models::fs_types::{DiscoveredFile, ScanSummary};
use crate::services::classifier::Labeler;
use crate::services::dispatch::{ClientRegistry, Dispatcher};
use crate::services::fs_service::{self, ExtensionFilter, SeenFiles};
use crate::services::pool::{PoolConfig, PoolStats, WorkerPool};
use crate::services::watcher::{FileSink, FolderWatcher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub root: PathBuf,
    pub filter: ExtensionFilter,
    pub watch: bool,
    pub deduplicate: bool,
    pub settle: Duration,
    pub image_pool: PoolConfig,
    pub network_pool: PoolConfig,
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            root: config.discovery.root.clone(),
            filter: ExtensionFilter::new(&config.discovery.extensions),
            watch: config.discovery.watch,
            deduplicate: config.discovery.deduplicate,
            settle: Duration::from_millis(config.discovery.settle_ms),
            image_pool: config.pools.image_pool(),
            network_pool: config.pools.network_pool(),
        }
    }
}

struct Stages {
    labeler: Mutex<Box<dyn Labeler>>,
    image_pool: WorkerPool,
    network_pool: WorkerPool,
    clients: Arc<ClientRegistry>,
    client: ClientId,
    seen: Option<SeenFiles>,
}

impl Stages {
    fn accept(self: &Arc<Self>, file: DiscoveredFile) -> Result<(), AppError> {
        if let Some(seen) = &self.seen {
            if !seen.first_sighting(&file) {
                debug!(path = %file.path.display(), "already queued, skipping");
                return Ok(());
            }
        }
        let stages = Arc::clone(self);
        self.image_pool.submit(move || stages.label(file))
    }

    fn label(&self, file: DiscoveredFile) -> Result<(), AppError> {
        let predictions = {
            let mut labeler = self.labeler.lock().unwrap_or_else(|p| p.into_inner());
            labeler.process(&file.path)?
        };
        let result = LabelResult::new(self.client, file.path, predictions);
        info!(
            path = %result.image.display(),
            labels = result.len(),
            client = %result.client,
            "labeled"
        );

        let clients = Arc::clone(&self.clients);
        self.network_pool.submit(move || clients.dispatch(result))
    }
}

pub struct LabelPipeline {
    options: PipelineOptions,
    stages: Arc<Stages>,
    watcher: FolderWatcher,
}

impl LabelPipeline {
    pub fn new(
        options: PipelineOptions,
        labeler: Box<dyn Labeler>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self, AppError> {
        let clients = Arc::new(ClientRegistry::new());
        let sink_name = dispatcher.name();
        let client = clients.register(dispatcher);
        info!(%client, sink = sink_name, "registered client");

        let stages = Arc::new(Stages {
            labeler: Mutex::new(labeler),
            image_pool: WorkerPool::new("image", options.image_pool)?,
            network_pool: WorkerPool::new("network", options.network_pool)?,
            clients,
            client,
            seen: options.deduplicate.then(SeenFiles::new),
        });

        let watcher = FolderWatcher::with_settle(options.settle);
        Ok(Self {
            options,
            stages,
            watcher,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.stages.client
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.stages.clients
    }

    /// Queues one file for labeling, as the scan and the watcher do.
    pub fn submit(&self, file: DiscoveredFile) -> Result<(), AppError> {
        self.stages.accept(file)
    }

    /// Installs the watcher (when enabled) and then scans the root once.
    /// The watcher goes first so nothing created during the scan is missed.
    pub fn start(&self) -> Result<ScanSummary, AppError> {
        if self.options.watch {
            let stages = Arc::clone(&self.stages);
            let sink: FileSink = Arc::new(move |file: DiscoveredFile| {
                if let Err(e) = stages.accept(file) {
                    warn!("Failed to queue new file: {}", e);
                }
            });
            self.watcher
                .watch_folder(&self.options.root, self.options.filter.clone(), sink)?;
        }

        let summary = fs_service::scan(&self.options.root, &self.options.filter, |file| {
            if let Err(e) = self.stages.accept(file) {
                warn!("Failed to queue file: {}", e);
            }
        })?;
        info!(
            root = %self.options.root.display(),
            matched = summary.matched,
            skipped = summary.skipped,
            errors = summary.errors,
            "initial scan complete"
        );
        Ok(summary)
    }

    pub fn image_stats(&self) -> PoolStats {
        self.stages.image_pool.stats()
    }

    pub fn network_stats(&self) -> PoolStats {
        self.stages.network_pool.stats()
    }

    /// Stops the watcher, drains both pools (image pool first) and waits
    /// for every dispatcher to finish what it already accepted.
    pub fn shutdown(&self) {
        self.watcher.stop();
        self.stages.image_pool.shutdown();
        self.stages.network_pool.shutdown();
        self.stages.clients.flush_all();
    }
}
