use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use trellis_core::orchestrator::TaskUpdateCallback;
use trellis_core::{
    ArtifactStore, ArtifactStoreConfig, Config, ConnectionManager, ConnectionPolicy,
    JobOrchestrator, MetadataRecorder, OrchestratorConfig, RestFetcher, SanitizedConfig,
    SessionRegistry, Task, Transport,
};

use crate::api::WsBroadcaster;

/// Shared application state
pub struct AppState {
    config: Config,
    orchestrator: Arc<JobOrchestrator>,
    ws_broadcaster: WsBroadcaster,
}

impl AppState {
    pub fn new(
        config: Config,
        orchestrator: Arc<JobOrchestrator>,
        ws_broadcaster: WsBroadcaster,
    ) -> Self {
        Self {
            config,
            orchestrator,
            ws_broadcaster,
        }
    }

    /// Wire every component from `config` on top of `transport`.
    ///
    /// Task changes are forwarded to the WebSocket broadcaster.
    pub async fn build(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let storage = &config.storage;

        let registry = Arc::new(
            SessionRegistry::open(storage.session_dir.clone())
                .await
                .with_context(|| format!("Failed to open session registry at {:?}", storage.session_dir))?,
        );
        info!(
            sessions = registry.list_sessions().await.len(),
            "Session registry loaded"
        );

        let store = Arc::new(ArtifactStore::new(ArtifactStoreConfig::from(storage)));
        let indexed = store
            .load_existing()
            .await
            .context("Failed to index artifact cache")?;
        info!(artifacts = indexed, "Artifact cache indexed");

        let recorder = Arc::new(MetadataRecorder::new(storage.metadata_dir.clone()));

        let fetcher = Arc::new(
            RestFetcher::new(
                &config.server.rest_api_url,
                storage.api_download_dir.clone(),
                config.server.timeout(),
            )
            .context("Failed to create REST client")?,
        );

        let connections = Arc::new(ConnectionManager::new(
            transport,
            ConnectionPolicy::from(&config.server),
        ));

        let ws_broadcaster = WsBroadcaster::default();
        let broadcaster_for_callback = ws_broadcaster.clone();
        let update_callback: TaskUpdateCallback = Arc::new(move |task: &Task| {
            broadcaster_for_callback.task_updated(task);
        });

        let orchestrator = JobOrchestrator::new(
            OrchestratorConfig::from(&config),
            registry,
            connections,
            store,
            recorder,
        )
        .with_rest_fetcher(fetcher)
        .with_update_callback(update_callback);

        Ok(Self::new(config, Arc::new(orchestrator), ws_broadcaster))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn orchestrator(&self) -> &Arc<JobOrchestrator> {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.orchestrator.registry()
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        self.orchestrator.store()
    }

    pub fn ws_broadcaster(&self) -> &WsBroadcaster {
        &self.ws_broadcaster
    }
}
