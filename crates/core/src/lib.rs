pub mod artifact;
pub mod config;
pub mod metadata;
pub mod metrics;
pub mod orchestrator;
pub mod params;
pub mod session;
pub mod task;
pub mod testing;
pub mod transport;

pub use artifact::{Artifact, ArtifactKind, ArtifactStore, ArtifactStoreConfig, StorageError};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use metadata::{MetadataRecorder, TaskMetadata};
pub use orchestrator::{
    JobOrchestrator, OrchestratorConfig, OrchestratorError, OrchestratorStatus, SubmitRequest,
    TaskUpdateCallback,
};
pub use params::{
    validate, GenerationParams, GenerationRequest, SourceImage, ValidatedRequest, ValidationError,
};
pub use session::{RegistryError, Session, SessionRegistry};
pub use task::{FailureKind, Task, TaskState};
pub use transport::{
    ConnectionError, ConnectionManager, ConnectionPolicy, RestFetcher, Transport,
    WebSocketTransport,
};
