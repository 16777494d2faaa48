//! Testing utilities and an in-process generation service.
//!
//! [`MockTrellisService`] implements the transport seam, so the whole client
//! stack can be exercised without a real service.
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::testing::{fixtures, MockTrellisService, SubmitBehavior};
//!
//! let service = MockTrellisService::new();
//! service.set_behavior(SubmitBehavior::Fail("CUDA out of memory".into())).await;
//!
//! let connections = ConnectionManager::new(service.transport(), fixtures::fast_connection_policy());
//! // ... build the orchestrator and submit fixtures::default_request() ...
//! ```

mod mock_trellis_service;

pub use mock_trellis_service::{mock_artifact_bytes, MockTrellisService, SubmitBehavior};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::io::Cursor;
    use std::time::Duration;

    use crate::config::ProcessingConfig;
    use crate::orchestrator::OrchestratorConfig;
    use crate::params::{GenerationParams, GenerationRequest, SourceImage};
    use crate::transport::{ConnectionPolicy, ReconnectPolicy};

    /// Encode a small gradient PNG.
    pub fn png_image(width: u32, height: u32) -> SourceImage {
        let pixels = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 16) as u8, (y * 16) as u8, 128])
        });
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(pixels)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encode fixture png");
        SourceImage::from_bytes(bytes).expect("read fixture png header")
    }

    /// A request for a 16x16 image with the given parameters.
    pub fn request(params: GenerationParams) -> GenerationRequest {
        GenerationRequest::new(png_image(16, 16), params)
    }

    /// A request with default parameters.
    pub fn default_request() -> GenerationRequest {
        request(GenerationParams::default())
    }

    /// Channel policy with millisecond-scale timings.
    pub fn fast_connection_policy() -> ConnectionPolicy {
        ConnectionPolicy {
            acquire_timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(60),
            reconnect: ReconnectPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(20),
                connect_timeout: Duration::from_millis(200),
            },
        }
    }

    /// Orchestrator settings with millisecond-scale timings.
    pub fn fast_orchestrator_config() -> OrchestratorConfig {
        OrchestratorConfig {
            ack_timeout: Duration::from_millis(300),
            chunk_timeout: Duration::from_millis(500),
            task_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            processing: ProcessingConfig::default(),
        }
    }
}
