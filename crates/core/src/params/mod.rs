//! Generation parameter validation.
//!
//! Every request is normalized and range-checked here before anything touches
//! the network. Validation is pure: no I/O, no shared state.

mod types;
mod validator;

pub use types::{
    GenerationParams, GenerationRequest, ImageInfo, ParameterOverrides, SourceImage, TextureSize,
    ValidatedParams, ValidatedRequest,
};
pub use validator::{apply_preset, validate, validate_params, validate_with_preset};

use thiserror::Error;

/// Reasons a request is rejected before submission.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("texture_size {0} is not one of 512, 1024, 1536, 2048")]
    InvalidTextureSize(u32),

    #[error("unknown parameter preset: {0}")]
    UnknownPreset(String),

    #[error("source image is empty")]
    EmptyImage,

    #[error("invalid image dimensions {width}x{height}")]
    InvalidImageDimensions { width: u32, height: u32 },

    #[error("could not read image header: {0}")]
    UndecodableImage(String),
}
