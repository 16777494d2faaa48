use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Cursor;

use super::ValidationError;

/// Mesh texture resolution accepted by the remote bake stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum TextureSize {
    Px512,
    Px1024,
    Px1536,
    Px2048,
}

impl TextureSize {
    pub const ALL: [TextureSize; 4] = [
        TextureSize::Px512,
        TextureSize::Px1024,
        TextureSize::Px1536,
        TextureSize::Px2048,
    ];

    pub fn pixels(self) -> u32 {
        match self {
            TextureSize::Px512 => 512,
            TextureSize::Px1024 => 1024,
            TextureSize::Px1536 => 1536,
            TextureSize::Px2048 => 2048,
        }
    }
}

impl TryFrom<u32> for TextureSize {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        TextureSize::ALL
            .into_iter()
            .find(|size| size.pixels() == value)
            .ok_or(ValidationError::InvalidTextureSize(value))
    }
}

impl From<TextureSize> for u32 {
    fn from(size: TextureSize) -> Self {
        size.pixels()
    }
}

/// Raw generation parameters as supplied by a caller or config file.
///
/// Nothing here is trusted until it has been through [`super::validate_params`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub seed: u64,
    pub sparse_steps: u32,
    pub sparse_cfg_strength: f64,
    pub slat_steps: u32,
    pub slat_cfg_strength: f64,
    pub simplify: f64,
    pub texture_size: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            seed: 1,
            sparse_steps: 12,
            sparse_cfg_strength: 7.5,
            slat_steps: 12,
            slat_cfg_strength: 3.0,
            simplify: 0.95,
            texture_size: 1024,
        }
    }
}

/// A partial parameter set. Used for presets and for caller overrides on top
/// of configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse_cfg_strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slat_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slat_cfg_strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simplify: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texture_size: Option<u32>,
}

impl ParameterOverrides {
    /// Copy of `base` with every defined field replaced.
    pub fn apply_to(&self, base: &GenerationParams) -> GenerationParams {
        GenerationParams {
            seed: self.seed.unwrap_or(base.seed),
            sparse_steps: self.sparse_steps.unwrap_or(base.sparse_steps),
            sparse_cfg_strength: self.sparse_cfg_strength.unwrap_or(base.sparse_cfg_strength),
            slat_steps: self.slat_steps.unwrap_or(base.slat_steps),
            slat_cfg_strength: self.slat_cfg_strength.unwrap_or(base.slat_cfg_strength),
            simplify: self.simplify.unwrap_or(base.simplify),
            texture_size: self.texture_size.unwrap_or(base.texture_size),
        }
    }
}

/// Parameters that passed every range check.
///
/// Field names match the keys the remote service expects in a submit message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedParams {
    pub seed: u32,
    pub sparse_steps: u32,
    pub sparse_cfg_strength: f64,
    pub slat_steps: u32,
    pub slat_cfg_strength: f64,
    pub simplify: f64,
    pub texture_size: TextureSize,
}

/// Input image supplied by the caller.
#[derive(Clone, PartialEq)]
pub struct SourceImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl SourceImage {
    pub fn new(bytes: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            bytes,
            width,
            height,
        }
    }

    /// Build from encoded image bytes, reading dimensions from the header.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ValidationError> {
        if bytes.is_empty() {
            return Err(ValidationError::EmptyImage);
        }
        let (width, height) = image::ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .map_err(|e| ValidationError::UndecodableImage(e.to_string()))?
            .into_dimensions()
            .map_err(|e| ValidationError::UndecodableImage(e.to_string()))?;
        Ok(Self::new(bytes, width, height))
    }

    /// Hex SHA-256 of the encoded bytes.
    pub fn content_hash(&self) -> String {
        format!("{:x}", Sha256::digest(&self.bytes))
    }
}

impl std::fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceImage")
            .field("bytes", &self.bytes.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// One call's worth of input: an image plus raw parameters.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub image: SourceImage,
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(image: SourceImage, params: GenerationParams) -> Self {
        Self { image, params }
    }
}

/// Provenance of the input image, kept on tasks and metadata records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub hash: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
}

/// Output of validation, the only form the orchestrator accepts.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub image: SourceImage,
    pub params: ValidatedParams,
    pub image_hash: String,
}

impl ValidatedRequest {
    /// Dedup key: image hash plus the canonical JSON of the parameters.
    pub fn fingerprint(&self) -> String {
        let params = serde_json::to_string(&self.params).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(self.image_hash.as_bytes());
        hasher.update(b"\n");
        hasher.update(params.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn image_info(&self) -> ImageInfo {
        ImageInfo {
            hash: self.image_hash.clone(),
            width: self.image.width,
            height: self.image.height,
            bytes: self.image.bytes.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_size_serializes_as_pixels() {
        let json = serde_json::to_string(&TextureSize::Px1536).unwrap();
        assert_eq!(json, "1536");
        let parsed: TextureSize = serde_json::from_str("2048").unwrap();
        assert_eq!(parsed, TextureSize::Px2048);
        assert!(serde_json::from_str::<TextureSize>("999").is_err());
    }

    #[test]
    fn test_overrides_apply_only_defined_fields() {
        let base = GenerationParams {
            seed: 77,
            ..Default::default()
        };
        let overrides = ParameterOverrides {
            slat_steps: Some(30),
            ..Default::default()
        };
        let merged = overrides.apply_to(&base);
        assert_eq!(merged.seed, 77);
        assert_eq!(merged.slat_steps, 30);
        assert_eq!(merged.sparse_steps, 12);
    }

    #[test]
    fn test_partial_params_deserialize_with_defaults() {
        let params: GenerationParams = serde_json::from_str(r#"{"seed": 9}"#).unwrap();
        assert_eq!(params.seed, 9);
        assert_eq!(params.sparse_cfg_strength, 7.5);
        assert_eq!(params.texture_size, 1024);
    }

    #[test]
    fn test_source_image_from_png_bytes() {
        let image = crate::testing::fixtures::png_image(6, 4);
        assert_eq!(image.width, 6);
        assert_eq!(image.height, 4);

        let reread = SourceImage::from_bytes(image.bytes.clone()).unwrap();
        assert_eq!(reread, image);
    }

    #[test]
    fn test_source_image_rejects_garbage() {
        assert_eq!(
            SourceImage::from_bytes(Vec::new()),
            Err(ValidationError::EmptyImage)
        );
        assert!(matches!(
            SourceImage::from_bytes(b"definitely not an image".to_vec()),
            Err(ValidationError::UndecodableImage(_))
        ));
    }

    #[test]
    fn test_fingerprint_depends_on_image_and_params() {
        let image = SourceImage::new(vec![1, 2, 3], 1, 1);
        let params = crate::params::validate_params(&GenerationParams::default()).unwrap();
        let request = ValidatedRequest {
            image_hash: image.content_hash(),
            image: image.clone(),
            params: params.clone(),
        };

        let same = request.clone();
        assert_eq!(request.fingerprint(), same.fingerprint());

        let mut other_seed = request.clone();
        other_seed.params.seed = 2;
        assert_ne!(request.fingerprint(), other_seed.fingerprint());

        let other_image = SourceImage::new(vec![9, 9, 9], 1, 1);
        let other = ValidatedRequest {
            image_hash: other_image.content_hash(),
            image: other_image,
            params,
        };
        assert_ne!(request.fingerprint(), other.fingerprint());
    }
}
