use std::collections::BTreeMap;

use super::types::{
    GenerationParams, GenerationRequest, ParameterOverrides, TextureSize, ValidatedParams,
    ValidatedRequest,
};
use super::ValidationError;
use crate::config::ProcessingConfig;

const SEED_RANGE: (u64, u64) = (1, 2_147_483_647);
const STEPS_RANGE: (u32, u32) = (1, 50);
const CFG_RANGE: (f64, f64) = (0.0, 10.0);
const SIMPLIFY_RANGE: (f64, f64) = (0.90, 0.98);

fn check_int<T>(field: &'static str, value: T, (min, max): (T, T)) -> Result<T, ValidationError>
where
    T: PartialOrd + Copy + Into<f64>,
{
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            value: value.into(),
            min: min.into(),
            max: max.into(),
        });
    }
    Ok(value)
}

fn check_float(
    field: &'static str,
    value: f64,
    (min, max): (f64, f64),
) -> Result<f64, ValidationError> {
    // NaN fails `contains`, so it is rejected along with real out-of-range values.
    if !(min..=max).contains(&value) {
        return Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

/// Range-check a parameter set. Bounds are inclusive.
pub fn validate_params(params: &GenerationParams) -> Result<ValidatedParams, ValidationError> {
    // u64 has no lossless f64 conversion, so the seed is checked by hand.
    if !(SEED_RANGE.0..=SEED_RANGE.1).contains(&params.seed) {
        return Err(ValidationError::OutOfRange {
            field: "seed",
            value: params.seed as f64,
            min: SEED_RANGE.0 as f64,
            max: SEED_RANGE.1 as f64,
        });
    }

    Ok(ValidatedParams {
        seed: params.seed as u32,
        sparse_steps: check_int("sparse_steps", params.sparse_steps, STEPS_RANGE)?,
        sparse_cfg_strength: check_float(
            "sparse_cfg_strength",
            params.sparse_cfg_strength,
            CFG_RANGE,
        )?,
        slat_steps: check_int("slat_steps", params.slat_steps, STEPS_RANGE)?,
        slat_cfg_strength: check_float("slat_cfg_strength", params.slat_cfg_strength, CFG_RANGE)?,
        simplify: check_float("simplify", params.simplify, SIMPLIFY_RANGE)?,
        texture_size: TextureSize::try_from(params.texture_size)?,
    })
}

/// Validate a full request: image sanity plus parameter ranges.
pub fn validate(request: GenerationRequest) -> Result<ValidatedRequest, ValidationError> {
    let GenerationRequest { image, params } = request;

    if image.bytes.is_empty() {
        return Err(ValidationError::EmptyImage);
    }
    if image.width == 0 || image.height == 0 {
        return Err(ValidationError::InvalidImageDimensions {
            width: image.width,
            height: image.height,
        });
    }

    let params = validate_params(&params)?;
    let image_hash = image.content_hash();

    Ok(ValidatedRequest {
        image,
        params,
        image_hash,
    })
}

/// Overlay a named preset on `params`. The result is not yet validated.
pub fn apply_preset(
    params: &GenerationParams,
    preset: &str,
    presets: &BTreeMap<String, ParameterOverrides>,
) -> Result<GenerationParams, ValidationError> {
    presets
        .get(preset)
        .map(|overrides| overrides.apply_to(params))
        .ok_or_else(|| ValidationError::UnknownPreset(preset.to_string()))
}

/// Apply an optional preset from `processing`, then validate.
pub fn validate_with_preset(
    mut request: GenerationRequest,
    preset: Option<&str>,
    processing: &ProcessingConfig,
) -> Result<ValidatedRequest, ValidationError> {
    if let Some(name) = preset {
        request.params = apply_preset(&request.params, name, &processing.parameter_presets)?;
    }
    validate(request)
}
