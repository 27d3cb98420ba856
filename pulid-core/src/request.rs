use std::{fmt, str::FromStr};

use image::DynamicImage;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{PipelineError, Result};

/// Pixel granularity of the latent patch grid: 8x autoencoder downsampling times 2x2 packing.
pub const PATCH_GRANULARITY: usize = 16;

/// Upper bound of the T5 encoder's token budget.
pub const MAX_T5_SEQUENCE_LENGTH: usize = 512;

/// Seed selection for a request. `-1` on the wire means "pick one at random".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Seed {
    #[default]
    Random,
    Fixed(u64),
}

impl Seed {
    pub fn resolve(self) -> u64 {
        match self {
            Seed::Random => rand::random(),
            Seed::Fixed(seed) => seed,
        }
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seed::Random => f.write_str("-1"),
            Seed::Fixed(seed) => write!(f, "{seed}"),
        }
    }
}

impl FromStr for Seed {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "-1" {
            return Ok(Seed::Random);
        }
        s.parse::<u64>()
            .map(Seed::Fixed)
            .map_err(|_| PipelineError::InvalidParameter {
                name: "seed",
                reason: format!("expected -1 or a non-negative 64-bit integer, got {s:?}"),
            })
    }
}

impl Serialize for Seed {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Seed::Random => serializer.serialize_i64(-1),
            Seed::Fixed(seed) => serializer.serialize_u64(*seed),
        }
    }
}

impl<'de> Deserialize<'de> for Seed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Unsigned(u64),
            Signed(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Unsigned(seed) => Ok(Seed::Fixed(seed)),
            Raw::Signed(-1) => Ok(Seed::Random),
            Raw::Signed(other) => Err(de::Error::custom(format!(
                "seed must be -1 or non-negative, got {other}"
            ))),
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

/// User-facing generation parameters. Every field has a default.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GenerationParams {
    pub prompt: String,
    pub width: usize,
    pub height: usize,
    pub num_steps: usize,
    /// First denoising step (0-based) that receives the identity embedding.
    pub start_step: usize,
    pub guidance: f64,
    pub seed: Seed,
    pub id_weight: f64,
    pub neg_prompt: String,
    /// True classifier-free guidance scale; 1.0 disables the negative pass.
    pub true_cfg: f64,
    pub timestep_to_start_cfg: usize,
    pub max_sequence_length: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: "portrait, color, cinematic".to_string(),
            width: 896,
            height: 1152,
            num_steps: 20,
            start_step: 0,
            guidance: 4.0,
            seed: Seed::Random,
            id_weight: 1.0,
            neg_prompt: "bad quality, worst quality, text, signature, watermark, extra limbs"
                .to_string(),
            true_cfg: 1.0,
            timestep_to_start_cfg: 1,
            max_sequence_length: 128,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub params: GenerationParams,
    /// Reference face; `None` disables identity conditioning for the request.
    pub id_image: Option<DynamicImage>,
}

impl GenerationRequest {
    pub fn new(params: GenerationParams) -> Self {
        Self {
            params,
            id_image: None,
        }
    }

    pub fn with_id_image(mut self, image: DynamicImage) -> Self {
        self.id_image = Some(image);
        self
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub image: DynamicImage,
    /// The seed actually used, echoed back for reproducibility.
    pub seed: u64,
    pub debug_images: Vec<DynamicImage>,
}

/// Validated sampling options with the seed resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingOptions {
    pub prompt: String,
    pub width: usize,
    pub height: usize,
    pub num_steps: usize,
    pub guidance: f64,
    pub seed: u64,
}

impl SamplingOptions {
    pub fn resolve(params: &GenerationParams) -> Result<Self> {
        let GenerationParams {
            width,
            height,
            num_steps,
            guidance,
            max_sequence_length,
            ..
        } = *params;

        let aligned = |v: usize| v > 0 && v % PATCH_GRANULARITY == 0;
        if !aligned(width) || !aligned(height) {
            return Err(PipelineError::InvalidDimension { width, height });
        }
        if num_steps == 0 {
            return Err(PipelineError::InvalidSteps(num_steps));
        }
        if !(guidance.is_finite() && guidance > 0.0) {
            return Err(PipelineError::InvalidParameter {
                name: "guidance",
                reason: format!("must be a positive number, got {guidance}"),
            });
        }
        for (name, value) in [("id_weight", params.id_weight), ("true_cfg", params.true_cfg)] {
            if !value.is_finite() {
                return Err(PipelineError::InvalidParameter {
                    name,
                    reason: format!("must be finite, got {value}"),
                });
            }
        }
        if max_sequence_length == 0 || max_sequence_length > MAX_T5_SEQUENCE_LENGTH {
            return Err(PipelineError::InvalidParameter {
                name: "max_sequence_length",
                reason: format!(
                    "must be between 1 and {MAX_T5_SEQUENCE_LENGTH}, got {max_sequence_length}"
                ),
            });
        }

        Ok(Self {
            prompt: params.prompt.clone(),
            width,
            height,
            num_steps,
            guidance,
            seed: params.seed.resolve(),
        })
    }
}
