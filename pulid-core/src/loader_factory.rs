use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{flux, FluxLoader, LoadOptions, Loader, ModelLike};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Flux(flux::FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if !name_upper.contains("FLUX") {
            return None;
        }
        if name_upper.contains("SCHNELL") {
            Some(ModelVariant::Flux(flux::FluxVariant::Schnell))
        } else if name_upper.contains("DEV") {
            Some(ModelVariant::Flux(flux::FluxVariant::Dev))
        } else {
            None
        }
    }
}

/// Load a model based on its name, automatically detecting the appropriate loader
pub async fn load_model(
    model_name: &str,
    api: Api,
    options: LoadOptions,
) -> Result<Arc<dyn ModelLike>> {
    let variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model: {}", model_name))?;

    info!(model = model_name, ?variant, "loading model");

    match variant {
        ModelVariant::Flux(flux::FluxVariant::Dev) => {
            let model = FluxLoader::load(variant, api, options).await?;
            Ok(Arc::new(model))
        }
        ModelVariant::Flux(flux::FluxVariant::Schnell) => bail!(
            "Model variant {:?} is recognized but the identity adapter only supports FLUX.1-dev",
            variant
        ),
    }
}
