use std::{future::Future, path::PathBuf};

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, IdEncoder, ModelLike, ModelVariant, OffloadPolicy};

/// Everything a loader needs besides the model variant and the hub client.
#[derive(Default)]
pub struct LoadOptions {
    pub device_map: DeviceMap,
    pub offload: OffloadPolicy,
    /// Backend for reference faces; requests with an ID image fail without one.
    pub id_encoder: Option<Box<dyn IdEncoder>>,
    /// Local identity-adapter weights; fetched from the hub when unset.
    pub pulid_weights: Option<PathBuf>,
}

pub trait Loader {
    type Model: ModelLike;

    fn load(
        variant: ModelVariant,
        api: Api,
        options: LoadOptions,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
