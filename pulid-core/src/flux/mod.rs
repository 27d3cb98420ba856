use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::autoencoder::{self, AutoEncoder},
    t5::{self, T5EncoderModel},
};
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;
use tracing::info;

pub mod model;

use crate::{
    conditioning::{fit_tokens, truncate_tokens},
    decode::LatentDecoder,
    sampling::{Denoiser, DenoiserInput},
    select_best_device,
    session::{Handle, Residency},
    Conditioner, Conditioning, IdentityExtractor, LoadOptions, Loader, ModelVariant, Pipeline,
    PipelineError, Placeable, Resident, Session,
};
use model::PulidFlux;

const CLIP_MAX_TOKENS: usize = 77;
const CLIP_EOS_TOKEN: u32 = 49407;
const T5_PAD_TOKEN: u32 = 0;

const PULID_REPO: &str = "guozinan/PuLID";
const PULID_FILE: &str = "pulid_flux_v0.9.0.safetensors";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Dev,
    Schnell,
}

/// T5 sequence encoder and CLIP pooled encoder, placed together.
pub struct FluxConditioner {
    t5: Resident<T5EncoderModel>,
    t5_tokenizer: Tokenizer,
    clip: Resident<ClipTextTransformer>,
    clip_tokenizer: Tokenizer,
}

fn encode(tokenizer: &Tokenizer, prompt: &str) -> crate::Result<Vec<u32>> {
    let encoding = tokenizer
        .encode(prompt, true)
        .map_err(|e| PipelineError::Tokenizer(e.to_string()))?;
    Ok(encoding.get_ids().to_vec())
}

impl Placeable for FluxConditioner {
    fn relocate(&mut self, device: &Device) -> crate::Result<()> {
        self.t5.relocate(device)?;
        self.clip.relocate(device)
    }
}

impl Conditioner for FluxConditioner {
    fn condition(
        &mut self,
        prompt: &str,
        max_sequence_length: usize,
        batch: usize,
    ) -> crate::Result<Conditioning> {
        let t5_tokens = fit_tokens(
            encode(&self.t5_tokenizer, prompt)?,
            max_sequence_length,
            T5_PAD_TOKEN,
        )?;
        let t5_ids = Tensor::new(t5_tokens.as_slice(), self.t5.device())?.unsqueeze(0)?;
        let t5_emb = self.t5.model_mut().forward(&t5_ids)?;

        let clip_tokens = truncate_tokens(
            encode(&self.clip_tokenizer, prompt)?,
            CLIP_MAX_TOKENS,
            CLIP_EOS_TOKEN,
        );
        let clip_ids = Tensor::new(clip_tokens.as_slice(), self.clip.device())?.unsqueeze(0)?;
        let clip_emb = self.clip.model().forward(&clip_ids)?;

        Conditioning::new(&t5_emb, &clip_emb, batch)
    }
}

pub struct FluxDenoiser {
    model: Resident<PulidFlux>,
}

impl Placeable for FluxDenoiser {
    fn relocate(&mut self, device: &Device) -> crate::Result<()> {
        self.model.relocate(device)
    }
}

impl Denoiser for FluxDenoiser {
    fn predict(&mut self, input: &DenoiserInput<'_>) -> crate::Result<Tensor> {
        let id = input.id.map(|id| (id.embedding, id.weight));
        Ok(self.model.model().forward(
            input.img,
            input.img_ids,
            &input.cond.txt,
            &input.cond.txt_ids,
            input.timesteps,
            &input.cond.vec,
            Some(input.guidance),
            id,
        )?)
    }
}

pub struct FluxDecoder {
    model: Resident<AutoEncoder>,
}

impl Placeable for FluxDecoder {
    fn relocate(&mut self, device: &Device) -> crate::Result<()> {
        self.model.relocate(device)
    }
}

impl LatentDecoder for FluxDecoder {
    fn decode(&mut self, latent: &Tensor) -> crate::Result<Tensor> {
        Ok(self.model.model().decode(latent)?)
    }
}

pub type FluxModel = Pipeline<FluxConditioner, FluxDenoiser, FluxDecoder>;

fn clip_config() -> ClipTextConfig {
    ClipTextConfig {
        vocab_size: 49408,
        embed_dim: 768,
        activation: Activation::QuickGelu,
        intermediate_size: 3072,
        max_position_embeddings: 77,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        projection_dim: 768,
    }
}

fn load_tokenizer(file: PathBuf) -> Result<Tokenizer> {
    Tokenizer::from_file(file).map_err(anyhow::Error::msg)
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxModel;

    async fn load(variant: ModelVariant, api: Api, options: LoadOptions) -> Result<Self::Model> {
        let ModelVariant::Flux(FluxVariant::Dev) = variant else {
            anyhow::bail!("identity adapter weights exist only for FLUX.1-dev, got {variant:?}");
        };

        // Configure device.
        let device = select_best_device(options.device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();
        let policy = options.offload;
        let place = |handle: Handle| match policy.initial(handle) {
            Residency::Host => Device::Cpu,
            Residency::Accelerator => device.clone(),
        };
        info!(device = ?device.location(), ?dtype, ?policy, "loading FLUX.1-dev");

        // --- Load T5 Model and Tokenizer ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to load T5 model file")?;
        let config_filename = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5 = Resident::load(
            "t5",
            vec![t5_model_file],
            dtype,
            &place(Handle::TextEncoders),
            move |vb: VarBuilder| T5EncoderModel::load(vb, &t5_config),
        )
        .context("failed to load T5 model")?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer =
            load_tokenizer(t5_tokenizer_filename).context("failed to load T5 tokenizer")?;

        // --- Load CLIP Model and Tokenizer ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_cfg = clip_config();
        let clip = Resident::load(
            "clip",
            vec![clip_model_file],
            dtype,
            &place(Handle::TextEncoders),
            move |vb: VarBuilder| ClipTextTransformer::new(vb.pp("text_model"), &clip_cfg),
        )
        .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer =
            load_tokenizer(clip_tokenizer_filename).context("failed to load CLIP tokenizer")?;

        // --- Load Autoencoder ---
        let bf_repo = api.repo(hf_hub::Repo::model(
            "black-forest-labs/FLUX.1-dev".to_string(),
        ));
        let autoencoder_model_file = bf_repo
            .get("ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let ae_cfg = autoencoder::Config::dev();
        let autoencoder = Resident::load(
            "autoencoder",
            vec![autoencoder_model_file],
            dtype,
            &place(Handle::Decoder),
            move |vb: VarBuilder| AutoEncoder::new(&ae_cfg, vb),
        )
        .context("failed to load autoencoder")?;

        // --- Load Flux Model with the identity cross-attention weights ---
        let flux_model_file = bf_repo
            .get("flux1-dev.safetensors")
            .await
            .context("failed to get flux model file")?;
        let pulid_file = match options.pulid_weights {
            Some(path) => path,
            None => api
                .model(PULID_REPO.to_string())
                .get(PULID_FILE)
                .await
                .context("failed to get PuLID weights")?,
        };
        let flux_cfg = model::Config::dev();
        let flux = Resident::load(
            "flux",
            vec![flux_model_file, pulid_file],
            dtype,
            &place(Handle::Denoiser),
            move |vb: VarBuilder| PulidFlux::new(&flux_cfg, vb),
        )
        .context("failed to load flux model")?;

        if options.id_encoder.is_none() {
            info!("no identity encoder configured, requests with an ID image will be rejected");
        }

        let session = Session::new(
            FluxConditioner {
                t5,
                t5_tokenizer,
                clip,
                clip_tokenizer,
            },
            FluxDenoiser { model: flux },
            FluxDecoder { model: autoencoder },
            IdentityExtractor::new(options.id_encoder),
            device,
            dtype,
            policy,
        );
        Ok(Pipeline::new(session))
    }
}
