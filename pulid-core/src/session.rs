use std::{
    sync::{Mutex, PoisonError},
    time::Instant,
};

use candle_core::{DType, Device};
use tracing::{debug, info};

use crate::{
    decode::{self, LatentDecoder},
    sampling::{self, Cfg, DenoiseOptions, Denoiser, Latent, Shift},
    Conditioner, GenerationOutput, GenerationRequest, IdentityExtractor, ModelLike, Result,
    SamplingOptions,
};

/// Pipeline stages around which model weights may be relocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Conditioning,
    Denoising,
    Decoding,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handle {
    TextEncoders,
    Denoiser,
    Decoder,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    Host,
    Accelerator,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OffloadPolicy {
    /// Every model stays on the accelerator.
    #[default]
    Resident,
    /// Only the model needed by the current stage occupies accelerator memory.
    Offload,
}

impl OffloadPolicy {
    /// Moves to perform, in order, before entering `stage`.
    pub fn plan(self, stage: Stage) -> &'static [(Handle, Residency)] {
        use Residency::{Accelerator, Host};
        match self {
            OffloadPolicy::Resident => &[],
            OffloadPolicy::Offload => match stage {
                // A request that failed mid-flight may have left either model behind.
                Stage::Conditioning => &[
                    (Handle::Denoiser, Host),
                    (Handle::Decoder, Host),
                    (Handle::TextEncoders, Accelerator),
                ],
                Stage::Denoising => &[(Handle::TextEncoders, Host), (Handle::Denoiser, Accelerator)],
                Stage::Decoding => &[(Handle::Denoiser, Host), (Handle::Decoder, Accelerator)],
                Stage::Finished => &[(Handle::Decoder, Host)],
            },
        }
    }

    /// Where `handle` lives right after the models are loaded.
    pub fn initial(self, handle: Handle) -> Residency {
        match (self, handle) {
            (OffloadPolicy::Offload, Handle::Denoiser | Handle::Decoder) => Residency::Host,
            _ => Residency::Accelerator,
        }
    }
}

/// Long-lived model handles plus the per-request orchestration that drives them.
pub struct Session<C, D, V> {
    conditioner: C,
    denoiser: D,
    decoder: V,
    identity: IdentityExtractor,
    device: Device,
    dtype: DType,
    policy: OffloadPolicy,
}

impl<C, D, V> Session<C, D, V>
where
    C: Conditioner,
    D: Denoiser,
    V: LatentDecoder,
{
    pub fn new(
        conditioner: C,
        denoiser: D,
        decoder: V,
        identity: IdentityExtractor,
        device: Device,
        dtype: DType,
        policy: OffloadPolicy,
    ) -> Self {
        Self {
            conditioner,
            denoiser,
            decoder,
            identity,
            device,
            dtype,
            policy,
        }
    }

    fn target(&self, residency: Residency) -> Device {
        match residency {
            Residency::Host => Device::Cpu,
            Residency::Accelerator => self.device.clone(),
        }
    }

    /// Applies the offload plan for `stage`. Each move completes before the next starts.
    pub fn enter(&mut self, stage: Stage) -> Result<()> {
        for &(handle, residency) in self.policy.plan(stage) {
            let device = self.target(residency);
            debug!(?stage, ?handle, ?residency, "placing");
            match handle {
                Handle::TextEncoders => self.conditioner.relocate(&device)?,
                Handle::Denoiser => self.denoiser.relocate(&device)?,
                Handle::Decoder => self.decoder.relocate(&device)?,
            }
        }
        Ok(())
    }

    pub fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationOutput> {
        let params = &request.params;
        let opts = SamplingOptions::resolve(params)?;
        info!(prompt = %opts.prompt, seed = opts.seed, "generating");
        let start = Instant::now();

        let use_true_cfg = sampling::true_cfg_enabled(params.true_cfg);
        let (identity, debug_images) = self.identity.extract(
            request.id_image.as_ref(),
            use_true_cfg,
            &self.device,
            self.dtype,
        )?;

        let noise = sampling::get_noise(1, opts.height, opts.width, opts.seed, &self.device)?
            .to_dtype(self.dtype)?;
        let latent = Latent::pack(&noise)?;
        let timesteps = sampling::get_schedule(opts.num_steps, Some(Shift::dev(latent.seq_len()?)))?;

        self.enter(Stage::Conditioning)?;
        let batch = latent.img.dim(0)?;
        let cond = self
            .conditioner
            .condition(&opts.prompt, params.max_sequence_length, batch)?;
        let negative = if use_true_cfg {
            Some(
                self.conditioner
                    .condition(&params.neg_prompt, params.max_sequence_length, batch)?,
            )
        } else {
            None
        };

        self.enter(Stage::Denoising)?;
        let cfg = match &negative {
            Some(negative) => Cfg::True {
                scale: params.true_cfg,
                start_step: params.timestep_to_start_cfg,
                negative,
            },
            None => Cfg::Fake,
        };
        let denoise_opts = DenoiseOptions {
            guidance: opts.guidance,
            id_weight: params.id_weight,
            start_step: params.start_step,
        };
        let img = sampling::denoise(
            &mut self.denoiser,
            &latent,
            &cond,
            &timesteps,
            &denoise_opts,
            &identity,
            &cfg,
        )?;

        self.enter(Stage::Decoding)?;
        let unpacked = sampling::unpack(&img.to_dtype(DType::F32)?, opts.height, opts.width)?
            .to_dtype(self.dtype)?;
        let decoded = self.decoder.decode(&unpacked)?;
        self.enter(Stage::Finished)?;

        let image = decode::to_image(&decoded)?;
        info!(elapsed = %format!("{:.1}s", start.elapsed().as_secs_f64()), "done");
        Ok(GenerationOutput {
            image,
            seed: opts.seed,
            debug_images,
        })
    }
}

/// Serializes requests onto a single [`Session`].
pub struct Pipeline<C, D, V> {
    session: Mutex<Session<C, D, V>>,
}

impl<C, D, V> Pipeline<C, D, V> {
    pub fn new(session: Session<C, D, V>) -> Self {
        Self {
            session: Mutex::new(session),
        }
    }
}

impl<C, D, V> ModelLike for Pipeline<C, D, V>
where
    C: Conditioner,
    D: Denoiser,
    V: LatentDecoder,
{
    fn run(&self, request: GenerationRequest) -> Result<GenerationOutput> {
        // A failed request leaves the handles loaded; the next conditioning plan re-places them.
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        session.generate(&request)
    }
}
