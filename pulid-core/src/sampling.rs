use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::debug;

use crate::{Conditioning, IdEmbeddings, Placeable, PipelineError, Result};

/// Latent channels produced by the Flux autoencoder.
pub const LATENT_CHANNELS: usize = 16;

/// Lower bound for the final timestep so that the schedule stays inside (0, 1].
pub const TERMINAL_TIMESTEP: f64 = 1e-9;

/// Scales within this distance of 1.0 run a single, guidance-distilled pass.
pub const TRUE_CFG_TOLERANCE: f64 = 1e-2;

pub fn true_cfg_enabled(scale: f64) -> bool {
    (scale - 1.0).abs() > TRUE_CFG_TOLERANCE
}

/// Seeded gaussian noise, drawn on the host so that it is identical on every device.
pub fn get_noise(
    num_samples: usize,
    height: usize,
    width: usize,
    seed: u64,
    device: &Device,
) -> Result<Tensor> {
    if height == 0 || width == 0 {
        return Err(PipelineError::InvalidDimension { width, height });
    }
    let height = height.div_ceil(16) * 2;
    let width = width.div_ceil(16) * 2;
    let len = num_samples * LATENT_CHANNELS * height * width;
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..len).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
    let noise = Tensor::from_vec(values, (num_samples, LATENT_CHANNELS, height, width), &Device::Cpu)?;
    Ok(noise.to_device(device)?)
}

/// Resolution-dependent timestep shift.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shift {
    pub image_seq_len: usize,
    pub base_shift: f64,
    pub max_shift: f64,
}

impl Shift {
    /// The shift used by Flux-dev.
    pub fn dev(image_seq_len: usize) -> Self {
        Self {
            image_seq_len,
            base_shift: 0.5,
            max_shift: 1.15,
        }
    }

    fn mu(&self) -> f64 {
        let (x1, x2) = (256., 4096.);
        let m = (self.max_shift - self.base_shift) / (x2 - x1);
        let b = self.base_shift - m * x1;
        m * self.image_seq_len as f64 + b
    }
}

fn time_shift(mu: f64, sigma: f64, t: f64) -> f64 {
    let e = mu.exp();
    e / (e + (1. / t - 1.).powf(sigma))
}

/// Returns `num_steps + 1` strictly decreasing timesteps, from 1 down to a small positive floor.
pub fn get_schedule(num_steps: usize, shift: Option<Shift>) -> Result<Vec<f64>> {
    if num_steps == 0 {
        return Err(PipelineError::InvalidSteps(num_steps));
    }
    let timesteps = (0..=num_steps)
        .rev()
        .map(|v| v as f64 / num_steps as f64);
    let mut timesteps: Vec<f64> = match shift {
        None => timesteps.collect(),
        Some(shift) => {
            let mu = shift.mu();
            timesteps.map(|t| time_shift(mu, 1., t)).collect()
        }
    };
    if let Some(last) = timesteps.last_mut() {
        *last = last.max(TERMINAL_TIMESTEP);
    }
    Ok(timesteps)
}

/// Packed latent: 2x2 patches flattened into a token sequence, with their position ids.
#[derive(Debug, Clone)]
pub struct Latent {
    /// `(b, h/2 * w/2, c * 4)`.
    pub img: Tensor,
    /// `(b, h/2 * w/2, 3)`.
    pub img_ids: Tensor,
}

impl Latent {
    pub fn pack(noise: &Tensor) -> Result<Self> {
        let dtype = noise.dtype();
        let (bs, c, h, w) = noise.dims4()?;
        let dev = noise.device();
        let img = noise.reshape((bs, c, h / 2, 2, w / 2, 2))?; // (b, c, h, ph, w, pw)
        let img = img.permute((0, 2, 4, 1, 3, 5))?; // (b, h, w, c, ph, pw)
        let img = img.reshape((bs, h / 2 * w / 2, c * 4))?;
        let img_ids = Tensor::stack(
            &[
                Tensor::full(0u32, (h / 2, w / 2), dev)?,
                Tensor::arange(0u32, h as u32 / 2, dev)?
                    .reshape(((), 1))?
                    .broadcast_as((h / 2, w / 2))?,
                Tensor::arange(0u32, w as u32 / 2, dev)?
                    .reshape((1, ()))?
                    .broadcast_as((h / 2, w / 2))?,
            ],
            2,
        )?
        .to_dtype(dtype)?;
        let img_ids = img_ids.reshape((1, h / 2 * w / 2, 3))?;
        let img_ids = img_ids.repeat((bs, 1, 1))?;
        Ok(Self { img, img_ids })
    }

    /// Number of image tokens, which drives the schedule shift.
    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.img.dim(1)?)
    }
}

pub fn unpack(xs: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (b, _h_w, c_ph_pw) = xs.dims3()?;
    let height = height.div_ceil(16);
    let width = width.div_ceil(16);
    Ok(xs
        .reshape((b, height, width, c_ph_pw / 4, 2, 2))? // (b, h, w, c, ph, pw)
        .permute((0, 3, 1, 4, 2, 5))? // (b, c, h, ph, w, pw)
        .reshape((b, c_ph_pw / 4, height * 2, width * 2))?)
}

#[derive(Debug, Clone, Copy)]
pub struct IdInjection<'a> {
    pub embedding: &'a Tensor,
    pub weight: f64,
}

/// Everything a single denoiser evaluation reads.
#[derive(Debug, Clone, Copy)]
pub struct DenoiserInput<'a> {
    pub img: &'a Tensor,
    pub img_ids: &'a Tensor,
    pub cond: &'a Conditioning,
    pub timesteps: &'a Tensor,
    pub guidance: &'a Tensor,
    /// `None` means the identity branch is not run at all.
    pub id: Option<IdInjection<'a>>,
}

pub trait Denoiser: Placeable + Send {
    /// Predicts the velocity for the current latent.
    fn predict(&mut self, input: &DenoiserInput<'_>) -> Result<Tensor>;
}

/// Classifier-free guidance mode.
#[derive(Debug, Clone, Copy)]
pub enum Cfg<'a> {
    /// Guidance-distilled single pass; the guidance scale is fed to the model.
    Fake,
    /// Explicit negative pass combined as `neg + scale * (pos - neg)`.
    True {
        scale: f64,
        start_step: usize,
        negative: &'a Conditioning,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenoiseOptions {
    pub guidance: f64,
    pub id_weight: f64,
    /// First step index that receives the identity embedding.
    pub start_step: usize,
}

fn inject(embedding: Option<&Tensor>, weight: f64, active: bool) -> Option<IdInjection<'_>> {
    match embedding {
        Some(embedding) if active => Some(IdInjection { embedding, weight }),
        _ => None,
    }
}

/// Euler integration of the flow over `timesteps`.
pub fn denoise<D: Denoiser + ?Sized>(
    model: &mut D,
    latent: &Latent,
    cond: &Conditioning,
    timesteps: &[f64],
    opts: &DenoiseOptions,
    identity: &IdEmbeddings,
    cfg: &Cfg<'_>,
) -> Result<Tensor> {
    let b_sz = latent.img.dim(0)?;
    let dev = latent.img.device();
    let dtype = latent.img.dtype();
    let guidance = Tensor::full(opts.guidance as f32, b_sz, dev)?.to_dtype(dtype)?;
    let mut img = latent.img.clone();
    for (step, window) in timesteps.windows(2).enumerate() {
        let (t_curr, t_prev) = match window {
            [a, b] => (*a, *b),
            _ => continue,
        };
        let t_vec = Tensor::full(t_curr as f32, b_sz, dev)?.to_dtype(dtype)?;
        let with_id = step >= opts.start_step;
        debug!(step, t_curr, with_id = with_id && identity.is_present(), "denoise step");

        let pred = model.predict(&DenoiserInput {
            img: &img,
            img_ids: &latent.img_ids,
            cond,
            timesteps: &t_vec,
            guidance: &guidance,
            id: inject(identity.cond(), opts.id_weight, with_id),
        })?;
        let pred = match cfg {
            Cfg::True {
                scale,
                start_step,
                negative,
            } if step >= *start_step => {
                let neg_pred = model.predict(&DenoiserInput {
                    img: &img,
                    img_ids: &latent.img_ids,
                    cond: negative,
                    timesteps: &t_vec,
                    guidance: &guidance,
                    id: inject(identity.uncond(), opts.id_weight, with_id),
                })?;
                (&neg_pred + ((pred - &neg_pred)? * *scale)?)?
            }
            _ => pred,
        };
        img = (img + (pred * (t_prev - t_curr))?)?;
    }
    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn noise_is_reproducible() -> anyhow::Result<()> {
        let a = get_noise(1, 1152, 896, 2680261499100305976, &Device::Cpu)?;
        let b = get_noise(1, 1152, 896, 2680261499100305976, &Device::Cpu)?;
        assert_eq!(a.dims(), &[1, 16, 144, 112]);
        let a = a.flatten_all()?.to_vec1::<f32>()?;
        let b = b.flatten_all()?.to_vec1::<f32>()?;
        assert!(a.iter().zip(&b).all(|(x, y)| x.to_bits() == y.to_bits()));

        let c = get_noise(1, 1152, 896, 1, &Device::Cpu)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn noise_rounds_up_to_patches() -> anyhow::Result<()> {
        let n = get_noise(2, 100, 40, 0, &Device::Cpu)?;
        assert_eq!(n.dims(), &[2, 16, 14, 6]);
        assert!(get_noise(1, 0, 64, 0, &Device::Cpu).is_err());
        Ok(())
    }

    fn assert_valid_schedule(ts: &[f64], num_steps: usize) {
        assert_eq!(ts.len(), num_steps + 1);
        assert!(ts[0] <= 1.0);
        assert!(*ts.last().unwrap() > 0.0);
        assert!(ts.windows(2).all(|w| w[0] > w[1]), "{ts:?}");
    }

    #[test]
    fn schedule_shape() -> anyhow::Result<()> {
        for steps in [1, 4, 20, 50] {
            assert_valid_schedule(&get_schedule(steps, None)?, steps);
            assert_valid_schedule(&get_schedule(steps, Some(Shift::dev(4032)))?, steps);
        }
        assert!(matches!(
            get_schedule(0, None),
            Err(PipelineError::InvalidSteps(0))
        ));
        Ok(())
    }

    #[test]
    fn shift_biases_toward_high_noise() -> anyhow::Result<()> {
        let plain = get_schedule(20, None)?;
        let small = get_schedule(20, Some(Shift::dev(256)))?;
        let large = get_schedule(20, Some(Shift::dev(4096)))?;
        assert_eq!(small[0], 1.0);
        for i in 1..20 {
            assert!(small[i] > plain[i]);
            assert!(large[i] > small[i]);
        }
        Ok(())
    }

    #[test]
    fn pack_unpack_restores_layout() -> anyhow::Result<()> {
        let noise = get_noise(1, 64, 96, 3, &Device::Cpu)?;
        let latent = Latent::pack(&noise)?;
        assert_eq!(latent.img.dims(), &[1, 4 * 6, 64]);
        assert_eq!(latent.img_ids.dims(), &[1, 24, 3]);
        let ids = latent.img_ids.to_vec3::<f32>()?;
        assert_eq!(ids[0][7], vec![0., 1., 1.]);

        let back = unpack(&latent.img, 64, 96)?;
        let diff = (back - &noise)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn cfg_tolerance() {
        assert!(!true_cfg_enabled(1.0));
        assert!(!true_cfg_enabled(1.005));
        assert!(true_cfg_enabled(1.5));
        assert!(true_cfg_enabled(0.5));
    }

    /// Predicts a constant velocity, recording which conditioning each call saw.
    struct Constant {
        calls: Vec<(bool, Option<f64>)>,
        negative_marker: f32,
    }

    impl Placeable for Constant {
        fn relocate(&mut self, _device: &Device) -> crate::Result<()> {
            Ok(())
        }
    }

    impl Denoiser for Constant {
        fn predict(&mut self, input: &DenoiserInput<'_>) -> crate::Result<Tensor> {
            let marker = input.cond.vec.flatten_all()?.to_vec1::<f32>()?[0];
            let negative = marker == self.negative_marker;
            self.calls.push((negative, input.id.map(|id| id.weight)));
            let v = if negative { 1.0 } else { 3.0 };
            Ok(input.img.ones_like()?.affine(v, 0.)?)
        }
    }

    fn cond(marker: f32) -> anyhow::Result<Conditioning> {
        let t5 = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu)?;
        let clip = Tensor::full(marker, (1, 2), &Device::Cpu)?;
        Ok(Conditioning::new(&t5, &clip, 1)?)
    }

    #[test]
    fn true_cfg_combines_and_gates() -> anyhow::Result<()> {
        let latent = Latent::pack(&Tensor::zeros((1, 16, 2, 2), DType::F32, &Device::Cpu)?)?;
        let pos = cond(0.0)?;
        let neg = cond(-1.0)?;
        let mut model = Constant {
            calls: vec![],
            negative_marker: -1.0,
        };
        let timesteps = [1.0, 0.75, 0.5, 0.25, 1e-9];
        let opts = DenoiseOptions {
            guidance: 4.0,
            id_weight: 0.8,
            start_step: 2,
        };
        let identity = IdEmbeddings::Present {
            cond: Tensor::ones((1, 2, 2), DType::F32, &Device::Cpu)?,
            uncond: Some(Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu)?),
        };
        let cfg = Cfg::True {
            scale: 2.0,
            start_step: 1,
            negative: &neg,
        };
        let out = denoise(&mut model, &latent, &pos, &timesteps, &opts, &identity, &cfg)?;

        // Step 0: positive only. Steps 1-3: positive + negative.
        let negatives = model.calls.iter().filter(|(n, _)| *n).count();
        assert_eq!(model.calls.len(), 7);
        assert_eq!(negatives, 3);
        // Identity starts at step 2 on both branches.
        assert_eq!(model.calls[0], (false, None));
        assert_eq!(model.calls[1], (false, None));
        assert_eq!(model.calls[2], (true, None));
        assert_eq!(model.calls[3], (false, Some(0.8)));
        assert_eq!(model.calls[4], (true, Some(0.8)));

        // Velocity is 3 at step 0 and 1 + 2 * (3 - 1) = 5 afterwards.
        let expected = -(3.0 * 0.25 + 5.0 * (0.75 - 1e-9));
        let got = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(got.iter().all(|v| (*v as f64 - expected).abs() < 1e-5), "{got:?}");
        Ok(())
    }

    #[test]
    fn fake_cfg_never_runs_negative() -> anyhow::Result<()> {
        let latent = Latent::pack(&Tensor::zeros((1, 16, 2, 2), DType::F32, &Device::Cpu)?)?;
        let pos = cond(0.0)?;
        let mut model = Constant {
            calls: vec![],
            negative_marker: -1.0,
        };
        let timesteps = get_schedule(4, None)?;
        let opts = DenoiseOptions {
            guidance: 4.0,
            id_weight: 1.0,
            start_step: 0,
        };
        denoise(
            &mut model,
            &latent,
            &pos,
            &timesteps,
            &opts,
            &IdEmbeddings::Absent,
            &Cfg::Fake,
        )?;
        assert_eq!(model.calls, vec![(false, None); 4]);
        Ok(())
    }
}
