use candle_core::Tensor;

use crate::{Placeable, PipelineError, Result};

/// Text conditioning consumed by every denoising step.
#[derive(Debug, Clone)]
pub struct Conditioning {
    /// Sequence embedding, `(b, seq_len, context_dim)`.
    pub txt: Tensor,
    /// Position ids for the text tokens, `(b, seq_len, 3)`, all zero.
    pub txt_ids: Tensor,
    /// Pooled embedding, `(b, vec_dim)`.
    pub vec: Tensor,
}

impl Conditioning {
    /// Assembles a bundle from raw encoder outputs, repeating them over the batch.
    pub fn new(t5_emb: &Tensor, clip_emb: &Tensor, batch: usize) -> Result<Self> {
        let txt = t5_emb.repeat((batch, 1, 1))?;
        let txt_ids = Tensor::zeros((batch, txt.dim(1)?, 3), txt.dtype(), txt.device())?;
        let vec = clip_emb.repeat((batch, 1))?;
        Ok(Self { txt, txt_ids, vec })
    }
}

pub trait Conditioner: Placeable + Send {
    fn condition(
        &mut self,
        prompt: &str,
        max_sequence_length: usize,
        batch: usize,
    ) -> Result<Conditioning>;
}

/// Pads `ids` to exactly `max_len`, failing instead of truncating when the prompt is too long.
pub fn fit_tokens(mut ids: Vec<u32>, max_len: usize, pad_id: u32) -> Result<Vec<u32>> {
    if ids.len() > max_len {
        return Err(PipelineError::PromptTooLong {
            tokens: ids.len(),
            max: max_len,
        });
    }
    ids.resize(max_len, pad_id);
    Ok(ids)
}

/// Truncates to `max_len` keeping `eos_id` in the final slot.
pub fn truncate_tokens(mut ids: Vec<u32>, max_len: usize, eos_id: u32) -> Vec<u32> {
    if ids.len() > max_len {
        ids.truncate(max_len);
        if let Some(last) = ids.last_mut() {
            *last = eos_id;
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn fit_pads_to_budget() {
        let ids = fit_tokens(vec![5, 6, 1], 6, 0).unwrap();
        assert_eq!(ids, vec![5, 6, 1, 0, 0, 0]);
        let exact = fit_tokens(vec![5, 6, 1], 3, 0).unwrap();
        assert_eq!(exact, vec![5, 6, 1]);
    }

    #[test]
    fn fit_rejects_long_prompts() {
        let err = fit_tokens(vec![7; 129], 128, 0).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PromptTooLong {
                tokens: 129,
                max: 128
            }
        ));
    }

    #[test]
    fn truncate_keeps_eos() {
        let ids = truncate_tokens((0..100).collect(), 77, 49407);
        assert_eq!(ids.len(), 77);
        assert_eq!(ids[76], 49407);
        assert_eq!(ids[75], 75);
        assert_eq!(truncate_tokens(vec![1, 2], 77, 49407), vec![1, 2]);
    }

    #[test]
    fn bundle_shapes() -> anyhow::Result<()> {
        let t5 = Tensor::ones((1, 128, 8), DType::F32, &Device::Cpu)?;
        let clip = Tensor::ones((1, 4), DType::F32, &Device::Cpu)?;
        let cond = Conditioning::new(&t5, &clip, 2)?;
        assert_eq!(cond.txt.dims(), &[2, 128, 8]);
        assert_eq!(cond.txt_ids.dims(), &[2, 128, 3]);
        assert_eq!(cond.vec.dims(), &[2, 4]);
        Ok(())
    }
}
