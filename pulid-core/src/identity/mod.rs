//! Identity embedding extraction.
//!
//! The face encoder network itself is an external collaborator hidden behind [`IdEncoder`];
//! this module owns the request-level policy around it: bounding the reference image size,
//! computing the unconditional embedding only when true CFG needs it, and reporting the
//! absence of a reference image as [`IdEmbeddings::Absent`].

use candle_core::{DType, Device, Tensor};
use image::DynamicImage;
use tracing::debug;

use crate::{resize_long_edge, PipelineError, Result};

pub mod remote;

pub use remote::HttpIdEncoder;

/// Long edge, in pixels, that reference faces are bounded to before encoding.
pub const ID_IMAGE_LONG_EDGE: u32 = 1024;

/// Raw output of an identity encoder.
#[derive(Debug, Clone)]
pub struct IdEncoding {
    pub cond: Tensor,
    pub uncond: Option<Tensor>,
    pub debug_images: Vec<DynamicImage>,
}

pub trait IdEncoder: Send {
    fn encode(
        &mut self,
        face: &DynamicImage,
        cal_uncond: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<IdEncoding>;
}

/// Identity conditioning for one request.
#[derive(Debug, Clone, Default)]
pub enum IdEmbeddings {
    /// No reference image: identity injection is skipped entirely.
    #[default]
    Absent,
    Present {
        cond: Tensor,
        /// Only computed when true CFG is active.
        uncond: Option<Tensor>,
    },
}

impl IdEmbeddings {
    pub fn cond(&self) -> Option<&Tensor> {
        match self {
            IdEmbeddings::Absent => None,
            IdEmbeddings::Present { cond, .. } => Some(cond),
        }
    }

    pub fn uncond(&self) -> Option<&Tensor> {
        match self {
            IdEmbeddings::Absent => None,
            IdEmbeddings::Present { uncond, .. } => uncond.as_ref(),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, IdEmbeddings::Present { .. })
    }
}

pub struct IdentityExtractor {
    encoder: Option<Box<dyn IdEncoder>>,
    max_long_edge: u32,
}

impl IdentityExtractor {
    pub fn new(encoder: Option<Box<dyn IdEncoder>>) -> Self {
        Self {
            encoder,
            max_long_edge: ID_IMAGE_LONG_EDGE,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn extract(
        &mut self,
        image: Option<&DynamicImage>,
        cal_uncond: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<(IdEmbeddings, Vec<DynamicImage>)> {
        let Some(image) = image else {
            return Ok((IdEmbeddings::Absent, Vec::new()));
        };
        let encoder = self
            .encoder
            .as_mut()
            .ok_or(PipelineError::IdEncoderUnavailable)?;

        let face = resize_long_edge(image, self.max_long_edge);
        debug!(
            width = face.width(),
            height = face.height(),
            cal_uncond,
            "encoding reference face"
        );
        let IdEncoding {
            cond,
            uncond,
            debug_images,
        } = encoder.encode(&face, cal_uncond, device, dtype)?;
        let uncond = if cal_uncond { uncond } else { None };
        Ok((IdEmbeddings::Present { cond, uncond }, debug_images))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        seen: Vec<(u32, u32, bool)>,
    }

    impl IdEncoder for Recorder {
        fn encode(
            &mut self,
            face: &DynamicImage,
            cal_uncond: bool,
            device: &Device,
            dtype: DType,
        ) -> Result<IdEncoding> {
            self.seen.push((face.width(), face.height(), cal_uncond));
            let cond = Tensor::ones((1, 32, 8), dtype, device)?;
            // Always hand back an uncond tensor; the extractor must drop it when not asked for.
            let uncond = Some(cond.zeros_like()?);
            Ok(IdEncoding {
                cond,
                uncond,
                debug_images: vec![face.clone()],
            })
        }
    }

    #[test]
    fn no_image_is_absent() -> anyhow::Result<()> {
        let mut extractor = IdentityExtractor::disabled();
        let (ids, debug) = extractor.extract(None, true, &Device::Cpu, DType::F32)?;
        assert!(!ids.is_present());
        assert!(ids.cond().is_none() && ids.uncond().is_none());
        assert!(debug.is_empty());
        Ok(())
    }

    #[test]
    fn image_without_encoder_fails() {
        let mut extractor = IdentityExtractor::disabled();
        let image = DynamicImage::new_rgb8(64, 64);
        let err = extractor
            .extract(Some(&image), false, &Device::Cpu, DType::F32)
            .unwrap_err();
        assert!(matches!(err, PipelineError::IdEncoderUnavailable));
    }

    #[test]
    fn uncond_only_when_requested() -> anyhow::Result<()> {
        let mut extractor = IdentityExtractor::new(Some(Box::new(Recorder { seen: vec![] })));
        let image = DynamicImage::new_rgb8(2048, 1024);

        let (ids, debug) = extractor.extract(Some(&image), false, &Device::Cpu, DType::F32)?;
        assert!(ids.cond().is_some());
        assert!(ids.uncond().is_none());
        assert_eq!(debug.len(), 1);
        assert_eq!((debug[0].width(), debug[0].height()), (1024, 512));

        let (ids, _) = extractor.extract(Some(&image), true, &Device::Cpu, DType::F32)?;
        assert!(ids.uncond().is_some());
        Ok(())
    }
}
