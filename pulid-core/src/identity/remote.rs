use std::{io::Cursor, io::Read, time::Duration};

use candle_core::{DType, Device, Tensor};
use image::DynamicImage;
use tracing::debug;

use super::{IdEncoder, IdEncoding};
use crate::{tensor_to_image, PipelineError, Result};

const COND_KEY: &str = "id_embedding";
const UNCOND_KEY: &str = "uncond_id_embedding";
const DEBUG_PREFIX: &str = "debug.";

/// Identity encoder running as a separate service.
///
/// The face is posted as a PNG body with a `cal_uncond` query flag; the reply is a
/// safetensors blob holding `id_embedding`, optionally `uncond_id_embedding`, and any
/// number of `debug.N` tensors of `u8` pixels laid out `(height, width, 3)`.
pub struct HttpIdEncoder {
    url: String,
    agent: ureq::Agent,
}

impl HttpIdEncoder {
    pub fn new(url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(120))
            .build();
        Self {
            url: url.into(),
            agent,
        }
    }

    fn post(&self, face: &DynamicImage, cal_uncond: bool) -> Result<Vec<u8>> {
        let mut png = Vec::new();
        face.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
        let response = self
            .agent
            .post(&self.url)
            .query("cal_uncond", if cal_uncond { "true" } else { "false" })
            .set("Content-Type", "image/png")
            .send_bytes(&png)
            .map_err(|e| PipelineError::IdEncoder(format!("request to {} failed: {e}", self.url)))?;
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| PipelineError::IdEncoder(format!("failed to read response: {e}")))?;
        Ok(body)
    }
}

impl IdEncoder for HttpIdEncoder {
    fn encode(
        &mut self,
        face: &DynamicImage,
        cal_uncond: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<IdEncoding> {
        let body = self.post(face, cal_uncond)?;
        debug!(bytes = body.len(), "identity encoder replied");
        decode_reply(&body, device, dtype)
    }
}

fn decode_reply(body: &[u8], device: &Device, dtype: DType) -> Result<IdEncoding> {
    let mut tensors = candle_core::safetensors::load_buffer(body, device)
        .map_err(|e| PipelineError::IdEncoder(format!("malformed reply: {e}")))?;
    let cond = tensors
        .remove(COND_KEY)
        .ok_or_else(|| PipelineError::IdEncoder(format!("reply is missing `{COND_KEY}`")))?
        .to_dtype(dtype)?;
    let uncond = tensors
        .remove(UNCOND_KEY)
        .map(|t| t.to_dtype(dtype))
        .transpose()?;

    let mut debug: Vec<(usize, Tensor)> = tensors
        .into_iter()
        .filter_map(|(name, t)| {
            let idx = name.strip_prefix(DEBUG_PREFIX)?.parse().ok()?;
            Some((idx, t))
        })
        .collect();
    debug.sort_by_key(|(idx, _)| *idx);
    let debug_images = debug
        .into_iter()
        .map(|(_, t)| tensor_to_image(&t.to_dtype(DType::U8)?.permute((2, 0, 1))?))
        .collect::<Result<Vec<_>>>()?;

    Ok(IdEncoding {
        cond,
        uncond,
        debug_images,
    })
}
