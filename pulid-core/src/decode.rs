use candle_core::{DType, IndexOp, Tensor};
use image::DynamicImage;

use crate::{tensor_to_image, Placeable, Result};

pub trait LatentDecoder: Placeable + Send {
    /// Maps an unpacked `(b, 16, h/8, w/8)` latent to pixel space, roughly in [-1, 1].
    fn decode(&mut self, latent: &Tensor) -> Result<Tensor>;
}

/// Clamps the first decoded sample to [-1, 1] and rescales it to an 8-bit RGB image.
pub fn to_image(decoded: &Tensor) -> Result<DynamicImage> {
    let img = ((decoded.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
        .to_dtype(DType::U8)?;
    tensor_to_image(&img.i(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn clamps_and_rescales() -> anyhow::Result<()> {
        let vals = vec![-3.0f32, -1.0, 0.0, 1.0, 2.0, 0.5];
        let t = Tensor::from_vec(vals, (1, 3, 1, 2), &Device::Cpu)?;
        let img = to_image(&t)?.to_rgb8();
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(0, 0).0, [0, 127, 255]);
        assert_eq!(img.get_pixel(1, 0).0, [0, 255, 191]);
        Ok(())
    }
}
