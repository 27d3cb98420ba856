use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use tracing::warn;

use crate::{DeviceMap, Result};

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a `u8` tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        return Err(candle_core::Error::msg(format!(
            "tensor_to_image expects an image with 3 channels, got {channels}"
        ))
        .into());
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Downscales `image` so that its longer side is at most `max_long_edge`. Never upscales.
pub fn resize_long_edge(image: &DynamicImage, max_long_edge: u32) -> DynamicImage {
    let (w, h) = image.dimensions();
    let long = w.max(h);
    if long <= max_long_edge {
        return image.clone();
    }
    let k = max_long_edge as f64 / long as f64;
    let w = ((w as f64 * k) as u32).max(1);
    let h = ((h as f64 * k) as u32).max(1);
    image.resize_exact(w, h, FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn long_edge_bounded() {
        let img = DynamicImage::new_rgb8(3000, 1500);
        let out = resize_long_edge(&img, 1024);
        assert_eq!(out.dimensions(), (1024, 512));

        let small = DynamicImage::new_rgb8(640, 480);
        assert_eq!(resize_long_edge(&small, 1024).dimensions(), (640, 480));

        let tall = DynamicImage::new_rgb8(500, 2000);
        assert_eq!(resize_long_edge(&tall, 1024).dimensions(), (256, 1024));
    }

    #[test]
    fn chw_tensor_to_rgb() -> anyhow::Result<()> {
        let data: Vec<u8> = (0..3 * 2 * 4).map(|v| v as u8).collect();
        let t = Tensor::from_vec(data, (3, 2, 4), &Device::Cpu)?;
        let img = tensor_to_image(&t)?.to_rgb8();
        assert_eq!(img.dimensions(), (4, 2));
        // Pixel (x=1, y=0) takes channel planes at offset 1.
        assert_eq!(img.get_pixel(1, 0).0, [1, 9, 17]);

        let gray = Tensor::zeros((1, 2, 2), DType::U8, &Device::Cpu)?;
        assert!(tensor_to_image(&gray).is_err());
        Ok(())
    }
}
