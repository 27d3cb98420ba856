use std::path::PathBuf;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use tracing::debug;

use crate::Result;

/// A component whose weights can be moved between host and accelerator memory.
pub trait Placeable {
    /// Moves the component's weights to `device`. Must be a no-op when already there.
    fn relocate(&mut self, device: &Device) -> Result<()>;
}

type Builder<M> = Box<dyn Fn(VarBuilder) -> candle_core::Result<M> + Send + Sync>;

/// A model handle that can be rebuilt on another device from its memory-mapped weights.
pub struct Resident<M> {
    name: &'static str,
    files: Vec<PathBuf>,
    dtype: DType,
    device: Device,
    build: Builder<M>,
    model: M,
}

impl<M> Resident<M> {
    pub fn load<F>(
        name: &'static str,
        files: Vec<PathBuf>,
        dtype: DType,
        device: &Device,
        build: F,
    ) -> Result<Self>
    where
        F: Fn(VarBuilder) -> candle_core::Result<M> + Send + Sync + 'static,
    {
        let model = Self::build_on(&files, dtype, device, &build)?;
        Ok(Self {
            name,
            files,
            dtype,
            device: device.clone(),
            build: Box::new(build),
            model,
        })
    }

    fn build_on(
        files: &[PathBuf],
        dtype: DType,
        device: &Device,
        build: &dyn Fn(VarBuilder) -> candle_core::Result<M>,
    ) -> Result<M> {
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(files, dtype, device)? };
        Ok(build(vb)?)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl<M> Placeable for Resident<M> {
    fn relocate(&mut self, device: &Device) -> Result<()> {
        if self.device.same_device(device) {
            return Ok(());
        }
        debug!(model = self.name, from = ?self.device.location(), to = ?device.location(), "relocating");
        self.model = Self::build_on(&self.files, self.dtype, device, &self.build)?;
        self.device = device.clone();
        Ok(())
    }
}
