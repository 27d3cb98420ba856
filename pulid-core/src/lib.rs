#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod conditioning;
pub mod decode;
pub mod device_map;
mod error;
pub mod flux;
pub mod identity;
pub mod loader;
mod loader_factory;
mod request;
pub mod resident;
pub mod sampling;
pub mod session;
mod util;

pub use conditioning::{Conditioner, Conditioning};
pub use device_map::*;
pub use error::{PipelineError, Result};
pub use flux::{FluxLoader, FluxModel};
pub use identity::{IdEmbeddings, IdEncoder, IdEncoding, IdentityExtractor};
pub use loader::*;
pub use loader_factory::*;
pub use request::*;
pub use resident::{Placeable, Resident};
pub use session::{OffloadPolicy, Pipeline, Session};
pub use util::*;

pub trait ModelLike: Send + Sync {
    fn run(&self, request: GenerationRequest) -> Result<GenerationOutput>;
}
