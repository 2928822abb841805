//! Single-sequence generation engine: forward passes and sampling.

pub mod forward;
pub mod model;
pub mod sampler;

pub use forward::{Engine, InferenceCache};
pub use model::{ModelHandle, ToyModel};
pub use sampler::{SamplingParams, Sampler};
