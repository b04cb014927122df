pub mod ctc_model;
mod encoder;
mod feature_extractor;
mod feature_projection;
mod layers;
pub mod ops;
pub mod synthetic;

pub use ctc_model::CtcAcousticModel;
pub use synthetic::{save_synthetic_safetensors, synthetic_model, synthetic_weights};
