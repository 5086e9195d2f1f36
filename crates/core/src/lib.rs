//! Part-token Vision Transformer feature extraction for re-identification.
//!
//! The encoder augments the usual class token with three learned part tokens
//! that aggregate localized regions through self-attention. A forward pass
//! either runs all four special tokens jointly or the class token plus one
//! part selected by index; see [`config::TokenMode`]. Checkpoints in the
//! native layout or in foreign Flax archives are adapted onto the parameter
//! manifest by the loaders in [`loader`].

pub mod config;
pub mod init;
pub mod layers;
pub mod loader;
pub mod models;
pub mod resample;

pub use config::{ConfigError, PartIndex, PartVitConfig, TokenMode};
pub use loader::{FlaxLayout, LoadError, LoadReport, ParamSpec, ShapeMismatch};
pub use models::{Embeddings, PartVit};
