//! Text-to-image retrieval on CLIP embeddings.
//!
//! - [`index`]: embed an image folder and rank it against text queries
//! - [`train`]: contrastive fine-tuning of adapters on image/caption pairs
//! - [`evaluate`]: top-K accuracy with folder names as labels

pub mod clip;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluate;
pub mod export;
pub mod index;
pub mod logging;
pub mod scanner;
pub mod train;

#[cfg(test)]
mod testutil;

pub use error::ClipseekError;
