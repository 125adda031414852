//! Error types that callers are expected to match on.
//!
//! Everything else is reported through `anyhow` with context attached.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClipseekError {
    #[error("no image files found in {}", .dir.display())]
    NoImagesFound { dir: PathBuf },

    #[error("none of the images in {} could be processed, check the image formats", .dir.display())]
    NoValidImages { dir: PathBuf },

    #[error("metadata must contain columns '{filename_col}' and '{caption_col}'")]
    MissingColumns {
        filename_col: String,
        caption_col: String,
    },

    #[error("image not found: {} (do the metadata filenames match the images directory?)", .path.display())]
    ImageNotFound { path: PathBuf },

    #[error("checkpoint not found: {}", .path.display())]
    CheckpointNotFound { path: PathBuf },

    #[error("the image index is empty")]
    EmptyIndex,

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("top-k must be between 1 and {max}, got {value}")]
    InvalidTopK { value: usize, max: usize },

    #[error("{pairs} image/caption pairs is not enough for one batch of {batch_size}")]
    NotEnoughPairs { pairs: usize, batch_size: usize },
}
