//! Image/caption pairs read from a metadata CSV.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ClipseekError;
use crate::scanner::has_extension;

/// Extensions accepted in the filename column.
const PAIR_IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub filename: String,
    pub caption: String,
}

#[derive(Debug, Clone)]
pub struct PairDataset {
    pub images_dir: PathBuf,
    pub pairs: Vec<Pair>,
}

impl PairDataset {
    pub fn load(
        images_dir: &Path,
        metadata_csv: &Path,
        filename_col: &str,
        caption_col: &str,
    ) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(metadata_csv)
            .with_context(|| format!("Failed to open metadata {}", metadata_csv.display()))?;

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.replace('\u{feff}', "").trim().to_string())
            .collect();

        let filename_idx = headers.iter().position(|h| h == filename_col);
        let caption_idx = headers.iter().position(|h| h == caption_col);
        let (filename_idx, caption_idx) = match (filename_idx, caption_idx) {
            (Some(f), Some(c)) => (f, c),
            _ => {
                return Err(ClipseekError::MissingColumns {
                    filename_col: filename_col.to_string(),
                    caption_col: caption_col.to_string(),
                }
                .into())
            }
        };

        let extensions: Vec<String> = PAIR_IMAGE_EXTENSIONS.iter().map(|e| e.to_string()).collect();
        let mut pairs = Vec::new();

        for (line, record) in reader.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!(line = line + 2, error = %e, "Skipping malformed metadata row");
                    continue;
                }
            };

            // Usually an unquoted comma inside a caption
            if record.len() > headers.len() {
                warn!(
                    line = line + 2,
                    fields = record.len(),
                    expected = headers.len(),
                    "Skipping metadata row with too many fields"
                );
                continue;
            }

            let filename = record.get(filename_idx).unwrap_or("").trim();
            let caption = record.get(caption_idx).unwrap_or("").trim();
            if filename.is_empty() || caption.is_empty() {
                continue;
            }

            if !has_extension(Path::new(filename), &extensions) {
                warn!(
                    index = pairs.len(),
                    filename = %filename,
                    caption = %caption,
                    "Filename does not look like an image; check this row and the one before it"
                );
            }

            pairs.push(Pair {
                filename: filename.to_string(),
                caption: caption.to_string(),
            });
        }

        info!(
            pairs = pairs.len(),
            metadata = %metadata_csv.display(),
            "Loaded image/caption pairs"
        );

        Ok(Self {
            images_dir: images_dir.to_path_buf(),
            pairs,
        })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn image_path(&self, pair: &Pair) -> PathBuf {
        self.images_dir.join(&pair.filename)
    }

    /// Fail on the first pair whose image file is missing.
    pub fn verify_images(&self) -> Result<()> {
        for pair in &self.pairs {
            let path = self.image_path(pair);
            if !path.is_file() {
                return Err(ClipseekError::ImageNotFound { path }.into());
            }
        }
        Ok(())
    }
}
