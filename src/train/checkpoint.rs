//! Training checkpoints stored as JSON.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use super::head::{ClipHead, HeadState};
use super::optimizer::OptimizerState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelState {
    /// Encoder the adapters were trained on top of.
    pub encoder: String,
    pub head: HeadState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub model_state: ModelState,
    pub optimizer_state: OptimizerState,
    pub avg_loss: f32,
    pub avg_acc: f32,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = File::create(path)
            .with_context(|| format!("Failed to create checkpoint {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open checkpoint {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Invalid checkpoint {}", path.display()))?;
        checkpoint
            .head()
            .with_context(|| format!("Invalid checkpoint {}", path.display()))?;
        Ok(checkpoint)
    }

    /// Rebuild the trained head.
    pub fn head(&self) -> Result<ClipHead> {
        ClipHead::from_state(&self.model_state.head)
    }
}
