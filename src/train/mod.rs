//! Contrastive fine-tuning on image/caption pairs.
//!
//! The encoders stay frozen; a residual adapter per tower and the logit
//! scale are trained with a symmetric cross-entropy loss.

pub mod adapter;
pub mod checkpoint;
pub mod head;
pub mod loss;
pub mod optimizer;

use anyhow::{anyhow, Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::clip::{ImageEncoder, Preprocess, TextEncoder};
use crate::config::TrainConfig;
use crate::dataset::PairDataset;
use crate::error::ClipseekError;

pub use checkpoint::{Checkpoint, ModelState};
pub use head::{ClipHead, HeadState};
pub use optimizer::OptimizerState;

pub const BEST_CHECKPOINT: &str = "clip_best.json";

/// Frozen encoder outputs for every pair, row-aligned `[N, dim]` tensors.
#[derive(Debug, Clone)]
pub struct EncodedPairs {
    pub images: Tensor,
    /// The same images mirrored horizontally.
    pub images_flipped: Tensor,
    pub texts: Tensor,
}

impl EncodedPairs {
    pub fn len(&self) -> usize {
        self.texts.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.texts.dims().get(1).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub avg_loss: f32,
    pub avg_acc: f32,
}

#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub epochs: Vec<EpochStats>,
    pub best_checkpoint: Option<PathBuf>,
    pub head: ClipHead,
}

/// Run both frozen encoders over the dataset once.
pub fn encode_pairs<I, T>(
    dataset: &PairDataset,
    image_encoder: &I,
    text_encoder: &T,
    image_size: u32,
    encode_batch: usize,
) -> Result<EncodedPairs>
where
    I: ImageEncoder + ?Sized,
    T: TextEncoder + ?Sized,
{
    dataset.verify_images()?;

    let preprocess = Preprocess::training(image_size);
    let encode_batch = encode_batch.max(1);
    let total = dataset.len();

    let mut images = Vec::with_capacity(total);
    let mut images_flipped = Vec::with_capacity(total);
    let mut texts = Vec::with_capacity(total);

    for (chunk_idx, chunk) in dataset.pairs.chunks(encode_batch).enumerate() {
        let tensors = chunk
            .par_iter()
            .map(|pair| {
                let path = dataset.image_path(pair);
                let img = image::open(&path)
                    .with_context(|| format!("Failed to load image {}", path.display()))?;
                Ok((preprocess.apply(&img, false), preprocess.apply(&img, true)))
            })
            .collect::<Result<Vec<_>>>()?;
        let (plain, flipped): (Vec<_>, Vec<_>) = tensors.into_iter().unzip();

        images.extend(image_encoder.embed_images(&plain)?);
        images_flipped.extend(image_encoder.embed_images(&flipped)?);

        let captions: Vec<String> = chunk.iter().map(|pair| pair.caption.clone()).collect();
        texts.extend(text_encoder.embed_texts(&captions)?);

        info!(
            encoded = (chunk_idx * encode_batch + chunk.len()).min(total),
            total,
            "Encoding training pairs"
        );
    }

    Ok(EncodedPairs {
        images: stack(&images)?,
        images_flipped: stack(&images_flipped)?,
        texts: stack(&texts)?,
    })
}

/// Stack equal-length rows into a `[rows, dim]` tensor.
fn stack(rows: &[Vec<f32>]) -> Result<Tensor> {
    let dim = rows.first().map(|r| r.len()).unwrap_or(0);
    let mut flat = Vec::with_capacity(rows.len() * dim);
    for row in rows {
        if row.len() != dim {
            return Err(ClipseekError::DimensionMismatch {
                expected: dim,
                actual: row.len(),
            }
            .into());
        }
        flat.extend_from_slice(row);
    }
    Ok(Tensor::from_vec(flat, (rows.len(), dim), &Device::Cpu)?)
}

pub struct Trainer {
    config: TrainConfig,
    encoder_name: String,
    head: ClipHead,
    optimizer_state: OptimizerState,
    optimizer: AdamW,
    start_epoch: usize,
    best_loss: f32,
    rng: StdRng,
}

impl Trainer {
    pub fn new(config: TrainConfig, encoder_name: &str, dim: usize) -> Result<Self> {
        config.validate()?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let head = ClipHead::identity(dim)?;
        let optimizer_state = OptimizerState::new(config.lr as f64, config.weight_decay as f64);
        let optimizer = optimizer_state.build(head.vars())?;

        Ok(Self {
            config,
            encoder_name: encoder_name.to_string(),
            head,
            optimizer_state,
            optimizer,
            start_epoch: 1,
            best_loss: f32::INFINITY,
            rng,
        })
    }

    /// Continue from a checkpoint's weights, step count and epoch counter.
    /// The learning rate and weight decay come from the current config, and
    /// the best loss so far from the best checkpoint already in `output_dir`.
    pub fn resume(mut self, checkpoint: Checkpoint) -> Result<Self> {
        let head = checkpoint.head()?;
        if head.dim() != self.head.dim() {
            return Err(ClipseekError::DimensionMismatch {
                expected: self.head.dim(),
                actual: head.dim(),
            }
            .into());
        }

        self.optimizer_state = OptimizerState {
            lr: self.config.lr as f64,
            weight_decay: self.config.weight_decay as f64,
            ..checkpoint.optimizer_state
        };
        self.optimizer = self.optimizer_state.build(head.vars())?;
        self.head = head;
        self.start_epoch = checkpoint.epoch + 1;

        let best_path = self.config.output_dir.join(BEST_CHECKPOINT);
        if best_path.exists() {
            match Checkpoint::load(&best_path) {
                Ok(best) => self.best_loss = best.avg_loss,
                Err(e) => warn!(path = %best_path.display(), error = %e, "Ignoring unreadable best checkpoint"),
            }
        }
        Ok(self)
    }

    pub fn fit(mut self, data: &EncodedPairs) -> Result<TrainSummary> {
        let batch_size = self.config.batch_size.max(1);
        if data.len() < batch_size {
            return Err(ClipseekError::NotEnoughPairs {
                pairs: data.len(),
                batch_size,
            }
            .into());
        }
        if data.dim() != self.head.dim() {
            return Err(ClipseekError::DimensionMismatch {
                expected: self.head.dim(),
                actual: data.dim(),
            }
            .into());
        }

        std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!("Failed to create {}", self.config.output_dir.display())
        })?;

        // Flipped rows follow the plain ones, so a flip is an index offset
        let candidates = Tensor::cat(&[&data.images, &data.images_flipped], 0)?;

        let mut epochs = Vec::with_capacity(self.config.epochs);
        let mut best_checkpoint = None;

        for epoch in self.start_epoch..self.start_epoch + self.config.epochs {
            let stats = self.train_epoch(data, &candidates, epoch, batch_size)?;
            info!(
                epoch,
                avg_loss = stats.avg_loss,
                avg_acc = stats.avg_acc,
                "Epoch finished"
            );

            let checkpoint = self.checkpoint(stats)?;
            let epoch_path = self.config.output_dir.join(format!("clip_epoch_{epoch}.json"));
            checkpoint.save(&epoch_path)?;

            if stats.avg_loss < self.best_loss {
                self.best_loss = stats.avg_loss;
                let best_path = self.config.output_dir.join(BEST_CHECKPOINT);
                checkpoint.save(&best_path)?;
                info!(path = %best_path.display(), "Saved best model");
                best_checkpoint = Some(best_path);
            }

            epochs.push(stats);
        }

        Ok(TrainSummary {
            epochs,
            best_checkpoint,
            head: self.head,
        })
    }

    fn train_epoch(
        &mut self,
        data: &EncodedPairs,
        candidates: &Tensor,
        epoch: usize,
        batch_size: usize,
    ) -> Result<EpochStats> {
        let n = data.len();
        let device = self.head.device().clone();
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut self.rng);

        let mut total_loss = 0.0f32;
        let mut total_correct = 0usize;
        let mut total_samples = 0usize;
        let mut batches = 0usize;

        // Partial trailing batch is dropped
        for batch in order.chunks_exact(batch_size) {
            let image_rows: Vec<u32> = batch
                .iter()
                .map(|&i| {
                    let flip = self.rng.gen_bool(self.config.flip_probability);
                    (if flip { i + n } else { i }) as u32
                })
                .collect();
            let text_rows: Vec<u32> = batch.iter().map(|&i| i as u32).collect();

            let images = candidates.index_select(&Tensor::from_vec(image_rows, batch.len(), &device)?, 0)?;
            let texts = data
                .texts
                .index_select(&Tensor::from_vec(text_rows, batch.len(), &device)?, 0)?;

            let output = self.head.loss(&images, &texts)?;
            let loss: f32 = output.loss.to_scalar()?;
            if !loss.is_finite() {
                return Err(anyhow!("Loss diverged at epoch {epoch}, batch {}", batches + 1));
            }

            self.optimizer.backward_step(&output.loss)?;
            self.head.clamp_logit_scale()?;
            self.optimizer_state.step += 1;

            batches += 1;
            total_loss += loss;
            total_correct += output.correct;
            total_samples += batch.len();

            debug!(
                epoch,
                batch = batches,
                loss = total_loss / batches as f32,
                acc = total_correct as f32 / total_samples as f32,
                "Training step"
            );
        }

        Ok(EpochStats {
            epoch,
            avg_loss: total_loss / batches.max(1) as f32,
            avg_acc: total_correct as f32 / total_samples.max(1) as f32,
        })
    }

    fn checkpoint(&self, stats: EpochStats) -> Result<Checkpoint> {
        Ok(Checkpoint {
            epoch: stats.epoch,
            model_state: ModelState {
                encoder: self.encoder_name.clone(),
                head: self.head.state()?,
            },
            optimizer_state: self.optimizer_state.clone(),
            avg_loss: stats.avg_loss,
            avg_acc: stats.avg_acc,
            created_at: Utc::now(),
        })
    }
}

/// Load pairs, encode them and train. Used by the `train` command.
pub fn run<E>(config: &TrainConfig, encoder: &E, encode_batch: usize, resume: Option<&Path>) -> Result<TrainSummary>
where
    E: ImageEncoder + TextEncoder + ?Sized,
{
    config.validate()?;

    let dataset = PairDataset::load(
        &config.images_dir,
        &config.metadata,
        &config.filename_col,
        &config.caption_col,
    )?;
    if dataset.len() < config.batch_size.max(1) {
        return Err(ClipseekError::NotEnoughPairs {
            pairs: dataset.len(),
            batch_size: config.batch_size,
        }
        .into());
    }

    let encoded = encode_pairs(&dataset, encoder, encoder, config.image_size, encode_batch)?;

    let mut trainer = Trainer::new(config.clone(), encoder.model_name(), encoded.dim())?;
    if let Some(path) = resume {
        let checkpoint = Checkpoint::load(path)?;
        info!(path = %path.display(), epoch = checkpoint.epoch, "Resuming from checkpoint");
        trainer = trainer.resume(checkpoint)?;
    }

    trainer.fit(&encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Pair;
    use crate::testutil::{write_png, HashEncoder};
    use tempfile::tempdir;

    fn config(output_dir: &Path) -> TrainConfig {
        TrainConfig {
            epochs: 3,
            batch_size: 4,
            lr: 5e-2,
            weight_decay: 0.0,
            output_dir: output_dir.to_path_buf(),
            seed: Some(42),
            ..TrainConfig::default()
        }
    }

    /// Pairs whose text embeddings are a fixed rotation of the image embeddings,
    /// so an adapter can learn to realign them.
    fn rotated_pairs(n: usize, dim: usize) -> EncodedPairs {
        let mut images = vec![0.0f32; n * dim];
        let mut texts = vec![0.0f32; n * dim];
        for i in 0..n {
            let a = (i as f32 * 0.7).sin();
            let b = (i as f32 * 1.3).cos();
            let c = ((i * 7 % 5) as f32) - 2.0;
            let mut row = vec![a, b, c, 0.5];
            crate::clip::normalize(&mut row);
            for d in 0..dim {
                images[i * dim + d] = row[d];
                texts[i * dim + (d + 1) % dim] = row[d];
            }
        }
        let images = Tensor::from_vec(images, (n, dim), &Device::Cpu).unwrap();
        EncodedPairs {
            images_flipped: images.clone(),
            images,
            texts: Tensor::from_vec(texts, (n, dim), &Device::Cpu).unwrap(),
        }
    }

    #[test]
    fn test_fit_lowers_loss_and_writes_checkpoints() {
        let dir = tempdir().unwrap();
        let data = rotated_pairs(8, 4);
        let mut cfg = config(dir.path());
        cfg.epochs = 40;

        let summary = Trainer::new(cfg, "test", 4).unwrap().fit(&data).unwrap();

        let first = summary.epochs.first().unwrap();
        let last = summary.epochs.last().unwrap();
        assert!(last.avg_loss < first.avg_loss, "{} !< {}", last.avg_loss, first.avg_loss);
        assert!(dir.path().join("clip_epoch_1.json").exists());
        assert!(dir.path().join("clip_epoch_40.json").exists());
        assert_eq!(summary.best_checkpoint, Some(dir.path().join(BEST_CHECKPOINT)));

        let best = Checkpoint::load(&dir.path().join(BEST_CHECKPOINT)).unwrap();
        let min_loss = summary
            .epochs
            .iter()
            .map(|e| e.avg_loss)
            .fold(f32::INFINITY, f32::min);
        assert!((best.avg_loss - min_loss).abs() < 1e-6);
        assert!(summary.head.logit_scale().unwrap() <= 100.0 + 1e-3);
    }

    #[test]
    fn test_partial_batches_are_dropped() {
        let dir = tempdir().unwrap();
        let data = rotated_pairs(10, 4);
        let mut cfg = config(dir.path());
        cfg.epochs = 1;

        let summary = Trainer::new(cfg, "test", 4).unwrap().fit(&data).unwrap();
        // 10 pairs, batches of 4: two batches, 8 samples
        let checkpoint = Checkpoint::load(&dir.path().join("clip_epoch_1.json")).unwrap();
        assert_eq!(checkpoint.optimizer_state.step, 2);
        assert_eq!(summary.epochs.len(), 1);
    }

    #[test]
    fn test_too_few_pairs() {
        let dir = tempdir().unwrap();
        let data = rotated_pairs(3, 4);
        let err = Trainer::new(config(dir.path()), "test", 4)
            .unwrap()
            .fit(&data)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClipseekError>(),
            Some(ClipseekError::NotEnoughPairs { pairs: 3, batch_size: 4 })
        ));
    }

    #[test]
    fn test_invalid_flip_probability_is_rejected() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.flip_probability = f64::NAN;
        assert!(Trainer::new(cfg, "test", 4).is_err());
    }

    #[test]
    fn test_resume_continues_epoch_numbering() {
        let dir = tempdir().unwrap();
        let data = rotated_pairs(8, 4);
        let mut cfg = config(dir.path());
        cfg.epochs = 1;

        Trainer::new(cfg.clone(), "test", 4).unwrap().fit(&data).unwrap();
        let checkpoint = Checkpoint::load(&dir.path().join("clip_epoch_1.json")).unwrap();

        let summary = Trainer::new(cfg, "test", 4)
            .unwrap()
            .resume(checkpoint)
            .unwrap()
            .fit(&data)
            .unwrap();
        assert_eq!(summary.epochs[0].epoch, 2);
        assert!(dir.path().join("clip_epoch_2.json").exists());

        let resumed = Checkpoint::load(&dir.path().join("clip_epoch_2.json")).unwrap();
        assert_eq!(resumed.optimizer_state.step, 4);
    }

    #[test]
    fn test_resume_keeps_better_best_checkpoint() {
        let dir = tempdir().unwrap();
        let data = rotated_pairs(8, 4);
        let mut cfg = config(dir.path());
        cfg.epochs = 2;

        Trainer::new(cfg.clone(), "test", 4).unwrap().fit(&data).unwrap();

        // Pretend an earlier epoch reached a loss no later epoch can beat
        let best_path = dir.path().join(BEST_CHECKPOINT);
        let mut best = Checkpoint::load(&best_path).unwrap();
        best.avg_loss = 0.0;
        best.save(&best_path).unwrap();
        let best_epoch = best.epoch;

        let checkpoint = Checkpoint::load(&dir.path().join("clip_epoch_2.json")).unwrap();
        cfg.epochs = 1;
        let summary = Trainer::new(cfg, "test", 4)
            .unwrap()
            .resume(checkpoint)
            .unwrap()
            .fit(&data)
            .unwrap();

        assert_eq!(summary.epochs[0].epoch, 3);
        assert!(summary.epochs[0].avg_loss > 0.0);
        assert_eq!(summary.best_checkpoint, None);
        let after = Checkpoint::load(&best_path).unwrap();
        assert_eq!(after.epoch, best_epoch);
        assert_eq!(after.avg_loss, 0.0);
    }

    #[test]
    fn test_encode_pairs_with_images_on_disk() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("red.png"), [220, 20, 20]);
        write_png(&dir.path().join("blue.png"), [20, 20, 220]);

        let dataset = PairDataset {
            images_dir: dir.path().to_path_buf(),
            pairs: vec![
                Pair { filename: "red.png".into(), caption: "a red car".into() },
                Pair { filename: "blue.png".into(), caption: "a blue car".into() },
            ],
        };

        let encoder = HashEncoder::new(8);
        let encoded = encode_pairs(&dataset, &encoder, &encoder, 32, 1).unwrap();
        assert_eq!(encoded.len(), 2);
        assert_eq!(encoded.dim(), 8);
        assert_eq!(encoded.images.dims(), encoded.images_flipped.dims());
    }
}
