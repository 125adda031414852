use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ClipseekError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,

    /// Adapter checkpoint applied at search/evaluation time. The default path is
    /// ignored while it does not exist; any other missing path is an error.
    #[serde(default = "default_checkpoint")]
    pub checkpoint: Option<PathBuf>,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub evaluate: EvaluateConfig,

    #[serde(default)]
    pub train: TrainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    #[serde(default = "default_visual_url")]
    pub visual_url: String,

    #[serde(default = "default_text_url")]
    pub text_url: String,

    #[serde(default = "default_tokenizer_url")]
    pub tokenizer_url: String,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    /// Images per visual encoder call.
    #[serde(default = "default_encode_batch")]
    pub batch_size: usize,

    #[serde(default = "default_context_length")]
    pub context_length: usize,
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("clipseek")
        .join("models")
}

// Qdrant's CLIP ViT-B/32 exports
fn default_visual_url() -> String {
    "https://huggingface.co/Qdrant/clip-ViT-B-32-vision/resolve/main/model.onnx".to_string()
}

fn default_text_url() -> String {
    "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/model.onnx".to_string()
}

fn default_tokenizer_url() -> String {
    "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/tokenizer.json".to_string()
}

fn default_intra_threads() -> usize {
    4
}

fn default_encode_batch() -> usize {
    32
}

fn default_context_length() -> usize {
    77
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            visual_url: default_visual_url(),
            text_url: default_text_url(),
            tokenizer_url: default_tokenizer_url(),
            intra_threads: default_intra_threads(),
            batch_size: default_encode_batch(),
            context_length: default_context_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clipseek")
        .join("index.db")
}

fn default_image_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            image_extensions: default_image_extensions(),
        }
    }
}

pub const MAX_SEARCH_TOP_K: usize = 20;
pub const MAX_EVAL_TOP_K: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_top_k")]
    pub top_k: usize,

    /// Softmax temperature used when no checkpoint provides one.
    #[serde(default = "default_logit_scale")]
    pub logit_scale: f32,
}

fn default_search_top_k() -> usize {
    6
}

fn default_logit_scale() -> f32 {
    100.0
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: default_search_top_k(),
            logit_scale: default_logit_scale(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateConfig {
    #[serde(default = "default_eval_top_k")]
    pub top_k: usize,

    /// `{label}` is replaced by the directory name with underscores turned into spaces.
    #[serde(default = "default_query_template")]
    pub query_template: String,
}

fn default_eval_top_k() -> usize {
    5
}

fn default_query_template() -> String {
    "a photo of a {label}".to_string()
}

impl Default for EvaluateConfig {
    fn default() -> Self {
        Self {
            top_k: default_eval_top_k(),
            query_template: default_query_template(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_image_dir")]
    pub images_dir: PathBuf,

    #[serde(default = "default_metadata")]
    pub metadata: PathBuf,

    #[serde(default = "default_filename_col")]
    pub filename_col: String,

    #[serde(default = "default_caption_col")]
    pub caption_col: String,

    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_train_batch")]
    pub batch_size: usize,

    #[serde(default = "default_lr")]
    pub lr: f32,

    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_image_size")]
    pub image_size: u32,

    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default = "default_flip_probability")]
    pub flip_probability: f64,
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("./images")
}

fn default_checkpoint() -> Option<PathBuf> {
    Some(PathBuf::from("checkpoints/clip_best.json"))
}

fn default_metadata() -> PathBuf {
    PathBuf::from("metadata.csv")
}

fn default_filename_col() -> String {
    "filename".to_string()
}

fn default_caption_col() -> String {
    "caption".to_string()
}

fn default_epochs() -> usize {
    5
}

fn default_train_batch() -> usize {
    16
}

fn default_lr() -> f32 {
    1e-4
}

fn default_weight_decay() -> f32 {
    0.01
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}

fn default_image_size() -> u32 {
    224
}

fn default_flip_probability() -> f64 {
    0.5
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            images_dir: default_image_dir(),
            metadata: default_metadata(),
            filename_col: default_filename_col(),
            caption_col: default_caption_col(),
            epochs: default_epochs(),
            batch_size: default_train_batch(),
            lr: default_lr(),
            weight_decay: default_weight_decay(),
            output_dir: default_output_dir(),
            image_size: default_image_size(),
            seed: None,
            flip_probability: default_flip_probability(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_dir: default_image_dir(),
            checkpoint: default_checkpoint(),
            model: ModelConfig::default(),
            index: IndexConfig::default(),
            search: SearchConfig::default(),
            evaluate: EvaluateConfig::default(),
            train: TrainConfig::default(),
        }
    }
}

impl Config {
    /// Load from `CLIPSEEK_CONFIG` or the default location, creating the default file if absent.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("CLIPSEEK_CONFIG") {
            return Self::load_from(Path::new(&path));
        }

        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config
            .train
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("clipseek")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// The checkpoint to apply. A missing file at the default location means
    /// "not trained yet"; a missing file anywhere else is reported.
    pub fn active_checkpoint(&self) -> Result<Option<&Path>> {
        match self.checkpoint.as_deref() {
            None => Ok(None),
            Some(path) if path.exists() => Ok(Some(path)),
            Some(path) if default_checkpoint().as_deref() == Some(path) => Ok(None),
            Some(path) => Err(ClipseekError::CheckpointNotFound {
                path: path.to_path_buf(),
            }
            .into()),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.flip_probability) {
            return Err(anyhow!(
                "train.flip_probability must be between 0 and 1, got {}",
                self.flip_probability
            ));
        }
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(anyhow!("train.lr must be a positive number, got {}", self.lr));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(anyhow!(
                "train.weight_decay must be a non-negative number, got {}",
                self.weight_decay
            ));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("train.batch_size must be at least 1"));
        }
        Ok(())
    }
}
