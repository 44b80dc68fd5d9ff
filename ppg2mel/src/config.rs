//! Typed training configuration.
//!
//! The YAML layout mirrors the three sections consumed by the solver:
//! `data` (corpus locations), `model` (decoder dimensions) and `hparas`
//! (loop cadence and optimizer schedule). Unknown keys are rejected at
//! load time.
use std::path::{Path, PathBuf};

use candle::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub hparas: Hparas,
}

/// Corpus locations. Feature files are per-utterance npy matrices found at
/// `{dir}/{fid}.{ext}`; the fid lists enumerate one `fid|spk` entry per line.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    pub train_fid_list: PathBuf,
    pub dev_fid_list: PathBuf,
    pub ppg_dir: PathBuf,
    pub f0_dir: PathBuf,
    pub mel_dir: PathBuf,
    #[serde(default = "default_ppg_ext")]
    pub ppg_file_ext: String,
    #[serde(default)]
    pub pretrain_model_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Mel frames emitted per decoder step; output lengths are padded up to
    /// a multiple of this.
    pub frames_per_step: usize,
    pub ppg_dim: usize,
    pub mel_dim: usize,
    pub num_speakers: usize,
    pub spk_embed_dim: usize,
    pub hidden_dim: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Hparas {
    pub batch_size: usize,
    pub max_step: usize,
    pub valid_step: usize,
    #[serde(default = "default_progress_step")]
    pub progress_step: usize,
    #[serde(default = "default_num_att_plots")]
    pub num_att_plots: usize,
    pub optimizer: OptimizerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrSchedule {
    Fixed,
    Warmup,
}

impl Default for LrSchedule {
    fn default() -> Self {
        Self::Fixed
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    pub lr: f64,
    #[serde(default)]
    pub lr_scheduler: LrSchedule,
    #[serde(default = "default_warmup_step")]
    pub warmup_step: usize,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

fn default_ppg_ext() -> String {
    "npy".to_string()
}

fn default_progress_step() -> usize {
    100
}

fn default_num_att_plots() -> usize {
    5
}

fn default_warmup_step() -> usize {
    4000
}

fn default_max_grad_norm() -> f64 {
    1.0
}

fn default_weight_decay() -> f64 {
    0.01
}

impl Config {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| candle::Error::Msg(format!("{:?}: {e}", path.as_ref())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hparas.batch_size == 0 {
            candle::bail!("hparas.batch_size must be at least 1")
        }
        if self.hparas.max_step == 0 {
            candle::bail!("hparas.max_step must be at least 1")
        }
        if self.hparas.valid_step == 0 {
            candle::bail!("hparas.valid_step must be at least 1")
        }
        if self.model.frames_per_step == 0 {
            candle::bail!("model.frames_per_step must be at least 1")
        }
        if self.hparas.optimizer.lr <= 0. {
            candle::bail!("hparas.optimizer.lr must be positive")
        }
        if self.hparas.optimizer.lr_scheduler == LrSchedule::Warmup
            && self.hparas.optimizer.warmup_step == 0
        {
            candle::bail!("warmup schedule requires hparas.optimizer.warmup_step > 0")
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
data:
  train_fid_list: meta/train.lst
  dev_fid_list: meta/dev.lst
  ppg_dir: feats/ppg
  f0_dir: feats/lf0
  mel_dir: feats/mel
  ppg_file_ext: ling.npy
model:
  frames_per_step: 2
  ppg_dim: 144
  mel_dim: 80
  num_speakers: 4
  spk_embed_dim: 64
  hidden_dim: 256
hparas:
  batch_size: 8
  max_step: 100000
  valid_step: 5000
  optimizer:
    lr: 0.001
    lr_scheduler: warmup
    warmup_step: 4000
"#;

    #[test]
    fn parses_full_config() {
        let config: Config = serde_yaml::from_str(YAML).unwrap();
        config.validate().unwrap();
        assert_eq!(config.data.ppg_file_ext, "ling.npy");
        assert_eq!(config.model.frames_per_step, 2);
        assert_eq!(config.hparas.progress_step, 100);
        assert_eq!(config.hparas.num_att_plots, 5);
        assert_eq!(config.hparas.optimizer.lr_scheduler, LrSchedule::Warmup);
        assert!(config.data.pretrain_model_file.is_none());
    }

    #[test]
    fn rejects_unknown_keys() {
        let yaml = YAML.replace("hidden_dim: 256", "hidden_dim: 256\n  dropout: 0.5");
        let config: std::result::Result<Config, _> = serde_yaml::from_str(&yaml);
        assert!(config.is_err());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let yaml = YAML.replace("batch_size: 8", "batch_size: 0");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_warmup_without_steps() {
        let yaml = YAML.replace("warmup_step: 4000", "warmup_step: 0");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
