//! Run configuration
//!
//! Sections mirror the knobs a federated fine-tuning run exposes: where data
//! lives, how many simulated clients there are, and how checkpoints and
//! generation are set up. Every section has defaults so a TOML file only
//! needs to name what it overrides.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_DATA_ROOT: &str = "data";
pub const DEFAULT_MAX_TOKENS: usize = 512;
pub const DEFAULT_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub seed: u64,
    pub outdir: PathBuf,
    pub data: DataConfig,
    pub federate: FederateConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub root: PathBuf,
    /// Token budget for `instruction + output_A + output_B` on the train split.
    pub max_tokens: usize,
    /// Keep at most this many val/test examples after loading.
    pub max_num_test: Option<usize>,
    /// Concentration of the Dirichlet client split.
    pub alpha: f64,
    /// Minimum number of instructions each client must receive.
    pub min_client_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederateConfig {
    pub client_num: usize,
    pub total_round_num: usize,
    pub save_freq: usize,
    /// Checkpoint path; the file name is the basename prefixed during resolution.
    pub save_to: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Tokenizer identity: a tiktoken model/encoding name or a Hugging Face repo id.
    pub tokenizer: String,
    pub max_new_token: usize,
    pub chat: ChatConfig,
    pub ollama: OllamaConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub max_history_len: usize,
    pub max_len: usize,
    /// Fall back to the base model when no checkpoint exists.
    pub allow_raw_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub url: String,
    /// Base model tag served when no checkpoint is resolved.
    pub base_model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::shp_default()
    }
}

impl Config {
    /// Returns the configuration used for SHP federated runs
    pub fn shp_default() -> Self {
        Self {
            seed: 42,
            outdir: PathBuf::from("exp"),
            data: DataConfig::default(),
            federate: FederateConfig::default(),
            llm: LlmConfig::default(),
        }
    }

    /// Reads a TOML file; absent keys keep their defaults.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let cfg: Config = toml::from_str(&raw).map_err(anyhow::Error::from)?;
        Ok(cfg)
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_DATA_ROOT),
            max_tokens: DEFAULT_MAX_TOKENS,
            max_num_test: None,
            alpha: DEFAULT_ALPHA,
            min_client_size: 1,
        }
    }
}

impl Default for FederateConfig {
    fn default() -> Self {
        Self {
            client_num: 3,
            total_round_num: 500,
            save_freq: 100,
            save_to: PathBuf::from("checkpoints/shp.ckpt"),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            tokenizer: "gpt2".to_string(),
            max_new_token: 60,
            chat: ChatConfig::default(),
            ollama: OllamaConfig::default(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_history_len: 10,
            max_len: 100,
            allow_raw_fallback: true,
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            base_model: "llama3.2".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::*;
    use std::io::Write;

    #[rstest]
    fn test_partial_toml_keeps_defaults() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            "seed = 7\n\n[federate]\nclient_num = 10\n\n[data]\nmax_num_test = 100"
        )?;

        let cfg = Config::from_toml_file(file.path())?;

        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.federate.client_num, 10);
        assert_eq!(cfg.federate.save_freq, 100);
        assert_eq!(cfg.data.max_num_test, Some(100));
        assert_eq!(cfg.data.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(cfg.llm.tokenizer, "gpt2");
        Ok(())
    }

    #[rstest]
    fn test_invalid_toml_is_an_error() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "seed = \"not a number\"")?;
        assert!(Config::from_toml_file(file.path()).is_err());
        Ok(())
    }
}
