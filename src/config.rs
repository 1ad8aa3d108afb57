//! config.rs
//!
//! Immutable pipeline configuration.
//!
//! Loaded once from TOML (explicit path, then the user config dir, then
//! defaults), adjusted by CLI flags, then shared read-only across workers.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: RepairConfig,
    pub verifier: VerifierConfig,
    pub oracle: OracleConfig,
    pub llm: LlmConfig,
}

/* ---------- repair loop ---------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub max_unidiomatic_attempts: u32,
    pub max_idiomatic_attempts: u32,
    pub unidiomatic_only: bool,
    pub workers: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_unidiomatic_attempts: 6,
            max_idiomatic_attempts: 4,
            unidiomatic_only: false,
            workers: 4,
        }
    }
}

/* ---------- verifier ---------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub cargo: String,
    pub build_timeout_secs: u64,
    pub case_timeout_secs: u64,
    pub memcheck: bool,
    pub valgrind: String,
    pub memcheck_timeout_secs: u64,
    pub edition: String,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            cargo: "cargo".into(),
            build_timeout_secs: 300,
            case_timeout_secs: 10,
            memcheck: true,
            valgrind: "valgrind".into(),
            memcheck_timeout_secs: 60,
            edition: "2021".into(),
        }
    }
}

impl VerifierConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn case_timeout(&self) -> Duration {
        Duration::from_secs(self.case_timeout_secs)
    }

    pub fn memcheck_timeout(&self) -> Duration {
        Duration::from_secs(self.memcheck_timeout_secs)
    }
}

/* ---------- oracle ---------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub cc: String,
    pub cflags: Vec<String>,
    pub min_cases: usize,
    pub max_random_cases: usize,
    pub seed: Option<u64>,
    pub case_timeout_secs: u64,
    pub build_timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            cc: "cc".into(),
            cflags: vec!["-O0".into(), "-w".into()],
            min_cases: 3,
            max_random_cases: 5,
            seed: None,
            case_timeout_secs: 10,
            build_timeout_secs: 30,
        }
    }
}

impl OracleConfig {
    pub fn case_timeout(&self) -> Duration {
        Duration::from_secs(self.case_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

/* ---------- llm ---------- */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Any OpenAI-compatible chat completions endpoint (OpenAI, vLLM, Qwen).
    OpenAI,
    Anthropic,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    /// Providers that reject a system role get it folded into the user turn.
    pub system_in_user: bool,
    /// Same provider, other models; tried in order when quota runs out.
    pub fallback_models: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAI,
            model: "gpt-4o".into(),
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".into()),
            base_url: None,
            temperature: None,
            max_tokens: 8192,
            request_timeout_secs: 180,
            system_in_user: false,
            fallback_models: Vec::new(),
        }
    }
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|k| !k.trim().is_empty())
            })
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline: RepairConfig::default(),
            verifier: VerifierConfig::default(),
            oracle: OracleConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Explicit path wins; otherwise the user config file if present.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let cfg = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.max_unidiomatic_attempts == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_unidiomatic_attempts must be at least 1".into(),
            ));
        }
        if self.pipeline.max_idiomatic_attempts == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_idiomatic_attempts must be at least 1".into(),
            ));
        }
        if self.pipeline.workers == 0 {
            return Err(ConfigError::Invalid("pipeline.workers must be at least 1".into()));
        }
        if self.oracle.min_cases == 0 {
            return Err(ConfigError::Invalid("oracle.min_cases must be at least 1".into()));
        }
        Ok(())
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("osmoport/config.toml")
}
