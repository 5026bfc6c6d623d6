//! Orchestrator configuration stored in `forgeline.toml`.
//!
//! Every field has a default, so a missing file or a partial file is valid.
//! Secrets never live in the file; they are read from the environment.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::MIN_OUTPUT_TOKENS;
use crate::core::types::Mode;
use crate::io::atomic::write_atomic;

pub const DEFAULT_CONFIG_FILE: &str = "forgeline.toml";
pub const GENERATOR_API_KEY_ENV: &str = "FORGELINE_GENERATOR_API_KEY";
pub const BOARD_TOKEN_ENV: &str = "FORGELINE_BOARD_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForgeConfig {
    pub generator: GeneratorConfig,
    pub runtime: RuntimeConfig,
    pub breaker: BreakerConfig,
    pub monitor: MonitorConfig,
    pub pipeline: PipelineConfig,
    pub board: BoardConfig,
    pub limits: LimitsConfig,
}

/// Text-completion backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub base_url: String,
    pub model: String,
    /// Value of the `anthropic-version` header.
    pub api_version: String,
    /// Per-call wall-clock timeout.
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            api_version: "2023-06-01".to_string(),
            timeout_secs: 300,
        }
    }
}

impl GeneratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// API key from `FORGELINE_GENERATOR_API_KEY`, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        non_empty_env(GENERATOR_API_KEY_ENV)
    }
}

/// Retry and repair behavior of the invocation runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Generator calls per attempt cycle, including the first.
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_step_secs: u64,
    /// Re-asks with validator feedback after the first answer.
    pub max_repairs: u32,
    /// Directory holding `<role>/SYSTEM_PROMPT.md` overrides.
    pub prompts_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 2,
            backoff_step_secs: 3,
            max_repairs: 2,
            prompts_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive terminal failures that open the circuit.
    pub threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { threshold: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    /// Reworks allowed per task; the rejection after the last one force-closes it.
    pub max_qa_rework: u32,
    /// DEV calls without artifacts before a task is given up.
    pub max_dev_no_artifact: u32,
    /// QA calls without a verdict before a task's review is abandoned.
    pub max_qa_no_verdict: u32,
    pub max_iterations: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_qa_rework: 3,
            max_dev_no_artifact: 3,
            max_qa_no_verdict: 3,
            max_iterations: 500,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root for per-project checkpoints, STOP files, and stored artifacts.
    pub state_dir: PathBuf,
    /// Charter and backlog negotiation rounds before accepting the last draft.
    pub max_negotiation_rounds: u32,
    /// Agent invocation service; the runtime runs in-process when unset.
    pub agents_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".forgeline/projects"),
            max_negotiation_rounds: 3,
            agents_url: None,
        }
    }
}

/// External task/project API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BoardConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            timeout_secs: 30,
        }
    }
}

impl BoardConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Bearer token from `FORGELINE_BOARD_TOKEN`, if set and non-empty.
    pub fn token(&self) -> Option<String> {
        non_empty_env(BOARD_TOKEN_ENV)
    }
}

/// Output-size ceilings keyed by mode tag (e.g. `implement_task = 16000`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_output_tokens: BTreeMap<String, u32>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let max_output_tokens = [
            (Mode::SpecIntakeAndNormalize, 16_000),
            (Mode::GenerateEngineeringDocs, 16_000),
            (Mode::GenerateBacklog, 16_000),
            (Mode::ImplementTask, 16_000),
            (Mode::ValidateTask, 8_000),
            (Mode::ValidateBacklog, 8_000),
            (Mode::ValidateEngineerDocs, 8_000),
            (Mode::CharterAndProposal, 8_000),
        ]
        .into_iter()
        .map(|(mode, tokens)| (mode.as_str().to_string(), tokens))
        .collect();
        Self { max_output_tokens }
    }
}

impl LimitsConfig {
    pub fn ceiling_for(&self, mode: Mode) -> Option<u32> {
        self.max_output_tokens.get(mode.as_str()).copied()
    }
}

impl ForgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.generator.model.trim().is_empty() {
            return Err(anyhow!("generator.model must be non-empty"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.runtime.max_attempts == 0 {
            return Err(anyhow!("runtime.max_attempts must be > 0"));
        }
        if self.breaker.threshold == 0 {
            return Err(anyhow!("breaker.threshold must be > 0"));
        }
        if self.monitor.poll_interval_secs == 0 {
            return Err(anyhow!("monitor.poll_interval_secs must be > 0"));
        }
        if self.monitor.max_iterations == 0 {
            return Err(anyhow!("monitor.max_iterations must be > 0"));
        }
        if self.pipeline.max_negotiation_rounds == 0 {
            return Err(anyhow!("pipeline.max_negotiation_rounds must be > 0"));
        }
        if self.board.timeout_secs == 0 {
            return Err(anyhow!("board.timeout_secs must be > 0"));
        }
        for (mode, tokens) in &self.limits.max_output_tokens {
            mode.parse::<Mode>()
                .with_context(|| format!("limits.max_output_tokens key '{mode}'"))?;
            if *tokens < MIN_OUTPUT_TOKENS {
                return Err(anyhow!(
                    "limits.max_output_tokens.{mode} must be >= {MIN_OUTPUT_TOKENS}"
                ));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForgeConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForgeConfig> {
    if !path.exists() {
        let cfg = ForgeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForgeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForgeConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}
