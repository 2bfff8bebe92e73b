use crate::error::ConfigError;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which API docs the model is shown for a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ApiMode {
    /// Only the APIs the conversation uses
    Exact,
    /// Every API in the suites the conversation uses
    Suite,
    /// The whole catalog
    #[default]
    All,
}

/// Serialization used for tool calls and tool responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Native structured function calls
    #[default]
    FunctionCall,
    /// JSON between `<tool_call>` tags
    ToolCallTags,
    /// `FUNCTION_CALL [Name(key=value)]`
    BracketCall,
}

/// Shape of the model endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStyle {
    #[default]
    Chat,
    /// Legacy completions endpoint fed a rendered prompt
    Raw,
}

/// Harness phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EvalMode {
    Predict,
    Evaluate,
    Validate,
}

/// Configuration for one benchmark run
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Directory of conversation files, or a single file
    pub dataset: PathBuf,
    /// API catalog consumed by the predictor, simulator and evaluator
    pub catalog: PathBuf,
    /// Where processed conversations are written, one file each
    pub output_dir: PathBuf,
    #[serde(default)]
    pub api_mode: ApiMode,
    /// Blank out API descriptions while keeping names and parameter shapes
    #[serde(default)]
    pub disable_documentation: bool,
    /// Upper bound on API calls the model may chain for one ground-truth turn
    #[serde(default = "default_max_chained_calls")]
    pub max_chained_calls: usize,
    /// OpenAI-compatible API endpoint
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    #[serde(default = "default_env_var_api_key")]
    pub env_var_api_key: String,
    pub model: String,
    #[serde(default)]
    pub dialect: Dialect,
    #[serde(default)]
    pub completion_style: CompletionStyle,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Rate limit for API requests per second
    #[serde(default = "default_rate_limit")]
    pub rate_limit_rps: f64,
    /// Attempts per model call when the endpoint reports a rate limit
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_wait_secs")]
    pub retry_wait_secs: u64,
}

fn default_max_chained_calls() -> usize {
    8
}

fn default_api_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_env_var_api_key() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_temperature() -> f64 {
    0.0
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_rate_limit() -> f64 {
    10.0
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_wait_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }

    /// Reject settings no conversation could run under
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chained_calls == 0 {
            return Err(ConfigError::ZeroChainBound);
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::ZeroRetryAttempts);
        }
        if self.dialect == Dialect::FunctionCall && self.completion_style == CompletionStyle::Raw {
            return Err(ConfigError::StructuredCallsNeedChat);
        }
        Ok(())
    }

    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.env_var_api_key)
            .map_err(|_| ConfigError::MissingApiKey(self.env_var_api_key.clone()))
    }
}
