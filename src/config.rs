use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

const DEFAULT_MODEL_API_URL: &str = "http://127.0.0.1:11434/v1/chat/completions";
const DEFAULT_VISION_MODEL: &str = "mistralai/Mistral-Small-3.2-24B-Instruct-2506";
const DEFAULT_TEXT_MODEL: &str = "mistralai/Ministral-3-14B-Instruct-2512";
const DEFAULT_DRIVE_API_URL: &str = "https://www.googleapis.com";

/// Runtime configuration for Rusty Brief.
///
/// The binary loads this once at start-up and hands an `Arc<Config>` to the components that
/// need it; nothing inside the library reads the environment on its own.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenAI-compatible chat-completions endpoint used by both generators.
    pub model_api_url: String,
    /// Optional bearer token sent to the model endpoint.
    pub model_api_token: Option<String>,
    /// Vision-capable model used for page images.
    pub vision_model: String,
    /// Text-only model used for excerpts and collection summaries.
    pub text_model: String,
    /// Route text-only generation to the vision model as well.
    pub use_vision_model_for_all: bool,
    /// Directory holding one checkpoint file per batch.
    pub checkpoint_dir: PathBuf,
    /// Minimum interval between periodic checkpoint writes.
    pub checkpoint_interval: Duration,
    /// Number of items processed concurrently.
    pub batch_workers: usize,
    /// Upper bound applied to every extraction or generation call.
    pub collaborator_timeout: Duration,
    /// Character bound for structured-text excerpts.
    pub text_excerpt_chars: usize,
    /// Token bound for the aggregate text submitted for a container.
    pub aggregate_token_budget: usize,
    /// Maximum container nesting depth.
    pub max_container_depth: usize,
    /// Resolution used when rendering pages to images.
    pub render_dpi: u32,
    /// Base URL of the remote storage API.
    pub drive_api_url: String,
    /// Pre-issued access token for the remote storage API.
    pub drive_access_token: Option<String>,
    /// Language requested from the generators unless a run overrides it.
    pub default_language: String,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_api_url: DEFAULT_MODEL_API_URL.to_string(),
            model_api_token: None,
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            use_vision_model_for_all: false,
            checkpoint_dir: PathBuf::from("data/checkpoints"),
            checkpoint_interval: Duration::from_secs(60),
            batch_workers: 1,
            collaborator_timeout: Duration::from_secs(180),
            text_excerpt_chars: 6000,
            aggregate_token_budget: 6000,
            max_container_depth: 8,
            render_dpi: 100,
            drive_api_url: DEFAULT_DRIVE_API_URL.to_string(),
            drive_access_token: None,
            default_language: "es".to_string(),
            server_port: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    ///
    /// Every variable is optional; unset or blank variables keep the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let batch_workers: usize = parse_env("BATCH_WORKERS", defaults.batch_workers)?;
        if batch_workers == 0 {
            return Err(ConfigError::InvalidValue("BATCH_WORKERS".into()));
        }

        Ok(Self {
            model_api_url: load_env_optional("MODEL_API_URL").unwrap_or(defaults.model_api_url),
            model_api_token: load_env_optional("MODEL_API_TOKEN"),
            vision_model: load_env_optional("VISION_MODEL").unwrap_or(defaults.vision_model),
            text_model: load_env_optional("TEXT_MODEL").unwrap_or(defaults.text_model),
            use_vision_model_for_all: load_env_optional("USE_VISION_MODEL_FOR_ALL")
                .map(|value| parse_bool("USE_VISION_MODEL_FOR_ALL", &value))
                .transpose()?
                .unwrap_or(defaults.use_vision_model_for_all),
            checkpoint_dir: load_env_optional("CHECKPOINT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint_dir),
            checkpoint_interval: Duration::from_secs(parse_env(
                "CHECKPOINT_INTERVAL_SECS",
                defaults.checkpoint_interval.as_secs(),
            )?),
            batch_workers,
            collaborator_timeout: Duration::from_secs(parse_env(
                "COLLABORATOR_TIMEOUT_SECS",
                defaults.collaborator_timeout.as_secs(),
            )?),
            text_excerpt_chars: parse_env("TEXT_EXCERPT_CHARS", defaults.text_excerpt_chars)?,
            aggregate_token_budget: parse_env(
                "AGGREGATE_TOKEN_BUDGET",
                defaults.aggregate_token_budget,
            )?,
            max_container_depth: parse_env("MAX_CONTAINER_DEPTH", defaults.max_container_depth)?,
            render_dpi: parse_env("RENDER_DPI", defaults.render_dpi)?,
            drive_api_url: load_env_optional("DRIVE_API_URL").unwrap_or(defaults.drive_api_url),
            drive_access_token: load_env_optional("DRIVE_ACCESS_TOKEN"),
            default_language: load_env_optional("DEFAULT_LANGUAGE")
                .unwrap_or(defaults.default_language),
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        })
    }

    /// Model used for text-only generation, honoring `USE_VISION_MODEL_FOR_ALL`.
    pub fn effective_text_model(&self) -> &str {
        if self.use_vision_model_for_all {
            &self.vision_model
        } else {
            &self.text_model
        }
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(key.to_string())),
    }
}

/// Load `.env` (when present) and build the configuration, logging the effective values.
pub fn load_config() -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        model_api_url = %config.model_api_url,
        vision_model = %config.vision_model,
        text_model = %config.effective_text_model(),
        checkpoint_dir = %config.checkpoint_dir.display(),
        workers = config.batch_workers,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    Ok(config)
}
