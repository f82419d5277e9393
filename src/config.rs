use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Service settings. Every flag can also come from the environment (or a
/// `.env` file loaded at startup).
#[derive(Debug, Clone, Parser)]
#[command(name = "webagent-solver", version, about = "Plans browser actions for web tasks")]
pub struct Config {
    #[arg(long, env = "API_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Chat-completions endpoint used when an API key is configured.
    #[arg(long, env = "LLM_API_URL", default_value = "https://api.chutes.ai/v1/chat/completions")]
    pub llm_api_url: String,

    /// Enables the LLM planner when non-empty.
    #[arg(long, env = "LLM_API_KEY", default_value = "", hide_env_values = true)]
    pub llm_api_key: String,

    #[arg(long, env = "LLM_MODEL", default_value = "gpt-4o-mini")]
    pub llm_model: String,

    #[arg(long, env = "LLM_TIMEOUT_SECS", default_value_t = 30)]
    pub llm_timeout_secs: u64,

    /// Directory holding the selector outcome files.
    #[arg(long = "data-dir", env = "LEARNING_DATA_DIR", default_value = ".")]
    pub learning_data_dir: PathBuf,

    /// Persist learning data after this many recorded outcomes.
    #[arg(long, env = "CHECKPOINT_EVERY", default_value_t = 10)]
    pub checkpoint_every: u32,

    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = 3600)]
    pub cache_ttl_secs: u64,

    /// Zero disables the plan cache.
    #[arg(long, env = "CACHE_CAPACITY", default_value_t = 100)]
    pub cache_capacity: usize,

    /// Classify callers by the first `X-Forwarded-For` entry.
    #[arg(long, env = "TRUST_FORWARDED_FOR", default_value_t = false)]
    pub trust_forwarded_for: bool,

    /// Fallback filter when `RUST_LOG` is unset.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Host and port to bind. The host may be a name such as `localhost`.
    pub fn listen_target(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }

    pub fn llm_enabled(&self) -> bool {
        !self.llm_api_key.trim().is_empty()
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs.max(1))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
