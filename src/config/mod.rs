use anyhow::{Context, Result};
use credit_ledger::{ModelPrice, PricingTable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

mod prompts;

pub const DEFAULT_CONFIG_PATH: &str = "mathtop.toml";
pub const TELEGRAM_TOKEN_ENV: &str = "TELEGRAM_BOT_API_KEY";
pub const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    /// Per-model rate overrides, merged over the built-in table.
    #[serde(default)]
    pub pricing: HashMap<String, PriceConfig>,
    #[serde(default)]
    pub recommendation: RecommendationConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_openai_base")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CreditsConfig {
    #[serde(default = "default_initial_tokens")]
    pub initial_tokens: u64,
    #[serde(default = "default_referral_bonus")]
    pub referral_bonus: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelsConfig {
    #[serde(default = "default_chat_model")]
    pub chat: String,
    #[serde(default = "default_image_model")]
    pub image: String,
    #[serde(default = "default_solve_model")]
    pub solve: String,
    #[serde(default = "default_chat_model")]
    pub recommendation: String,
    #[serde(default = "default_embedding_model")]
    pub embedding: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PromptsConfig {
    #[serde(default = "prompts::system")]
    pub system: String,
    #[serde(default = "prompts::image_parse")]
    pub image_parse: String,
    /// `{problem}` is replaced by the parsed problem; otherwise it is appended.
    #[serde(default = "prompts::problem_solve")]
    pub problem_solve: String,
    #[serde(default = "prompts::recommendation")]
    pub recommendation: String,
}

/// Rates in USD per million tokens.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct PriceConfig {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecommendationConfig {
    #[serde(default = "default_recommendation_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_history_len")]
    pub max_messages: usize,
    /// Conversations untouched for this long may be dropped.
    #[serde(default = "default_history_idle_secs")]
    pub idle_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Defaults ────────────────────────────────────────────────────

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_telegram_api(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_base(),
            timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            initial_tokens: default_initial_tokens(),
            referral_bonus: default_referral_bonus(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            chat: default_chat_model(),
            image: default_image_model(),
            solve: default_solve_model(),
            recommendation: default_chat_model(),
            embedding: default_embedding_model(),
        }
    }
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            system: prompts::system(),
            image_parse: prompts::image_parse(),
            problem_solve: prompts::problem_solve(),
            recommendation: prompts::recommendation(),
        }
    }
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            limit: default_recommendation_limit(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_messages: default_history_len(),
            idle_secs: default_history_idle_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_db_path() -> String {
    "~/.mathtop/mathtop.db".to_string()
}

fn default_initial_tokens() -> u64 {
    20_000
}

fn default_referral_bonus() -> u64 {
    5_000
}

fn default_cache_capacity() -> usize {
    credit_ledger::cache::DEFAULT_CACHE_CAPACITY
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_image_model() -> String {
    "gpt-4o".to_string()
}

fn default_solve_model() -> String {
    "gpt-4o".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}

fn default_recommendation_limit() -> usize {
    5
}

fn default_history_len() -> usize {
    20
}

fn default_history_idle_secs() -> u64 {
    6 * 60 * 60
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1:3848".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Loading ─────────────────────────────────────────────────────

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(path);
        let content = fs::read_to_string(expanded_path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load `path`, or fall back to defaults when the default file is absent.
    pub fn load(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path).to_string();
        if path == DEFAULT_CONFIG_PATH && !Path::new(&expanded).exists() {
            debug!("No {DEFAULT_CONFIG_PATH} found, using built-in defaults");
            let mut config = Config::default();
            config.apply_env(|key| std::env::var(key).ok());
            return Ok(config);
        }
        Self::load_from_file(path)
    }

    /// Fill missing secrets from the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.telegram.bot_token.is_none() {
            self.telegram.bot_token = lookup(TELEGRAM_TOKEN_ENV).filter(|v| !v.is_empty());
        }
        if self.openai.api_key.is_none() {
            self.openai.api_key = lookup(OPENAI_KEY_ENV).filter(|v| !v.is_empty());
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("Telegram API base", &self.telegram.api_base),
            ("OpenAI base URL", &self.openai.base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{name} must start with http:// or https://");
            }
        }

        if self.api.bind.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("Invalid bind address: {}", self.api.bind);
        }

        if self.history.max_messages == 0 {
            anyhow::bail!("history.max_messages must be at least 1");
        }

        if self.recommendation.limit == 0 {
            anyhow::bail!("recommendation.limit must be at least 1");
        }

        for (model, price) in &self.pricing {
            if !price.input.is_finite() || !price.output.is_finite() {
                anyhow::bail!("Pricing for {model} must be finite");
            }
        }

        Ok(())
    }

    /// Secrets needed to talk to Telegram and OpenAI.
    pub fn require_secrets(&self) -> Result<(&str, &str)> {
        let telegram = self
            .telegram
            .bot_token
            .as_deref()
            .with_context(|| format!("Missing Telegram bot token (set {TELEGRAM_TOKEN_ENV})"))?;
        let openai = self
            .openai
            .api_key
            .as_deref()
            .with_context(|| format!("Missing OpenAI API key (set {OPENAI_KEY_ENV})"))?;
        Ok((telegram, openai))
    }

    pub fn expand_paths(&mut self) {
        self.database.path = shellexpand::tilde(&self.database.path).to_string();
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database.path)
    }

    pub fn pricing_table(&self) -> PricingTable {
        let overrides: HashMap<String, ModelPrice> = self
            .pricing
            .iter()
            .map(|(model, p)| (model.clone(), ModelPrice::new(p.input, p.output)))
            .collect();
        if !overrides.is_empty() {
            info!("Loaded {} pricing overrides", overrides.len());
        }
        PricingTable::with_overrides(&overrides)
    }
}
