use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Language codes following ISO 639-1 with regional variants
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lang(pub String);

impl Lang {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_auto(&self) -> bool {
        self.0 == "auto"
    }
}

// Serde default functions for common languages
fn default_source_lang() -> Lang {
    Lang::new("auto")
}

fn default_target_lang() -> Lang {
    Lang::new("en")
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Lang {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Lang {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Translator backend configuration for OpenAI-compatible APIs.
///
/// Supports llama.cpp, Ollama, DeepSeek, OpenAI, and any other OpenAI-compatible API.
/// Vision input requires a model that accepts `image_url` content parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Transport-level attempts per request. The scheduler itself never
    /// retries, so this stays at 1 unless explicitly raised.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Request SSE streaming so partial text reaches the UI as it arrives
    #[serde(default = "default_true")]
    pub stream: bool,
}

impl TranslatorConfig {
    /// Create a new translator config
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            api_key,
            model: model.into(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
            stream: true,
        }
    }
}

const fn default_retry_count() -> u32 {
    1
}

const fn default_retry_delay_ms() -> u64 {
    1000
}

const fn default_timeout_secs() -> u64 {
    180
}

const fn default_true() -> bool {
    true
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self::new("http://localhost:8080/v1", None, "default_model")
    }
}

/// Job scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of page jobs in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Request a verification pass after every successful translation
    #[serde(default = "default_true")]
    pub verify_after_translate: bool,

    /// Run the single corrective hop automatically on a severe verification
    #[serde(default)]
    pub auto_fix_severe: bool,
}

const fn default_concurrency() -> usize {
    2
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            verify_after_translate: true,
            auto_fix_severe: false,
        }
    }
}

/// Orchestration policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Pages to prefetch beyond the visible ones
    #[serde(default = "default_prefetch_ahead")]
    pub prefetch_ahead: u32,

    /// Quiet period before a navigation recomputes the prefetch set
    #[serde(default = "default_prefetch_debounce_ms")]
    pub prefetch_debounce_ms: u64,

    /// Poll interval of the translate-all completion watcher
    #[serde(default = "default_translate_all_poll_ms")]
    pub translate_all_poll_ms: u64,
}

const fn default_prefetch_ahead() -> u32 {
    2
}

const fn default_prefetch_debounce_ms() -> u64 {
    250
}

const fn default_translate_all_poll_ms() -> u64 {
    500
}

impl OrchestrationConfig {
    pub const fn prefetch_debounce(&self) -> Duration {
        Duration::from_millis(self.prefetch_debounce_ms)
    }

    pub const fn translate_all_poll(&self) -> Duration {
        Duration::from_millis(self.translate_all_poll_ms)
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            prefetch_ahead: default_prefetch_ahead(),
            prefetch_debounce_ms: default_prefetch_debounce_ms(),
            translate_all_poll_ms: default_translate_all_poll_ms(),
        }
    }
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory (defaults to $XDG_DATA_HOME/page-translator)
    pub root: Option<PathBuf>,

    /// Quiet period before buffered updates are flushed to disk
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,

    /// Corrupted temp files younger than this are kept aside for inspection
    #[serde(default = "default_corrupt_retention_days")]
    pub corrupt_retention_days: u64,

    /// Backup, corrupted and stale siblings are purged after this many days
    #[serde(default = "default_sibling_retention_days")]
    pub sibling_retention_days: u64,

    /// Trash holding folders are purged after this many days
    #[serde(default = "default_trash_retention_days")]
    pub trash_retention_days: u64,
}

const fn default_flush_delay_ms() -> u64 {
    2000
}

const fn default_corrupt_retention_days() -> u64 {
    7
}

const fn default_sibling_retention_days() -> u64 {
    30
}

const fn default_trash_retention_days() -> u64 {
    30
}

const fn days(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(24 * 60 * 60))
}

impl StorageConfig {
    /// Resolve the storage root, falling back to the XDG data directory.
    pub fn root_dir(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(crate::util::default_storage_root)
    }

    pub const fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub const fn corrupt_retention(&self) -> Duration {
        days(self.corrupt_retention_days)
    }

    pub const fn sibling_retention(&self) -> Duration {
        days(self.sibling_retention_days)
    }

    pub const fn trash_retention(&self) -> Duration {
        days(self.trash_retention_days)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            flush_delay_ms: default_flush_delay_ms(),
            corrupt_retention_days: default_corrupt_retention_days(),
            sibling_retention_days: default_sibling_retention_days(),
            trash_retention_days: default_trash_retention_days(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Source language
    #[serde(default = "default_source_lang")]
    pub source_lang: Lang,

    /// Target language
    #[serde(default = "default_target_lang")]
    pub target_lang: Lang,

    /// Translator backend configuration
    #[serde(default)]
    pub translator: TranslatorConfig,

    /// Job scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Orchestration policy configuration
    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    /// Durable store configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source_lang: default_source_lang(),
            target_lang: default_target_lang(),
            translator: TranslatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            orchestration: OrchestrationConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::ConfigLoad(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigLoad(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations, layered lowest to highest priority:
    /// `~/.config/page-translator/config.toml`, `./config.toml`, then
    /// `PAGE_TRANSLATOR__SECTION__KEY` environment variables.
    ///
    /// Falls back to defaults when the layered sources are unusable.
    pub fn load() -> Self {
        match Self::load_layered() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load layered config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    fn load_layered() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(config_dir) = crate::util::config_dir() {
            let user_config = config_dir.join("page-translator").join("config.toml");
            tracing::debug!("Checking user config at {}", user_config.display());
            builder = builder.add_source(config::File::from(user_config).required(false));
        }

        builder = builder
            .add_source(config::File::from(PathBuf::from("config.toml")).required(false))
            .add_source(
                config::Environment::with_prefix("PAGE_TRANSLATOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| Error::ConfigLoad(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler and store cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.concurrency == 0 {
            return Err(Error::ConfigInvalid {
                field: "scheduler.concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.translator.retry_count == 0 {
            return Err(Error::ConfigInvalid {
                field: "translator.retry_count".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.translator.api_base.trim().is_empty() {
            return Err(Error::ConfigInvalid {
                field: "translator.api_base".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Get a human-readable language name for prompts.
pub fn language_name(lang: &Lang) -> &'static str {
    match lang.as_str() {
        "en" => "English",
        "zh-CN" => "Simplified Chinese",
        "zh-TW" => "Traditional Chinese",
        "ja" => "Japanese",
        "ko" => "Korean",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "it" => "Italian",
        "pt" => "Portuguese",
        "ru" => "Russian",
        "la" => "Latin",
        "el" => "Greek",
        "ar" => "Arabic",
        // For unknown languages, the LLM should still understand most ISO codes
        _ => "the specified language",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.concurrency, 2);
        assert_eq!(config.orchestration.prefetch_ahead, 2);
        assert_eq!(config.storage.flush_delay(), Duration::from_secs(2));
        assert_eq!(config.storage.trash_retention(), days(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            target_lang = "de"

            [scheduler]
            concurrency = 4

            [translator]
            api_base = "http://example.invalid/v1"
            model = "vision-large"
            "#,
        )
        .unwrap();

        assert_eq!(config.target_lang.as_str(), "de");
        assert_eq!(config.scheduler.concurrency, 4);
        assert!(config.scheduler.verify_after_translate);
        assert_eq!(config.translator.retry_count, 1);
        assert_eq!(config.storage.sibling_retention_days, 30);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = AppConfig::default();
        config.scheduler.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigInvalid { field, .. }) if field == "scheduler.concurrency"
        ));
    }

    #[test]
    fn test_huge_retention_saturates() {
        let storage = StorageConfig {
            trash_retention_days: u64::MAX,
            ..StorageConfig::default()
        };
        assert_eq!(storage.trash_retention(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_language_name() {
        assert_eq!(language_name(&Lang::new("en")), "English");
        assert_eq!(language_name(&Lang::new("unknown")), "the specified language");
    }
}
