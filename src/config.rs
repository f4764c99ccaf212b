//! Daemon configuration loaded from `vidrelay.toml`.
//!
//! [`RelayConfig`] holds every tunable. Anything missing from the file falls
//! back to a default. `VIDRELAY_LLM_API_KEY` takes precedence over the file
//! for the provider key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "vidrelay.toml";
const API_KEY_ENV: &str = "VIDRELAY_LLM_API_KEY";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Root of the per-unit working directories.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// `[ingest]`: ingestion tick interval.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// `[publish]`: publication interval, cooldowns and the secondary delay.
    #[serde(default)]
    pub publish: PublishConfig,

    /// `[translation]`: batching, languages and repair.
    #[serde(default)]
    pub translation: TranslationConfig,

    /// `[llm]`: chat-completion endpoint and retry policy.
    #[serde(default)]
    pub llm: LlmConfig,

    /// `[tools]`: external fetch and publish programs.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// `[cover]`: thumbnail sources.
    #[serde(default)]
    pub cover: CoverConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Seconds between ingestion ticks.
    #[serde(default = "default_ingest_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    /// Seconds between publication ticks.
    #[serde(default = "default_publish_interval")]
    pub interval_secs: u64,

    /// Minimum gap between two primary publications.
    #[serde(default = "default_cooldown")]
    pub primary_cooldown_secs: u64,

    /// Minimum gap between two secondary publications.
    #[serde(default = "default_cooldown")]
    pub secondary_cooldown_secs: u64,

    /// How long a unit must sit in primary-published before its secondary phase.
    #[serde(default = "default_cooldown")]
    pub secondary_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslationConfig {
    /// Segments per provider call.
    #[serde(default = "default_group_size")]
    pub group_size: usize,

    /// Concurrent provider calls.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Language named in the translation prompt, e.g. "Simplified Chinese".
    #[serde(default = "default_target_language")]
    pub target_language: String,

    /// Platform language code for the translated caption track.
    #[serde(default = "default_caption_language")]
    pub caption_language: String,

    /// Platform language code for the source caption track.
    #[serde(default = "default_source_caption_language")]
    pub source_caption_language: String,

    /// Problem entries re-translated per repair call.
    #[serde(default = "default_repair_batch_size")]
    pub repair_batch_size: usize,

    /// Pause between repair calls.
    #[serde(default = "default_repair_interval_ms")]
    pub repair_interval_ms: u64,

    /// When false, a translation that still carries placeholders after
    /// repair fails the step instead of being published.
    #[serde(default = "default_true")]
    pub allow_placeholders: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Bearer token. `VIDRELAY_LLM_API_KEY` wins over the file.
    #[serde(default)]
    pub api_key: String,

    /// Per-request HTTP timeout.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Attempts after the first one before a call is reported as failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

/// An external program with `{placeholder}` arguments.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ToolCommand {
    /// Executable name or path, resolved through `PATH`.
    pub program: String,
    /// Arguments with `{key}` placeholders filled per call, e.g. `{dir}` and `{url}` for the fetcher.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Substitutes every `{key}` occurrence in the argument list.
    /// Unknown placeholders are left as-is.
    pub fn render_args(&self, vars: &BTreeMap<&str, String>) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{key}}}"), value)
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    /// Downloads the source video into `{dir}`.
    #[serde(default = "default_fetch_tool")]
    pub fetch: ToolCommand,

    /// Submits the video; prints the platform id on its last stdout line.
    #[serde(default = "default_publish_video_tool")]
    pub publish_video: ToolCommand,

    /// Attaches one caption file to a published video.
    #[serde(default = "default_publish_captions_tool")]
    pub publish_captions: ToolCommand,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoverConfig {
    /// Thumbnail URLs tried in order; `{ref}` is replaced by the source reference.
    #[serde(default = "default_cover_templates")]
    pub url_templates: Vec<String>,

    /// Timeout for each thumbnail download.
    #[serde(default = "default_cover_timeout")]
    pub timeout_secs: u64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("vidrelay.db")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_ingest_interval() -> u64 {
    5
}

fn default_publish_interval() -> u64 {
    300
}

fn default_cooldown() -> u64 {
    3600
}

fn default_group_size() -> usize {
    25
}

fn default_max_workers() -> usize {
    3
}

fn default_target_language() -> String {
    "Simplified Chinese".to_string()
}

fn default_caption_language() -> String {
    "zh-Hans".to_string()
}

fn default_source_caption_language() -> String {
    "en".to_string()
}

fn default_repair_batch_size() -> usize {
    10
}

fn default_repair_interval_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_llm_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_llm_model() -> String {
    "deepseek-chat".to_string()
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_fetch_tool() -> ToolCommand {
    ToolCommand::new(
        "yt-dlp",
        &[
            "-P",
            "{dir}",
            "-o",
            "%(id)s.%(ext)s",
            "--merge-output-format",
            "mp4",
            "{url}",
        ],
    )
}

fn default_publish_video_tool() -> ToolCommand {
    ToolCommand::new(
        "biliup",
        &[
            "upload",
            "--title",
            "{title}",
            "--desc",
            "{description}",
            "--tag",
            "{tags}",
            "--cover",
            "{cover}",
            "{video}",
        ],
    )
}

fn default_publish_captions_tool() -> ToolCommand {
    ToolCommand::new(
        "biliup-subtitle",
        &["--id", "{id}", "--lang", "{lang}", "{file}"],
    )
}

fn default_cover_templates() -> Vec<String> {
    vec![
        "https://img.youtube.com/vi/{ref}/maxresdefault.jpg".to_string(),
        "https://img.youtube.com/vi/{ref}/hqdefault.jpg".to_string(),
    ]
}

fn default_cover_timeout() -> u64 {
    10
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_ingest_interval(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_publish_interval(),
            primary_cooldown_secs: default_cooldown(),
            secondary_cooldown_secs: default_cooldown(),
            secondary_delay_secs: default_cooldown(),
        }
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            group_size: default_group_size(),
            max_workers: default_max_workers(),
            target_language: default_target_language(),
            caption_language: default_caption_language(),
            source_caption_language: default_source_caption_language(),
            repair_batch_size: default_repair_batch_size(),
            repair_interval_ms: default_repair_interval_ms(),
            allow_placeholders: true,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: String::new(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fetch: default_fetch_tool(),
            publish_video: default_publish_video_tool(),
            publish_captions: default_publish_captions_tool(),
        }
    }
}

impl Default for CoverConfig {
    fn default() -> Self {
        Self {
            url_templates: default_cover_templates(),
            timeout_secs: default_cover_timeout(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            work_dir: default_work_dir(),
            ingest: IngestConfig::default(),
            publish: PublishConfig::default(),
            translation: TranslationConfig::default(),
            llm: LlmConfig::default(),
            tools: ToolsConfig::default(),
            cover: CoverConfig::default(),
        }
    }
}

impl PublishConfig {
    pub fn primary_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.primary_cooldown_secs as i64)
    }

    pub fn secondary_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.secondary_cooldown_secs as i64)
    }

    pub fn secondary_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.secondary_delay_secs as i64)
    }
}

impl TranslationConfig {
    pub fn repair_interval(&self) -> Duration {
        Duration::from_millis(self.repair_interval_ms)
    }
}

impl RelayConfig {
    /// Loads `path`, or [`DEFAULT_CONFIG_FILE`] in the working directory.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<RelayConfig>(&contents)?
        } else {
            Self::default()
        };

        let config = config.with_api_key_override(std::env::var(API_KEY_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// A non-empty environment key wins over the file.
    fn with_api_key_override(mut self, key: Option<String>) -> Self {
        if let Some(key) = key.filter(|k| !k.is_empty()) {
            self.llm.api_key = key;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.translation.group_size == 0 {
            bail!("translation.group_size must be at least 1");
        }
        if self.translation.max_workers == 0 {
            bail!("translation.max_workers must be at least 1");
        }
        if self.translation.repair_batch_size == 0 {
            bail!("translation.repair_batch_size must be at least 1");
        }
        if self.ingest.interval_secs == 0 || self.publish.interval_secs == 0 {
            bail!("scheduler intervals must be at least one second");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = RelayConfig::default();
        assert_eq!(config.database_path, PathBuf::from("vidrelay.db"));
        assert_eq!(config.ingest.interval_secs, 5);
        assert_eq!(config.publish.interval_secs, 300);
        assert_eq!(config.publish.secondary_delay_secs, 3600);
        assert_eq!(config.translation.group_size, 25);
        assert_eq!(config.translation.max_workers, 3);
        assert_eq!(config.llm.max_retries, 3);
        assert!(config.llm.api_key.is_empty());
        assert!(config.translation.allow_placeholders);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            work_dir = "/srv/relay"

            [translation]
            group_size = 10

            [llm]
            api_key = "sk-test-123"
            model = "gpt-4o-mini"

            [tools.fetch]
            program = "fake-fetch"
            args = ["{url}"]
        "#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/srv/relay"));
        assert_eq!(config.translation.group_size, 10);
        assert_eq!(config.translation.max_workers, 3);
        assert_eq!(config.llm.api_key, "sk-test-123");
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.timeout_secs, 60);
        assert_eq!(config.tools.fetch, ToolCommand::new("fake-fetch", &["{url}"]));
        assert_eq!(config.tools.publish_video.program, "biliup");
    }

    #[test]
    fn env_key_overrides_file_key() {
        let mut config = RelayConfig::default();
        config.llm.api_key = "from-file".into();

        let config = config.with_api_key_override(Some("from-env".into()));
        assert_eq!(config.llm.api_key, "from-env");

        let config = config.with_api_key_override(Some(String::new()));
        assert_eq!(config.llm.api_key, "from-env");
    }

    #[test]
    fn validate_rejects_zero_group_size() {
        let mut config = RelayConfig::default();
        config.translation.group_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[publish]\ninterval_secs = 60\n").unwrap();

        let config = RelayConfig::load(Some(&path)).unwrap();
        assert_eq!(config.publish.interval_secs, 60);
        assert_eq!(config.publish.primary_cooldown_secs, 3600);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let config = RelayConfig::load(Some(&missing)).unwrap();
        assert_eq!(config.translation.group_size, 25);
    }

    #[test]
    fn render_args_substitutes_placeholders() {
        let tool = ToolCommand::new("up", &["--title", "{title}", "{video}", "{unknown}"]);
        let mut vars = BTreeMap::new();
        vars.insert("title", "Hello".to_string());
        vars.insert("video", "/tmp/a.mp4".to_string());
        assert_eq!(
            tool.render_args(&vars),
            vec!["--title", "Hello", "/tmp/a.mp4", "{unknown}"]
        );
    }
}
