use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::UserId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub feed: FeedConfig,
}

impl Config {
    /// The signed-in user. Present on every validated config.
    pub fn user_id(&self) -> Result<UserId, ConfigError> {
        self.session
            .user_id
            .ok_or_else(|| ConfigError::MissingRequiredFields {
                fields: vec!["session.user_id".to_string()],
            })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncConfig {
    /// Messages per history page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Upper bound for a single gateway call.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Coalescing window for channel-list reloads triggered by membership events.
    #[serde(default = "default_reload_debounce_ms")]
    pub reload_debounce_ms: u64,
    #[serde(default)]
    pub optimistic_send: bool,
    /// Merge each channel's latest message after `load_channels`.
    #[serde(default = "default_true")]
    pub load_previews: bool,
}

impl SyncConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            reload_debounce_ms: default_reload_debounce_ms(),
            optimistic_send: false,
            load_previews: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl FeedConfig {
    /// Delay before resubscribe attempt `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    user_id: Option<String>,
    log_level: Option<String>,
    page_size: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> usize {
    50
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_reload_debounce_ms() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

pub(crate) const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[session]
# user_id = "00000000-0000-0000-0000-000000000000"

[sync]
page_size = 50
fetch_timeout_ms = 10000
reload_debounce_ms = 250
optimistic_send = false
load_previews = true

[logging]
level = "info"
with_target = false

[feed]
channel_capacity = 1024
initial_backoff_ms = 500
max_backoff_ms = 30000
"#;

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "parley", "parley") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides. Returns a validated Config or a descriptive error.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: PathBuf,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(&path)?;
            return Err(ConfigError::MissingRequiredFields {
                fields: vec!["session.user_id".to_string()],
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides)?;
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        user_id: std::env::var("PARLEY_USER_ID").ok(),
        log_level: std::env::var("PARLEY_LOG_LEVEL").ok(),
        page_size: std::env::var("PARLEY_PAGE_SIZE").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) -> Result<(), ConfigError> {
    if let Some(user_id) = overrides.user_id {
        let parsed = user_id
            .trim()
            .parse::<UserId>()
            .map_err(|e| ConfigError::InvalidValue {
                field: "session.user_id".to_string(),
                message: e.to_string(),
            })?;
        config.session.user_id = Some(parsed);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
    if let Some(page_size) = overrides.page_size {
        config.sync.page_size =
            page_size
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "sync.page_size".to_string(),
                    message: format!("not a number: {page_size}"),
                })?;
    }
    Ok(())
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.session.user_id.is_none() {
        return Err(ConfigError::MissingRequiredFields {
            fields: vec!["session.user_id".to_string()],
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    if config.sync.page_size == 0 {
        return Err(ConfigError::InvalidValue {
            field: "sync.page_size".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    if config.sync.fetch_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "sync.fetch_timeout_ms".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    if config.feed.channel_capacity == 0 {
        return Err(ConfigError::InvalidValue {
            field: "feed.channel_capacity".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    if config.feed.initial_backoff_ms > config.feed.max_backoff_ms {
        return Err(ConfigError::InvalidValue {
            field: "feed.initial_backoff_ms".to_string(),
            message: "must not exceed feed.max_backoff_ms".to_string(),
        });
    }

    Ok(())
}

fn create_default_config(path: &PathBuf) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const USER: &str = "6f1c1a52-2d7e-4c57-9a43-0f3f3c1b6a10";

    fn parse_without_env(toml_str: &str) -> Result<Config, ConfigError> {
        load_config_from_str_with_overrides(toml_str, ConfigOverrides::default())
    }

    fn minimal_toml() -> String {
        format!("[session]\nuser_id = \"{USER}\"\n")
    }

    // ── Parsing ───────────────────────────────────────────────────

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = parse_without_env(&minimal_toml()).unwrap();
        assert_eq!(config.user_id().unwrap().to_string(), USER);
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.sync.reload_debounce(), Duration::from_millis(250));
        assert!(!config.sync.optimistic_send);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.feed.channel_capacity, 1024);
    }

    #[test]
    fn default_file_contents_parse_once_user_is_set() {
        let toml = DEFAULT_CONFIG_TOML.replace(
            "# user_id = \"00000000-0000-0000-0000-000000000000\"",
            &format!("user_id = \"{USER}\""),
        );
        let config = parse_without_env(&toml).unwrap();
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.feed, FeedConfig::default());
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn parses_sync_section() {
        let toml = format!(
            r#"{}
[sync]
page_size = 20
fetch_timeout_ms = 1500
optimistic_send = true
load_previews = false
"#,
            minimal_toml()
        );
        let config = parse_without_env(&toml).unwrap();
        assert_eq!(config.sync.page_size, 20);
        assert_eq!(config.sync.fetch_timeout(), Duration::from_millis(1500));
        assert!(config.sync.optimistic_send);
        assert!(!config.sync.load_previews);
        assert_eq!(config.sync.reload_debounce_ms, 250);
    }

    // ── Validation ────────────────────────────────────────────────

    #[test]
    fn rejects_missing_user() {
        let err = parse_without_env("[sync]\npage_size = 10\n").unwrap_err();
        match err {
            ConfigError::MissingRequiredFields { fields } => {
                assert_eq!(fields, vec!["session.user_id".to_string()]);
            }
            other => panic!("expected MissingRequiredFields, got: {other}"),
        }
    }

    #[test]
    fn rejects_malformed_user_id() {
        let err = parse_without_env("[session]\nuser_id = \"not-a-uuid\"\n").unwrap_err();
        assert_matches!(err, ConfigError::InvalidToml { .. });
    }

    #[test]
    fn rejects_zero_page_size() {
        let toml = format!("{}\n[sync]\npage_size = 0\n", minimal_toml());
        let err = parse_without_env(&toml).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { field, .. } if field == "sync.page_size");
    }

    #[test]
    fn rejects_inverted_backoff() {
        let toml = format!(
            "{}\n[feed]\ninitial_backoff_ms = 5000\nmax_backoff_ms = 100\n",
            minimal_toml()
        );
        let err = parse_without_env(&toml).unwrap_err();
        assert_matches!(
            err,
            ConfigError::InvalidValue { field, .. } if field == "feed.initial_backoff_ms"
        );
    }

    #[test]
    fn rejects_invalid_log_level() {
        let toml = format!("{}\n[logging]\nlevel = \"verbose\"\n", minimal_toml());
        let err = parse_without_env(&toml).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { field, .. } if field == "logging.level");
    }

    #[test]
    fn accepts_all_valid_log_levels() {
        for level in VALID_LOG_LEVELS {
            let toml = format!("{}\n[logging]\nlevel = \"{level}\"\n", minimal_toml());
            parse_without_env(&toml).unwrap();
        }
    }

    #[test]
    fn invalid_toml_reports_position() {
        let toml = format!("{}bad_line ===\n", minimal_toml());
        let err = parse_without_env(&toml).unwrap_err();
        match err {
            ConfigError::InvalidToml { line, .. } => assert_eq!(line, 3),
            other => panic!("expected InvalidToml, got: {other}"),
        }
    }

    // ── Environment variable overrides ────────────────────────────

    #[test]
    fn env_override_supplies_user() {
        let overrides = ConfigOverrides {
            user_id: Some(USER.to_string()),
            ..Default::default()
        };
        let config = load_config_from_str_with_overrides("", overrides).unwrap();
        assert_eq!(config.user_id().unwrap().to_string(), USER);
    }

    #[test]
    fn env_override_rejects_bad_user() {
        let overrides = ConfigOverrides {
            user_id: Some("nope".to_string()),
            ..Default::default()
        };
        let err = load_config_from_str_with_overrides("", overrides).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { field, .. } if field == "session.user_id");
    }

    #[test]
    fn env_overrides_take_precedence() {
        let toml = format!(
            "{}\n[logging]\nlevel = \"warn\"\n[sync]\npage_size = 10\n",
            minimal_toml()
        );
        let overrides = ConfigOverrides {
            user_id: None,
            log_level: Some("trace".to_string()),
            page_size: Some("25".to_string()),
        };
        let config = load_config_from_str_with_overrides(&toml, overrides).unwrap();
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.sync.page_size, 25);
    }

    #[test]
    fn env_override_page_size_must_be_numeric() {
        let overrides = ConfigOverrides {
            page_size: Some("lots".to_string()),
            ..Default::default()
        };
        let err = load_config_from_str_with_overrides(&minimal_toml(), overrides).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { field, .. } if field == "sync.page_size");
    }

    // ── Backoff ───────────────────────────────────────────────────

    #[test]
    fn backoff_doubles_and_caps() {
        let feed = FeedConfig {
            channel_capacity: 16,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        assert_eq!(feed.backoff(0), Duration::from_millis(100));
        assert_eq!(feed.backoff(1), Duration::from_millis(200));
        assert_eq!(feed.backoff(3), Duration::from_millis(800));
        assert_eq!(feed.backoff(4), Duration::from_millis(1000));
        assert_eq!(feed.backoff(200), Duration::from_millis(1000));
    }

    // ── File-based loading ────────────────────────────────────────

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, minimal_toml()).unwrap();

        let config = load_config_from_with_overrides(path, ConfigOverrides::default()).unwrap();
        assert_eq!(config.user_id().unwrap().to_string(), USER);
    }

    #[test]
    fn missing_file_creates_default_and_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subdir").join("config.toml");

        let err =
            load_config_from_with_overrides(path.clone(), ConfigOverrides::default()).unwrap_err();
        assert_matches!(err, ConfigError::MissingRequiredFields { .. });

        assert!(path.exists(), "default config should have been created");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[session]"));
        assert!(contents.contains("[feed]"));
    }

    #[test]
    fn config_path_ends_with_config_toml() {
        let path = config_path();
        assert!(
            path.ends_with("config.toml"),
            "config_path should end with config.toml, got: {path:?}"
        );
    }
}
