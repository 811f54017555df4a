use serde::Deserialize;
use std::path::PathBuf;

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
    pub identity: IdentityConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub transitions: TransitionsConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub impersonation: ImpersonationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizationConfig {
    /// Base URL of the impersonation endpoint; impersonation is disabled when unset.
    pub url: Option<String>,
    #[serde(default)]
    pub admin_roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_positive_ttl_secs")]
    pub positive_ttl_secs: u64,
    #[serde(default = "default_negative_ttl_secs")]
    pub negative_ttl_secs: u64,
    #[serde(default = "default_refresh_buffer_secs")]
    pub refresh_buffer_secs: u64,
    #[serde(default = "default_race_settle_delay_ms")]
    pub race_settle_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            positive_ttl_secs: default_positive_ttl_secs(),
            negative_ttl_secs: default_negative_ttl_secs(),
            refresh_buffer_secs: default_refresh_buffer_secs(),
            race_settle_delay_ms: default_race_settle_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitionsConfig {
    #[serde(default = "default_transition_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for TransitionsConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_transition_deadline_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_true")]
    pub binding_enabled: bool,
    #[serde(default = "default_grace_window_secs")]
    pub grace_window_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            binding_enabled: true,
            grace_window_secs: default_grace_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImpersonationConfig {
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_preserved_keys")]
    pub preserved_keys: Vec<String>,
}

impl Default for ImpersonationConfig {
    fn default() -> Self {
        Self {
            login_path: default_login_path(),
            preserved_keys: default_preserved_keys(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    pub path: Option<String>,
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    identity_url: Option<String>,
    api_key: Option<String>,
    authorization_url: Option<String>,
    log_level: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_positive_ttl_secs() -> u64 {
    30
}

fn default_negative_ttl_secs() -> u64 {
    3
}

fn default_refresh_buffer_secs() -> u64 {
    60
}

fn default_race_settle_delay_ms() -> u64 {
    500
}

fn default_transition_deadline_secs() -> u64 {
    30
}

fn default_grace_window_secs() -> u64 {
    10
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_preserved_keys() -> Vec<String> {
    vec!["verity.preferences.theme".to_string(), "verity.preferences.locale".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[identity]
url = ""
api_key = ""
# request_timeout_secs = 10

[authorization]
# url = "https://audit.example.com/api/admin/impersonation"
admin_roles = ["admin"]

[session]
positive_ttl_secs = 30
negative_ttl_secs = 3
refresh_buffer_secs = 60
race_settle_delay_ms = 500

[transitions]
deadline_secs = 30

[device]
binding_enabled = true
grace_window_secs = 10

[impersonation]
login_path = "/login"
preserved_keys = ["verity.preferences.theme", "verity.preferences.locale"]

[logging]
level = "info"

[event_bus]
channel_capacity = 1024

[storage]
# path = "~/.local/share/verity/verity.db"
"#;

/// Return the resolved platform-appropriate configuration file path.
#[cfg(feature = "native")]
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "verity", "verity") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Return the platform-appropriate default storage database path.
#[cfg(feature = "native")]
pub fn default_storage_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "verity", "verity") {
        proj_dirs.data_dir().join("verity.db")
    } else {
        PathBuf::from("verity.db")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides. Returns a validated Config or a descriptive error.
#[cfg(feature = "native")]
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. Used by `load_config()` and tests.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly (for testing).
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
                fields: vec!["identity.url".to_string(), "identity.api_key".to_string()],
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

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        identity_url: std::env::var("VERITY_IDENTITY_URL").ok(),
        api_key: std::env::var("VERITY_API_KEY").ok(),
        authorization_url: std::env::var("VERITY_AUTHORIZATION_URL").ok(),
        log_level: std::env::var("VERITY_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(url) = overrides.identity_url {
        config.identity.url = url;
    }
    if let Some(api_key) = overrides.api_key {
        config.identity.api_key = api_key;
    }
    if let Some(url) = overrides.authorization_url {
        config.authorization.url = Some(url);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut missing = Vec::new();

    if config.identity.url.is_empty() {
        missing.push("identity.url".to_string());
    }
    if config.identity.api_key.is_empty() {
        missing.push("identity.api_key".to_string());
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    if !config.identity.url.starts_with("http://") && !config.identity.url.starts_with("https://")
    {
        return Err(ConfigError::InvalidValue {
            field: "identity.url".to_string(),
            message: "must be an http(s) URL".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    if config.session.positive_ttl_secs == 0 {
        return Err(ConfigError::InvalidValue {
            field: "session.positive_ttl_secs".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if config.session.negative_ttl_secs > config.session.positive_ttl_secs {
        return Err(ConfigError::InvalidValue {
            field: "session.negative_ttl_secs".to_string(),
            message: "must not exceed session.positive_ttl_secs".to_string(),
        });
    }

    if config.transitions.deadline_secs == 0 {
        return Err(ConfigError::InvalidValue {
            field: "transitions.deadline_secs".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if !config.impersonation.login_path.starts_with('/') {
        return Err(ConfigError::InvalidValue {
            field: "impersonation.login_path".to_string(),
            message: "must be an absolute path".to_string(),
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
