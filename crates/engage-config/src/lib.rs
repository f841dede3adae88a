use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("invalid environment override {key}: {message}")]
    EnvOverride { key: String, message: String },
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub bucket: Bucket,
    #[serde(default)]
    pub quiet_hours: QuietHours,
    #[serde(default)]
    pub recency: Recency,
    #[serde(default)]
    pub transaction: Transaction,
    #[serde(default)]
    pub decision_source: DecisionSource,
    #[serde(default)]
    pub builtin: Builtin,
    #[serde(default)]
    pub audit: Audit,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            sqlite_path: None,
        }
    }
}

/// Token bucket shape shared by every subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
    #[serde(default = "default_refill_tokens")]
    pub refill_tokens: u32,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_interval_ms: default_refill_interval_ms(),
            refill_tokens: default_refill_tokens(),
        }
    }
}

/// Process-wide quiet window; subjects may override the bounds and zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHours {
    #[serde(default = "default_quiet_hours_start")]
    pub start: u8,
    #[serde(default = "default_quiet_hours_end")]
    pub end: u8,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            start: default_quiet_hours_start(),
            end: default_quiet_hours_end(),
            time_zone: default_time_zone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recency {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for Recency {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default = "default_transaction_max_attempts")]
    pub max_attempts: usize,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            max_attempts: default_transaction_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionSource {
    #[serde(default = "default_decision_mode")]
    pub mode: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_decision_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    #[serde(default = "default_fail_mode")]
    pub fail_mode: String,
}

impl Default for DecisionSource {
    fn default() -> Self {
        Self {
            mode: default_decision_mode(),
            endpoint: None,
            timeout_ms: default_decision_timeout_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            fail_mode: default_fail_mode(),
        }
    }
}

/// Heuristic used when `decision_source.mode` is `builtin` or as a fail-mode fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Builtin {
    #[serde(default = "default_message_event_types")]
    pub message_event_types: Vec<String>,
    #[serde(default)]
    pub task_event_types: Vec<String>,
    #[serde(default = "default_message_body")]
    pub message_body: String,
    #[serde(default = "default_task_delay_ms")]
    pub task_delay_ms: u64,
}

impl Default for Builtin {
    fn default() -> Self {
        Self {
            message_event_types: default_message_event_types(),
            task_event_types: Vec::new(),
            message_body: default_message_body(),
            task_delay_ms: default_task_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
}

impl Default for Audit {
    fn default() -> Self {
        Self {
            jsonl_path: "./engage-audit.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_capacity() -> u32 {
    5
}

fn default_refill_interval_ms() -> u64 {
    30 * 60 * 1000
}

fn default_refill_tokens() -> u32 {
    1
}

fn default_quiet_hours_start() -> u8 {
    22
}

fn default_quiet_hours_end() -> u8 {
    8
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

fn default_cooldown_ms() -> u64 {
    30 * 60 * 1000
}

fn default_transaction_max_attempts() -> usize {
    16
}

fn default_decision_mode() -> String {
    "builtin".to_string()
}

fn default_decision_timeout_ms() -> u64 {
    3_000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    2_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_fail_mode() -> String {
    "none".to_string()
}

fn default_message_event_types() -> Vec<String> {
    vec!["drop_nearby".to_string()]
}

fn default_message_body() -> String {
    "Someone left a thought near you.".to_string()
}

fn default_task_delay_ms() -> u64 {
    60 * 60 * 1000
}

fn default_log_level() -> String {
    "info".to_string()
}

pub const ENV_TOKEN_CAPACITY: &str = "ENGAGE_TOKEN_CAPACITY";
pub const ENV_REFILL_INTERVAL_MS: &str = "ENGAGE_REFILL_INTERVAL_MS";
pub const ENV_REFILL_TOKENS: &str = "ENGAGE_REFILL_TOKENS";
pub const ENV_TIME_ZONE: &str = "ENGAGE_TIME_ZONE";
pub const ENV_QUIET_HOURS_START: &str = "ENGAGE_QUIET_HOURS_START";
pub const ENV_QUIET_HOURS_END: &str = "ENGAGE_QUIET_HOURS_END";
pub const ENV_COOLDOWN_MS: &str = "ENGAGE_COOLDOWN_MS";
pub const ENV_LISTEN_ADDR: &str = "ENGAGE_LISTEN_ADDR";

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let mut cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

/// Built-in defaults plus environment overrides, for running without a config file.
pub fn load_from_env() -> Result<Config, ConfigError> {
    let mut cfg = Config::default();
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

pub fn apply_env_overrides<F>(cfg: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup(ENV_TOKEN_CAPACITY) {
        cfg.bucket.capacity = parse_override(ENV_TOKEN_CAPACITY, &v)?;
    }
    if let Some(v) = lookup(ENV_REFILL_INTERVAL_MS) {
        cfg.bucket.refill_interval_ms = parse_override(ENV_REFILL_INTERVAL_MS, &v)?;
    }
    if let Some(v) = lookup(ENV_REFILL_TOKENS) {
        cfg.bucket.refill_tokens = parse_override(ENV_REFILL_TOKENS, &v)?;
    }
    if let Some(v) = lookup(ENV_QUIET_HOURS_START) {
        cfg.quiet_hours.start = parse_override(ENV_QUIET_HOURS_START, &v)?;
    }
    if let Some(v) = lookup(ENV_QUIET_HOURS_END) {
        cfg.quiet_hours.end = parse_override(ENV_QUIET_HOURS_END, &v)?;
    }
    if let Some(v) = lookup(ENV_COOLDOWN_MS) {
        cfg.recency.cooldown_ms = parse_override(ENV_COOLDOWN_MS, &v)?;
    }
    if let Some(v) = lookup(ENV_TIME_ZONE) {
        cfg.quiet_hours.time_zone = v.trim().to_string();
    }
    if let Some(v) = lookup(ENV_LISTEN_ADDR) {
        cfg.server.listen_addr = v.trim().to_string();
    }
    Ok(())
}

fn parse_override<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::EnvOverride {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.bucket.capacity == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "bucket.capacity must be >= 1".to_string(),
        ));
    }
    if cfg.bucket.refill_interval_ms == 0 || cfg.bucket.refill_interval_ms > i64::MAX as u64 {
        return Err(ConfigError::UnsupportedConfig(
            "bucket.refill_interval_ms must be >= 1".to_string(),
        ));
    }
    if cfg.quiet_hours.start > 23 || cfg.quiet_hours.end > 23 {
        return Err(ConfigError::UnsupportedConfig(
            "quiet_hours.start and quiet_hours.end must be within 0..=23".to_string(),
        ));
    }
    if cfg.quiet_hours.start == cfg.quiet_hours.end {
        return Err(ConfigError::UnsupportedConfig(format!(
            "quiet_hours.start and quiet_hours.end are both {}; the window would be empty",
            cfg.quiet_hours.start
        )));
    }
    if cfg.quiet_hours.time_zone.parse::<chrono_tz::Tz>().is_err() {
        return Err(ConfigError::UnsupportedConfig(format!(
            "quiet_hours.time_zone={} is not a known IANA zone",
            cfg.quiet_hours.time_zone
        )));
    }
    if cfg.transaction.max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "transaction.max_attempts must be >= 1".to_string(),
        ));
    }
    match cfg.decision_source.mode.as_str() {
        "builtin" => {}
        "http" => {
            if cfg
                .decision_source
                .endpoint
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "decision_source.endpoint is required when decision_source.mode=http"
                        .to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "decision_source.mode={other} is not implemented; supported: builtin, http"
            )))
        }
    }
    if cfg.decision_source.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "decision_source.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.decision_source.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "decision_source.timeout_ms must be >= 1".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&cfg.decision_source.jitter_factor) {
        return Err(ConfigError::UnsupportedConfig(
            "decision_source.jitter_factor must be within 0.0..=1.0".to_string(),
        ));
    }
    if cfg.decision_source.fail_mode != "none" && cfg.decision_source.fail_mode != "builtin" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "decision_source.fail_mode={} is not implemented; supported: none, builtin",
            cfg.decision_source.fail_mode
        )));
    }
    Ok(())
}
