use std::{collections::HashMap, fs, path::Path, time::Duration};

use chrono_tz::Tz;
use once_cell::sync::Lazy;
use rand::{distr::Alphanumeric, rng, Rng};
use serde::{Deserialize, Serialize};

// --- START RELAY CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Extra attempts after the first channel fails with a retriable error.
    pub retry_times: u32,
    pub non_stream_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub stream_hard_cap_secs: u64,
    /// Model name prefixes whose streams get a doubled idle timeout.
    pub reasoning_model_prefixes: Vec<String>,
    pub pass_through_upstream_status: bool,
    pub cooldown_secs: u64,
    pub auto_disable_channel: bool,
    pub record_error_log: bool,
    pub sensitive_words: Vec<String>,
    pub sync_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_times: 2,
            non_stream_timeout_secs: 30,
            stream_idle_timeout_secs: 30,
            stream_hard_cap_secs: 600,
            reasoning_model_prefixes: vec![
                "o1".to_string(),
                "o3".to_string(),
                "o4".to_string(),
                "gpt-5".to_string(),
                "deepseek-r1".to_string(),
                "deepseek-reasoner".to_string(),
            ],
            pass_through_upstream_status: false,
            cooldown_secs: 30,
            auto_disable_channel: true,
            record_error_log: true,
            sensitive_words: Vec::new(),
            sync_interval_secs: 60,
        }
    }
}

impl RelayConfig {
    pub fn stream_idle_timeout(&self, upstream_model: &str) -> Duration {
        let base = Duration::from_secs(self.stream_idle_timeout_secs);
        let lower = upstream_model.to_ascii_lowercase();
        let is_reasoning = self
            .reasoning_model_prefixes
            .iter()
            .any(|prefix| lower.starts_with(prefix.as_str()) || lower.contains(&format!("/{prefix}")));
        if is_reasoning { base * 2 } else { base }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRelayConfig {
    pub retry_times: Option<u32>,
    pub non_stream_timeout_secs: Option<u64>,
    pub stream_idle_timeout_secs: Option<u64>,
    pub stream_hard_cap_secs: Option<u64>,
    pub reasoning_model_prefixes: Option<Vec<String>>,
    pub pass_through_upstream_status: Option<bool>,
    pub cooldown_secs: Option<u64>,
    pub auto_disable_channel: Option<bool>,
    pub record_error_log: Option<bool>,
    pub sensitive_words: Option<Vec<String>>,
    pub sync_interval_secs: Option<u64>,
}

impl PartialRelayConfig {
    fn merge_into(self, final_config: &mut RelayConfig) {
        if let Some(v) = self.retry_times { final_config.retry_times = v; }
        if let Some(v) = self.non_stream_timeout_secs { final_config.non_stream_timeout_secs = v; }
        if let Some(v) = self.stream_idle_timeout_secs { final_config.stream_idle_timeout_secs = v; }
        if let Some(v) = self.stream_hard_cap_secs { final_config.stream_hard_cap_secs = v; }
        if let Some(v) = self.reasoning_model_prefixes { final_config.reasoning_model_prefixes = v; }
        if let Some(v) = self.pass_through_upstream_status { final_config.pass_through_upstream_status = v; }
        if let Some(v) = self.cooldown_secs { final_config.cooldown_secs = v; }
        if let Some(v) = self.auto_disable_channel { final_config.auto_disable_channel = v; }
        if let Some(v) = self.record_error_log { final_config.record_error_log = v; }
        if let Some(v) = self.sensitive_words { final_config.sensitive_words = v; }
        if let Some(v) = self.sync_interval_secs { final_config.sync_interval_secs = v; }
    }
}

// --- START QUOTA & RATIO CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Quota units per one USD of model price.
    pub quota_per_unit: f64,
    /// Pre-consume is skipped when both balances exceed this multiple of the estimate.
    pub trust_multiplier: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            quota_per_unit: 500_000.0,
            trust_multiplier: 100,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialQuotaConfig {
    pub quota_per_unit: Option<f64>,
    pub trust_multiplier: Option<i64>,
}

impl PartialQuotaConfig {
    fn merge_into(self, final_config: &mut QuotaConfig) {
        if let Some(v) = self.quota_per_unit { final_config.quota_per_unit = v; }
        if let Some(v) = self.trust_multiplier { final_config.trust_multiplier = v; }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatioConfig {
    pub default_model_ratio: f64,
    pub default_completion_ratio: f64,
    pub default_cache_ratio: f64,
    pub model_ratio: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    pub cache_ratio: HashMap<String, f64>,
    /// USD per call. Models listed here are priced per call instead of per token.
    pub model_price: HashMap<String, f64>,
    pub group_ratio: HashMap<String, f64>,
    /// user group -> using group -> ratio
    pub group_special_ratio: HashMap<String, HashMap<String, f64>>,
}

impl Default for RatioConfig {
    fn default() -> Self {
        let model_ratio = HashMap::from([
            ("gpt-4o".to_string(), 1.25),
            ("gpt-4o-mini".to_string(), 0.075),
            ("claude-sonnet-4-5".to_string(), 1.5),
            ("gemini-2.5-pro".to_string(), 0.625),
            ("deepseek-chat".to_string(), 0.135),
        ]);
        let completion_ratio = HashMap::from([
            ("gpt-4o".to_string(), 4.0),
            ("gpt-4o-mini".to_string(), 4.0),
            ("claude-sonnet-4-5".to_string(), 5.0),
            ("gemini-2.5-pro".to_string(), 8.0),
            ("deepseek-chat".to_string(), 4.0),
        ]);
        let model_price = HashMap::from([
            ("dall-e-3".to_string(), 0.04),
            ("wanx2.1-t2v-plus".to_string(), 0.1),
        ]);
        Self {
            default_model_ratio: 1.0,
            default_completion_ratio: 1.0,
            default_cache_ratio: 1.0,
            model_ratio,
            completion_ratio,
            cache_ratio: HashMap::new(),
            model_price,
            group_ratio: HashMap::from([("default".to_string(), 1.0)]),
            group_special_ratio: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRatioConfig {
    pub default_model_ratio: Option<f64>,
    pub default_completion_ratio: Option<f64>,
    pub default_cache_ratio: Option<f64>,
    pub model_ratio: Option<HashMap<String, f64>>,
    pub completion_ratio: Option<HashMap<String, f64>>,
    pub cache_ratio: Option<HashMap<String, f64>>,
    pub model_price: Option<HashMap<String, f64>>,
    pub group_ratio: Option<HashMap<String, f64>>,
    pub group_special_ratio: Option<HashMap<String, HashMap<String, f64>>>,
}

impl PartialRatioConfig {
    fn merge_into(self, final_config: &mut RatioConfig) {
        if let Some(v) = self.default_model_ratio { final_config.default_model_ratio = v; }
        if let Some(v) = self.default_completion_ratio { final_config.default_completion_ratio = v; }
        if let Some(v) = self.default_cache_ratio { final_config.default_cache_ratio = v; }
        if let Some(v) = self.model_ratio { final_config.model_ratio = v; }
        if let Some(v) = self.completion_ratio { final_config.completion_ratio = v; }
        if let Some(v) = self.cache_ratio { final_config.cache_ratio = v; }
        if let Some(v) = self.model_price { final_config.model_price = v; }
        if let Some(v) = self.group_ratio { final_config.group_ratio = v; }
        if let Some(v) = self.group_special_ratio { final_config.group_special_ratio = v; }
    }
}

// --- START TASK CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub max_lifetime_secs: i64,
    pub query_timeout_secs: u64,
    /// Models that are submitted without estimate or billing.
    pub free_models: Vec<String>,
    /// Billing units assumed when an upstream estimate is unavailable.
    pub default_units: f64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 30,
            batch_size: 50,
            max_concurrent: 100,
            max_lifetime_secs: 24 * 3600,
            query_timeout_secs: 30,
            free_models: Vec::new(),
            default_units: 1.0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialTaskConfig {
    pub enabled: Option<bool>,
    pub poll_interval_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_concurrent: Option<usize>,
    pub max_lifetime_secs: Option<i64>,
    pub query_timeout_secs: Option<u64>,
    pub free_models: Option<Vec<String>>,
    pub default_units: Option<f64>,
}

impl PartialTaskConfig {
    fn merge_into(self, final_config: &mut TaskConfig) {
        if let Some(v) = self.enabled { final_config.enabled = v; }
        if let Some(v) = self.poll_interval_secs { final_config.poll_interval_secs = v; }
        if let Some(v) = self.batch_size { final_config.batch_size = v.max(1); }
        if let Some(v) = self.max_concurrent { final_config.max_concurrent = v.max(1); }
        if let Some(v) = self.max_lifetime_secs { final_config.max_lifetime_secs = v; }
        if let Some(v) = self.query_timeout_secs { final_config.query_timeout_secs = v; }
        if let Some(v) = self.free_models { final_config.free_models = v; }
        if let Some(v) = self.default_units { final_config.default_units = v; }
    }
}

// --- START PIPELINE CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogWriterConfig {
    pub flush_interval_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for LogWriterConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1000,
            shutdown_grace_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialLogWriterConfig {
    pub flush_interval_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub queue_capacity: usize,
    pub workers: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8192,
            workers: 4,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialAggregatorConfig {
    pub queue_capacity: Option<usize>,
    pub workers: Option<usize>,
}

/// Token lookup cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl: u64,
    pub negative_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: 60,
            negative_ttl: 10,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl)
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialCacheConfig {
    pub ttl: Option<u64>,
    pub negative_ttl: Option<u64>,
}

// Used for deserializing user-provided config files where all fields are optional.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub base_path: Option<String>,
    pub jwt_secret: Option<String>,
    pub admin_key: Option<String>,
    pub db_url: Option<String>,
    pub proxy: Option<String>,
    pub log_level: Option<String>,
    pub timezone: Option<String>,
    pub language: Option<String>,
    pub bootstrap_file: Option<String>,
    pub relay: Option<PartialRelayConfig>,
    pub quota: Option<PartialQuotaConfig>,
    pub ratio: Option<PartialRatioConfig>,
    pub task: Option<PartialTaskConfig>,
    pub log_writer: Option<PartialLogWriterConfig>,
    pub aggregator: Option<PartialAggregatorConfig>,
    pub cache: Option<PartialCacheConfig>,
}

impl PartialConfig {
    /// Merges the fields of this partial config into a final config, overwriting existing values.
    fn merge_into(self, final_config: &mut FinalConfig) {
        if let Some(host) = self.host { final_config.host = host; }
        if let Some(port) = self.port { final_config.port = port; }
        if let Some(base_path) = self.base_path { final_config.base_path = base_path; }
        if let Some(jwt_secret) = self.jwt_secret { final_config.jwt_secret = jwt_secret; }
        if let Some(admin_key) = self.admin_key { final_config.admin_key = admin_key; }
        if let Some(db_url) = self.db_url { final_config.db_url = db_url; }
        if let Some(proxy) = self.proxy { final_config.proxy = Some(proxy); }
        if let Some(log_level) = self.log_level { final_config.log_level = log_level; }
        if let Some(timezone) = self.timezone { final_config.timezone = Some(timezone); }
        if let Some(language) = self.language { final_config.language = language; }
        if let Some(bootstrap_file) = self.bootstrap_file { final_config.bootstrap_file = Some(bootstrap_file); }
        if let Some(relay) = self.relay {
            relay.merge_into(&mut final_config.relay);
        }
        if let Some(quota) = self.quota {
            quota.merge_into(&mut final_config.quota);
        }
        if let Some(ratio) = self.ratio {
            ratio.merge_into(&mut final_config.ratio);
        }
        if let Some(task) = self.task {
            task.merge_into(&mut final_config.task);
        }
        if let Some(log_writer) = self.log_writer {
            if let Some(v) = log_writer.flush_interval_ms { final_config.log_writer.flush_interval_ms = v.max(10); }
            if let Some(v) = log_writer.shutdown_grace_ms { final_config.log_writer.shutdown_grace_ms = v; }
        }
        if let Some(aggregator) = self.aggregator {
            if let Some(v) = aggregator.queue_capacity { final_config.aggregator.queue_capacity = v.max(1); }
            if let Some(v) = aggregator.workers { final_config.aggregator.workers = v.max(1); }
        }
        if let Some(cache) = self.cache {
            if let Some(v) = cache.ttl { final_config.cache.ttl = v; }
            if let Some(v) = cache.negative_ttl { final_config.cache.negative_ttl = v; }
        }
    }
}

// The fully resolved configuration used by the application.
// This is also the format for the default configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FinalConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
    pub jwt_secret: String,
    /// Exchanged for an admin JWT at `/api/auth/login`.
    pub admin_key: String,
    /// `memory`, a sqlite file path, or a `postgres://` url.
    pub db_url: String,
    pub proxy: Option<String>,
    pub log_level: String,
    pub timezone: Option<String>,
    pub language: String,
    pub bootstrap_file: Option<String>,
    pub relay: RelayConfig,
    pub quota: QuotaConfig,
    pub ratio: RatioConfig,
    pub task: TaskConfig,
    pub log_writer: LogWriterConfig,
    pub aggregator: AggregatorConfig,
    pub cache: CacheConfig,
}

impl Default for FinalConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            base_path: String::new(),
            jwt_secret: generate_random_string(48),
            admin_key: generate_random_string(32),
            db_url: "./storage/relay.db".to_string(),
            proxy: None,
            log_level: "info".to_string(),
            timezone: None,
            language: "en".to_string(),
            bootstrap_file: None,
            relay: RelayConfig::default(),
            quota: QuotaConfig::default(),
            ratio: RatioConfig::default(),
            task: TaskConfig::default(),
            log_writer: LogWriterConfig::default(),
            aggregator: AggregatorConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl FinalConfig {
    /// Time zone used for daily log tables. Falls back to UTC on unknown names.
    pub fn tz(&self) -> Tz {
        self.timezone
            .as_deref()
            .and_then(|name| name.parse::<Tz>().ok())
            .unwrap_or(Tz::UTC)
    }
}

fn generate_random_string(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn get_env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn get_config_from_env() -> PartialConfig {
    PartialConfig {
        host: get_env_var("HOST"),
        port: get_env_var("PORT"),
        base_path: get_env_var("BASE_PATH"),
        jwt_secret: get_env_var("JWT_SECRET"),
        admin_key: get_env_var("ADMIN_KEY"),
        db_url: get_env_var("DB_URL"),
        proxy: get_env_var("PROXY"),
        log_level: get_env_var("LOG_LEVEL"),
        timezone: get_env_var("TIMEZONE"),
        language: get_env_var("LANGUAGE"),
        bootstrap_file: get_env_var("BOOTSTRAP_FILE"),
        ..Default::default()
    }
}

fn load_partial(path: &Path) -> Option<PartialConfig> {
    let config_str = fs::read_to_string(path).ok()?;
    let partial: PartialConfig = serde_yaml::from_str(&config_str)
        .unwrap_or_else(|e| panic!("Failed to parse configuration file at {:?}: {}", path, e));
    Some(partial)
}

pub static CONFIG: Lazy<FinalConfig> = Lazy::new(|| {
    let default_config_path = Path::new("config.default.yaml");
    let user_config_path = if Path::new("config.local.yaml").exists() {
        Path::new("config.local.yaml")
    } else {
        Path::new("config.yaml")
    };

    let mut effective_default_config = FinalConfig::default();
    if let Some(file_defaults) = load_partial(default_config_path) {
        file_defaults.merge_into(&mut effective_default_config);
    }

    // Write the defaults back so new fields show up in config.default.yaml.
    match serde_yaml::to_string(&effective_default_config) {
        Ok(yaml_str) => {
            if let Err(err) = fs::write(default_config_path, yaml_str) {
                eprintln!("failed to write default configuration file: {}", err);
            }
        }
        Err(err) => eprintln!("failed to serialize default configuration: {}", err),
    }

    let mut final_config = effective_default_config;
    if let Some(user_config) = load_partial(user_config_path) {
        user_config.merge_into(&mut final_config);
    }

    get_config_from_env().merge_into(&mut final_config);

    final_config
});
