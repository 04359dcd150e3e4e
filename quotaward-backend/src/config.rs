use std::env::var;
use std::time::Duration;

use dotenvy::dotenv;

use crate::device_info::DEFAULT_VOLATILE_PATTERN;
use crate::engine::EngineConfig;
use crate::scheduler::SchedulerConfig;

/// Application configuration with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Request body size limit in bytes
    /// Env: REQUEST_BODY_LIMIT (default: 1048576 = 1MB)
    pub request_body_limit: usize,

    /// Request timeout in seconds
    /// Env: REQUEST_TIMEOUT_SECS (default: 30)
    pub request_timeout: Duration,

    /// Server port
    /// Env: PORT (default: 3000)
    pub port: u16,

    /// Database file path
    /// Env: DATABASE_PATH (default: "quotaward.db")
    pub database_path: String,

    /// Ban list refresh period
    /// Env: BAN_REFRESH_SECS (default: 55)
    pub ban_refresh: Duration,

    /// Server settings refresh period
    /// Env: SETTINGS_REFRESH_SECS (default: 55)
    pub settings_refresh: Duration,

    /// Playtime flush and reload period
    /// Env: PLAYTIME_REFRESH_SECS (default: 21600 = 6h)
    pub playtime_refresh: Duration,

    /// How long refreshes keep running after traffic stops
    /// Env: QUIET_GRACE_SECS (default: 900)
    pub quiet_grace: Duration,

    /// Regex of the volatile device-info token stripped before matching
    /// Env: DEVICE_INFO_VOLATILE_PATTERN
    pub device_info_pattern: String,

    /// Bearer token for the admin routes
    /// Env: ADMIN_TOKEN (optional, admin routes reject everything without it)
    pub admin_token: Option<String>,

    /// Requests per second per client IP
    /// Env: RATE_LIMIT_PER_SEC (default: 20, 0 disables rate limiting)
    pub rate_limit_per_sec: u64,

    /// Burst size per client IP
    /// Env: RATE_LIMIT_BURST (default: 40)
    pub rate_limit_burst: u32,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let _ = dotenv(); //for debugging mostly
        let defaults = Self::default();
        Self {
            request_body_limit: env_or_default("REQUEST_BODY_LIMIT", defaults.request_body_limit),
            request_timeout: Duration::from_secs(env_or_default("REQUEST_TIMEOUT_SECS", 30)),
            port: env_or_default("PORT", defaults.port),
            database_path: env_or_default_string("DATABASE_PATH", &defaults.database_path),
            ban_refresh: Duration::from_secs(env_or_default("BAN_REFRESH_SECS", 55)),
            settings_refresh: Duration::from_secs(env_or_default("SETTINGS_REFRESH_SECS", 55)),
            playtime_refresh: Duration::from_secs(env_or_default("PLAYTIME_REFRESH_SECS", 21600)),
            quiet_grace: Duration::from_secs(env_or_default("QUIET_GRACE_SECS", 900)),
            device_info_pattern: env_or_default_string(
                "DEVICE_INFO_VOLATILE_PATTERN",
                DEFAULT_VOLATILE_PATTERN,
            ),
            admin_token: var("ADMIN_TOKEN").ok().filter(|token| !token.is_empty()),
            rate_limit_per_sec: env_or_default("RATE_LIMIT_PER_SEC", defaults.rate_limit_per_sec),
            rate_limit_burst: env_or_default("RATE_LIMIT_BURST", defaults.rate_limit_burst),
        }
    }

    /// Scheduler periods and normalizer pattern for the engine
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            bans: SchedulerConfig {
                period: self.ban_refresh,
                grace: self.quiet_grace,
            },
            settings: SchedulerConfig {
                period: self.settings_refresh,
                grace: self.quiet_grace,
            },
            playtime: SchedulerConfig {
                period: self.playtime_refresh,
                grace: self.quiet_grace,
            },
            device_info_pattern: self.device_info_pattern.clone(),
        }
    }
}

impl Default for Config {
    /// Create configuration with all default values
    fn default() -> Self {
        Self {
            request_body_limit: 1024 * 1024, // 1 MB
            request_timeout: Duration::from_secs(30),
            port: 3000,
            database_path: "quotaward.db".to_string(),
            ban_refresh: Duration::from_secs(55),
            settings_refresh: Duration::from_secs(55),
            playtime_refresh: Duration::from_secs(6 * 60 * 60),
            quiet_grace: Duration::from_secs(15 * 60),
            device_info_pattern: DEFAULT_VOLATILE_PATTERN.to_string(),
            admin_token: None,
            rate_limit_per_sec: 20,
            rate_limit_burst: 40,
        }
    }
}

/// Parse environment variable or return default value
fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Parse environment variable string or return default value
fn env_or_default_string(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|_| default.to_string())
}
