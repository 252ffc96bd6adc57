//! Configuration management
//!
//! JSON configuration file with environment variable support for gateway
//! credentials. Every section has working defaults so a bare config file
//! connects to a local gateway in SIM mode.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from a JSON file, then apply env overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        if let Ok(user) = std::env::var("DTC_USERNAME") {
            config.gateway.username = Some(user);
        }
        if let Ok(pass) = std::env::var("DTC_PASSWORD") {
            config.gateway.password = Some(pass);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot be keyed unambiguously.
    ///
    /// SIM and LIVE scopes on the same account string would collapse into
    /// one row key in the store, so that layout is refused up front.
    pub fn validate(&self) -> Result<()> {
        if let Some(live) = &self.accounts.live_account {
            if live.starts_with(&self.accounts.sim_prefix) {
                anyhow::bail!(
                    "live account '{}' matches the sim prefix '{}'; \
                     one account cannot carry two trading scopes",
                    live,
                    self.accounts.sim_prefix
                );
            }
        }
        if self.resilience.failure_threshold == 0 {
            anyhow::bail!("resilience.failure_threshold must be at least 1");
        }
        if self.router.flush_hz == 0 {
            anyhow::bail!("router.flush_hz must be at least 1");
        }
        Ok(())
    }
}

/// Gateway connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Heartbeat send interval, seconds
    pub heartbeat_interval_secs: u64,
    /// Silence timeout = multiplier x heartbeat interval
    pub silence_multiplier: u32,
    /// Seconds to wait for the logon response
    pub logon_timeout_secs: u64,
    /// DTC protocol version offered at logon
    pub protocol_version: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 11099,
            username: None,
            password: None,
            heartbeat_interval_secs: 10,
            silence_multiplier: 3,
            logon_timeout_secs: 15,
            protocol_version: 8,
        }
    }
}

impl GatewayConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * self.silence_multiplier as u64)
    }

    pub fn logon_timeout(&self) -> Duration {
        Duration::from_secs(self.logon_timeout_secs)
    }
}

/// Account scoping and SIM ledger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsConfig {
    /// Accounts starting with this prefix are SIM scopes
    pub sim_prefix: String,
    /// Exact account identifier of the LIVE scope, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_account: Option<String>,
    /// Starting balance the SIM ledger is derived from
    pub sim_starting_balance: f64,
    /// Dollar value of one point of price movement
    pub point_value: f64,
    /// Round-trip commission charged per contract on SIM closes
    pub commission_per_contract: f64,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        AccountsConfig {
            sim_prefix: "Sim".to_string(),
            live_account: None,
            sim_starting_balance: 100_000.0,
            point_value: 50.0,
            commission_per_contract: 4.5,
        }
    }
}

/// Mode detection and notification coalescing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Two agreeing messages within this window switch the active scope
    pub debounce_window_ms: u64,
    /// How long a persisted "last known mode" stays trustworthy
    pub last_known_mode_ttl_hours: u64,
    /// Presentation flush rate, Hz
    pub flush_hz: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            debounce_window_ms: 750,
            last_known_mode_ttl_hours: 24,
            flush_hz: 10,
        }
    }
}

impl RouterConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn last_known_mode_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.last_known_mode_ttl_hours as i64)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.flush_hz.max(1) as u64)
    }
}

/// Circuit breaker and reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before one trial call is allowed
    pub recovery_timeout_secs: u64,
    /// First reconnect delay, seconds
    pub backoff_base_secs: u64,
    /// Backoff ceiling, seconds
    pub backoff_cap_secs: u64,
    /// Seconds the recovery pull may take before health degrades
    pub recovery_pull_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        ResilienceConfig {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            backoff_base_secs: 1,
            backoff_cap_secs: 60,
            recovery_pull_timeout_secs: 30,
        }
    }
}

impl ResilienceConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn recovery_pull_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_pull_timeout_secs)
    }
}

/// Persistence layout and staleness policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Primary SQLite database path
    pub primary_path: String,
    /// Secondary database path tried when the primary cannot be opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_path: Option<String>,
    /// Open positions untouched longer than this are flagged on recovery
    pub staleness_hours: u64,
    /// Ceiling on the historical fill pull after reconnect
    pub max_lookback_days: u32,
    /// Bounded retries for transactional writes
    pub write_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            primary_path: "state/dtc_bridge.db".to_string(),
            secondary_path: None,
            staleness_hours: 24,
            max_lookback_days: 7,
            write_retries: 3,
        }
    }
}

impl StoreConfig {
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.staleness_hours as i64)
    }
}
