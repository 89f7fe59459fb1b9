//! Configuration loading and validation

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::Credentials;
use crate::execution::ExecutorSettings;
use crate::pipeline::StaticWhitelist;
use crate::retry::RetryPolicy;
use crate::risk::{PremiumTable, RiskLimits};
use crate::session::SessionPolicy;

/// Environment variable prefix, e.g. `RELAY__RISK__MAX_LOTS_PER_ORDER=5`
pub const ENV_PREFIX: &str = "RELAY";

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub senders: SendersConfig,
    #[serde(default)]
    pub instruments: InstrumentsConfig,
    /// Approximate premium per unit, keyed by underlying
    #[serde(default = "default_premiums")]
    pub premiums: HashMap<String, Decimal>,
    #[serde(default)]
    pub positions: PositionsConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_lots")]
    pub max_lots_per_order: u32,
    /// Rupees
    #[serde(default = "default_max_order_value")]
    pub max_order_value: Decimal,
    #[serde(default = "default_allowed_underlyings")]
    pub allowed_underlyings: Vec<String>,
    #[serde(default = "default_lot_sizes")]
    pub lot_sizes: HashMap<String, u32>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_lots_per_order: default_max_lots(),
            max_order_value: default_max_order_value(),
            allowed_underlyings: default_allowed_underlyings(),
            lot_sizes: default_lot_sizes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Refresh this long before token expiry
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: default_safety_margin_secs(),
            login_timeout_ms: default_login_timeout_ms(),
            cooldown_secs: default_cooldown_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    #[serde(default = "default_token_wait_ms")]
    pub token_wait_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Pending messages per sender before dispatch applies backpressure
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Seconds a sender's worker waits for a message before retiring
    #[serde(default = "default_worker_idle_secs")]
    pub worker_idle_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            submit_timeout_ms: default_submit_timeout_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            token_wait_ms: default_token_wait_ms(),
            retry: RetryPolicy::default(),
            queue_capacity: default_queue_capacity(),
            worker_idle_secs: default_worker_idle_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    /// Re-deliveries within one bucket collapse to one order
    #[serde(default = "default_bucket_secs")]
    pub bucket_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            bucket_secs: default_bucket_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendersConfig {
    #[serde(default)]
    pub allowed: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstrumentsConfig {
    /// JSON instrument master, one row per contract
    #[serde(default)]
    pub master_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PositionsConfig {
    #[serde(default)]
    pub persistence_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub client_code: String,
    #[serde(default)]
    pub totp_secret: String,
    /// Token lifetime granted by the paper broker
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default)]
    pub paper_latency_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            client_code: String::new(),
            totp_secret: String::new(),
            token_ttl_secs: default_token_ttl_secs(),
            paper_latency_ms: 0,
        }
    }
}

// Default value functions
fn default_max_lots() -> u32 { 10 }
fn default_max_order_value() -> Decimal { dec!(100000) }
fn default_allowed_underlyings() -> Vec<String> {
    vec!["NIFTY".to_string(), "BANKNIFTY".to_string(), "FINNIFTY".to_string()]
}
fn default_lot_sizes() -> HashMap<String, u32> {
    HashMap::from([
        ("NIFTY".to_string(), 75),
        ("BANKNIFTY".to_string(), 35),
        ("FINNIFTY".to_string(), 65),
    ])
}
fn default_premiums() -> HashMap<String, Decimal> {
    HashMap::from([
        ("NIFTY".to_string(), dec!(150)),
        ("BANKNIFTY".to_string(), dec!(300)),
        ("FINNIFTY".to_string(), dec!(120)),
    ])
}
fn default_safety_margin_secs() -> u64 { 300 }
fn default_login_timeout_ms() -> u64 { 5_000 }
fn default_cooldown_secs() -> u64 { 60 }
fn default_submit_timeout_ms() -> u64 { 5_000 }
fn default_resolve_timeout_ms() -> u64 { 2_000 }
fn default_token_wait_ms() -> u64 { 10_000 }
fn default_queue_capacity() -> usize { 32 }
fn default_worker_idle_secs() -> u64 { 300 }
fn default_bucket_secs() -> u64 { 60 }
fn default_token_ttl_secs() -> u64 { 8 * 3600 }

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with_env_prefix(path, ENV_PREFIX)
    }

    fn load_with_env_prefix<P: AsRef<Path>>(path: P, prefix: &str) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("idempotency.bucket_secs", default_bucket_secs() as i64)?
            .set_default("session.cooldown_secs", default_cooldown_secs() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix RELAY__)
            .add_source(
                config::Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("senders.allowed")
                    .with_list_parse_key("risk.allowed_underlyings"),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let risk = &self.risk;
        if risk.max_lots_per_order == 0 {
            anyhow::bail!("risk.max_lots_per_order must be at least 1");
        }
        if risk.max_order_value <= Decimal::ZERO {
            anyhow::bail!("risk.max_order_value must be positive");
        }
        if risk.allowed_underlyings.is_empty() {
            anyhow::bail!("risk.allowed_underlyings cannot be empty");
        }

        let lot_sizes = upper_keys(&risk.lot_sizes);
        for underlying in &risk.allowed_underlyings {
            match lot_sizes.get(&underlying.to_uppercase()) {
                Some(size) if *size > 0 => {}
                Some(_) => anyhow::bail!("lot size for {} must be positive", underlying),
                None => anyhow::bail!("no lot size configured for {}", underlying),
            }
        }

        for (underlying, premium) in &self.premiums {
            if *premium < Decimal::ZERO {
                anyhow::bail!("premium for {} cannot be negative", underlying);
            }
        }

        if self.idempotency.bucket_secs == 0 {
            anyhow::bail!("idempotency.bucket_secs must be positive");
        }

        for (name, retry) in [("session", &self.session.retry), ("execution", &self.execution.retry)] {
            if retry.max_attempts == 0 {
                anyhow::bail!("{}.retry.max_attempts must be at least 1", name);
            }
            if retry.multiplier < 1.0 {
                anyhow::bail!("{}.retry.multiplier must be >= 1.0", name);
            }
            if !(0.0..1.0).contains(&retry.jitter) {
                anyhow::bail!("{}.retry.jitter must be in [0, 1)", name);
            }
        }

        if self.session.safety_margin_secs >= self.broker.token_ttl_secs {
            anyhow::bail!(
                "session.safety_margin_secs ({}) must be shorter than broker.token_ttl_secs ({})",
                self.session.safety_margin_secs,
                self.broker.token_ttl_secs
            );
        }

        if self.execution.queue_capacity == 0 {
            anyhow::bail!("execution.queue_capacity must be positive");
        }

        if self.execution.worker_idle_secs == 0 {
            anyhow::bail!("execution.worker_idle_secs must be positive");
        }

        if self.senders.allowed.is_empty() {
            tracing::warn!("senders.allowed is empty - every message will be refused");
        }
        if self.instruments.master_path.is_none() {
            tracing::warn!("instruments.master_path not set - every order will fail to resolve");
        }

        Ok(())
    }

    /// Risk limits with underlyings normalised to upper case
    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_lots_per_order: self.risk.max_lots_per_order,
            max_order_value: self.risk.max_order_value,
            allowed_underlyings: self
                .risk
                .allowed_underlyings
                .iter()
                .map(|u| u.to_uppercase())
                .collect::<HashSet<_>>(),
            lot_sizes: upper_keys(&self.risk.lot_sizes),
        }
    }

    pub fn premium_table(&self) -> PremiumTable {
        PremiumTable::new(self.premiums.clone())
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            safety_margin: Duration::from_secs(self.session.safety_margin_secs),
            login_timeout: Duration::from_millis(self.session.login_timeout_ms),
            cooldown: Duration::from_secs(self.session.cooldown_secs),
            login_retry: self.session.retry.clone(),
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            retry: self.execution.retry.clone(),
            submit_timeout: Duration::from_millis(self.execution.submit_timeout_ms),
            resolve_timeout: Duration::from_millis(self.execution.resolve_timeout_ms),
            token_wait: Duration::from_millis(self.execution.token_wait_ms),
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            api_key: self.broker.api_key.clone(),
            client_code: self.broker.client_code.clone(),
            totp_secret: self.broker.totp_secret.clone(),
        }
    }

    pub fn whitelist(&self) -> StaticWhitelist {
        StaticWhitelist::new(self.senders.allowed.iter().cloned())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        let mut underlyings = self.risk.allowed_underlyings.clone();
        underlyings.sort();

        format!(
            r#"Configuration:
  Risk:
    max_lots_per_order: {}
    max_order_value: ₹{}
    allowed_underlyings: {:?}
  Session:
    safety_margin: {}s
    login_timeout: {}ms
    cooldown: {}s
    login attempts: {}
  Execution:
    submit_timeout: {}ms
    resolve_timeout: {}ms
    submit attempts: {}
    queue_capacity: {}
    worker_idle: {}s
  Idempotency:
    bucket: {}s
  Senders:
    allowed: {}
  Instruments:
    master_path: {}
  Positions:
    persistence_path: {}
  Broker:
    client_code: {}
    api_key: {}
    totp_secret: {}
"#,
            self.risk.max_lots_per_order,
            self.risk.max_order_value,
            underlyings,
            self.session.safety_margin_secs,
            self.session.login_timeout_ms,
            self.session.cooldown_secs,
            self.session.retry.max_attempts,
            self.execution.submit_timeout_ms,
            self.execution.resolve_timeout_ms,
            self.execution.retry.max_attempts,
            self.execution.queue_capacity,
            self.execution.worker_idle_secs,
            self.idempotency.bucket_secs,
            self.senders.allowed.iter().map(|s| mask_sender(s)).collect::<Vec<_>>().join(", "),
            display_path(&self.instruments.master_path),
            display_path(&self.positions.persistence_path),
            self.broker.client_code,
            mask_secret(&self.broker.api_key),
            mask_secret(&self.broker.totp_secret),
        )
    }
}

fn upper_keys<V: Copy>(map: &HashMap<String, V>) -> HashMap<String, V> {
    map.iter().map(|(k, v)| (k.to_uppercase(), *v)).collect()
}

fn mask_secret(secret: &str) -> &'static str {
    if secret.is_empty() {
        "(not set)"
    } else {
        "***"
    }
}

/// Keep only the last four digits of a sender id
fn mask_sender(sender: &str) -> String {
    let chars: Vec<char> = sender.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(not set)".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            risk: RiskConfig::default(),
            session: SessionConfig::default(),
            execution: ExecutionConfig::default(),
            idempotency: IdempotencyConfig::default(),
            senders: SendersConfig::default(),
            instruments: InstrumentsConfig::default(),
            premiums: default_premiums(),
            positions: PositionsConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}
