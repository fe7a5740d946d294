// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for tally-reconciler.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// How this process decides whether it leads the reconciliation loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderMode {
    /// Always lead (single replica).
    Always,
    /// Never lead (standby / read-only replica).
    Never,
    /// Compete for a lease in the store.
    Lease,
}

impl FromStr for LeaderMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            "lease" => Ok(Self::Lease),
            _ => Err(()),
        }
    }
}

/// Reconciler configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (`postgres://...` or `sqlite:...`)
    pub database_url: String,
    /// Base URL of the flow-execution service
    pub flow_service_url: String,
    /// Base URL of the financial data source
    pub rate_source_url: String,
    /// Base URL of the billing notification service
    pub notify_url: String,
    /// Base URL of the ticketing service; the approval watcher is off without it
    pub ticket_service_url: Option<String>,
    /// Name this process holds leases under
    pub instance_id: String,
    /// Leadership strategy
    pub leader_mode: LeaderMode,
    /// Lease time-to-live
    pub leader_lease_ttl: Duration,
    /// Delay before the first tick of every loop
    pub grace_period: Duration,
    /// Bill sync tick interval
    pub bill_sync_interval: Duration,
    /// Exchange rate tick interval
    pub exchange_rate_interval: Duration,
    /// Sub-ticket watcher tick interval
    pub sub_ticket_interval: Duration,
    /// Base bill rows per delegated flow
    pub batch_size: i64,
    /// Failed flows per unit of work before parking it (0 = unbounded)
    pub flow_retry_limit: u32,
    /// Currencies exchange rates are reconciled into
    pub target_currencies: Vec<String>,
    /// Optional allow-list of source currencies
    pub source_currencies: Option<Vec<String>>,
    /// Timeout of every outbound HTTP request
    pub http_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("TALLY_DATABASE_URL")?;
        let flow_service_url = required("TALLY_FLOW_SERVICE_URL")?;
        let rate_source_url = required("TALLY_RATE_SOURCE_URL")?;
        let notify_url = required("TALLY_NOTIFY_URL")?;
        let ticket_service_url = optional("TALLY_TICKET_SERVICE_URL");

        let instance_id = optional("TALLY_INSTANCE_ID").unwrap_or_else(default_instance_id);

        let leader_mode = match optional("TALLY_LEADER_MODE") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "TALLY_LEADER_MODE",
                value: raw,
            })?,
            None => LeaderMode::Lease,
        };

        let batch_size: i64 = parse_or("TALLY_BATCH_SIZE", 5000)?;
        if batch_size <= 0 {
            return Err(ConfigError::Invalid {
                var: "TALLY_BATCH_SIZE",
                value: batch_size.to_string(),
            });
        }

        let target_currencies = optional("TALLY_TARGET_CURRENCIES")
            .map(|raw| currency_list(&raw))
            .unwrap_or_else(|| vec!["CNY".to_string(), "USD".to_string()]);

        let source_currencies = optional("TALLY_SOURCE_CURRENCIES")
            .map(|raw| currency_list(&raw))
            .filter(|list| !list.is_empty());

        Ok(Self {
            database_url,
            flow_service_url,
            rate_source_url,
            notify_url,
            ticket_service_url,
            instance_id,
            leader_mode,
            leader_lease_ttl: secs("TALLY_LEADER_LEASE_TTL_SECS", 30)?,
            grace_period: Duration::from_secs(parse_or("TALLY_GRACE_PERIOD_SECS", 10)?),
            bill_sync_interval: secs("TALLY_BILL_SYNC_INTERVAL_SECS", 60)?,
            exchange_rate_interval: secs("TALLY_EXCHANGE_RATE_INTERVAL_SECS", 3600)?,
            sub_ticket_interval: secs("TALLY_SUB_TICKET_INTERVAL_SECS", 30)?,
            batch_size,
            flow_retry_limit: parse_or("TALLY_FLOW_RETRY_LIMIT", 10)?,
            target_currencies,
            source_currencies,
            http_timeout: secs("TALLY_HTTP_TIMEOUT_SECS", 30)?,
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::MissingEnvVar(var))
}

fn optional(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        None => Ok(default),
    }
}

/// A strictly positive number of seconds.
fn secs(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let value: u64 = parse_or(var, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        });
    }
    Ok(Duration::from_secs(value))
}

fn currency_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
        .collect()
}

fn default_instance_id() -> String {
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "tally".to_string());
    format!("{}-{}", host, std::process::id())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable has an unusable value.
    #[error("Invalid value for {var}: '{value}'")]
    Invalid {
        /// The variable name.
        var: &'static str,
        /// The rejected value.
        value: String,
    },
}
