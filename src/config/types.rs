//! Configuration types

use chrono::NaiveTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::warn;

use crate::common::errors::{Result, TraderError};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Broker connectivity
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Candidate stream
    #[serde(default)]
    pub feed: FeedConfig,
    /// Allocation and entry rules
    #[serde(default)]
    pub trading: TradingConfig,
    /// Exit triggers
    #[serde(default)]
    pub exits: ExitConfig,
    /// Settlement windows
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Trading hours
    #[serde(default)]
    pub session: SessionConfig,
    /// Operator alerts
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Database configuration (in-memory when absent)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// General application settings
    #[serde(default)]
    pub settings: AppSettings,
}

impl AppConfig {
    /// Reject schedules the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        self.trading.validate()?;
        self.exits.validate(&self.trading)?;
        self.session.validate()?;
        if self.broker.mode == BrokerMode::Rest {
            if self.broker.app_key.is_none() || self.broker.app_secret.is_none() {
                return Err(TraderError::Configuration(
                    "rest broker requires app_key and app_secret".into(),
                ));
            }
            url::Url::parse(&self.broker.rest_url)?;
        }
        if self.feed.enabled {
            url::Url::parse(&self.feed.websocket_url)?;
        }
        if self.reconcile.missing_threshold == 0 {
            return Err(TraderError::Configuration(
                "reconcile.missing_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Apply persisted key/value settings on top of the loaded file.
    ///
    /// Keys are `section.field` (for example `trading.capital_ratio_pct`).
    /// Unknown keys are ignored with a warning.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, String>) -> Result<()> {
        for (key, value) in overrides {
            let applied = match key.split_once('.') {
                Some(("trading", field)) => self.trading.set(field, value)?,
                Some(("exits", field)) => self.exits.set(field, value)?,
                _ => false,
            };
            if !applied {
                warn!(key = %key, "Ignoring unknown setting");
            }
        }
        self.validate()
    }
}

/// Which gateway implementation to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    /// Live REST API
    Rest,
    /// In-memory simulated account
    #[default]
    Paper,
}

/// Broker connectivity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Gateway implementation
    #[serde(default)]
    pub mode: BrokerMode,
    /// Application key for the token endpoint
    #[serde(default)]
    pub app_key: Option<String>,
    /// Application secret for the token endpoint
    #[serde(default)]
    pub app_secret: Option<String>,
    /// Base64 secret used to sign order bodies, if the broker requires it
    #[serde(default)]
    pub signing_secret: Option<String>,
    /// Base URL for the REST API
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    /// Exchange code sent with orders
    #[serde(default = "default_market_code")]
    pub market_code: String,
    /// Per-call timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Extra attempts for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial retry delay in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Minimum spacing between order submissions in milliseconds
    #[serde(default = "default_order_interval_ms")]
    pub order_interval_ms: u64,
    /// Starting cash of the paper account
    #[serde(default = "default_paper_cash")]
    pub paper_initial_cash: Decimal,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::default(),
            app_key: None,
            app_secret: None,
            signing_secret: None,
            rest_url: default_rest_url(),
            market_code: default_market_code(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            order_interval_ms: default_order_interval_ms(),
            paper_initial_cash: default_paper_cash(),
        }
    }
}

fn default_rest_url() -> String {
    "https://api.kiwoom.com".to_string()
}

fn default_market_code() -> String {
    "KRX".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_order_interval_ms() -> u64 {
    250
}

fn default_paper_cash() -> Decimal {
    dec!(10000000)
}

/// Candidate stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Run the streaming listener
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// WebSocket URL for condition search
    #[serde(default = "default_websocket_url")]
    pub websocket_url: String,
    /// Position of the condition in the server's list
    #[serde(default)]
    pub condition_index: usize,
    /// Silence after which the connection is torn down
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// Reconnect delay cap in milliseconds
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_ms: u64,
    /// Maximum symbols kept in the ranked buffer
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Candidates older than this are discarded
    #[serde(default = "default_candidate_max_age")]
    pub candidate_max_age_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            websocket_url: default_websocket_url(),
            condition_index: 0,
            liveness_timeout_secs: default_liveness_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            max_reconnect_delay_ms: default_max_reconnect_delay(),
            buffer_capacity: default_buffer_capacity(),
            candidate_max_age_secs: default_candidate_max_age(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_websocket_url() -> String {
    "wss://api.kiwoom.com:10000/api/dostk/websocket".to_string()
}

fn default_liveness_timeout() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    1000
}

fn default_max_reconnect_delay() -> u64 {
    30_000
}

fn default_buffer_capacity() -> usize {
    100
}

fn default_candidate_max_age() -> u64 {
    120
}

/// How add-on tranches are triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrancheStrategy {
    /// Average down: add as the price falls
    #[default]
    #[serde(alias = "water")]
    BuyOnWeakness,
    /// Pyramid: add as the price rises
    #[serde(alias = "fire")]
    BuyOnStrength,
}

impl FromStr for TrancheStrategy {
    type Err = TraderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy_on_weakness" | "water" => Ok(TrancheStrategy::BuyOnWeakness),
            "buy_on_strength" | "fire" => Ok(TrancheStrategy::BuyOnStrength),
            other => Err(TraderError::Configuration(format!(
                "unknown tranche strategy: {}",
                other
            ))),
        }
    }
}

/// Allocation and entry rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Share of equity put to work, in percent
    #[serde(default = "default_capital_ratio")]
    pub capital_ratio_pct: Decimal,
    /// Number of symbols held at once
    #[serde(default = "default_target_count")]
    pub target_symbol_count: u32,
    /// Number of tranches per symbol
    #[serde(default = "default_split_count")]
    pub split_count: usize,
    /// Add-on direction
    #[serde(default)]
    pub strategy: TrancheStrategy,
    /// Return move, in percent, that advances one tranche
    #[serde(default = "default_step_rate")]
    pub step_rate_pct: Decimal,
    /// Smallest order notional
    #[serde(default = "default_min_order_amount")]
    pub min_order_amount: Decimal,
    /// Stop adding once this share of the ceiling is deployed, in percent
    #[serde(default = "default_max_fill_ratio")]
    pub max_fill_ratio_pct: Decimal,
    /// Wait after a full exit before re-entering
    #[serde(default = "default_reentry_cooldown")]
    pub reentry_cooldown_secs: u64,
    /// Wait between buy attempts on one symbol
    #[serde(default = "default_entry_retry_cooldown")]
    pub entry_retry_cooldown_secs: u64,
    /// Realized daily profit that halts entries (0 disables)
    #[serde(default)]
    pub target_profit_amount: Decimal,
    /// Account return, in percent, that liquidates everything
    #[serde(default = "default_global_loss_rate")]
    pub global_loss_rate_pct: Decimal,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            capital_ratio_pct: default_capital_ratio(),
            target_symbol_count: default_target_count(),
            split_count: default_split_count(),
            strategy: TrancheStrategy::default(),
            step_rate_pct: default_step_rate(),
            min_order_amount: default_min_order_amount(),
            max_fill_ratio_pct: default_max_fill_ratio(),
            reentry_cooldown_secs: default_reentry_cooldown(),
            entry_retry_cooldown_secs: default_entry_retry_cooldown(),
            target_profit_amount: Decimal::ZERO,
            global_loss_rate_pct: default_global_loss_rate(),
        }
    }
}

impl TradingConfig {
    /// Capital ratio as a fraction
    pub fn capital_ratio(&self) -> Decimal {
        self.capital_ratio_pct / Decimal::ONE_HUNDRED
    }

    fn validate(&self) -> Result<()> {
        if self.split_count == 0 {
            return Err(TraderError::Configuration(
                "trading.split_count must be at least 1".into(),
            ));
        }
        if self.capital_ratio_pct <= Decimal::ZERO || self.capital_ratio_pct > Decimal::ONE_HUNDRED {
            return Err(TraderError::Configuration(format!(
                "trading.capital_ratio_pct must be in (0, 100], got {}",
                self.capital_ratio_pct
            )));
        }
        if self.step_rate_pct <= Decimal::ZERO {
            return Err(TraderError::Configuration(
                "trading.step_rate_pct must be positive".into(),
            ));
        }
        if self.min_order_amount < Decimal::ZERO {
            return Err(TraderError::Configuration(
                "trading.min_order_amount must not be negative".into(),
            ));
        }
        Ok(())
    }

    fn set(&mut self, field: &str, value: &str) -> Result<bool> {
        match field {
            "capital_ratio_pct" => self.capital_ratio_pct = parse_value(field, value)?,
            "target_symbol_count" => self.target_symbol_count = parse_value(field, value)?,
            "split_count" => self.split_count = parse_value(field, value)?,
            "strategy" => self.strategy = value.parse()?,
            "step_rate_pct" => self.step_rate_pct = parse_value(field, value)?,
            "min_order_amount" => self.min_order_amount = parse_value(field, value)?,
            "max_fill_ratio_pct" => self.max_fill_ratio_pct = parse_value(field, value)?,
            "reentry_cooldown_secs" => self.reentry_cooldown_secs = parse_value(field, value)?,
            "entry_retry_cooldown_secs" => {
                self.entry_retry_cooldown_secs = parse_value(field, value)?
            }
            "target_profit_amount" => self.target_profit_amount = parse_value(field, value)?,
            "global_loss_rate_pct" => self.global_loss_rate_pct = parse_value(field, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn default_capital_ratio() -> Decimal {
    dec!(70)
}

fn default_target_count() -> u32 {
    5
}

fn default_split_count() -> usize {
    5
}

fn default_step_rate() -> Decimal {
    dec!(1.5)
}

fn default_min_order_amount() -> Decimal {
    dec!(50000)
}

fn default_max_fill_ratio() -> Decimal {
    dec!(98)
}

fn default_reentry_cooldown() -> u64 {
    60
}

fn default_entry_retry_cooldown() -> u64 {
    5
}

fn default_global_loss_rate() -> Decimal {
    dec!(-99)
}

/// Exit triggers, returns in percent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    #[serde(default = "default_take_profit")]
    pub take_profit_pct: Decimal,
    #[serde(default = "default_stop_loss")]
    pub stop_loss_pct: Decimal,
    /// Exit immediately at or above this return
    #[serde(default = "default_upper_limit")]
    pub upper_limit_pct: Decimal,
    /// Holding time after which a weak position is cut
    #[serde(default = "default_time_exit_minutes")]
    pub time_exit_minutes: u64,
    /// Return a position must reach to survive the time exit
    #[serde(default = "default_time_exit_min_return")]
    pub time_exit_min_return_pct: Decimal,
    /// Share of the ceiling that must be deployed before the time exit applies
    #[serde(default = "default_time_exit_min_fill")]
    pub time_exit_min_fill_pct: Decimal,
    #[serde(default = "default_true")]
    pub trailing_enabled: bool,
    /// Return at which the high-water mark starts tracking
    #[serde(default = "default_trailing_activation")]
    pub trailing_activation_pct: Decimal,
    /// Retrace from the high-water mark that fires the stop
    #[serde(default = "default_trailing_callback")]
    pub trailing_callback_pct: Decimal,
    /// Tranche index from which the tiered stop applies (split count - 1 when unset)
    #[serde(default)]
    pub max_tranche: Option<usize>,
    /// Tiered stop: full exit at or below
    #[serde(default = "default_hard_stop")]
    pub hard_stop_pct: Decimal,
    /// Tiered stop: half exit at or below
    #[serde(default = "default_soft_stop")]
    pub soft_stop_pct: Decimal,
    /// Suppress repeated partial exits for this long
    #[serde(default = "default_partial_exit_cooldown")]
    pub partial_exit_cooldown_secs: u64,
    #[serde(default = "default_true")]
    pub momentum_exit_enabled: bool,
    /// Samples in the strength indicator
    #[serde(default = "default_momentum_period")]
    pub momentum_period: usize,
    /// Indicator level treated as overbought
    #[serde(default = "default_momentum_overbought")]
    pub momentum_overbought: Decimal,
    /// Symbol stays "being sold" this long after a submitted sell
    #[serde(default = "default_sell_settlement")]
    pub sell_settlement_secs: u64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: default_take_profit(),
            stop_loss_pct: default_stop_loss(),
            upper_limit_pct: default_upper_limit(),
            time_exit_minutes: default_time_exit_minutes(),
            time_exit_min_return_pct: default_time_exit_min_return(),
            time_exit_min_fill_pct: default_time_exit_min_fill(),
            trailing_enabled: true,
            trailing_activation_pct: default_trailing_activation(),
            trailing_callback_pct: default_trailing_callback(),
            max_tranche: None,
            hard_stop_pct: default_hard_stop(),
            soft_stop_pct: default_soft_stop(),
            partial_exit_cooldown_secs: default_partial_exit_cooldown(),
            momentum_exit_enabled: true,
            momentum_period: default_momentum_period(),
            momentum_overbought: default_momentum_overbought(),
            sell_settlement_secs: default_sell_settlement(),
        }
    }
}

impl ExitConfig {
    /// Tranche index at which the position counts as fully built
    pub fn max_tranche(&self, split_count: usize) -> usize {
        self.max_tranche
            .unwrap_or_else(|| split_count.saturating_sub(1))
            .max(1)
    }

    fn validate(&self, trading: &TradingConfig) -> Result<()> {
        if self.hard_stop_pct > self.soft_stop_pct {
            return Err(TraderError::Configuration(format!(
                "exits.hard_stop_pct ({}) must not exceed exits.soft_stop_pct ({})",
                self.hard_stop_pct, self.soft_stop_pct
            )));
        }
        if self.take_profit_pct <= Decimal::ZERO || self.upper_limit_pct <= Decimal::ZERO {
            return Err(TraderError::Configuration(
                "exits.take_profit_pct and exits.upper_limit_pct must be positive".into(),
            ));
        }
        if self.trailing_callback_pct <= Decimal::ZERO {
            return Err(TraderError::Configuration(
                "exits.trailing_callback_pct must be positive".into(),
            ));
        }
        if let Some(max) = self.max_tranche {
            if max == 0 || max > trading.split_count {
                return Err(TraderError::Configuration(format!(
                    "exits.max_tranche must be in 1..={}, got {}",
                    trading.split_count, max
                )));
            }
        }
        if self.momentum_period < 2 {
            return Err(TraderError::Configuration(
                "exits.momentum_period must be at least 2".into(),
            ));
        }
        Ok(())
    }

    fn set(&mut self, field: &str, value: &str) -> Result<bool> {
        match field {
            "take_profit_pct" => self.take_profit_pct = parse_value(field, value)?,
            "stop_loss_pct" => self.stop_loss_pct = parse_value(field, value)?,
            "upper_limit_pct" => self.upper_limit_pct = parse_value(field, value)?,
            "time_exit_minutes" => self.time_exit_minutes = parse_value(field, value)?,
            "time_exit_min_return_pct" => {
                self.time_exit_min_return_pct = parse_value(field, value)?
            }
            "time_exit_min_fill_pct" => self.time_exit_min_fill_pct = parse_value(field, value)?,
            "trailing_enabled" => self.trailing_enabled = parse_value(field, value)?,
            "trailing_activation_pct" => self.trailing_activation_pct = parse_value(field, value)?,
            "trailing_callback_pct" => self.trailing_callback_pct = parse_value(field, value)?,
            "max_tranche" => self.max_tranche = Some(parse_value(field, value)?),
            "hard_stop_pct" => self.hard_stop_pct = parse_value(field, value)?,
            "soft_stop_pct" => self.soft_stop_pct = parse_value(field, value)?,
            "partial_exit_cooldown_secs" => {
                self.partial_exit_cooldown_secs = parse_value(field, value)?
            }
            "momentum_exit_enabled" => self.momentum_exit_enabled = parse_value(field, value)?,
            "momentum_overbought" => self.momentum_overbought = parse_value(field, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn default_take_profit() -> Decimal {
    dec!(10)
}

fn default_stop_loss() -> Decimal {
    dec!(-10)
}

fn default_upper_limit() -> Decimal {
    dec!(29.5)
}

fn default_time_exit_minutes() -> u64 {
    30
}

fn default_time_exit_min_return() -> Decimal {
    dec!(1.0)
}

fn default_time_exit_min_fill() -> Decimal {
    dec!(95)
}

fn default_trailing_activation() -> Decimal {
    dec!(1.5)
}

fn default_trailing_callback() -> Decimal {
    dec!(0.5)
}

fn default_hard_stop() -> Decimal {
    dec!(-10)
}

fn default_soft_stop() -> Decimal {
    dec!(-5)
}

fn default_partial_exit_cooldown() -> u64 {
    300
}

fn default_momentum_period() -> usize {
    14
}

fn default_momentum_overbought() -> Decimal {
    dec!(70)
}

fn default_sell_settlement() -> u64 {
    5
}

/// Settlement windows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Unconfirmed orders are treated as failed after this long
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_secs: u64,
    /// Sold symbols are not re-adopted from snapshots for this long
    #[serde(default = "default_ghost_grace")]
    pub ghost_grace_secs: u64,
    /// Consecutive absences before a holding is dropped
    #[serde(default = "default_missing_threshold")]
    pub missing_threshold: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            pending_timeout_secs: default_pending_timeout(),
            ghost_grace_secs: default_ghost_grace(),
            missing_threshold: default_missing_threshold(),
        }
    }
}

fn default_pending_timeout() -> u64 {
    60
}

fn default_ghost_grace() -> u64 {
    60
}

fn default_missing_threshold() -> u32 {
    3
}

/// Trading hours, expressed in exchange local time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Offset of exchange local time from UTC
    #[serde(default = "default_utc_offset")]
    pub utc_offset_hours: i32,
    #[serde(default = "default_market_open")]
    pub market_open: String,
    #[serde(default = "default_market_close")]
    pub market_close: String,
    /// Everything is sold from this time on
    #[serde(default = "default_liquidation_time")]
    pub liquidation_time: String,
    /// Skip cycles outside market hours
    #[serde(default = "default_true")]
    pub enforce_market_hours: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: default_utc_offset(),
            market_open: default_market_open(),
            market_close: default_market_close(),
            liquidation_time: default_liquidation_time(),
            enforce_market_hours: true,
        }
    }
}

impl SessionConfig {
    pub fn parse_time(value: &str) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|e| {
            TraderError::Configuration(format!("invalid time '{}': {}", value, e))
        })
    }

    fn validate(&self) -> Result<()> {
        let open = Self::parse_time(&self.market_open)?;
        let close = Self::parse_time(&self.market_close)?;
        Self::parse_time(&self.liquidation_time)?;
        if open >= close {
            return Err(TraderError::Configuration(format!(
                "session.market_open ({}) must precede session.market_close ({})",
                self.market_open, self.market_close
            )));
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(TraderError::Configuration(format!(
                "session.utc_offset_hours out of range: {}",
                self.utc_offset_hours
            )));
        }
        Ok(())
    }
}

fn default_utc_offset() -> i32 {
    9
}

fn default_market_open() -> String {
    "09:00".to_string()
}

fn default_market_close() -> String {
    "15:30".to_string()
}

fn default_liquidation_time() -> String {
    "15:20".to_string()
}

/// Operator alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Webhook receiving `{chat_id, text}` posts; alerts are only logged when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    /// Prefix identifying this process in messages
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            chat_id: None,
            process_name: None,
            queue_size: default_queue_size(),
            timeout_secs: default_notify_timeout(),
        }
    }
}

fn default_queue_size() -> usize {
    256
}

fn default_notify_timeout() -> u64 {
    10
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_connection_timeout() -> u64 {
    30
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
    /// Scheduler period in milliseconds
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_ms: u64,
    /// Bound on waiting for in-flight decisions at shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            cycle_interval_ms: default_cycle_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cycle_interval() -> u64 {
    1000
}

fn default_shutdown_grace() -> u64 {
    10
}

fn parse_value<T: FromStr>(field: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| {
        TraderError::Configuration(format!("invalid value '{}' for {}: {}", value, field, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trading.capital_ratio(), dec!(0.7));
        assert_eq!(config.exits.max_tranche(config.trading.split_count), 4);
    }

    #[test]
    fn test_zero_split_count_rejected() {
        let mut config = AppConfig::default();
        config.trading.split_count = 0;
        assert!(matches!(
            config.validate(),
            Err(TraderError::Configuration(_))
        ));
    }

    #[test]
    fn test_rest_mode_requires_credentials() {
        let mut config = AppConfig::default();
        config.broker.mode = BrokerMode::Rest;
        assert!(config.validate().is_err());

        config.broker.app_key = Some("key".into());
        config.broker.app_secret = Some("secret".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = AppConfig::default();
        let overrides = HashMap::from([
            ("trading.capital_ratio_pct".to_string(), "50".to_string()),
            ("trading.strategy".to_string(), "FIRE".to_string()),
            ("exits.trailing_callback_pct".to_string(), "0.7".to_string()),
            ("unknown.key".to_string(), "1".to_string()),
        ]);
        config.apply_overrides(&overrides).unwrap();
        assert_eq!(config.trading.capital_ratio_pct, dec!(50));
        assert_eq!(config.trading.strategy, TrancheStrategy::BuyOnStrength);
        assert_eq!(config.exits.trailing_callback_pct, dec!(0.7));
    }

    #[test]
    fn test_override_rejects_garbage() {
        let mut config = AppConfig::default();
        let overrides = HashMap::from([(
            "trading.target_symbol_count".to_string(),
            "five".to_string(),
        )]);
        assert!(config.apply_overrides(&overrides).is_err());
    }

    #[test]
    fn test_session_order_checked() {
        let mut config = AppConfig::default();
        config.session.market_open = "16:00".into();
        assert!(config.validate().is_err());
    }
}
