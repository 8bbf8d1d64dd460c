//! Exchange session clock

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};

use crate::common::errors::{Result, TraderError};
use crate::config::types::SessionConfig;

/// Market hours and the liquidation cut-off in exchange local time
#[derive(Debug, Clone)]
pub struct SessionClock {
    offset: FixedOffset,
    open: NaiveTime,
    close: NaiveTime,
    liquidation: NaiveTime,
    enforce: bool,
}

impl SessionClock {
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let offset = FixedOffset::east_opt(config.utc_offset_hours * 3600).ok_or_else(|| {
            TraderError::Configuration(format!(
                "invalid utc offset: {}",
                config.utc_offset_hours
            ))
        })?;
        Ok(Self {
            offset,
            open: SessionConfig::parse_time(&config.market_open)?,
            close: SessionConfig::parse_time(&config.market_close)?,
            liquidation: SessionConfig::parse_time(&config.liquidation_time)?,
            enforce: config.enforce_market_hours,
        })
    }

    pub fn local(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        now.with_timezone(&self.offset)
    }

    fn is_trading_day(&self, now: DateTime<Utc>) -> bool {
        !matches!(self.local(now).weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// Always true when market hours are not enforced
    pub fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        if !self.enforce {
            return true;
        }
        let time = self.local(now).time();
        self.is_trading_day(now) && time >= self.open && time < self.close
    }

    /// Past the daily liquidation cut-off on a trading day
    pub fn is_liquidation_time(&self, now: DateTime<Utc>) -> bool {
        self.enforce && self.is_trading_day(now) && self.local(now).time() >= self.liquidation
    }

    /// Local midnight of the current trading day, in UTC
    pub fn session_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = self.local(now);
        let midnight = local.date_naive().and_time(NaiveTime::MIN);
        self.offset
            .from_local_datetime(&midnight)
            .single()
            .map_or(now, |dt| dt.with_timezone(&Utc))
    }
}
