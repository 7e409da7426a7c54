use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::limits::MAX_ADVANCE_DAYS;
use crate::model::Timestamp;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0}")]
    Inconsistent(&'static str),
}

/// Pricing and scheduling rules for one practice space.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingPolicy {
    pub hourly_rate: Decimal,
    /// Bookings starting within this many days are confirmed on creation.
    pub auto_confirm_days: i64,
    pub min_duration: TimeDelta,
    pub max_duration: TimeDelta,
    pub open_time: NaiveTime,
    pub close_time: NaiveTime,
    /// Scheduled reservations starting within this many days get a confirmation reminder.
    pub reminder_lead_days: i64,
    pub default_max_advance_days: u32,
    pub timezone: Tz,
    pub cache_ttl: Duration,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            hourly_rate: Decimal::new(1500, 2),
            auto_confirm_days: 3,
            min_duration: TimeDelta::hours(1),
            max_duration: TimeDelta::hours(8),
            open_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            close_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
            reminder_lead_days: 5,
            default_max_advance_days: 90,
            timezone: chrono_tz::America::Los_Angeles,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl BookingPolicy {
    /// Calendar date of `ts` in the space's time zone.
    pub fn local_date(&self, ts: Timestamp) -> NaiveDate {
        ts.with_timezone(&self.timezone).date_naive()
    }

    /// Resolve a local wall-clock time to UTC. Ambiguous times (DST fall-back)
    /// take the earlier instant; nonexistent times (spring-forward gap) yield None.
    pub fn to_utc(&self, local: NaiveDateTime) -> Option<Timestamp> {
        self.timezone
            .from_local_datetime(&local)
            .earliest()
            .map(|dt| dt.to_utc())
    }

    /// Operating hours of a local day as a UTC range.
    pub fn operating_hours(&self, day: NaiveDate) -> Option<(Timestamp, Timestamp)> {
        let open = self.to_utc(day.and_time(self.open_time))?;
        let close = self.to_utc(day.and_time(self.close_time))?;
        (open < close).then_some((open, close))
    }
}

/// Daemon configuration gathered from `JAMROOM_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub job_interval: Duration,
    pub policy: BookingPolicy,
}

impl Config {
    /// Load a `.env` file if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = BookingPolicy::default();

        let timezone = match lookup("JAMROOM_TIMEZONE") {
            Some(raw) => raw.parse::<Tz>().map_err(|_| ConfigError::InvalidValue {
                key: "JAMROOM_TIMEZONE",
                value: raw,
            })?,
            None => defaults.timezone,
        };
        let open_hour: u32 = parse_or(&lookup, "JAMROOM_OPEN_HOUR", 9)?;
        let close_hour: u32 = parse_or(&lookup, "JAMROOM_CLOSE_HOUR", 22)?;
        let open_time = hour_of_day(open_hour, "JAMROOM_OPEN_HOUR")?;
        let close_time = hour_of_day(close_hour, "JAMROOM_CLOSE_HOUR")?;
        if open_time >= close_time {
            return Err(ConfigError::Inconsistent(
                "JAMROOM_OPEN_HOUR must be before JAMROOM_CLOSE_HOUR",
            ));
        }

        let min_minutes: i64 = parse_or(&lookup, "JAMROOM_MIN_BOOKING_MINUTES", 60)?;
        let max_minutes: i64 = parse_or(&lookup, "JAMROOM_MAX_BOOKING_MINUTES", 480)?;
        if min_minutes <= 0 || max_minutes < min_minutes {
            return Err(ConfigError::Inconsistent(
                "booking length bounds must satisfy 0 < min <= max",
            ));
        }

        let hourly_rate: Decimal = parse_or(&lookup, "JAMROOM_HOURLY_RATE", defaults.hourly_rate)?;
        if hourly_rate.is_sign_negative() {
            return Err(ConfigError::InvalidValue {
                key: "JAMROOM_HOURLY_RATE",
                value: hourly_rate.to_string(),
            });
        }

        let max_advance: u32 =
            parse_or(&lookup, "JAMROOM_MAX_ADVANCE_DAYS", defaults.default_max_advance_days)?;
        if max_advance == 0 || max_advance > MAX_ADVANCE_DAYS {
            return Err(ConfigError::InvalidValue {
                key: "JAMROOM_MAX_ADVANCE_DAYS",
                value: max_advance.to_string(),
            });
        }

        let policy = BookingPolicy {
            hourly_rate,
            auto_confirm_days: parse_or(&lookup, "JAMROOM_AUTO_CONFIRM_DAYS", defaults.auto_confirm_days)?,
            min_duration: TimeDelta::minutes(min_minutes),
            max_duration: TimeDelta::minutes(max_minutes),
            open_time,
            close_time,
            reminder_lead_days: parse_or(&lookup, "JAMROOM_REMINDER_DAYS", defaults.reminder_lead_days)?,
            default_max_advance_days: max_advance,
            timezone,
            cache_ttl: Duration::from_secs(parse_or(&lookup, "JAMROOM_CACHE_TTL_SECS", 300)?),
        };

        Ok(Self {
            port: parse_or(&lookup, "JAMROOM_PORT", 5433)?,
            bind: lookup("JAMROOM_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("JAMROOM_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("JAMROOM_PASSWORD").unwrap_or_else(|| "jamroom".into()),
            max_connections: parse_or(&lookup, "JAMROOM_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "JAMROOM_COMPACT_THRESHOLD", 1000)?,
            tls_cert: lookup("JAMROOM_TLS_CERT"),
            tls_key: lookup("JAMROOM_TLS_KEY"),
            metrics_port: lookup("JAMROOM_METRICS_PORT")
                .map(|raw| {
                    raw.parse().map_err(|_| ConfigError::InvalidValue {
                        key: "JAMROOM_METRICS_PORT",
                        value: raw,
                    })
                })
                .transpose()?,
            job_interval: Duration::from_secs(parse_or(&lookup, "JAMROOM_JOB_INTERVAL_SECS", 3600)?),
            policy,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

fn hour_of_day(hour: u32, key: &'static str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::from_hms_opt(hour, 0, 0).ok_or(ConfigError::InvalidValue {
        key,
        value: hour.to_string(),
    })
}
