use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

use crate::limits::*;
use crate::model::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0}")]
    Inconsistent(&'static str),
}

/// Booking rules: the slot grid and the minimum lead time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    pub grid: GridSpec,
    /// Earliest allowed reservation start is `now + min_advance`.
    pub min_advance: Ms,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            grid: GridSpec {
                // 2025-01-01T00:00:00Z .. 2026-01-01T00:00:00Z
                horizon: Span::new(1_735_689_600_000, 1_767_225_600_000),
                slot_len: 30 * MINUTE_MS,
                capacity: 50_000,
            },
            min_advance: 3 * DAY_MS,
        }
    }
}

impl BookingPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let grid = &self.grid;
        if grid.horizon.start >= grid.horizon.end {
            return Err(ConfigError::Inconsistent("horizon start must be before horizon end"));
        }
        if grid.slot_len <= 0 {
            return Err(ConfigError::Inconsistent("slot length must be positive"));
        }
        if grid.slot_count() > MAX_GRID_SLOTS {
            return Err(ConfigError::Inconsistent("slot grid too large"));
        }
        if self.min_advance < 0 {
            return Err(ConfigError::Inconsistent("minimum advance must not be negative"));
        }
        Ok(())
    }

    /// Read `SLOTBOOK_HORIZON_*`, `SLOTBOOK_SLOT_*` and
    /// `SLOTBOOK_MIN_ADVANCE_HOURS`, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let start = match env_var("SLOTBOOK_HORIZON_START") {
            Some(v) => parse_timestamp(&v).ok_or(ConfigError::Invalid {
                var: "SLOTBOOK_HORIZON_START",
                value: v,
            })?,
            None => defaults.grid.horizon.start,
        };
        let end = match env_var("SLOTBOOK_HORIZON_END") {
            Some(v) => parse_timestamp(&v).ok_or(ConfigError::Invalid {
                var: "SLOTBOOK_HORIZON_END",
                value: v,
            })?,
            None => defaults.grid.horizon.end,
        };
        if start >= end {
            return Err(ConfigError::Inconsistent("horizon start must be before horizon end"));
        }
        let slot_minutes: i64 = env_parse("SLOTBOOK_SLOT_MINUTES")?.unwrap_or(30);
        let capacity: u32 = env_parse("SLOTBOOK_SLOT_CAPACITY")?.unwrap_or(defaults.grid.capacity);
        let advance_hours: i64 = env_parse("SLOTBOOK_MIN_ADVANCE_HOURS")?.unwrap_or(72);

        let policy = Self {
            grid: GridSpec {
                horizon: Span::new(start, end),
                slot_len: scaled("SLOTBOOK_SLOT_MINUTES", slot_minutes, MINUTE_MS)?,
                capacity,
            },
            min_advance: scaled("SLOTBOOK_MIN_ADVANCE_HOURS", advance_hours, HOUR_MS)?,
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// Process-level settings for the listener and storage.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub admin_user: String,
    pub admin_password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            admin_user: "admin".into(),
            admin_password: "admin".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            bind: env_var("SLOTBOOK_BIND").unwrap_or(d.bind),
            port: env_parse("SLOTBOOK_PORT")?.unwrap_or(d.port),
            data_dir: env_var("SLOTBOOK_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            password: env_var("SLOTBOOK_PASSWORD").unwrap_or(d.password),
            admin_user: env_var("SLOTBOOK_ADMIN_USER").unwrap_or(d.admin_user),
            admin_password: env_var("SLOTBOOK_ADMIN_PASSWORD").unwrap_or(d.admin_password),
            max_connections: env_parse("SLOTBOOK_MAX_CONNECTIONS")?.unwrap_or(d.max_connections),
            compact_threshold: env_parse("SLOTBOOK_COMPACT_THRESHOLD")?.unwrap_or(d.compact_threshold),
            tls_cert: env_var("SLOTBOOK_TLS_CERT"),
            tls_key: env_var("SLOTBOOK_TLS_KEY"),
            metrics_port: env_parse("SLOTBOOK_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn env_var(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env_var(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

/// `amount * unit` in milliseconds, or `Invalid` when it overflows.
fn scaled(var: &'static str, amount: i64, unit: Ms) -> Result<Ms, ConfigError> {
    amount.checked_mul(unit).ok_or_else(|| ConfigError::Invalid {
        var,
        value: amount.to_string(),
    })
}

/// Parse a timestamp as Unix milliseconds, RFC 3339, `YYYY-MM-DD HH:MM:SS`
/// (or with a `T` separator) or a bare `YYYY-MM-DD`. Naive forms are UTC.
pub fn parse_timestamp(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Render Unix milliseconds as RFC 3339 for log lines.
pub fn format_timestamp(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map_or_else(|| ms.to_string(), |dt| dt.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_original_calendar() {
        let p = BookingPolicy::default();
        assert_eq!(p.grid.horizon.start, parse_timestamp("2025-01-01").unwrap());
        assert_eq!(p.grid.horizon.end, parse_timestamp("2026-01-01T00:00:00Z").unwrap());
        assert_eq!(p.grid.slot_len, 30 * MINUTE_MS);
        assert_eq!(p.grid.capacity, 50_000);
        assert_eq!(p.min_advance, 3 * DAY_MS);
        assert_eq!(p.grid.slot_count(), 365 * 48);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn timestamp_formats() {
        let expected = 1_748_772_000_000; // 2025-06-01T10:00:00Z
        assert_eq!(parse_timestamp("1748772000000"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-01T10:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-01T12:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-01 10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-01T10:00"), Some(expected));
        assert_eq!(parse_timestamp("next tuesday"), None);
    }

    #[test]
    fn format_roundtrips_through_parse() {
        let ms = 1_748_772_000_000;
        assert_eq!(parse_timestamp(&format_timestamp(ms)), Some(ms));
    }

    #[test]
    fn validate_rejects_bad_grids() {
        let mut p = BookingPolicy::default();
        p.grid.slot_len = 0;
        assert!(p.validate().is_err());

        let mut p = BookingPolicy::default();
        p.grid.slot_len = 1;
        assert_eq!(p.validate(), Err(ConfigError::Inconsistent("slot grid too large")));

        let mut p = BookingPolicy::default();
        p.min_advance = -1;
        assert!(p.validate().is_err());
    }

    #[test]
    fn huge_durations_are_invalid_not_overflowing() {
        assert_eq!(scaled("SLOTBOOK_SLOT_MINUTES", 30, MINUTE_MS), Ok(30 * MINUTE_MS));
        assert_eq!(
            scaled("SLOTBOOK_SLOT_MINUTES", i64::MAX / 1000, MINUTE_MS),
            Err(ConfigError::Invalid {
                var: "SLOTBOOK_SLOT_MINUTES",
                value: (i64::MAX / 1000).to_string(),
            })
        );
        assert!(scaled("SLOTBOOK_MIN_ADVANCE_HOURS", i64::MIN, HOUR_MS).is_err());
    }

    #[test]
    fn server_defaults() {
        let c = ServerConfig::default();
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.admin_user, "admin");
        assert_eq!(c.max_connections, 256);
    }
}
