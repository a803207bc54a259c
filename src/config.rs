use std::{path::PathBuf, str::FromStr, time::Duration};

use chrono::{DateTime, Datelike, Timelike, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

/// Minutes credited to a present player for each scheduler tick. Must match
/// the tick period of the poll loop or accumulated time drifts from reality.
pub const POLL_INTERVAL_MINUTES: u64 = 5;

/// Tick period of the attendance poll loop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(POLL_INTERVAL_MINUTES * 60);

/// Day/hour range during which presence counts toward attendance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationalWindow {
    /// Day of week, 0 = Sunday.
    pub day: u32,
    /// Inclusive start hour (UTC).
    pub start_hour: u32,
    /// Exclusive end hour (UTC).
    pub end_hour: u32,
    /// Default qualifying threshold in minutes.
    pub min_minutes: u64,
}

impl Default for OperationalWindow {
    fn default() -> Self {
        Self {
            day: 3,
            start_hour: 19,
            end_hour: 22,
            min_minutes: 60,
        }
    }
}

impl OperationalWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at.weekday().num_days_from_sunday() == self.day
            && at.hour() >= self.start_hour
            && at.hour() < self.end_hour
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub query_port: u16,
    pub console_port: u16,
    /// Shared secret for the remote console. Unset means every console
    /// command resolves to a "no credential" result instead of failing hard.
    pub console_password: Option<String>,
    pub window: OperationalWindow,
    pub buffer_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            query_port: 9046,
            console_port: 2302,
            console_password: None,
            window: OperationalWindow::default(),
            buffer_path: PathBuf::from("data/attendance_buffer.json"),
        }
    }
}

impl Config {
    /// Builds a config from the environment. Missing or malformed values fall
    /// back to defaults with a warning; startup never aborts on bad config.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        let window = OperationalWindow {
            day: env_parse("ROLLCALL_OP_DAY", defaults.window.day),
            start_hour: env_parse("ROLLCALL_OP_START_HOUR", defaults.window.start_hour),
            end_hour: env_parse("ROLLCALL_OP_END_HOUR", defaults.window.end_hour),
            min_minutes: env_parse("ROLLCALL_MIN_MINUTES", defaults.window.min_minutes),
        };

        Self {
            server_host: env_string("ROLLCALL_SERVER_HOST").unwrap_or(defaults.server_host),
            query_port: env_parse("ROLLCALL_QUERY_PORT", defaults.query_port),
            console_port: env_parse("ROLLCALL_RCON_PORT", defaults.console_port),
            console_password: env_string("ROLLCALL_RCON_PASSWORD"),
            window,
            buffer_path: env_string("ROLLCALL_BUFFER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.buffer_path),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("invalid value for {key}: {raw:?}, using default");
            default
        }),
        Err(_) => default,
    }
}
