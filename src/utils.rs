/// Utility functions for timestamps and host identification
use time::{format_description, OffsetDateTime};

use crate::config::Settings;

/// Format a timestamp for log lines as YYYY-MM-DD HH:MM:SS
///
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    format_with(dt, "[year]-[month]-[day] [hour]:[minute]:[second]")
}

/// Format the date part only (YYYY-MM-DD), used for daily log file names
pub fn format_date(dt: &OffsetDateTime) -> String {
    format_with(dt, "[year]-[month]-[day]")
}

fn format_with(dt: &OffsetDateTime, description: &str) -> String {
    format_description::parse(description)
        .ok()
        .and_then(|format| dt.format(&format).ok())
        .unwrap_or_else(|| dt.to_string())
}

/// Host field for zabbix_sender lines.
///
/// Configured name first, then the system hostname; `-` makes zabbix_sender
/// take the hostname from the agent configuration file.
pub fn resolve_hostname(settings: &Settings) -> String {
    settings
        .hostname
        .clone()
        .or_else(|| {
            hostname::get()
                .ok()
                .map(|name| name.to_string_lossy().into_owned())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "-".to_string())
}
