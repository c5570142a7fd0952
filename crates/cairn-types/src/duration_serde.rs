//! Serde helpers for human-readable durations (`"500ms"`, `"30s"`, `"5m"`, `"1h"`, `"1d"`).
//!
//! Use with `#[serde(with = "cairn_types::duration_serde")]`. Bare integers are
//! read as milliseconds.

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
        Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
    }
}

/// Render a duration in the most compact exact unit.
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms == 0 {
        return "0ms".to_string();
    }
    if ms % 86_400_000 == 0 {
        format!("{}d", ms / 86_400_000)
    } else if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}

/// Parse `"<n>ms" | "<n>s" | "<n>m" | "<n>h" | "<n>d"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let parse = |val: &str| -> Result<u64, String> {
        val.trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{}': {}", s, e))
    };
    if let Some(val) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(val)?))
    } else if let Some(val) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(val)?))
    } else if let Some(val) = s.strip_suffix('m') {
        Ok(Duration::from_secs(parse(val)? * 60))
    } else if let Some(val) = s.strip_suffix('h') {
        Ok(Duration::from_secs(parse(val)? * 3600))
    } else if let Some(val) = s.strip_suffix('d') {
        Ok(Duration::from_secs(parse(val)? * 86400))
    } else {
        Err(format!("unknown duration format: {}", s))
    }
}
