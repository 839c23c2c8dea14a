//! Small shared helpers used across the SDK that don't belong to any one
//! subsystem (duration (de)serialization, that kind of thing).

pub mod duration_serde {
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        use serde_json::Value;

        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => parse_duration_string(&s).map_err(Error::custom),
            Value::Object(obj) => {
                let secs = obj
                    .get("secs")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| Error::custom("missing 'secs' field"))?;
                let nanos = obj.get("nanos").and_then(|v| v.as_u64()).unwrap_or(0);
                Ok(Duration::new(secs, nanos as u32))
            }
            Value::Number(n) => {
                let secs = n.as_u64().ok_or_else(|| Error::custom("invalid duration number"))?;
                Ok(Duration::from_secs(secs))
            }
            _ => Err(Error::custom("invalid duration format")),
        }
    }

    /// Same as [`parse_duration_string`] but with an `anyhow` error, for
    /// callers (the gateway binary's config loader) that propagate with `?`
    /// through `anyhow::Result`.
    pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
        parse_duration_string(s).map_err(anyhow::Error::msg)
    }

    /// Parses strings like `"30s"`, `"500ms"`, `"2m"`, `"1h"`.
    pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration string".to_string());
        }
        if let Some(stripped) = s.strip_suffix("ms") {
            let num: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_millis(num));
        }
        if let Some(stripped) = s.strip_suffix('h') {
            let num: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_secs(num * 3600));
        }
        if let Some(stripped) = s.strip_suffix('m') {
            let num: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_secs(num * 60));
        }
        if let Some(stripped) = s.strip_suffix('s') {
            let num: f64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            let secs = num.trunc() as u64;
            let nanos = (num.fract() * 1_000_000_000.0).round() as u32;
            return Ok(Duration::new(secs, nanos));
        }
        Err(format!("unknown duration unit: {s}"))
    }

}
