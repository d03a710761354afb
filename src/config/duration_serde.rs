//! Serde helpers for human-readable durations ("5s", "1m30s") in configuration.

use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};
use std::{fmt, time::Duration};

/// Serialize a `Duration` as a humantime string, accept strings or whole seconds
pub mod duration {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }
}

struct DurationVisitor;

impl<'de> Visitor<'de> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a duration as seconds (number) or human-readable string (e.g. '500ms', '5s', '1h30m')")
    }

    fn visit_u64<E>(self, seconds: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Duration::from_secs(seconds))
    }

    fn visit_i64<E>(self, seconds: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        u64::try_from(seconds)
            .map(Duration::from_secs)
            .map_err(|_| de::Error::custom(format!("Negative duration: {seconds}")))
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        humantime::parse_duration(value)
            .map_err(|e| de::Error::custom(format!("Invalid duration '{value}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Holder {
        #[serde(with = "super::duration")]
        wait: Duration,
    }

    #[test]
    fn test_parses_strings_and_seconds() {
        let from_str: Holder = toml::from_str("wait = \"1m30s\"").unwrap();
        assert_eq!(from_str.wait, Duration::from_secs(90));

        let from_int: Holder = toml::from_str("wait = 5").unwrap();
        assert_eq!(from_int.wait, Duration::from_secs(5));

        assert!(toml::from_str::<Holder>("wait = \"soon\"").is_err());
        assert!(toml::from_str::<Holder>("wait = -3").is_err());
    }

    #[test]
    fn test_serializes_human_readable() {
        let holder = Holder {
            wait: Duration::from_millis(1500),
        };
        let rendered = toml::to_string(&holder).unwrap();
        assert!(rendered.contains("1s 500ms"));
        let back: Holder = toml::from_str(&rendered).unwrap();
        assert_eq!(back, holder);
    }
}
