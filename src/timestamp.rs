//! Fixed wire encoding for timestamps: RFC 3339 in UTC with millisecond precision and a `Z`
//! suffix. The server expects this exact shape, so the default `chrono` serialization (variable
//! precision) is not used for wire types.
//!
//! Use with `#[serde(with = "crate::timestamp")]`.
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Millis, true))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}
