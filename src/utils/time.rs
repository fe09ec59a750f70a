//! Timestamp handling for persisted and exported data.
//!
//! Timestamps are always written in UTC as `YYYY-MM-DDTHH:MM:SS.mmmZ` and
//! revived from exactly that pattern.  Values are kept at millisecond
//! precision so that a save/load cycle is lossless.

use serde::{Deserialize, Deserializer, Serializer};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

/// Returns the current UTC time truncated to milliseconds.
pub fn now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(u32::from(now.millisecond()) * 1_000_000)
        .unwrap_or(now)
}

/// Formats a timestamp with the persisted millisecond pattern.
pub fn format_timestamp(datetime: &OffsetDateTime) -> Result<String, time::error::Format> {
    datetime.to_offset(UtcOffset::UTC).format(TIMESTAMP_FORMAT)
}

/// Parses a timestamp written by [`format_timestamp`].
pub fn parse_timestamp(s: &str) -> Result<OffsetDateTime, time::error::Parse> {
    PrimitiveDateTime::parse(s, TIMESTAMP_FORMAT).map(PrimitiveDateTime::assume_utc)
}

/// Deserialize a millisecond ISO-8601 string into an OffsetDateTime
pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_timestamp(&s).map_err(serde::de::Error::custom)
}

/// Serialize an OffsetDateTime into a millisecond ISO-8601 string
pub fn serialize<S>(datetime: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let s = format_timestamp(datetime).map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&s)
}
