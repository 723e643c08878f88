pub mod fleet;
pub mod history;
pub mod lock;
pub mod marker;

use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width UTC RFC 3339, so stored timestamps also sort lexically.
pub(crate) fn to_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn now_ts() -> String {
    to_ts(Utc::now())
}

pub(crate) fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn parse_version(raw: &str) -> rusqlite::Result<crate::engine::version::SchemaVersion> {
    crate::engine::version::SchemaVersion::parse(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}
