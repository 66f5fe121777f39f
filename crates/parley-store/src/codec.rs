//! Column encoding helpers shared by the row mappers.
//!
//! Timestamps are stored as epoch milliseconds so that SQL ordering matches
//! chronological ordering. Opaque payloads are stored as JSON text and only
//! decoded here, at the mapping boundary.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, thiserror::Error)]
#[error("invalid column value: {0}")]
struct InvalidColumn(String);

pub(crate) fn millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn opt_millis(ts: Option<&DateTime<Utc>>) -> Option<i64> {
    ts.map(millis)
}

pub(crate) fn from_millis(idx: usize, value: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value).ok_or_else(|| {
        invalid(idx, Type::Integer, format!("timestamp out of range: {value}"))
    })
}

pub(crate) fn opt_from_millis(
    idx: usize,
    value: Option<i64>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| from_millis(idx, v)).transpose()
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn invalid(idx: usize, ty: Type, what: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(InvalidColumn(what)))
}
