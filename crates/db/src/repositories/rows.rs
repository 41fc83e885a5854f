use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::RepositoryError;

pub(crate) fn text(row: &SqliteRow, column: &str) -> Result<String, RepositoryError> {
    row.try_get(column).map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

pub(crate) fn optional_text(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<String>, RepositoryError> {
    row.try_get(column).map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

pub(crate) fn flag(row: &SqliteRow, column: &str) -> Result<bool, RepositoryError> {
    let value: i64 =
        row.try_get(column).map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))?;
    Ok(value != 0)
}

pub(crate) fn unsigned(row: &SqliteRow, column: &str) -> Result<u32, RepositoryError> {
    let value: i64 =
        row.try_get(column).map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))?;
    u32::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("{column}: {value} is out of range")))
}

pub(crate) fn decimal(row: &SqliteRow, column: &str) -> Result<Decimal, RepositoryError> {
    let raw = text(row, column)?;
    Decimal::from_str(&raw).map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

pub(crate) fn timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, RepositoryError> {
    parse_timestamp(column, &text(row, column)?)
}

pub(crate) fn optional_timestamp(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    optional_text(row, column)?.map(|raw| parse_timestamp(column, &raw)).transpose()
}

/// Parses a stored enum label through its `FromStr` impl.
pub(crate) fn parsed<T>(row: &SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = text(row, column)?;
    raw.parse::<T>().map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

pub(crate) fn to_i64(value: u32) -> i64 {
    i64::from(value)
}
