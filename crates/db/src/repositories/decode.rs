use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::RepositoryError;

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_enum<T>(
    column: &str,
    value: String,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, RepositoryError> {
    parse(&value).ok_or_else(|| RepositoryError::Decode(format!("unknown {column} `{value}`")))
}

pub(crate) fn parse_json<T: DeserializeOwned>(
    column: &str,
    value: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

pub(crate) fn parse_optional_json<T: DeserializeOwned>(
    column: &str,
    value: Option<String>,
) -> Result<Option<T>, RepositoryError> {
    value.map(|raw| parse_json(column, &raw)).transpose()
}

pub(crate) fn encode_json<T: Serialize>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("could not encode `{column}`: {error}")))
}

pub(crate) fn encode_optional_json<T: Serialize>(
    column: &str,
    value: Option<&T>,
) -> Result<Option<String>, RepositoryError> {
    value.map(|value| encode_json(column, value)).transpose()
}
