//! Environment-driven configuration helpers.

use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },

    #[error("malformed entry {entry:?} in {name}, expected {expected}")]
    MalformedEntry {
        name: String,
        entry: String,
        expected: &'static str,
    },
}

/// Read and parse an optional environment variable.
pub fn env_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => parse_value(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

pub fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value: raw.to_string(),
    })
}

/// Split a `a:b,c:d` list into pairs.
pub fn parse_pairs(name: &str, raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((left, right)) if !left.is_empty() && !right.is_empty() => {
                Ok((left.to_string(), right.to_string()))
            }
            _ => Err(ConfigError::MalformedEntry {
                name: name.to_string(),
                entry: entry.to_string(),
                expected: "key:value",
            }),
        })
        .collect()
}
