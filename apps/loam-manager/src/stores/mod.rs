//! Lifecycle stores for peripherals and controller tasks. The two stores are
//! structurally parallel but deliberately independent: their command
//! vocabularies are never cross-validated and each evolves on its own.

pub mod peripheral;
pub mod task;

use loam_proto::JsonObject;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Validation failure for a single command entry. Always recoverable and
/// surfaced to the caller; no batch that triggers one commits anything.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("missing key '{key}'")]
    MissingKey { key: &'static str },
    #[error("missing key '{key}' for {id}")]
    MissingKeyFor { key: &'static str, id: Uuid },
    #[error("invalid value for key '{key}'")]
    InvalidValue { key: &'static str },
    #[error("invalid uuid '{value}'")]
    InvalidUuid { value: String },
    #[error("unknown peripheral type '{value}' for {id}")]
    UnknownPeripheralType { value: String, id: Uuid },
    #[error("duplicate uuid {id}")]
    DuplicateUuid { id: Uuid },
}

/// Outcome of applying a controller-reported lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Applied,
    Noop,
    Rejected,
}

pub(crate) fn take_string(
    entry: &mut JsonObject,
    key: &'static str,
    id: Option<Uuid>,
) -> Result<String, CommandError> {
    match entry.remove(key) {
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(CommandError::InvalidValue { key }),
        None => Err(match id {
            Some(id) => CommandError::MissingKeyFor { key, id },
            None => CommandError::MissingKey { key },
        }),
    }
}

pub(crate) fn take_uuid(entry: &mut JsonObject, key: &'static str) -> Result<Uuid, CommandError> {
    let raw = take_string(entry, key, None)?;
    Uuid::parse_str(&raw).map_err(|_| CommandError::InvalidUuid { value: raw })
}
