use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("event {name} v{version} is already registered")]
    DuplicateRegistration { name: String, version: i32 },
    #[error("event type {type_name} is already registered as {name} v{version}")]
    DuplicateShape {
        type_name: &'static str,
        name: String,
        version: i32,
    },
    #[error("event name must not be empty")]
    EmptyName,
    #[error("event version must be positive, got {0}")]
    InvalidVersion(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationError {
    #[error("event type {type_name} is not registered")]
    UnregisteredShape { type_name: &'static str },
    #[error("event {name} v{version} is not registered")]
    UnregisteredEvent { name: String, version: i32 },
    #[error("event {type_name} did not serialize to a JSON object")]
    NotAnObject { type_name: &'static str },
    #[error("failed to encode {type_name}: {message}")]
    Encode {
        type_name: &'static str,
        message: String,
    },
    #[error("event {type_name} occurred at {occurred_at}, finer than the microsecond precision events are stored at")]
    SubMicrosecondTimestamp {
        type_name: &'static str,
        occurred_at: DateTime<Utc>,
    },
    #[error("malformed payload for {name} v{version}: {message}")]
    MalformedPayload {
        name: String,
        version: i32,
        message: String,
    },
}
