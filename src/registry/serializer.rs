use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::SerializationError;
use super::registry::EventRegistry;
use crate::core::AnyEvent;
use crate::store::OutboxRecord;

pub const AGGREGATE_ID_FIELD: &str = "aggregate_id";
pub const OCCURRED_AT_FIELD: &str = "occurred_at";

/// The storable form of a domain event.
///
/// `payload` holds every event field except `aggregate_id` and
/// `occurred_at`, which travel in their own columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedEvent {
    pub event_name: String,
    pub event_version: i32,
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl SerializedEvent {
    /// `event_name:aggregate_id:occurred_at`, with the timestamp in RFC 3339
    /// at microsecond precision.
    pub fn dedup_key(&self) -> String {
        dedup_key(&self.event_name, &self.aggregate_id, self.occurred_at)
    }

    /// The complete event as JSON: payload plus identity and time fields.
    pub fn data(&self) -> Value {
        let mut object = self.payload.clone();
        object.insert(
            AGGREGATE_ID_FIELD.to_string(),
            Value::String(self.aggregate_id.clone()),
        );
        object.insert(
            OCCURRED_AT_FIELD.to_string(),
            Value::String(format_timestamp(self.occurred_at)),
        );
        Value::Object(object)
    }
}

pub fn dedup_key(event_name: &str, aggregate_id: &str, occurred_at: DateTime<Utc>) -> String {
    format!(
        "{}:{}:{}",
        event_name,
        aggregate_id,
        format_timestamp(occurred_at)
    )
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Converts events to and from [`SerializedEvent`] through an
/// [`EventRegistry`].
#[derive(Debug, Clone)]
pub struct EventSerializer {
    registry: Arc<EventRegistry>,
}

impl EventSerializer {
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    pub fn serialize(&self, event: &dyn AnyEvent) -> Result<SerializedEvent, SerializationError> {
        let shape = self.registry.shape_of(event.event_type()).ok_or(
            SerializationError::UnregisteredShape {
                type_name: event.type_name(),
            },
        )?;

        let occurred_at = event.occurred_at();
        if occurred_at.timestamp_subsec_nanos() % 1_000 != 0 {
            return Err(SerializationError::SubMicrosecondTimestamp {
                type_name: event.type_name(),
                occurred_at,
            });
        }

        let value = event.to_json().map_err(|err| SerializationError::Encode {
            type_name: event.type_name(),
            message: err.to_string(),
        })?;
        let Value::Object(mut payload) = value else {
            return Err(SerializationError::NotAnObject {
                type_name: event.type_name(),
            });
        };
        payload.remove(AGGREGATE_ID_FIELD);
        payload.remove(OCCURRED_AT_FIELD);

        Ok(SerializedEvent {
            event_name: shape.name().to_string(),
            event_version: shape.version(),
            aggregate_id: event.aggregate_id(),
            occurred_at,
            payload,
        })
    }

    pub fn deserialize(
        &self,
        event: &SerializedEvent,
    ) -> Result<Box<dyn AnyEvent>, SerializationError> {
        let shape = self
            .registry
            .shape_for(&event.event_name, event.event_version)
            .ok_or_else(|| SerializationError::UnregisteredEvent {
                name: event.event_name.clone(),
                version: event.event_version,
            })?;

        shape
            .decode(event.data())
            .map_err(|err| SerializationError::MalformedPayload {
                name: event.event_name.clone(),
                version: event.event_version,
                message: err.to_string(),
            })
    }

    pub fn deserialize_record(
        &self,
        record: &OutboxRecord,
    ) -> Result<Box<dyn AnyEvent>, SerializationError> {
        self.deserialize(&record.to_serialized())
    }
}
