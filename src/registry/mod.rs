pub mod as_string;
mod error;
mod registry;
mod serializer;

pub use error::{RegistryError, SerializationError};
pub use registry::{EventMetadata, EventRegistry, EventRegistryBuilder, EventShape};
pub use serializer::{
    dedup_key, EventSerializer, SerializedEvent, AGGREGATE_ID_FIELD, OCCURRED_AT_FIELD,
};
