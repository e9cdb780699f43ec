use std::any::{Any, TypeId};
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Identity and time accessors every domain event exposes.
///
/// Implement it with [`impl_event!`](crate::impl_event), which reads the
/// `aggregate_id` and `occurred_at` fields of the event struct.
pub trait Event {
    fn aggregate_id(&self) -> String;
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// A concrete, owned domain event value that the pipeline can serialize,
/// clone and move between tasks.
pub trait DomainEvent:
    Event + Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

impl<T> DomainEvent for T where
    T: Event + Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// Object-safe view over a [`DomainEvent`], used by event buffers and handlers.
pub trait AnyEvent: Event + fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
    fn clone_event(&self) -> Box<dyn AnyEvent>;
}

impl<T: DomainEvent> AnyEvent for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn clone_event(&self) -> Box<dyn AnyEvent> {
        Box::new(self.clone())
    }
}

impl dyn AnyEvent {
    pub fn downcast_ref<E: DomainEvent>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    pub fn is<E: DomainEvent>(&self) -> bool {
        self.as_any().is::<E>()
    }

    /// `TypeId` of the concrete event behind the trait object.
    pub fn event_type(&self) -> TypeId {
        self.as_any().type_id()
    }
}

impl Clone for Box<dyn AnyEvent> {
    fn clone(&self) -> Self {
        self.clone_event()
    }
}

/// An aggregate identifier that serializes as a JSON string equal to
/// [`to_aggregate_id`](AggregateId::to_aggregate_id).
///
/// The outbox stores identifiers as text and the serializer writes them back
/// into the event as a JSON string, so only string-shaped ids can round-trip.
/// Numeric ids are rejected when the event is declared:
///
/// ```compile_fail
/// use factory_events::{impl_event, __chrono::{DateTime, Utc}};
///
/// #[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
/// struct BatchNumbered {
///     aggregate_id: i64,
///     occurred_at: DateTime<Utc>,
/// }
///
/// impl_event!(BatchNumbered);
/// ```
///
/// Wrap a number in a newtype that serializes as a string to use it as an id.
pub trait AggregateId {
    fn to_aggregate_id(&self) -> String;
}

impl AggregateId for String {
    fn to_aggregate_id(&self) -> String {
        self.clone()
    }
}

impl AggregateId for uuid::Uuid {
    fn to_aggregate_id(&self) -> String {
        self.to_string()
    }
}

/// Current time at microsecond precision, the resolution events are stored at.
pub fn timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[macro_export]
macro_rules! impl_event {
    ($ty:ty) => {
        impl $crate::Event for $ty {
            fn aggregate_id(&self) -> String {
                $crate::AggregateId::to_aggregate_id(&self.aggregate_id)
            }

            fn occurred_at(&self) -> $crate::__chrono::DateTime<$crate::__chrono::Utc> {
                self.occurred_at
            }
        }
    };
}
