pub mod aggregate;
pub mod entity;
pub mod event;

pub use aggregate::Aggregate;
pub use entity::Entity;
pub use event::{timestamp, AggregateId, AnyEvent, DomainEvent, Event};
