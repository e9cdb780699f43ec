use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::error::RegistryError;
use crate::core::{AnyEvent, DomainEvent};

type DecodeFn = fn(Value) -> Result<Box<dyn AnyEvent>, serde_json::Error>;

fn decode_as<E: DomainEvent>(value: Value) -> Result<Box<dyn AnyEvent>, serde_json::Error> {
    Ok(Box::new(serde_json::from_value::<E>(value)?))
}

/// A registered event shape: its stable `(name, version)` and the Rust type
/// that carries it.
pub struct EventShape {
    name: String,
    version: i32,
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

impl EventShape {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn metadata(&self) -> EventMetadata {
        EventMetadata {
            name: self.name.clone(),
            version: self.version,
        }
    }

    pub(crate) fn decode(&self, value: Value) -> Result<Box<dyn AnyEvent>, serde_json::Error> {
        (self.decode)(value)
    }
}

impl fmt::Debug for EventShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventShape")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("type_name", &self.type_name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventMetadata {
    pub name: String,
    pub version: i32,
}

/// Bidirectional map between event types and their `(name, version)`.
///
/// Built once at startup through [`EventRegistry::builder`] and shared
/// read-only (usually behind an `Arc`).
#[derive(Debug, Default)]
pub struct EventRegistry {
    by_key: HashMap<(String, i32), Arc<EventShape>>,
    by_type: HashMap<TypeId, Arc<EventShape>>,
    order: Vec<Arc<EventShape>>,
}

impl EventRegistry {
    pub fn builder() -> EventRegistryBuilder {
        EventRegistryBuilder {
            registry: EventRegistry::default(),
        }
    }

    pub fn shape_for(&self, name: &str, version: i32) -> Option<&EventShape> {
        self.by_key
            .get(&(name.to_string(), version))
            .map(|shape| shape.as_ref())
    }

    pub fn shape_of(&self, type_id: TypeId) -> Option<&EventShape> {
        self.by_type.get(&type_id).map(|shape| shape.as_ref())
    }

    pub fn metadata_for<E: DomainEvent>(&self) -> Option<EventMetadata> {
        self.shape_of(TypeId::of::<E>()).map(EventShape::metadata)
    }

    pub fn metadata_of(&self, event: &dyn AnyEvent) -> Option<EventMetadata> {
        self.shape_of(event.event_type()).map(EventShape::metadata)
    }

    /// Every registered version of `name`, lowest version first.
    pub fn versions_of(&self, name: &str) -> Vec<&EventShape> {
        let mut shapes: Vec<&EventShape> = self
            .order
            .iter()
            .filter(|shape| shape.name == name)
            .map(|shape| shape.as_ref())
            .collect();
        shapes.sort_by_key(|shape| shape.version);
        shapes
    }

    /// Shapes in registration order.
    pub fn shapes(&self) -> impl Iterator<Item = &EventShape> {
        self.order.iter().map(|shape| shape.as_ref())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug)]
pub struct EventRegistryBuilder {
    registry: EventRegistry,
}

impl EventRegistryBuilder {
    pub fn register<E: DomainEvent>(
        mut self,
        name: impl Into<String>,
        version: i32,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if version < 1 {
            return Err(RegistryError::InvalidVersion(version));
        }

        let key = (name.clone(), version);
        if self.registry.by_key.contains_key(&key) {
            return Err(RegistryError::DuplicateRegistration { name, version });
        }

        let type_id = TypeId::of::<E>();
        if let Some(existing) = self.registry.by_type.get(&type_id) {
            return Err(RegistryError::DuplicateShape {
                type_name: type_name::<E>(),
                name: existing.name.clone(),
                version: existing.version,
            });
        }

        let shape = Arc::new(EventShape {
            name,
            version,
            type_id,
            type_name: type_name::<E>(),
            decode: decode_as::<E>,
        });
        self.registry.by_key.insert(key, shape.clone());
        self.registry.by_type.insert(type_id, shape.clone());
        self.registry.order.push(shape);
        Ok(self)
    }

    pub fn build(self) -> EventRegistry {
        self.registry
    }
}
