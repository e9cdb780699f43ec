use std::collections::HashMap;

use super::error::UnitOfWorkError;
use super::tracked::{Tracked, TrackedObject};
use crate::core::Aggregate;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub kind: &'static str,
    pub id: String,
}

/// Every instance registered for one identity. The last one holds the state
/// that gets flushed; all of them contribute pending events.
pub(crate) struct IdentityEntry {
    key: IdentityKey,
    instances: Vec<Box<dyn TrackedObject>>,
}

impl IdentityEntry {
    pub(crate) fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub(crate) fn latest(&self) -> Option<&dyn TrackedObject> {
        self.instances.last().map(|instance| instance.as_ref())
    }

    pub(crate) fn instances(&self) -> impl Iterator<Item = &dyn TrackedObject> {
        self.instances.iter().map(|instance| instance.as_ref())
    }
}

/// Aggregates touched by one unit of work, in first-registration order.
#[derive(Default)]
pub struct IdentityMap {
    entries: Vec<IdentityEntry>,
    index: HashMap<IdentityKey, usize>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle.
    ///
    /// Registering the same handle again is a no-op. A different instance
    /// with an identity already present is merged into that entry.
    pub fn register<A: Aggregate>(&mut self, handle: &Tracked<A>) -> Result<(), UnitOfWorkError> {
        let id = handle.id()?;
        if id.is_empty() {
            return Err(UnitOfWorkError::MissingId { kind: A::KIND });
        }
        let key = IdentityKey { kind: A::KIND, id };
        let instance: Box<dyn TrackedObject> = Box::new(handle.clone());

        match self.index.get(&key) {
            Some(&position) => {
                let entry = &mut self.entries[position];
                if entry
                    .instances
                    .iter()
                    .all(|existing| existing.address() != instance.address())
                {
                    entry.instances.push(instance);
                }
            }
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push(IdentityEntry {
                    key,
                    instances: vec![instance],
                });
            }
        }
        Ok(())
    }

    /// Latest registered handle for `(A::KIND, id)`.
    pub fn get<A: Aggregate>(&self, id: &str) -> Option<Tracked<A>> {
        let key = IdentityKey {
            kind: A::KIND,
            id: id.to_string(),
        };
        let position = *self.index.get(&key)?;
        self.entries[position]
            .latest()?
            .as_any()
            .downcast_ref::<Tracked<A>>()
            .cloned()
    }

    pub fn contains(&self, kind: &str, id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.key.kind == kind && entry.key.id == id)
    }

    pub fn keys(&self) -> impl Iterator<Item = &IdentityKey> {
        self.entries.iter().map(|entry| &entry.key)
    }

    /// Number of instances registered for an identity.
    pub fn instance_count(&self, kind: &str, id: &str) -> usize {
        self.entries
            .iter()
            .find(|entry| entry.key.kind == kind && entry.key.id == id)
            .map_or(0, |entry| entry.instances.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub(crate) fn entries(&self) -> &[IdentityEntry] {
        &self.entries
    }
}
