use std::fmt;

use super::event::{AnyEvent, DomainEvent};

/// Identity, persisted version and pending-event buffer embedded in every
/// aggregate.
///
/// Business operations append with [`Entity::raise`]. The buffer is drained
/// only when a unit of work commits successfully, so a failed or rolled back
/// commit can be retried with the same events.
#[derive(Default)]
pub struct Entity {
    id: String,
    version: i64,
    pending: Vec<Box<dyn AnyEvent>>,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("pending", &self.pending)
            .finish()
    }
}

impl Clone for Entity {
    fn clone(&self) -> Self {
        Entity {
            id: self.id.clone(),
            version: self.version,
            pending: self.pending.clone(),
        }
    }
}

impl Entity {
    pub fn new() -> Self {
        Entity::default()
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let mut entity = Entity::default();
        entity.id = id.into();
        entity
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    /// Version of the last committed snapshot; 0 for an aggregate never saved.
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn raise<E: DomainEvent>(&mut self, event: E) {
        self.pending.push(Box::new(event));
    }

    pub fn pending_events(&self) -> &[Box<dyn AnyEvent>] {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn load(&mut self, id: impl Into<String>, version: i64) {
        self.id = id.into();
        self.version = version;
    }

    pub(crate) fn mark_committed(&mut self, version: i64) {
        self.version = version;
        self.pending.clear();
    }
}
