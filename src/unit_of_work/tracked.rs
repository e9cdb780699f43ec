use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::UnitOfWorkError;
use crate::core::{Aggregate, AnyEvent};
use crate::store::StoredAggregate;

/// Shared handle to an aggregate registered with a unit of work.
///
/// The caller and the identity map hold the same allocation, so events raised
/// through the handle after registration are still harvested at commit.
pub struct Tracked<A> {
    inner: Arc<Mutex<A>>,
}

impl<A> Clone for Tracked<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Tracked<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tracked").field(&self.inner).finish()
    }
}

impl<A: Aggregate> Tracked<A> {
    pub fn new(aggregate: A) -> Self {
        Self {
            inner: Arc::new(Mutex::new(aggregate)),
        }
    }

    /// Locks the aggregate. Do not hold the guard across an `.await`.
    pub fn lock(&self) -> Result<MutexGuard<'_, A>, UnitOfWorkError> {
        self.inner.lock().map_err(|_| UnitOfWorkError::LockPoisoned)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut A) -> R) -> Result<R, UnitOfWorkError> {
        let mut guard = self.lock()?;
        Ok(f(&mut guard))
    }

    pub fn id(&self) -> Result<String, UnitOfWorkError> {
        Ok(self.lock()?.id().to_string())
    }

    pub fn ptr_eq(&self, other: &Tracked<A>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Type-erased operations the identity map and collector need.
pub(crate) trait TrackedObject: Send + Sync {
    fn kind(&self) -> &'static str;
    fn id(&self) -> Result<String, UnitOfWorkError>;
    fn address(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
    fn snapshot(&self) -> Result<StoredAggregate, UnitOfWorkError>;
    fn pending_events(&self) -> Result<Vec<Box<dyn AnyEvent>>, UnitOfWorkError>;
    fn mark_committed(&self, version: i64) -> Result<(), UnitOfWorkError>;
}

impl<A: Aggregate> TrackedObject for Tracked<A> {
    fn kind(&self) -> &'static str {
        A::KIND
    }

    fn id(&self) -> Result<String, UnitOfWorkError> {
        Tracked::id(self)
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn snapshot(&self) -> Result<StoredAggregate, UnitOfWorkError> {
        let aggregate = self.lock()?;
        let id = aggregate.id().to_string();
        let state = serde_json::to_value(&*aggregate).map_err(|err| {
            UnitOfWorkError::AggregateEncoding {
                kind: A::KIND,
                id: id.clone(),
                message: err.to_string(),
            }
        })?;
        Ok(StoredAggregate {
            kind: A::KIND.to_string(),
            id,
            version: aggregate.entity().version(),
            state,
        })
    }

    fn pending_events(&self) -> Result<Vec<Box<dyn AnyEvent>>, UnitOfWorkError> {
        Ok(self.lock()?.entity().pending_events().to_vec())
    }

    fn mark_committed(&self, version: i64) -> Result<(), UnitOfWorkError> {
        self.lock()?.entity_mut().mark_committed(version);
        Ok(())
    }
}

/// Rebuilds an aggregate from a stored snapshot.
pub(crate) fn hydrate<A: Aggregate>(stored: StoredAggregate) -> Result<A, UnitOfWorkError> {
    let StoredAggregate {
        id, version, state, ..
    } = stored;
    let mut aggregate: A =
        serde_json::from_value::<A>(state).map_err(|err| UnitOfWorkError::AggregateDecoding {
            kind: A::KIND,
            id: id.clone(),
            message: err.to_string(),
        })?;
    aggregate.entity_mut().load(id, version);
    Ok(aggregate)
}
