use std::marker::PhantomData;

use tracing::trace;

use super::error::UnitOfWorkError;
use super::tracked::{hydrate, Tracked};
use super::unit_of_work::UnitOfWork;
use crate::core::Aggregate;
use crate::store::{Store, Transaction};

/// Aggregate access scoped to one unit of work.
///
/// Every handle it returns is registered in the unit of work's identity map,
/// so whatever the caller does to it is flushed, and its events harvested,
/// at commit.
pub struct TrackedRepository<'u, S: Store, A> {
    uow: &'u mut UnitOfWork<S>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<'u, S: Store, A: Aggregate> TrackedRepository<'u, S, A> {
    pub(crate) fn new(uow: &'u mut UnitOfWork<S>) -> Self {
        Self {
            uow,
            _aggregate: PhantomData,
        }
    }

    /// Tracks a new aggregate. Saving it fails with a concurrent-write error
    /// if the identity already exists in the store.
    pub fn create(&mut self, aggregate: A) -> Result<Tracked<A>, UnitOfWorkError> {
        let handle = Tracked::new(aggregate);
        self.uow.identity_map_mut().register(&handle)?;
        Ok(handle)
    }

    /// Loads an aggregate for writing.
    ///
    /// Returns the handle already tracked for this identity if there is one,
    /// so repeated loads within a unit of work share one instance.
    pub async fn get(&mut self, id: &str) -> Result<Option<Tracked<A>>, UnitOfWorkError> {
        if let Some(handle) = self.uow.identity_map().get::<A>(id) {
            trace!(kind = A::KIND, id, "identity map hit");
            return Ok(Some(handle));
        }

        let stored = self.uow.transaction()?.load_aggregate(A::KIND, id).await?;
        let Some(stored) = stored else {
            return Ok(None);
        };
        let handle = Tracked::new(hydrate::<A>(stored)?);
        self.uow.identity_map_mut().register(&handle)?;
        Ok(Some(handle))
    }

    /// Tracks a handle obtained outside this unit of work, merging it with
    /// any instance already tracked for the same identity.
    pub fn update(&mut self, handle: &Tracked<A>) -> Result<(), UnitOfWorkError> {
        self.uow.identity_map_mut().register(handle)
    }
}
