use serde::de::DeserializeOwned;
use serde::Serialize;

use super::entity::Entity;

/// A business object persisted as a JSON snapshot and tracked by a unit of
/// work.
///
/// The embedded [`Entity`] must be excluded from the serialized state
/// (`#[serde(skip)]`); identity and version live in their own columns.
pub trait Aggregate: Serialize + DeserializeOwned + Send + 'static {
    /// Stable name used as the storage key prefix, e.g. `"batch"`.
    const KIND: &'static str;

    fn entity(&self) -> &Entity;
    fn entity_mut(&mut self) -> &mut Entity;

    fn id(&self) -> &str {
        self.entity().id()
    }
}

#[macro_export]
macro_rules! impl_aggregate {
    ($ty:ty, $kind:expr, $entity:ident) => {
        impl $crate::Aggregate for $ty {
            const KIND: &'static str = $kind;

            fn entity(&self) -> &$crate::Entity {
                &self.$entity
            }

            fn entity_mut(&mut self) -> &mut $crate::Entity {
                &mut self.$entity
            }
        }
    };
}
