use std::collections::HashSet;

use tracing::debug;

use super::error::UnitOfWorkError;
use super::identity_map::IdentityMap;
use crate::registry::EventSerializer;
use crate::store::NewOutboxRecord;

/// Harvests pending events from every tracked aggregate into outbox rows.
///
/// Events come out in identity-map order, then instance order, then buffer
/// order. Two events with the same dedup key in one harvest collapse into the
/// first.
pub struct EventCollector<'a> {
    serializer: &'a EventSerializer,
}

impl<'a> EventCollector<'a> {
    pub fn new(serializer: &'a EventSerializer) -> Self {
        Self { serializer }
    }

    pub fn collect(&self, map: &IdentityMap) -> Result<Vec<NewOutboxRecord>, UnitOfWorkError> {
        let mut seen = HashSet::new();
        let mut records = Vec::new();

        for entry in map.entries() {
            for instance in entry.instances() {
                for event in instance.pending_events()? {
                    let serialized = self.serializer.serialize(event.as_ref())?;
                    let record = NewOutboxRecord::from(serialized);
                    if seen.insert(record.dedup_key.clone()) {
                        records.push(record);
                    } else {
                        debug!(
                            kind = entry.key().kind,
                            aggregate_id = %entry.key().id,
                            dedup_key = %record.dedup_key,
                            "duplicate event collapsed"
                        );
                    }
                }
            }
        }
        Ok(records)
    }
}
