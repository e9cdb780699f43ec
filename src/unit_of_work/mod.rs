mod collector;
mod error;
mod identity_map;
mod repository;
mod tracked;
mod unit_of_work;

pub use collector::EventCollector;
pub use error::UnitOfWorkError;
pub use identity_map::{IdentityKey, IdentityMap};
pub use repository::TrackedRepository;
pub use tracked::Tracked;
pub use unit_of_work::{CommitSummary, UnitOfWork};
