//! Shared fixtures for the integration suites: a small factory domain,
//! recording and failing handlers, a local webhook endpoint and a store
//! whose commits can be made to fail.

#![allow(dead_code)]

pub mod endpoint;
pub mod factory;
pub mod failing_store;
pub mod handlers;

pub use endpoint::{Captured, Endpoint};
pub use factory::*;
pub use failing_store::FailingCommitStore;
pub use handlers::{FailingHandler, FlakyHandler, ProjectionHandler, RecordingHandler};

/// Runs `f` until it returns true or `timeout` passes.
pub async fn eventually<F>(timeout: std::time::Duration, mut f: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    f()
}
