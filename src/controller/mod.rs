//! # Controller
//!
//! Core reconciliation modules.
//!
//! - `backoff`: exponential backoff with jitter for retries
//! - `dispatcher`: change events to queued operations, worker pool
//! - `engine`: management surface and lifecycle
//! - `executor`: sync, unsync and recreate against one destination
//! - `retry`: classification-aware retries around destination calls
//! - `scanner`: periodic drift detection and repair
//! - `single_flight`: one in-flight operation per association

pub mod backoff;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod retry;
pub mod scanner;
pub mod single_flight;

use tokio::sync::watch;

/// Resolves once `shutdown` reads `true` or its sender is gone
///
/// Returns nothing so no `watch::Ref` outlives the call; `select!` arms can
/// then await in their handlers and stay `Send`.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}
