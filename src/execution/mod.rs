//! Execution engine
//!
//! Provides:
//! - A bounded, runtime-resizable permit pool
//! - An ordered test queue with pluggable priority
//! - Out-of-process workers and the pool managing their lifecycle
//! - The queue consumer loop and the runner front door

pub mod concurrency;
pub mod consumer;
pub mod pool;
pub mod queue;
pub mod runner;
pub mod worker;

pub use concurrency::{ConcurrencyController, ConcurrencyPermit};
pub use consumer::QueueConsumer;
pub use pool::WorkerPool;
pub use queue::{FailFastPriority, NameOrder, PriorityPolicy, QueueEntry, RunHistory, TestQueue};
pub use runner::{RunnerOptions, TestRunner};
pub use worker::{ConnectionFactory, ProcessConnectionFactory, ResultSink, WorkerConnection, WorkerId};

use tokio::sync::watch;

/// Resolve once the flag is set. A dropped sender means nobody can cancel
/// any more, so this then never resolves.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
