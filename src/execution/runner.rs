//! Front door of the execution engine
//!
//! Nothing is started until the first non-empty push: an idle session
//! keeps no consumer task and no workers around.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use super::concurrency::ConcurrencyController;
use super::consumer::QueueConsumer;
use super::pool::WorkerPool;
use super::queue::{FailFastPriority, PriorityPolicy, RunHistory, TestQueue};
use super::worker::ConnectionFactory;
use crate::events::{EventBus, RunEvent};

/// Options for the execution engine
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Maximum number of workers running at once
    pub concurrency: usize,
    /// Tests handed to one worker per dispatch
    pub batch_size: usize,
    /// Events buffered per subscriber before it starts lagging
    pub event_capacity: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            batch_size: 1,
            event_capacity: 1024,
        }
    }
}

pub struct TestRunner {
    factory: Arc<dyn ConnectionFactory>,
    /// Bound of the running consumer; replaced each time one starts
    controller: Mutex<ConcurrencyController>,
    history: Arc<RunHistory>,
    priority: Arc<dyn PriorityPolicy>,
    bus: Arc<EventBus>,
    batch_size: usize,
    consumer: Mutex<Option<QueueConsumer>>,
}

impl TestRunner {
    /// Runner with fail-fast ordering
    pub fn new(factory: Arc<dyn ConnectionFactory>, options: RunnerOptions) -> Self {
        let history = Arc::new(RunHistory::new());
        let priority = Arc::new(FailFastPriority::new(history.clone()));
        Self::with_priority(factory, options, history, priority)
    }

    pub fn with_priority(
        factory: Arc<dyn ConnectionFactory>,
        options: RunnerOptions,
        history: Arc<RunHistory>,
        priority: Arc<dyn PriorityPolicy>,
    ) -> Self {
        Self {
            factory,
            controller: Mutex::new(ConcurrencyController::new(options.concurrency)),
            history,
            priority,
            bus: Arc::new(EventBus::new(options.event_capacity)),
            batch_size: options.batch_size.max(1),
            consumer: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.bus.subscribe()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn history(&self) -> Arc<RunHistory> {
        self.history.clone()
    }

    /// Queue tests for execution. Returns the session id, or `None` when
    /// there was nothing to run. Must be called inside a tokio runtime.
    pub fn run_tests<I, S>(&self, test_names: I) -> Option<Uuid>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let tests: Vec<String> = test_names
            .into_iter()
            .map(Into::into)
            .filter(|name| seen.insert(name.clone()))
            .collect();

        if tests.is_empty() {
            debug!("nothing to run");
            return None;
        }

        let mut consumer = self.consumer.lock();
        let consumer = consumer.get_or_insert_with(|| {
            // A consumer closes its controller on shutdown, so each one gets a fresh bound
            let controller = {
                let mut current = self.controller.lock();
                *current = ConcurrencyController::new(current.limit());
                current.clone()
            };
            QueueConsumer::start(
                Arc::new(TestQueue::new(self.priority.clone())),
                controller,
                Arc::new(WorkerPool::new(self.factory.clone())),
                self.bus.clone(),
                self.history.clone(),
                self.batch_size,
            )
        });

        let session_id = self.bus.open_session(tests.len());
        info!(session = %session_id, count = tests.len(), "queued tests");
        consumer.push(session_id, tests);
        Some(session_id)
    }

    pub fn is_started(&self) -> bool {
        self.consumer.lock().is_some()
    }

    /// Change the worker bound. In-flight work is never interrupted.
    pub fn set_concurrency(&self, limit: usize) {
        info!(limit, "concurrency changed");
        self.controller.lock().set_limit(limit);
    }

    pub fn concurrency(&self) -> usize {
        self.controller.lock().limit()
    }

    pub fn in_flight(&self) -> usize {
        self.controller.lock().in_flight()
    }

    /// Stop the engine; unfinished tests are reported `NotRun`
    pub async fn shutdown(&self) {
        let consumer = self.consumer.lock().take();
        if let Some(mut consumer) = consumer {
            consumer.shutdown().await;
        }
    }
}
