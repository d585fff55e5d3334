//! Queue consumer loop
//!
//! One long-lived task pulls batches off the queue, waits for a permit and
//! spawns a dispatch per batch. Dispatches run concurrently up to the
//! controller's bound. A failing dispatch only affects its own batch; the
//! loop keeps going until it is shut down.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cancelled;
use super::concurrency::{ConcurrencyController, ConcurrencyPermit};
use super::pool::WorkerPool;
use super::queue::{RunHistory, TestQueue};
use super::worker::ResultSink;
use crate::events::{Diagnostic, EventBus, Outcome};

struct Dispatcher {
    queue: Arc<TestQueue>,
    controller: ConcurrencyController,
    pool: Arc<WorkerPool>,
    bus: Arc<EventBus>,
    history: Arc<RunHistory>,
    batch_size: usize,
}

impl Dispatcher {
    fn sink(&self, session_id: Uuid, tests: &[String]) -> ResultSink {
        ResultSink::new(session_id, tests, self.bus.clone(), self.history.clone())
    }

    fn abandon(&self, session_id: Uuid, tests: &[String]) {
        debug!(session = %session_id, count = tests.len(), "abandoning tests");
        self.sink(session_id, tests).cancel_remaining();
    }

    async fn dispatch(
        &self,
        session_id: Uuid,
        tests: Vec<String>,
        permit: ConcurrencyPermit,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut sink = self.sink(session_id, &tests);

        let mut conn = match self.pool.checkout().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(session = %session_id, "could not start worker: {}", e);
                self.bus
                    .diagnostic(Some(session_id), format!("could not start worker: {e}"));
                sink.fail_remaining(&e.to_string());
                return;
            }
        };
        debug!(worker = %conn.id(), count = tests.len(), "dispatching");

        let result = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => None,
            result = conn.run_tests(&tests, &mut sink) => Some(result),
        };

        let broken = match result {
            Some(Ok(())) => {
                for test in sink.unfinished() {
                    warn!(worker = %conn.id(), test = %test, "worker reported no result");
                    sink.finished(
                        &test,
                        Outcome::Error,
                        Some(Diagnostic::new("worker finished without reporting a result")),
                    );
                }
                false
            }
            Some(Err(e)) => {
                warn!(worker = %conn.id(), "dispatch failed: {}", e);
                self.bus.diagnostic(Some(session_id), format!("{}: {e}", conn.id()));
                sink.fail_remaining(&e.to_string());
                true
            }
            None => {
                debug!(worker = %conn.id(), "dispatch cancelled");
                sink.cancel_remaining();
                true
            }
        };

        self.pool.checkin(conn, broken).await;
        permit.release();
    }
}

async fn consume(ctx: Arc<Dispatcher>, mut cancel: watch::Receiver<bool>) {
    let mut tasks = JoinSet::new();

    loop {
        let batch = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!("dispatch task failed: {}", e);
                }
                continue;
            }
            batch = ctx.queue.next_batch(ctx.batch_size) => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        let Some(first) = batch.first() else { continue };
        let session_id = first.session_id;
        let tests: Vec<String> = batch.into_iter().map(|entry| entry.test_name).collect();

        let Some(permit) = ctx.controller.acquire_or_cancel(&mut cancel).await else {
            ctx.abandon(session_id, &tests);
            break;
        };

        let dispatcher = ctx.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            dispatcher.dispatch(session_id, tests, permit, cancel).await;
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("dispatch task failed: {}", e);
        }
    }

    let mut leftovers: BTreeMap<Uuid, Vec<String>> = BTreeMap::new();
    for entry in ctx.queue.drain() {
        leftovers.entry(entry.session_id).or_default().push(entry.test_name);
    }
    for (session_id, tests) in leftovers {
        ctx.abandon(session_id, &tests);
    }

    ctx.pool.shutdown().await;
    info!("queue consumer stopped");
}

pub struct QueueConsumer {
    queue: Arc<TestQueue>,
    controller: ConcurrencyController,
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl QueueConsumer {
    pub fn start(
        queue: Arc<TestQueue>,
        controller: ConcurrencyController,
        pool: Arc<WorkerPool>,
        bus: Arc<EventBus>,
        history: Arc<RunHistory>,
        batch_size: usize,
    ) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let ctx = Arc::new(Dispatcher {
            queue: queue.clone(),
            controller: controller.clone(),
            pool,
            bus,
            history,
            batch_size: batch_size.max(1),
        });
        let handle = tokio::spawn(consume(ctx, cancel_rx));
        info!(limit = controller.limit(), "queue consumer started");

        Self {
            queue,
            controller,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn push(&self, session_id: Uuid, tests: Vec<String>) {
        self.queue.push(session_id, tests);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Stop dispatching. Everything unfinished is reported `NotRun` before
    /// this returns.
    pub async fn shutdown(&mut self) {
        let _ = self.cancel.send(true);
        self.queue.close();
        self.controller.close();

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("queue consumer panicked: {}", e);
            }
        }
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
        self.queue.close();
    }
}
