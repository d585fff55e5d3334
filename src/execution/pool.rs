//! Worker connection pool
//!
//! Connections are checked out for one dispatch and checked back in
//! afterwards. Only healthy connections from a reusing factory go back to
//! the idle list; everything else is shut down on checkin.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::worker::{ConnectionFactory, WorkerConnection};
use crate::error::WorkerError;

/// Hands out worker connections and retires them
///
/// With a non-reusing factory every checkout starts a fresh worker and
/// every checkin shuts it down.
pub struct WorkerPool {
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<Box<dyn WorkerConnection>>>,
    shutting_down: AtomicBool,
    spawned: AtomicUsize,
}

impl WorkerPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            idle: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            spawned: AtomicUsize::new(0),
        }
    }

    pub async fn checkout(&self) -> Result<Box<dyn WorkerConnection>, WorkerError> {
        loop {
            let candidate = self.idle.lock().pop();
            let Some(mut conn) = candidate else { break };
            if conn.is_healthy() {
                debug!(worker = %conn.id(), "reusing worker");
                return Ok(conn);
            }
            conn.shutdown().await;
        }

        let conn = self.factory.connect().await?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }

    /// Return a connection after a dispatch. Broken or single-use
    /// connections are shut down here.
    pub async fn checkin(&self, mut conn: Box<dyn WorkerConnection>, broken: bool) {
        let keep = !broken
            && self.factory.reuses_connections()
            && !self.shutting_down.load(Ordering::SeqCst)
            && conn.is_healthy();

        if keep {
            self.idle.lock().push(conn);
        } else {
            conn.shutdown().await;
        }
    }

    /// Workers started so far
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let idle: Vec<_> = self.idle.lock().drain(..).collect();
        if idle.is_empty() {
            return;
        }
        debug!(count = idle.len(), "shutting down idle workers");
        join_all(idle.into_iter().map(|mut conn| async move { conn.shutdown().await })).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::worker::fakes::{Behaviour, FakeFactory};
    use super::*;

    #[tokio::test]
    async fn test_single_use_connections_are_shut_down() {
        let factory = Arc::new(FakeFactory::new(Behaviour::Pass));
        let counters = factory.counters.clone();
        let pool = WorkerPool::new(factory);

        let conn = pool.checkout().await.unwrap();
        pool.checkin(conn, false).await;
        let conn = pool.checkout().await.unwrap();
        pool.checkin(conn, false).await;

        assert_eq!(pool.spawned(), 2);
        assert_eq!(pool.idle(), 0);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reusable_connections_are_recycled() {
        let factory = Arc::new(FakeFactory::new(Behaviour::Pass).reusing());
        let pool = WorkerPool::new(factory);

        let conn = pool.checkout().await.unwrap();
        let first = conn.id();
        pool.checkin(conn, false).await;
        let conn = pool.checkout().await.unwrap();

        assert_eq!(conn.id(), first);
        assert_eq!(pool.spawned(), 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_never_reused() {
        let factory = Arc::new(FakeFactory::new(Behaviour::Pass).reusing());
        let pool = WorkerPool::new(factory);

        let conn = pool.checkout().await.unwrap();
        let first = conn.id();
        pool.checkin(conn, true).await;
        let conn = pool.checkout().await.unwrap();

        assert_ne!(conn.id(), first);
    }

    #[tokio::test]
    async fn test_shutdown_drains_idle() {
        let factory = Arc::new(FakeFactory::new(Behaviour::Pass).reusing());
        let counters = factory.counters.clone();
        let pool = WorkerPool::new(factory);

        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        pool.checkin(a, false).await;
        pool.checkin(b, false).await;
        assert_eq!(pool.idle(), 2);

        pool.shutdown().await;
        assert_eq!(pool.idle(), 0);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 2);

        // Late checkins after shutdown are closed, not parked
        let c = pool.checkout().await.unwrap();
        pool.checkin(c, false).await;
        assert_eq!(pool.idle(), 0);
    }
}
