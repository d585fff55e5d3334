//! Pending test queue
//!
//! Each pushed batch is sorted once by the priority policy and appended;
//! entries then leave in exactly that order. Push and pop are atomic under
//! one short lock that is never held across an await.

use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::events::{Outcome, TestResult};

/// Orders the tests of one batch. Must be a total order.
pub trait PriorityPolicy: Send + Sync {
    fn compare(&self, a: &str, b: &str) -> Ordering;

    /// Sort one batch in place. Policies backed by shared state override
    /// this to read that state once per batch.
    fn order(&self, test_names: &mut [String]) {
        test_names.sort_by(|a, b| self.compare(a, b));
    }
}

/// Plain name order
#[derive(Debug, Default, Clone, Copy)]
pub struct NameOrder;

impl PriorityPolicy for NameOrder {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        a.cmp(b)
    }
}

#[derive(Debug, Clone, Copy)]
struct HistoryEntry {
    failed: bool,
    duration_ms: Option<u64>,
}

/// What the last run of each test looked like, for this session only
#[derive(Debug, Default)]
pub struct RunHistory {
    entries: RwLock<HashMap<String, HistoryEntry>>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &TestResult) {
        // A test that never ran tells us nothing new
        if result.outcome == Outcome::NotRun {
            return;
        }
        self.entries.write().insert(
            result.test_name.clone(),
            HistoryEntry {
                failed: result.outcome.is_failure(),
                duration_ms: result.duration_ms,
            },
        );
    }

    pub fn last_failed(&self, test_name: &str) -> bool {
        self.entries
            .read()
            .get(test_name)
            .is_some_and(|entry| entry.failed)
    }

    pub fn last_duration_ms(&self, test_name: &str) -> Option<u64> {
        self.entries.read().get(test_name).and_then(|entry| entry.duration_ms)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Previously failing tests first, then tests with no recorded duration,
/// then fastest first; ties broken by name.
pub struct FailFastPriority {
    history: Arc<RunHistory>,
}

type FailFastKey = (bool, Option<u64>);

impl FailFastPriority {
    pub fn new(history: Arc<RunHistory>) -> Self {
        Self { history }
    }

    fn key_of(entries: &HashMap<String, HistoryEntry>, name: &str) -> FailFastKey {
        match entries.get(name) {
            Some(entry) => (!entry.failed, entry.duration_ms),
            None => (true, None),
        }
    }
}

impl PriorityPolicy for FailFastPriority {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        let entries = self.history.entries.read();
        Self::key_of(&entries, a)
            .cmp(&Self::key_of(&entries, b))
            .then_with(|| a.cmp(b))
    }

    fn order(&self, test_names: &mut [String]) {
        // Results keep landing while we sort; every key comes from one view
        let mut keyed: Vec<(FailFastKey, String)> = {
            let entries = self.history.entries.read();
            test_names
                .iter_mut()
                .map(|name| (Self::key_of(&entries, name), std::mem::take(name)))
                .collect()
        };
        keyed.sort_unstable();

        for (slot, (_, name)) in test_names.iter_mut().zip(keyed) {
            *slot = name;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub session_id: Uuid,
    pub test_name: String,
}

pub struct TestQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
    closed: AtomicBool,
    priority: Arc<dyn PriorityPolicy>,
}

impl TestQueue {
    pub fn new(priority: Arc<dyn PriorityPolicy>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            priority,
        }
    }

    pub fn push(&self, session_id: Uuid, mut test_names: Vec<String>) {
        if test_names.is_empty() {
            return;
        }
        self.priority.order(&mut test_names);

        self.entries.lock().extend(test_names.into_iter().map(|test_name| QueueEntry {
            session_id,
            test_name,
        }));
        self.notify.notify_one();
    }

    /// Pop up to `max` contiguous entries belonging to the same session
    pub fn try_pop_batch(&self, max: usize) -> Vec<QueueEntry> {
        let mut entries = self.entries.lock();
        let mut batch: Vec<QueueEntry> = Vec::new();

        while batch.len() < max.max(1) {
            let same_session = match (entries.front(), batch.first()) {
                (Some(next), Some(first)) => next.session_id == first.session_id,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !same_session {
                break;
            }
            if let Some(entry) = entries.pop_front() {
                batch.push(entry);
            }
        }

        batch
    }

    /// Wait for the next batch. `None` once the queue is closed.
    pub async fn next_batch(&self, max: usize) -> Option<Vec<QueueEntry>> {
        loop {
            if self.closed.load(AtomicOrdering::SeqCst) {
                return None;
            }
            let batch = self.try_pop_batch(max);
            if !batch.is_empty() {
                return Some(batch);
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_one();
    }

    /// Take everything still queued
    pub fn drain(&self) -> Vec<QueueEntry> {
        self.entries.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
