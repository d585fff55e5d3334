//! Test run events
//!
//! Results are published as they arrive on a broadcast channel. Each push
//! of tests opens a session; once every test in it has an outcome the
//! session is closed with a `BatchComplete` marker.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Terminal outcome of one test
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
    /// The worker died while the test was running
    Crashed,
    /// The test never started (worker died earlier, or the run was cancelled)
    NotRun,
}

impl Outcome {
    pub fn symbol(&self) -> &'static str {
        match self {
            Outcome::Pass => "✓",
            Outcome::Fail => "✗",
            Outcome::Error => "!",
            Outcome::Crashed => "☠",
            Outcome::NotRun => "○",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass)
    }

    /// Whether the outcome says something is wrong with the code under test
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Fail | Outcome::Error | Outcome::Crashed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub session_id: Uuid,
    pub test_name: String,
    pub outcome: Outcome,
    pub diagnostic: Option<Diagnostic>,
    pub duration_ms: Option<u64>,
    pub finished_at: DateTime<Utc>,
}

/// Per-session outcome counts
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub crashed: usize,
    pub not_run: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            passed: 0,
            failed: 0,
            errors: 0,
            crashed: 0,
            not_run: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Pass => self.passed += 1,
            Outcome::Fail => self.failed += 1,
            Outcome::Error => self.errors += 1,
            Outcome::Crashed => self.crashed += 1,
            Outcome::NotRun => self.not_run += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.errors + self.crashed + self.not_run
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum RunEvent {
    TestStarted { session_id: Uuid, test_name: String },
    TestFinished(TestResult),
    BatchComplete { session_id: Uuid, summary: RunSummary },
    /// Session-level problem (indexing, filters, workers), separate from
    /// per-test outcomes
    Diagnostic { session_id: Option<Uuid>, message: String },
}

struct SessionProgress {
    remaining: usize,
    summary: RunSummary,
}

/// Publishes run events and tracks open sessions
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
    sessions: Mutex<HashMap<Uuid, SessionProgress>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<RunEvent> {
        self.tx.clone()
    }

    pub fn open_session(&self, test_count: usize) -> Uuid {
        let session_id = Uuid::new_v4();
        self.sessions.lock().insert(
            session_id,
            SessionProgress {
                remaining: test_count,
                summary: RunSummary::new(),
            },
        );
        session_id
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn started(&self, session_id: Uuid, test_name: &str) {
        self.publish(RunEvent::TestStarted {
            session_id,
            test_name: test_name.to_string(),
        });
    }

    pub fn finished(&self, result: TestResult) {
        let session_id = result.session_id;
        let outcome = result.outcome;
        self.publish(RunEvent::TestFinished(result));

        let completed = {
            let mut sessions = self.sessions.lock();
            let done = match sessions.get_mut(&session_id) {
                Some(progress) => {
                    progress.summary.record(outcome);
                    progress.remaining = progress.remaining.saturating_sub(1);
                    progress.remaining == 0
                }
                None => false,
            };
            if done {
                sessions.remove(&session_id)
            } else {
                None
            }
        };

        if let Some(mut progress) = completed {
            progress.summary.finished_at = Some(Utc::now());
            self.publish(RunEvent::BatchComplete {
                session_id,
                summary: progress.summary,
            });
        }
    }

    pub fn diagnostic(&self, session_id: Option<Uuid>, message: impl Into<String>) {
        self.publish(RunEvent::Diagnostic {
            session_id,
            message: message.into(),
        });
    }

    fn publish(&self, event: RunEvent) {
        // No subscriber is fine
        let _ = self.tx.send(event);
    }
}
