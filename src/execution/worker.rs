//! Out-of-process test workers
//!
//! A worker receives test names and streams results back while they run.
//! The default factory starts one child process per dispatch, so a test
//! that corrupts process state or kills the VM cannot affect the next one.
//!
//! Wire format with a process worker: test names go to stdin one per line,
//! a blank line ends the batch. The worker answers with JSON lines on
//! stdout:
//!
//! ```text
//! {"event":"started","test":"com.acme.FooTest"}
//! {"event":"finished","test":"com.acme.FooTest","outcome":"fail","message":"expected 1","stack":"..."}
//! {"event":"batch_complete"}
//! ```
//!
//! Anything else on stdout is treated as test output.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::queue::RunHistory;
use crate::error::WorkerError;
use crate::events::{Diagnostic, EventBus, Outcome, TestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Collects the results of one dispatch and forwards each one as soon as
/// it arrives
pub struct ResultSink {
    session_id: Uuid,
    tests: Vec<String>,
    started: HashMap<String, Instant>,
    finished: HashSet<String>,
    bus: Arc<EventBus>,
    history: Arc<RunHistory>,
}

impl ResultSink {
    pub fn new(session_id: Uuid, tests: &[String], bus: Arc<EventBus>, history: Arc<RunHistory>) -> Self {
        Self {
            session_id,
            tests: tests.to_vec(),
            started: HashMap::new(),
            finished: HashSet::new(),
            bus,
            history,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn expects(&self, test_name: &str) -> bool {
        self.tests.iter().any(|t| t == test_name) && !self.finished.contains(test_name)
    }

    pub fn started(&mut self, test_name: &str) {
        if !self.expects(test_name) || self.started.contains_key(test_name) {
            trace!(test = test_name, "ignoring start of unexpected test");
            return;
        }
        self.started.insert(test_name.to_string(), Instant::now());
        self.bus.started(self.session_id, test_name);
    }

    pub fn finished(&mut self, test_name: &str, outcome: Outcome, diagnostic: Option<Diagnostic>) {
        if !self.expects(test_name) {
            debug!(test = test_name, "ignoring result for test not in this dispatch");
            return;
        }

        let duration_ms = self
            .started
            .get(test_name)
            .map(|start| start.elapsed().as_millis() as u64);
        self.finished.insert(test_name.to_string());

        let result = TestResult {
            session_id: self.session_id,
            test_name: test_name.to_string(),
            outcome,
            diagnostic,
            duration_ms,
            finished_at: Utc::now(),
        };
        self.history.record(&result);
        self.bus.finished(result);
    }

    pub fn unfinished(&self) -> Vec<String> {
        self.tests
            .iter()
            .filter(|t| !self.finished.contains(*t))
            .cloned()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.finished.len() == self.tests.len()
    }

    /// The worker went away: whatever was running crashed, the rest never ran
    pub fn fail_remaining(&mut self, reason: &str) {
        for test in self.unfinished() {
            let outcome = if self.started.contains_key(&test) {
                Outcome::Crashed
            } else {
                Outcome::NotRun
            };
            self.finished(&test, outcome, Some(Diagnostic::new(reason)));
        }
    }

    /// The dispatch was abandoned: nothing unfinished counts as run
    pub fn cancel_remaining(&mut self) {
        for test in self.unfinished() {
            self.finished(&test, Outcome::NotRun, Some(Diagnostic::new("run cancelled")));
        }
    }
}

/// A live channel to one worker
#[async_trait]
pub trait WorkerConnection: Send {
    fn id(&self) -> WorkerId;

    /// Run the tests, reporting into `sink` as results come in. Returns
    /// once the worker reports the batch complete, or with an error when
    /// the worker dies or the channel breaks.
    async fn run_tests(&mut self, tests: &[String], sink: &mut ResultSink) -> Result<(), WorkerError>;

    fn is_healthy(&mut self) -> bool;

    async fn shutdown(&mut self);
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn WorkerConnection>, WorkerError>;

    /// Whether healthy connections may be handed out again
    fn reuses_connections(&self) -> bool {
        false
    }
}

/// Starts workers as child processes
pub struct ProcessConnectionFactory {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    reuse: bool,
    shutdown_timeout: Duration,
    next_id: AtomicU64,
}

impl ProcessConnectionFactory {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            working_dir: None,
            env: Vec::new(),
            reuse: false,
            shutdown_timeout: Duration::from_secs(2),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[async_trait]
impl ConnectionFactory for ProcessConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn WorkerConnection>, WorkerError> {
        let (program, args) = self.command.split_first().ok_or(WorkerError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            command: self.command.join(" "),
            source,
        })?;

        let id = WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Protocol("worker stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut segments = BufReader::new(stderr).split(b'\n');
                while let Ok(Some(segment)) = segments.next_segment().await {
                    debug!(worker = %id, "{}", String::from_utf8_lossy(&segment).trim_end());
                }
            });
        }

        debug!(worker = %id, pid = ?child.id(), "spawned worker process");

        Ok(Box::new(ProcessConnection {
            id,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            line: Vec::new(),
            shutdown_timeout: self.shutdown_timeout,
        }))
    }

    fn reuses_connections(&self) -> bool {
        self.reuse
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireOutcome {
    Pass,
    Fail,
    Error,
}

impl From<WireOutcome> for Outcome {
    fn from(outcome: WireOutcome) -> Self {
        match outcome {
            WireOutcome::Pass => Outcome::Pass,
            WireOutcome::Fail => Outcome::Fail,
            WireOutcome::Error => Outcome::Error,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WorkerMessage {
    Started {
        test: String,
    },
    Finished {
        test: String,
        outcome: WireOutcome,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        stack: Option<String>,
    },
    BatchComplete,
}

fn parse_message(line: &str) -> Option<WorkerMessage> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

struct ProcessConnection {
    id: WorkerId,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    line: Vec<u8>,
    shutdown_timeout: Duration,
}

impl ProcessConnection {
    async fn send_batch(&mut self, tests: &[String]) -> Result<(), WorkerError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| WorkerError::Protocol("worker stdin already closed".to_string()))?;

        let mut payload = String::new();
        for test in tests {
            payload.push_str(test);
            payload.push('\n');
        }
        payload.push('\n');

        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Next stdout line, decoded lossily. `None` at end of stream.
    async fn next_line(&mut self) -> Result<Option<String>, WorkerError> {
        self.line.clear();
        if self.stdout.read_until(b'\n', &mut self.line).await? == 0 {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&self.line);
        Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
    }

    async fn exit_status(&mut self) -> String {
        match tokio::time::timeout(self.shutdown_timeout, self.child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "still running".to_string(),
        }
    }
}

#[async_trait]
impl WorkerConnection for ProcessConnection {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn run_tests(&mut self, tests: &[String], sink: &mut ResultSink) -> Result<(), WorkerError> {
        self.send_batch(tests).await?;

        while let Some(line) = self.next_line().await? {
            match parse_message(&line) {
                Some(WorkerMessage::Started { test }) => sink.started(&test),
                Some(WorkerMessage::Finished {
                    test,
                    outcome,
                    message,
                    stack,
                }) => {
                    let diagnostic = message.map(|message| Diagnostic { message, stack });
                    sink.finished(&test, outcome.into(), diagnostic);
                }
                Some(WorkerMessage::BatchComplete) => return Ok(()),
                None => trace!(worker = %self.id, "{}", line),
            }
        }

        let status = self.exit_status().await;
        warn!(worker = %self.id, status = %status, "worker exited mid-batch");
        Err(WorkerError::Crashed { status })
    }

    fn is_healthy(&mut self) -> bool {
        self.stdin.is_some() && matches!(self.child.try_wait(), Ok(None))
    }

    async fn shutdown(&mut self) {
        // Closing stdin asks the worker to exit
        self.stdin.take();
        match tokio::time::timeout(self.shutdown_timeout, self.child.wait()).await {
            Ok(_) => debug!(worker = %self.id, "worker exited"),
            Err(_) => {
                warn!(worker = %self.id, "worker did not exit in time, killing it");
                let _ = self.child.kill().await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    //! In-process stand-ins for worker processes

    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Behaviour {
        Pass,
        /// Fail any test whose name contains "Fail"
        FailMatching,
        /// Die right after starting the test at this position in the batch
        CrashAt(usize),
    }

    #[derive(Default)]
    pub struct Counters {
        pub connects: AtomicUsize,
        pub running: AtomicUsize,
        pub peak: AtomicUsize,
        pub shutdowns: AtomicUsize,
    }

    pub struct FakeFactory {
        pub behaviour: Behaviour,
        pub delay: Duration,
        pub reuse: bool,
        pub counters: Arc<Counters>,
        next_id: AtomicU64,
    }

    impl FakeFactory {
        pub fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                delay: Duration::from_millis(5),
                reuse: false,
                counters: Arc::new(Counters::default()),
                next_id: AtomicU64::new(1),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn reusing(mut self) -> Self {
            self.reuse = true;
            self
        }
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        async fn connect(&self) -> Result<Box<dyn WorkerConnection>, WorkerError> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                id: WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst)),
                behaviour: self.behaviour,
                delay: self.delay,
                counters: self.counters.clone(),
                alive: true,
            }))
        }

        fn reuses_connections(&self) -> bool {
            self.reuse
        }
    }

    struct FakeConnection {
        id: WorkerId,
        behaviour: Behaviour,
        delay: Duration,
        counters: Arc<Counters>,
        alive: bool,
    }

    #[async_trait]
    impl WorkerConnection for FakeConnection {
        fn id(&self) -> WorkerId {
            self.id
        }

        async fn run_tests(&mut self, tests: &[String], sink: &mut ResultSink) -> Result<(), WorkerError> {
            let running = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.peak.fetch_max(running, Ordering::SeqCst);

            let mut result = Ok(());
            for (position, test) in tests.iter().enumerate() {
                sink.started(test);
                tokio::time::sleep(self.delay).await;

                if self.behaviour == Behaviour::CrashAt(position) {
                    self.alive = false;
                    result = Err(WorkerError::Crashed {
                        status: "signal: 9".to_string(),
                    });
                    break;
                }

                let outcome = match self.behaviour {
                    Behaviour::FailMatching if test.contains("Fail") => Outcome::Fail,
                    _ => Outcome::Pass,
                };
                let diagnostic = (outcome == Outcome::Fail).then(|| Diagnostic::new("assertion failed"));
                sink.finished(test, outcome, diagnostic);
            }

            self.counters.running.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn is_healthy(&mut self) -> bool {
            self.alive
        }

        async fn shutdown(&mut self) {
            self.alive = false;
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}
