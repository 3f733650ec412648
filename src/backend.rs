use crate::chat::{ChatMessage, Role};
use crate::snapshot::{SEEDED_DEFECT, SEEDED_FIX};
use chrono::{DateTime, Local};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub type Files = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("malformed {what} from backend: {reason}")]
    Malformed { what: &'static str, reason: String },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub candidate: String,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub status: CaseStatus,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: u32,
    pub failed: u32,
    pub cases: Vec<TestCase>,
    pub duration_ms: u64,
}

impl TestResult {
    pub fn pass_ratio(&self) -> f64 {
        let total = self.passed + self.failed;
        if total == 0 {
            0.0
        } else {
            self.passed as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub criterion: String,
    pub score: u32,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub score: u32,
    pub breakdown: Vec<CriterionScore>,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    Prompt,
    Apply,
    TestRun,
    Checkpoint,
    Restore,
    Submit,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub detail: String,
    pub at: DateTime<Local>,
}

impl SessionEvent {
    pub fn new(kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            at: Local::now(),
        }
    }
}

/// Remote assessment service. Everything crossing this seam is decoded and
/// validated before the rest of the app sees it.
pub trait Backend: Send + Sync {
    fn start_session(&self, candidate: &str, duration: Duration) -> Result<SessionInfo, BackendError>;
    fn prompt(&self, history: &[ChatMessage], files: &Files) -> Result<ChatMessage, BackendError>;
    fn log_event(&self, event: &SessionEvent) -> Result<(), BackendError>;
    fn run_tests(&self, files: &Files) -> Result<TestResult, BackendError>;
    fn submit(&self, files: &Files, history: &[ChatMessage]) -> Result<SubmissionResult, BackendError>;
}

fn malformed(what: &'static str, err: impl std::fmt::Display) -> BackendError {
    BackendError::Malformed {
        what,
        reason: err.to_string(),
    }
}

pub fn decode_session(value: Value) -> Result<SessionInfo, BackendError> {
    let info: SessionInfo = serde_json::from_value(value).map_err(|e| malformed("session", e))?;
    if info.session_id.is_empty() {
        return Err(malformed("session", "empty session id"));
    }
    Ok(info)
}

pub fn decode_message(value: Value) -> Result<ChatMessage, BackendError> {
    let msg: ChatMessage = serde_json::from_value(value).map_err(|e| malformed("message", e))?;
    if msg.role != Role::Assistant {
        return Err(malformed("message", "reply is not from the assistant"));
    }
    Ok(msg)
}

pub fn decode_test_result(value: Value) -> Result<TestResult, BackendError> {
    let result: TestResult =
        serde_json::from_value(value).map_err(|e| malformed("test result", e))?;
    let passed = count_status(&result.cases, CaseStatus::Passed);
    let failed = count_status(&result.cases, CaseStatus::Failed);
    if passed != result.passed || failed != result.failed {
        return Err(malformed(
            "test result",
            format!(
                "counts {}/{} disagree with cases {passed}/{failed}",
                result.passed, result.failed
            ),
        ));
    }
    Ok(result)
}

pub fn decode_submission(value: Value) -> Result<SubmissionResult, BackendError> {
    let result: SubmissionResult =
        serde_json::from_value(value).map_err(|e| malformed("submission", e))?;
    if result.score > 100 {
        return Err(malformed("submission", format!("score {} out of range", result.score)));
    }
    if let Some(bad) = result.breakdown.iter().find(|c| c.score > 100) {
        return Err(malformed(
            "submission",
            format!("criterion {} score {} out of range", bad.criterion, bad.score),
        ));
    }
    Ok(result)
}

fn count_status(cases: &[TestCase], status: CaseStatus) -> u32 {
    cases.iter().filter(|c| c.status == status).count() as u32
}

/// In-process stand-in for the assessment service: canned replies, canned
/// tests and random collaboration scores, all emitted as JSON and decoded
/// through the same validators a remote service would go through.
pub struct MockBackend {
    latency: Duration,
    failure_rate: f64,
    roundtrips: AtomicUsize,
}

impl MockBackend {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            roundtrips: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    fn roundtrips(&self) -> usize {
        self.roundtrips.load(Ordering::Relaxed)
    }

    fn roundtrip(&self, call: &str) -> Result<(), BackendError> {
        let n = self.roundtrips.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(call, n, "mock roundtrip");
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate) {
            warn!(call, "mock backend injected failure");
            return Err(BackendError::Unavailable(format!("{call} timed out")));
        }
        Ok(())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(Duration::ZERO, 0.0)
    }
}

impl Backend for MockBackend {
    fn start_session(&self, candidate: &str, duration: Duration) -> Result<SessionInfo, BackendError> {
        self.roundtrip("start_session")?;
        let id: u32 = rand::thread_rng().r#gen();
        decode_session(json!({
            "session_id": format!("mock-{id:08x}"),
            "candidate": candidate,
            "duration_secs": duration.as_secs(),
        }))
    }

    fn prompt(&self, history: &[ChatMessage], files: &Files) -> Result<ChatMessage, BackendError> {
        self.roundtrip("prompt")?;
        let question = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.to_lowercase())
            .unwrap_or_default();
        let content = canned_reply(&question, files);
        decode_message(json!({ "role": "assistant", "content": content }))
    }

    fn log_event(&self, event: &SessionEvent) -> Result<(), BackendError> {
        debug!(kind = ?event.kind, detail = %event.detail, "event logged");
        Ok(())
    }

    fn run_tests(&self, files: &Files) -> Result<TestResult, BackendError> {
        self.roundtrip("run_tests")?;
        canned_tests(files)
    }

    fn submit(&self, files: &Files, history: &[ChatMessage]) -> Result<SubmissionResult, BackendError> {
        self.roundtrip("submit")?;
        let tests = canned_tests(files)?;
        let mut rng = rand::thread_rng();
        let prompts = history.iter().filter(|m| m.role == Role::User).count();
        let prompting: u32 = if prompts == 0 { 20 } else { rng.gen_range(55..=95) };
        let verification: u32 = rng.gen_range(50..=90);
        let ownership: u32 = rng.gen_range(45..=95);
        let correctness = (tests.pass_ratio() * 100.0).round() as u32;
        let score = (prompting * 25 + verification * 20 + ownership * 20 + correctness * 35) / 100;
        info!(score, correctness, prompts, "submission scored");
        decode_submission(json!({
            "score": score,
            "breakdown": [
                criterion("Prompt quality", prompting, &format!("{prompts} prompts sent")),
                criterion("Verification", verification, "Ran and read test output"),
                criterion("Code ownership", ownership, "Reviewed suggestions before applying"),
                criterion(
                    "Correctness",
                    correctness,
                    &format!("{}/{} tests passing", tests.passed, tests.passed + tests.failed),
                ),
            ],
            "summary": summary_for(score),
        }))
    }
}

fn case(name: &str, passed: bool, failure: &str) -> Value {
    if passed {
        json!({ "name": name, "status": "passed" })
    } else {
        json!({ "name": name, "status": "failed", "message": failure })
    }
}

fn criterion(name: &str, score: u32, comment: &str) -> Value {
    json!({ "criterion": name, "score": score, "comment": comment })
}

fn summary_for(score: u32) -> &'static str {
    match score {
        85.. => "Strong collaboration: targeted prompts and verified changes.",
        65..=84 => "Solid session with room to verify suggestions more closely.",
        _ => "Relied on the assistant without enough verification.",
    }
}

fn canned_reply(question: &str, files: &Files) -> String {
    if question.contains("count") || question.contains("bug") || question.contains("fix") {
        let fixed = files
            .get("rq/queue.py")
            .map(|src| src.replace(SEEDED_DEFECT, SEEDED_FIX))
            .unwrap_or_else(|| format!("# rq/queue.py\n{SEEDED_FIX}\n"));
        return format!(
            "**Off-by-one in Queue.count**\n\
             The `count` property subtracts one from the number of job ids, so an \
             empty queue reports `-1` and `is_empty()` is never true.\n\
             \n\
             - Drop the `- 1` from **count**\n\
             - Re-run the suite to confirm\n\
             \n\
             ```python rq/queue.py\n{}\n```",
            fixed.trim_end()
        );
    }
    if question.contains("test") {
        let existing = files
            .get("tests/test_queue.py")
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default();
        return format!(
            "Here is an extra regression test for `empty()`:\n\
             \n\
             ```python\n# tests/test_queue.py\n{existing}\n\n\n\
             def test_empty_removes_all_jobs():\n    \
             q = Queue()\n    \
             q.enqueue(say_hello, \"a\")\n    \
             assert q.empty() == 1\n    \
             assert q.is_empty()\n```\n\
             Run it with `pytest tests/`."
        );
    }
    if question.contains("worker") {
        return "**How the worker loop runs**\n\
                1. `Worker.work()` walks each queue in order\n\
                2. It dequeues ids until the queue is empty\n\
                3. Each job is looked up and `perform()`ed\n\
                \n\
                ```python\nworker = Worker([q], jobs)\nworker.work(burst=True)\n```"
            .to_string();
    }
    "I can help with the **rq** snapshot. Try asking about:\n\
     - the failing `count` property\n\
     - adding a test\n\
     - how the worker processes jobs"
        .to_string()
}

/// Canned suite: the two seeded cases pass only once the fix is in
/// `rq/queue.py`.
fn canned_tests(files: &Files) -> Result<TestResult, BackendError> {
    let started = Instant::now();
    let fixed = files
        .get("rq/queue.py")
        .map(|src| src.contains(SEEDED_FIX) && !src.contains(SEEDED_DEFECT))
        .unwrap_or(false);
    let mut cases = vec![
        case(
            "test_empty_queue_is_empty",
            fixed,
            "AssertionError: assert False\n where False = Queue().is_empty()",
        ),
        case(
            "test_count_tracks_enqueued_jobs",
            fixed,
            "AssertionError: assert 1 == 2\n where 1 = Queue.count",
        ),
        case("test_dequeue_is_fifo", true, ""),
    ];
    if !files.contains_key("rq/worker.py") {
        cases.push(json!({
            "name": "test_worker_drains_queue",
            "status": "skipped",
            "message": "rq/worker.py not present",
        }));
    } else {
        cases.push(case("test_worker_drains_queue", true, ""));
    }
    let passed = cases.iter().filter(|c| c["status"] == "passed").count();
    let failed = cases.iter().filter(|c| c["status"] == "failed").count();
    let duration_ms = 180 + started.elapsed().as_millis() as u64;
    decode_test_result(json!({
        "passed": passed,
        "failed": failed,
        "cases": cases,
        "duration_ms": duration_ms,
    }))
}

pub enum BackendRequest {
    Prompt { history: Vec<ChatMessage>, files: Files },
    RunTests { files: Files },
    Submit { files: Files, history: Vec<ChatMessage> },
    LogEvent(SessionEvent),
}

#[derive(Debug)]
pub enum BackendReply {
    Prompt(Result<ChatMessage, BackendError>),
    Tests(Result<TestResult, BackendError>),
    Submission(Result<SubmissionResult, BackendError>),
    Logged(Result<(), BackendError>),
}

/// A reply tagged with the session epoch its request was sent under.
#[derive(Debug)]
pub struct Tagged {
    pub epoch: u64,
    pub reply: BackendReply,
}

/// Runs backend calls off the UI thread. Each request gets its own thread;
/// replies come back over one channel in completion order. Nothing is
/// cancelled or retried.
pub struct BackendWorker {
    backend: Arc<dyn Backend>,
    tx: Sender<Tagged>,
    rx: Receiver<Tagged>,
}

impl BackendWorker {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self { backend, tx, rx }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn dispatch(&self, epoch: u64, request: BackendRequest) {
        let backend = Arc::clone(&self.backend);
        let tx = self.tx.clone();
        thread::spawn(move || {
            let reply = match request {
                BackendRequest::Prompt { history, files } => {
                    BackendReply::Prompt(backend.prompt(&history, &files))
                }
                BackendRequest::RunTests { files } => BackendReply::Tests(backend.run_tests(&files)),
                BackendRequest::Submit { files, history } => {
                    BackendReply::Submission(backend.submit(&files, &history))
                }
                BackendRequest::LogEvent(event) => BackendReply::Logged(backend.log_event(&event)),
            };
            let _ = tx.send(Tagged { epoch, reply });
        });
    }

    pub fn try_recv(&self) -> Option<Tagged> {
        self.rx.try_recv().ok()
    }

    #[cfg(test)]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Tagged> {
        self.rx.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        decode_message, decode_submission, decode_test_result, Backend, BackendError,
        BackendReply, BackendRequest, BackendWorker, CaseStatus, EventKind, Files, MockBackend, SessionEvent, Tagged,
    };
    use crate::chat::ChatMessage;
    use crate::render::{render_message, BlockKind, RenderContext};
    use crate::snapshot;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn files() -> Files {
        snapshot::builtin().snapshot()
    }

    #[test]
    fn decoder_rejects_negative_or_missing_counts() {
        let negative = json!({ "passed": -1, "failed": 0, "cases": [], "duration_ms": 1 });
        assert!(matches!(
            decode_test_result(negative),
            Err(BackendError::Malformed { .. })
        ));
        let missing = json!({ "failed": 0, "cases": [], "duration_ms": 1 });
        assert!(decode_test_result(missing).is_err());
    }

    #[test]
    fn decoder_rejects_counts_that_disagree_with_cases() {
        let value = json!({
            "passed": 2,
            "failed": 0,
            "cases": [{ "name": "a", "status": "passed" }],
            "duration_ms": 5,
        });
        assert!(decode_test_result(value).is_err());
    }

    #[test]
    fn decoder_rejects_out_of_range_scores() {
        let value = json!({ "score": 101, "breakdown": [], "summary": "" });
        assert!(decode_submission(value).is_err());
        let value = json!({
            "score": 50,
            "breakdown": [{ "criterion": "x", "score": 400, "comment": "" }],
            "summary": "",
        });
        assert!(decode_submission(value).is_err());
    }

    #[test]
    fn decoder_rejects_user_role_reply() {
        assert!(decode_message(json!({ "role": "user", "content": "hi" })).is_err());
        assert!(decode_message(json!({ "role": "robot", "content": "hi" })).is_err());
    }

    #[test]
    fn seeded_cases_fail_until_fix_is_applied() {
        let backend = MockBackend::default();
        let mut files = files();
        let before = backend.run_tests(&files).expect("tests");
        assert_eq!(before.failed, 2);
        assert_eq!(before.passed, 2);

        let queue = files["rq/queue.py"].replace(snapshot::SEEDED_DEFECT, snapshot::SEEDED_FIX);
        files.insert("rq/queue.py".to_string(), queue);
        let after = backend.run_tests(&files).expect("tests");
        assert_eq!(after.failed, 0);
        assert!(after.cases.iter().all(|c| c.status == CaseStatus::Passed));
        assert_eq!(after.pass_ratio(), 1.0);
    }

    #[test]
    fn fix_reply_is_applicable_to_queue_module() {
        let backend = MockBackend::default();
        let files = files();
        let reply = backend
            .prompt(&[ChatMessage::user("Why is count wrong?")], &files)
            .expect("reply");
        let known: BTreeSet<String> = files.keys().cloned().collect();
        let blocks = render_message(&reply.content, &RenderContext::new(&known));
        let target = blocks.iter().find_map(|b| match &b.kind {
            BlockKind::ApplicableCodeBlock { filename, code } => Some((filename, code)),
            _ => None,
        });
        let (filename, code) = target.expect("applicable block");
        assert_eq!(filename, "rq/queue.py");
        assert!(!code.content.contains(snapshot::SEEDED_DEFECT));
    }

    #[test]
    fn test_reply_targets_test_module_through_comment() {
        let backend = MockBackend::default();
        let files = files();
        let reply = backend
            .prompt(&[ChatMessage::user("add a test please")], &files)
            .expect("reply");
        let known: BTreeSet<String> = files.keys().cloned().collect();
        let blocks = render_message(&reply.content, &RenderContext::new(&known));
        assert!(blocks
            .iter()
            .any(|b| b.apply_target() == Some("tests/test_queue.py")));
    }

    #[test]
    fn submission_scores_stay_in_range() {
        let backend = MockBackend::default();
        let history = vec![ChatMessage::user("fix the bug")];
        for _ in 0..20 {
            let result = backend.submit(&files(), &history).expect("submission");
            assert!(result.score <= 100);
            assert_eq!(result.breakdown.len(), 4);
        }
    }

    #[test]
    fn injected_failures_surface_as_unavailable() {
        let backend = MockBackend::new(Duration::ZERO, 1.0);
        assert!(matches!(
            backend.run_tests(&files()),
            Err(BackendError::Unavailable(_))
        ));
    }

    #[test]
    fn worker_returns_replies_over_channel() {
        let worker = BackendWorker::new(Arc::new(MockBackend::default()));
        worker.dispatch(7, BackendRequest::RunTests { files: files() });
        match worker.recv_timeout(Duration::from_secs(5)) {
            Some(Tagged {
                epoch: 7,
                reply: BackendReply::Tests(Ok(result)),
            }) => assert_eq!(result.cases.len(), 4),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn session_events_serialise_with_timestamp() {
        let event = SessionEvent::new(EventKind::Apply, "rq/queue.py");
        let value = serde_json::to_value(&event).expect("serialise");
        assert_eq!(value["detail"], "rq/queue.py");
        assert!(value["at"].is_string());
    }

    #[test]
    fn submit_makes_a_single_roundtrip() {
        let backend = MockBackend::default();
        let history = vec![ChatMessage::user("fix the bug")];
        backend.submit(&files(), &history).expect("submission");
        assert_eq!(backend.roundtrips(), 1);
        backend.run_tests(&files()).expect("tests");
        assert_eq!(backend.roundtrips(), 2);
    }
}
