use crate::backend::{EventKind, SessionEvent, SessionInfo, SubmissionResult, TestResult};
use crate::chat::{ChatMessage, Conversation, Role};
use crate::render::{render_message, BlockKey, RenderBlock, RenderContext};
use crate::workspace::{AppliedBlocks, Workspace};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Running,
    Expired,
    Stopped,
}

/// Session clock with one-second resolution. `tick` reports `Expired` once;
/// afterwards, and after `cancel`, it reports `Stopped`.
#[derive(Debug, Clone)]
pub struct Countdown {
    total: Duration,
    started: Instant,
    stopped: bool,
}

impl Countdown {
    pub fn start(total: Duration, now: Instant) -> Self {
        Self {
            total,
            started: now,
            stopped: false,
        }
    }

    pub fn remaining_secs(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.started).as_secs();
        self.total.as_secs().saturating_sub(elapsed)
    }

    pub fn tick(&mut self, now: Instant) -> TimerEvent {
        if self.stopped {
            return TimerEvent::Stopped;
        }
        if self.remaining_secs(now) == 0 {
            self.stopped = true;
            return TimerEvent::Expired;
        }
        TimerEvent::Running
    }

    pub fn cancel(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn format(&self, now: Instant) -> String {
        let secs = self.remaining_secs(now);
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Pending {
    pub prompt: bool,
    pub tests: bool,
    pub submit: bool,
}

impl Pending {
    pub fn any(&self) -> bool {
        self.prompt || self.tests || self.submit
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(String),
    AlreadyApplied,
    NotApplicable,
}

/// Everything one assessment run owns. Created on session start, reset for a
/// new attempt, dropped when the app exits.
pub struct Session {
    pub info: SessionInfo,
    pub timer: Countdown,
    pub conversation: Conversation,
    pub workspace: Workspace,
    pub applied: AppliedBlocks,
    pub tests: Option<TestResult>,
    pub submission: Option<SubmissionResult>,
    pub pending: Pending,
    pub events: Vec<SessionEvent>,
    /// Bumped by `reset`; backend replies carry the epoch they were requested under.
    pub epoch: u64,
}

impl Session {
    pub fn start(info: SessionInfo, workspace: Workspace, now: Instant) -> Self {
        let timer = Countdown::start(Duration::from_secs(info.duration_secs), now);
        info!(session = %info.session_id, candidate = %info.candidate, "session started");
        let mut session = Self {
            info,
            timer,
            conversation: Conversation::new(),
            workspace,
            applied: AppliedBlocks::default(),
            tests: None,
            submission: None,
            pending: Pending::default(),
            events: Vec::new(),
            epoch: 0,
        };
        let detail = session.info.session_id.clone();
        session.record(EventKind::SessionStarted, detail);
        session
    }

    /// Starts over on the same snapshot: buffers, chat, results and clock.
    pub fn reset(&mut self, now: Instant) {
        self.workspace.reset();
        self.conversation = Conversation::new();
        self.applied.clear();
        self.tests = None;
        self.submission = None;
        self.pending = Pending::default();
        self.events.clear();
        self.epoch += 1;
        self.timer = Countdown::start(Duration::from_secs(self.info.duration_secs), now);
        info!(session = %self.info.session_id, "session reset");
        let detail = self.info.session_id.clone();
        self.record(EventKind::SessionStarted, detail);
    }

    pub fn record(&mut self, kind: EventKind, detail: impl Into<String>) -> SessionEvent {
        let event = SessionEvent::new(kind, detail);
        self.events.push(event.clone());
        event
    }

    pub fn is_finished(&self) -> bool {
        self.submission.is_some()
    }

    pub fn push_prompt(&mut self, text: &str) -> usize {
        self.pending.prompt = true;
        self.conversation.push(ChatMessage::user(text))
    }

    /// Blocks of an assistant message. Candidate prompts are never rendered
    /// into blocks, so nothing they paste can become an apply target.
    pub fn render(&self, message: usize) -> Vec<RenderBlock> {
        match self.conversation.get(message) {
            Some(msg) if msg.role == Role::Assistant => {
                render_message(&msg.content, &RenderContext::new(&self.workspace))
            }
            _ => Vec::new(),
        }
    }

    /// Applies the code block at `key` in `message` to its inferred file.
    pub fn apply_block(&mut self, message: usize, key: BlockKey) -> ApplyOutcome {
        if self.applied.is_applied(message, key) {
            return ApplyOutcome::AlreadyApplied;
        }
        let blocks = self.render(message);
        let Some(block) = blocks.iter().find(|b| b.key == key) else {
            return ApplyOutcome::NotApplicable;
        };
        let Some(path) = block.apply_target().map(str::to_string) else {
            return ApplyOutcome::NotApplicable;
        };
        if !block.apply_to(&mut self.workspace) {
            return ApplyOutcome::NotApplicable;
        }
        self.applied.mark_applied(message, key);
        self.record(EventKind::Apply, path.clone());
        ApplyOutcome::Applied(path)
    }

    /// Every applicable block in the conversation, in display order.
    pub fn applicable_blocks(&self) -> Vec<(usize, BlockKey, String)> {
        let mut out = Vec::new();
        for idx in 0..self.conversation.len() {
            for block in self.render(idx) {
                if let Some(path) = block.apply_target() {
                    out.push((idx, block.key, path.to_string()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::{ApplyOutcome, Countdown, Session, TimerEvent};
    use crate::backend::SessionInfo;
    use crate::chat::ChatMessage;
    use crate::render::BlockKey;
    use crate::workspace::Workspace;
    use std::time::{Duration, Instant};

    fn session(now: Instant) -> Session {
        let info = SessionInfo {
            session_id: "s-1".to_string(),
            candidate: "ada".to_string(),
            duration_secs: 90,
        };
        let ws = Workspace::from_files([("rq/queue.py", "old"), ("rq/job.py", "job")]);
        Session::start(info, ws, now)
    }

    #[test]
    fn countdown_expires_once() {
        let start = Instant::now();
        let mut timer = Countdown::start(Duration::from_secs(2), start);
        assert_eq!(timer.tick(start + Duration::from_millis(1500)), TimerEvent::Running);
        assert_eq!(timer.format(start + Duration::from_millis(1500)), "00:01");
        assert_eq!(timer.tick(start + Duration::from_secs(2)), TimerEvent::Expired);
        assert_eq!(timer.tick(start + Duration::from_secs(3)), TimerEvent::Stopped);
        assert_eq!(timer.remaining_secs(start + Duration::from_secs(10)), 0);
    }

    #[test]
    fn cancelled_countdown_never_expires() {
        let start = Instant::now();
        let mut timer = Countdown::start(Duration::from_secs(1), start);
        timer.cancel();
        assert!(timer.is_stopped());
        assert_eq!(timer.tick(start + Duration::from_secs(5)), TimerEvent::Stopped);
    }

    #[test]
    fn countdown_formats_minutes_and_seconds() {
        let start = Instant::now();
        let timer = Countdown::start(Duration::from_secs(45 * 60), start);
        assert_eq!(timer.format(start), "45:00");
        assert_eq!(timer.format(start + Duration::from_secs(61)), "43:59");
    }

    #[test]
    fn apply_block_marks_applied_and_refuses_repeat() {
        let now = Instant::now();
        let mut s = session(now);
        s.push_prompt("fix it");
        let idx = s
            .conversation
            .push(ChatMessage::assistant("Try:\n```python rq/queue.py\nnew\n```"));
        let targets = s.applicable_blocks();
        assert_eq!(targets, vec![(idx, BlockKey(1), "rq/queue.py".to_string())]);

        assert_eq!(
            s.apply_block(idx, BlockKey(1)),
            ApplyOutcome::Applied("rq/queue.py".to_string())
        );
        assert_eq!(s.workspace.text("rq/queue.py").as_deref(), Some("new"));
        assert_eq!(s.workspace.text("rq/job.py").as_deref(), Some("job"));
        assert_eq!(s.apply_block(idx, BlockKey(1)), ApplyOutcome::AlreadyApplied);
        assert_eq!(s.apply_block(idx, BlockKey(0)), ApplyOutcome::NotApplicable);
    }

    #[test]
    fn reset_clears_chat_and_restores_files() {
        let now = Instant::now();
        let mut s = session(now);
        let idx = s
            .conversation
            .push(ChatMessage::assistant("```python rq/queue.py\nnew\n```"));
        s.apply_block(idx, BlockKey(0));
        s.reset(now);
        assert!(s.conversation.is_empty());
        assert_eq!(s.workspace.text("rq/queue.py").as_deref(), Some("old"));
        assert_eq!(s.applied.len(), 0);
        assert_eq!(s.events.len(), 1);
        assert!(!s.is_finished());
    }

    #[test]
    fn reset_advances_epoch() {
        let now = Instant::now();
        let mut s = session(now);
        assert_eq!(s.epoch, 0);
        s.reset(now);
        s.reset(now);
        assert_eq!(s.epoch, 2);
    }

    #[test]
    fn fences_in_candidate_prompts_are_not_applicable() {
        let now = Instant::now();
        let mut s = session(now);
        let idx = s.push_prompt("what about this?\n```python rq/queue.py\nuser pasted junk\n```");
        assert!(s.render(idx).is_empty());
        assert!(s.applicable_blocks().is_empty());
        assert_eq!(s.apply_block(idx, BlockKey(1)), ApplyOutcome::NotApplicable);
        assert_eq!(s.workspace.text("rq/queue.py").as_deref(), Some("old"));
    }
}
