//! Progress state machine for one in-flight run.
//!
//! `created -> running -> evaluating -> completed`, with `failed` reachable
//! from any non-terminal state. The machine never edits a published snapshot:
//! each update clones the current value, changes the clone and publishes the
//! new `Arc` on a watch channel, so readers always hold a consistent view.

use crate::model::{
    ActiveRunProgress, LogEntry, LogKind, ProgressStatus, Run, RunStatus, RunStatusResponse,
};
use crate::stream::events::RunEvent;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub type Snapshot = Arc<ActiveRunProgress>;

/// Snapshots of every run being driven, plus the one shown as "active".
///
/// Each machine registers as a writer. Its snapshots are always kept under
/// its run id, but only the current owner of the feed reaches the active
/// channel. A freshly started stream always takes the feed over; a resumed
/// poller only takes it when nothing live is shown.
#[derive(Clone)]
pub struct ProgressFeed {
    tx: Arc<watch::Sender<Option<Snapshot>>>,
    inner: Arc<Mutex<FeedState>>,
}

#[derive(Default)]
struct FeedState {
    owner: Option<u64>,
    next_writer: u64,
    by_run: HashMap<String, Snapshot>,
}

impl Default for ProgressFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressFeed {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            inner: Arc::new(Mutex::new(FeedState::default())),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Snapshot>> {
        self.tx.subscribe()
    }

    /// Snapshot of the run that owns the feed.
    pub fn current(&self) -> Option<Snapshot> {
        self.tx.borrow().clone()
    }

    /// Latest snapshot published for `run_id`, owner or not.
    pub fn snapshot_of(&self, run_id: &str) -> Option<Snapshot> {
        self.inner.lock().unwrap().by_run.get(run_id).cloned()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.owner = None;
        inner.by_run.clear();
        self.tx.send_replace(None);
    }

    fn register(&self, preempt: bool) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_writer += 1;
        let id = inner.next_writer;
        let shown_is_live = self
            .tx
            .borrow()
            .as_ref()
            .map_or(false, |s| !s.status.is_terminal());
        if preempt || inner.owner.is_none() || !shown_is_live {
            inner.owner = Some(id);
        }
        id
    }

    fn publish(&self, writer: u64, snapshot: Snapshot) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run_id) = &snapshot.run_id {
            inner.by_run.insert(run_id.clone(), snapshot.clone());
        }
        if inner.owner == Some(writer) {
            self.tx.send_replace(Some(snapshot));
        }
    }
}

/// Outcome of feeding one input to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Continue,
    Completed(String),
    Failed(String),
}

pub struct ProgressMachine {
    state: Snapshot,
    feed: ProgressFeed,
    writer: u64,
    /// One-shot milestones already logged.
    logged: HashSet<String>,
}

impl ProgressMachine {
    /// Enters `created` synchronously, before anything reaches the network.
    pub fn start(question_set_id: &str, feed: ProgressFeed) -> Self {
        let mut initial = ActiveRunProgress::new(question_set_id);
        push_log(&mut initial, LogKind::Info, "Starting run".to_string());
        let writer = feed.register(true);
        Self::with_initial(initial, feed, writer)
    }

    /// Rebuilds a snapshot from the last counters persisted for `run`.
    pub fn resume(run: &Run, feed: ProgressFeed) -> Self {
        let mut initial = ActiveRunProgress::new(run.question_set_id.clone());
        initial.run_id = Some(run.id.clone());
        initial.status = match run.status {
            RunStatus::Evaluating => ProgressStatus::Evaluating,
            _ => ProgressStatus::Running,
        };
        initial.total_calls = run.total;
        initial.completed_calls = run.completed;
        initial.failed_calls = run.failed;
        push_log(
            &mut initial,
            LogKind::Info,
            format!(
                "Resumed run {} ({}/{} calls)",
                run.id,
                run.completed + run.failed,
                run.total
            ),
        );
        let writer = feed.register(false);
        Self::with_initial(initial, feed, writer)
    }

    fn with_initial(initial: ActiveRunProgress, feed: ProgressFeed, writer: u64) -> Self {
        let state = Arc::new(initial);
        feed.publish(writer, state.clone());
        Self {
            state,
            feed,
            writer,
            logged: HashSet::new(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.clone()
    }

    pub fn feed(&self) -> &ProgressFeed {
        &self.feed
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Snapshot>> {
        self.feed.subscribe()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.status.is_terminal()
    }

    pub fn run_id(&self) -> Option<&str> {
        self.state.run_id.as_deref()
    }

    pub fn apply(&mut self, event: &RunEvent) -> Transition {
        if self.is_terminal() {
            return Transition::Continue;
        }

        let mut next = (*self.state).clone();
        let transition = match event {
            RunEvent::RunCreated(p) => {
                next.run_id = Some(p.run_id.clone());
                if let Some(qs) = &p.question_set_id {
                    next.question_set_id = qs.clone();
                }
                let label = p.name.clone().unwrap_or_else(|| p.run_id.clone());
                push_log(&mut next, LogKind::Info, format!("Run created: {}", label));
                Transition::Continue
            }
            RunEvent::RunStarted(p) => {
                let changed = next.status == ProgressStatus::Created
                    || next.total_questions != p.total_questions
                    || next.total_calls != p.total_calls;
                next.run_id = Some(p.run_id.clone());
                next.status = ProgressStatus::Running;
                next.total_questions = p.total_questions;
                next.total_calls = p.total_calls;
                if changed {
                    push_log(
                        &mut next,
                        LogKind::Info,
                        format!(
                            "Asking {} questions ({} engine calls)",
                            p.total_questions, p.total_calls
                        ),
                    );
                }
                Transition::Continue
            }
            RunEvent::QuestionStart(p) => {
                mark_running(&mut next);
                let changed = next.current_question != p.index;
                next.current_question = p.index;
                next.current_question_text = Some(p.question_text.clone());
                if changed {
                    push_log(
                        &mut next,
                        LogKind::Info,
                        format!("Question {}/{}: {}", p.index, p.total, p.question_text),
                    );
                }
                Transition::Continue
            }
            RunEvent::ProviderComplete(p) => {
                mark_running(&mut next);
                if p.success {
                    next.completed_calls += 1;
                    push_log(
                        &mut next,
                        LogKind::Success,
                        format!("{} answered in {}ms", p.provider, p.time_ms),
                    );
                } else {
                    next.failed_calls += 1;
                    let reason = p.error.as_deref().unwrap_or("no answer");
                    push_log(
                        &mut next,
                        LogKind::Error,
                        format!("{} failed: {}", p.provider, reason),
                    );
                }
                Transition::Continue
            }
            RunEvent::QuestionComplete(_) => {
                mark_running(&mut next);
                Transition::Continue
            }
            RunEvent::ExecutionComplete(p) => {
                mark_running(&mut next);
                next.completed_calls = next.completed_calls.max(p.success);
                next.failed_calls = next.failed_calls.max(p.failed);
                if self.logged.insert("execution_complete".to_string()) {
                    push_log(
                        &mut next,
                        LogKind::Success,
                        format!(
                            "All calls finished: {} ok, {} failed in {}ms",
                            p.success, p.failed, p.duration_ms
                        ),
                    );
                }
                Transition::Continue
            }
            RunEvent::EvaluationStart(p) => {
                next.status = ProgressStatus::Evaluating;
                next.current_stage = p.stages.first().cloned();
                if self.logged.insert("evaluation_start".to_string()) {
                    push_log(
                        &mut next,
                        LogKind::Info,
                        format!("Evaluating answers ({})", p.stages.join(", ")),
                    );
                }
                Transition::Continue
            }
            RunEvent::EvaluationProgress(p) => {
                next.status = ProgressStatus::Evaluating;
                if next.current_stage.as_deref() != Some(p.stage.as_str()) {
                    next.current_stage = Some(p.stage.clone());
                    push_log(&mut next, LogKind::Info, format!("Stage: {}", p.stage));
                }
                Transition::Continue
            }
            RunEvent::AnalysisComplete(p) => {
                next.status = ProgressStatus::Evaluating;
                let key = format!("analysis:{}", p.analysis_id.as_deref().unwrap_or(""));
                if self.logged.insert(key) {
                    let preview = p.summary_preview.as_deref().unwrap_or("analysis ready");
                    push_log(&mut next, LogKind::Success, format!("Analysis: {}", preview));
                }
                Transition::Continue
            }
            RunEvent::RunComplete(p) => {
                next.run_id = Some(p.run_id.clone());
                next.status = ProgressStatus::Completed;
                push_log(
                    &mut next,
                    LogKind::Success,
                    format!("Run complete in {}ms", p.duration_ms),
                );
                Transition::Completed(p.run_id.clone())
            }
            RunEvent::Heartbeat(_) => {
                next.last_heartbeat_at = Some(Utc::now());
                Transition::Continue
            }
            RunEvent::Error(p) => {
                let msg = p.message();
                fail_into(&mut next, &msg);
                Transition::Failed(msg)
            }
        };

        self.replace(next);
        transition
    }

    /// Folds a status-endpoint response into the snapshot.
    pub fn apply_poll(&mut self, resp: &RunStatusResponse) -> Transition {
        if self.is_terminal() {
            return Transition::Continue;
        }

        let mut next = (*self.state).clone();
        next.run_id = Some(resp.run_id.clone());
        next.total_questions = resp.total_questions;
        next.total_calls = resp.total_calls;
        next.current_question = resp.completed_questions;
        next.current_stage = resp.current_stage.clone();

        let counters_moved =
            next.completed_calls != resp.completed_calls || next.failed_calls != resp.failed_calls;
        next.completed_calls = resp.completed_calls;
        next.failed_calls = resp.failed_calls;
        if counters_moved {
            push_log(
                &mut next,
                LogKind::Info,
                format!(
                    "{}/{} calls done ({} failed)",
                    resp.completed_calls + resp.failed_calls,
                    resp.total_calls,
                    resp.failed_calls
                ),
            );
        }

        let transition = match resp.status {
            RunStatus::Completed => {
                next.status = ProgressStatus::Completed;
                push_log(&mut next, LogKind::Success, "Run complete".to_string());
                Transition::Completed(resp.run_id.clone())
            }
            RunStatus::Failed => {
                let msg = resp.error.clone().unwrap_or_else(|| "run failed".to_string());
                fail_into(&mut next, &msg);
                Transition::Failed(msg)
            }
            RunStatus::Evaluating => {
                next.status = ProgressStatus::Evaluating;
                Transition::Continue
            }
            RunStatus::Running => {
                next.status = ProgressStatus::Running;
                Transition::Continue
            }
            RunStatus::Pending | RunStatus::Ready => Transition::Continue,
        };

        self.replace(next);
        transition
    }

    /// Terminal failure not carried by a frame or a poll, e.g. the stream never opened.
    pub fn fail(&mut self, message: &str) -> Transition {
        if self.is_terminal() {
            return Transition::Continue;
        }
        let mut next = (*self.state).clone();
        fail_into(&mut next, message);
        self.replace(next);
        Transition::Failed(message.to_string())
    }

    /// Appends an informational line without touching counters or status.
    pub fn note(&mut self, kind: LogKind, message: String) {
        let mut next = (*self.state).clone();
        push_log(&mut next, kind, message);
        self.replace(next);
    }

    fn replace(&mut self, next: ActiveRunProgress) {
        self.state = Arc::new(next);
        self.feed.publish(self.writer, self.state.clone());
    }
}

fn mark_running(p: &mut ActiveRunProgress) {
    if p.status == ProgressStatus::Created {
        p.status = ProgressStatus::Running;
    }
}

fn fail_into(p: &mut ActiveRunProgress, message: &str) {
    p.status = ProgressStatus::Failed;
    p.error = Some(message.to_string());
    push_log(p, LogKind::Error, message.to_string());
}

fn push_log(p: &mut ActiveRunProgress, kind: LogKind, message: String) {
    p.log.push(LogEntry {
        time: Utc::now(),
        message,
        kind,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::events::*;

    fn started(total_calls: u64) -> RunEvent {
        RunEvent::RunStarted(RunStarted {
            run_id: "r1".into(),
            total_questions: 6,
            total_calls,
        })
    }

    fn provider(success: bool) -> RunEvent {
        RunEvent::ProviderComplete(ProviderComplete {
            question_id: "q1".into(),
            provider: "chatgpt".into(),
            success,
            time_ms: 120,
            error: None,
        })
    }

    #[test]
    fn test_start_is_created_synchronously() {
        let feed = ProgressFeed::new();
        let m = ProgressMachine::start("qs-1", feed.clone());
        assert_eq!(m.snapshot().status, ProgressStatus::Created);
        assert_eq!(feed.current().unwrap().question_set_id, "qs-1");
    }

    #[test]
    fn test_full_lifecycle() {
        let mut m = ProgressMachine::start("qs-1", ProgressFeed::new());
        assert_eq!(m.apply(&started(2)), Transition::Continue);
        assert_eq!(m.snapshot().status, ProgressStatus::Running);
        m.apply(&provider(true));
        m.apply(&provider(false));
        m.apply(&RunEvent::EvaluationStart(EvaluationStart {
            stages: vec!["visibility".into()],
        }));
        assert_eq!(m.snapshot().status, ProgressStatus::Evaluating);

        let t = m.apply(&RunEvent::RunComplete(RunComplete {
            run_id: "r1".into(),
            analysis_id: None,
            status: None,
            duration_ms: 10,
        }));
        assert_eq!(t, Transition::Completed("r1".into()));
        let s = m.snapshot();
        assert_eq!((s.completed_calls, s.failed_calls), (1, 1));
        assert_eq!(s.status, ProgressStatus::Completed);
    }

    #[test]
    fn test_terminal_state_absorbs_everything() {
        let mut m = ProgressMachine::start("qs-1", ProgressFeed::new());
        m.apply(&started(1));
        let t = m.apply(&RunEvent::Error(StreamError {
            error: Some("engine quota".into()),
            message: None,
        }));
        assert_eq!(t, Transition::Failed("engine quota".into()));

        let before = m.snapshot();
        let t = m.apply(&RunEvent::RunComplete(RunComplete {
            run_id: "r1".into(),
            analysis_id: None,
            status: None,
            duration_ms: 0,
        }));
        assert_eq!(t, Transition::Continue);
        assert_eq!(m.fail("late"), Transition::Continue);
        assert_eq!(m.snapshot(), before);
        assert_eq!(m.snapshot().status, ProgressStatus::Failed);
    }

    #[test]
    fn test_log_only_grows_when_counters_change() {
        let mut m = ProgressMachine::start("qs-1", ProgressFeed::new());
        m.apply(&started(4));
        let q = RunEvent::QuestionStart(QuestionStart {
            question_id: "q1".into(),
            question_text: "best crm?".into(),
            index: 1,
            total: 6,
        });
        m.apply(&q);
        let len = m.snapshot().log.len();
        m.apply(&q);
        m.apply(&RunEvent::Heartbeat(Heartbeat { message: None }));
        m.apply(&RunEvent::QuestionComplete(QuestionComplete {
            question_id: "q1".into(),
            success_count: 4,
            failed_count: 0,
        }));
        assert_eq!(m.snapshot().log.len(), len);
        assert!(m.snapshot().last_heartbeat_at.is_some());
    }

    #[test]
    fn test_published_snapshots_are_not_mutated() {
        let feed = ProgressFeed::new();
        let mut m = ProgressMachine::start("qs-1", feed.clone());
        m.apply(&started(3));
        let mut rx = m.subscribe();
        let held = feed.current().unwrap();
        m.apply(&provider(true));
        assert_eq!(held.completed_calls, 0);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().completed_calls, 1);
    }

    #[test]
    fn test_poll_failed_uses_server_error() {
        let run = Run {
            id: "r2".into(),
            project_id: "p1".into(),
            question_set_id: "qs-2".into(),
            name: None,
            providers: vec![],
            status: RunStatus::Running,
            total: 24,
            completed: 10,
            failed: 0,
            started_at: None,
            completed_at: None,
        };
        let mut m = ProgressMachine::resume(&run, ProgressFeed::new());
        assert_eq!(m.snapshot().completed_calls, 10);

        let resp = RunStatusResponse {
            run_id: "r2".into(),
            status: RunStatus::Failed,
            current_stage: None,
            total_questions: 6,
            completed_questions: 3,
            total_calls: 24,
            completed_calls: 12,
            failed_calls: 1,
            error: Some("provider credentials revoked".into()),
            started_at: None,
            completed_at: None,
        };
        assert_eq!(
            m.apply_poll(&resp),
            Transition::Failed("provider credentials revoked".into())
        );
        assert_eq!(
            m.snapshot().error.as_deref(),
            Some("provider credentials revoked")
        );
    }

    fn running(id: &str) -> Run {
        Run {
            id: id.into(),
            project_id: "p1".into(),
            question_set_id: "qs-2".into(),
            name: None,
            providers: vec![],
            status: RunStatus::Running,
            total: 24,
            completed: 10,
            failed: 0,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_repeated_milestones_log_once() {
        let mut m = ProgressMachine::start("qs-1", ProgressFeed::new());
        m.apply(&started(2));
        let done = RunEvent::ExecutionComplete(ExecutionComplete {
            total: 2,
            success: 2,
            failed: 0,
            duration_ms: 900,
        });
        let analysis = RunEvent::AnalysisComplete(AnalysisComplete {
            analysis_id: Some("a1".into()),
            summary_preview: Some("cited 2/2".into()),
        });
        m.apply(&done);
        m.apply(&analysis);
        let len = m.snapshot().log.len();

        m.apply(&started(2));
        m.apply(&done);
        m.apply(&analysis);
        assert_eq!(m.snapshot().log.len(), len);
        assert_eq!(m.snapshot().completed_calls, 2);

        m.apply(&RunEvent::AnalysisComplete(AnalysisComplete {
            analysis_id: Some("a2".into()),
            summary_preview: None,
        }));
        assert_eq!(m.snapshot().log.len(), len + 1);
    }

    #[test]
    fn test_started_stream_takes_feed_from_poller() {
        let feed = ProgressFeed::new();
        let mut poller = ProgressMachine::resume(&running("r2"), feed.clone());
        assert_eq!(feed.current().unwrap().run_id.as_deref(), Some("r2"));

        let mut stream = ProgressMachine::start("qs-1", feed.clone());
        stream.apply(&started(3));
        poller.note(LogKind::Info, "still polling".into());

        let shown = feed.current().unwrap();
        assert_eq!(shown.run_id.as_deref(), Some("r1"));
        assert_eq!(shown.total_calls, 3);
        // The displaced run is still tracked under its own id.
        let r2 = feed.snapshot_of("r2").unwrap();
        assert_eq!(r2.log.last().unwrap().message, "still polling");
    }

    #[test]
    fn test_resumed_poller_does_not_displace_live_stream() {
        let feed = ProgressFeed::new();
        let mut stream = ProgressMachine::start("qs-1", feed.clone());
        stream.apply(&started(3));

        let _poller = ProgressMachine::resume(&running("r2"), feed.clone());
        assert_eq!(feed.current().unwrap().run_id.as_deref(), Some("r1"));
        assert!(feed.snapshot_of("r2").is_some());

        stream.fail("engine quota");
        let _later = ProgressMachine::resume(&running("r4"), feed.clone());
        assert_eq!(feed.current().unwrap().run_id.as_deref(), Some("r4"));
    }
}
