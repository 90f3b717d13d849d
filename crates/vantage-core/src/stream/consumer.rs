//! Drives one run from its live event stream.
//!
//! A reader task turns body chunks into frames and queues them on a bounded
//! channel; the consumer drains that channel in order, so frames reach the
//! progress machine exactly as the server emitted them.

use super::decoder::{Frame, FrameDecoder};
use super::events::*;
use crate::api::{ChunkStream, RunApi};
use crate::driver::{DriverKind, DriverRegistry, DriverSlot};
use crate::errors::RunError;
use crate::model::{ProgressStatus, Run, RunStatus, StartRunRequest};
use crate::progress::{ProgressFeed, ProgressMachine, Transition};
use crate::resume::{note_degraded, PollFallback};
use crate::session::RunBook;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;

const FRAME_QUEUE: usize = 256;

/// Per-event hooks for UI collaborators. Every hook defaults to a no-op.
#[allow(unused_variables)]
pub trait RunCallbacks: Send + Sync {
    fn on_run_created(&self, ev: &RunCreated) {}
    fn on_run_started(&self, ev: &RunStarted) {}
    fn on_question_start(&self, ev: &QuestionStart) {}
    fn on_provider_complete(&self, ev: &ProviderComplete) {}
    fn on_question_complete(&self, ev: &QuestionComplete) {}
    fn on_execution_complete(&self, ev: &ExecutionComplete) {}
    fn on_evaluation_start(&self, ev: &EvaluationStart) {}
    fn on_evaluation_progress(&self, ev: &EvaluationProgress) {}
    fn on_analysis_complete(&self, ev: &AnalysisComplete) {}
    fn on_run_complete(&self, ev: &RunComplete) {}
    fn on_heartbeat(&self, ev: &Heartbeat) {}
    fn on_error(&self, ev: &StreamError) {}
}

pub struct NoCallbacks;

impl RunCallbacks for NoCallbacks {}

fn dispatch(callbacks: &dyn RunCallbacks, event: &RunEvent) {
    match event {
        RunEvent::RunCreated(e) => callbacks.on_run_created(e),
        RunEvent::RunStarted(e) => callbacks.on_run_started(e),
        RunEvent::QuestionStart(e) => callbacks.on_question_start(e),
        RunEvent::ProviderComplete(e) => callbacks.on_provider_complete(e),
        RunEvent::QuestionComplete(e) => callbacks.on_question_complete(e),
        RunEvent::ExecutionComplete(e) => callbacks.on_execution_complete(e),
        RunEvent::EvaluationStart(e) => callbacks.on_evaluation_start(e),
        RunEvent::EvaluationProgress(e) => callbacks.on_evaluation_progress(e),
        RunEvent::AnalysisComplete(e) => callbacks.on_analysis_complete(e),
        RunEvent::RunComplete(e) => callbacks.on_run_complete(e),
        RunEvent::Heartbeat(e) => callbacks.on_heartbeat(e),
        RunEvent::Error(e) => callbacks.on_error(e),
    }
}

enum ReaderMsg {
    Frame(Frame),
    Lost(RunError),
    Closed,
}

async fn read_frames(mut body: Box<dyn ChunkStream>, tx: mpsc::Sender<ReaderMsg>) {
    let mut decoder = FrameDecoder::new();
    loop {
        match body.next_chunk().await {
            Ok(Some(chunk)) => {
                for frame in decoder.push(&chunk) {
                    if tx.send(ReaderMsg::Frame(frame)).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => {
                for frame in decoder.finish() {
                    if tx.send(ReaderMsg::Frame(frame)).await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(ReaderMsg::Closed).await;
                return;
            }
            Err(e) => {
                tracing::debug!(
                    event = "vantage.stream.read_failed",
                    pending_bytes = decoder.pending(),
                    error = %e,
                );
                let _ = tx.send(ReaderMsg::Lost(e)).await;
                return;
            }
        }
    }
}

#[derive(Clone)]
pub struct StreamConsumer {
    api: Arc<dyn RunApi>,
    registry: DriverRegistry,
    book: RunBook,
    feed: ProgressFeed,
    fallback: PollFallback,
}

impl StreamConsumer {
    pub fn new(
        api: Arc<dyn RunApi>,
        registry: DriverRegistry,
        book: RunBook,
        feed: ProgressFeed,
        fallback: PollFallback,
    ) -> Self {
        Self {
            api,
            registry,
            book,
            feed,
            fallback,
        }
    }

    /// Starts a run and follows it to the end.
    ///
    /// Resolves with the run id on the first `run_complete` and rejects on the
    /// first `error` frame. A connection that cannot be opened, or that ends
    /// before any frame arrived, rejects immediately. A connection lost after
    /// the run was confirmed is not a run failure: the consumer keeps its
    /// claim on the run and follows it through the status endpoint instead.
    pub async fn run_stream(
        &self,
        req: &StartRunRequest,
        callbacks: &dyn RunCallbacks,
    ) -> Result<String, RunError> {
        let mut machine = ProgressMachine::start(&req.question_set_id, self.feed.clone());

        let body = match self.api.open_run_stream(req).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(
                    event = "vantage.stream.open_failed",
                    question_set_id = %req.question_set_id,
                    error = %e,
                );
                machine.fail(&e.to_string());
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(FRAME_QUEUE);
        let reader = tokio::spawn(read_frames(body, tx));
        let result = self.consume(req, &mut machine, rx, callbacks).await;
        reader.abort();
        result
    }

    async fn consume(
        &self,
        req: &StartRunRequest,
        machine: &mut ProgressMachine,
        mut rx: mpsc::Receiver<ReaderMsg>,
        callbacks: &dyn RunCallbacks,
    ) -> Result<String, RunError> {
        let mut slot: Option<DriverSlot> = None;
        let mut frames_seen: u64 = 0;

        while let Some(msg) = rx.recv().await {
            let frame = match msg {
                ReaderMsg::Frame(f) => f,
                ReaderMsg::Lost(e) => {
                    return self.connection_lost(machine, slot, frames_seen, e).await;
                }
                ReaderMsg::Closed => {
                    let e = RunError::Connection("stream closed before the run finished".into());
                    return self.connection_lost(machine, slot, frames_seen, e).await;
                }
            };
            frames_seen += 1;

            let Some(event) = RunEvent::decode(&frame) else {
                continue;
            };

            if slot.is_none() {
                if let RunEvent::RunCreated(RunCreated { run_id, .. })
                | RunEvent::RunStarted(RunStarted { run_id, .. }) = &event
                {
                    slot = self.registry.try_acquire(run_id, DriverKind::Stream);
                    if slot.is_none() {
                        tracing::warn!(
                            event = "vantage.stream.already_driven",
                            run_id = %run_id,
                            held_by = ?self.registry.kind_of(run_id),
                        );
                        let e = RunError::AlreadyDriven(run_id.clone());
                        machine.fail(&e.to_string());
                        return Err(e);
                    }
                }
            }

            let transition = machine.apply(&event);
            self.sync_book(req, machine, &event);
            dispatch(callbacks, &event);

            match transition {
                Transition::Continue => {}
                Transition::Completed(run_id) => {
                    tracing::info!(event = "vantage.stream.completed", run_id = %run_id);
                    return Ok(run_id);
                }
                Transition::Failed(message) => {
                    tracing::warn!(
                        event = "vantage.stream.run_failed",
                        run_id = ?machine.run_id(),
                        error = %message,
                    );
                    return Err(RunError::Protocol(message));
                }
            }
        }

        let e = RunError::Connection("frame reader stopped".into());
        self.connection_lost(machine, slot, frames_seen, e).await
    }

    async fn connection_lost(
        &self,
        machine: &mut ProgressMachine,
        slot: Option<DriverSlot>,
        frames_seen: u64,
        err: RunError,
    ) -> Result<String, RunError> {
        let run_id = machine.run_id().map(str::to_string);
        let (Some(run_id), true) = (run_id, frames_seen > 0) else {
            tracing::warn!(
                event = "vantage.stream.lost_before_start",
                frames = frames_seen,
                error = %err,
            );
            machine.fail(&err.to_string());
            return Err(err);
        };

        let slot = match slot {
            Some(s) => s,
            None => match self.registry.try_acquire(&run_id, DriverKind::Poll) {
                Some(s) => s,
                None => {
                    // Someone else already follows this run; leave the snapshot as is.
                    return Err(err);
                }
            },
        };

        tracing::warn!(
            event = "vantage.stream.degraded_to_poll",
            run_id = %run_id,
            frames = frames_seen,
            error = %err,
        );
        note_degraded(machine, &err.to_string());
        self.fallback.follow(machine, slot).await.into_result()
    }

    /// Keeps the run record in step with what the stream reports.
    fn sync_book(&self, req: &StartRunRequest, machine: &ProgressMachine, event: &RunEvent) {
        let snap = machine.snapshot();
        let Some(run_id) = snap.run_id.clone() else {
            return;
        };

        match event {
            RunEvent::RunCreated(p) => {
                let run = Run {
                    id: run_id,
                    project_id: req.project_id.clone(),
                    question_set_id: snap.question_set_id.clone(),
                    name: p.name.clone().or_else(|| req.name.clone()),
                    providers: if p.providers.is_empty() {
                        req.providers.clone()
                    } else {
                        p.providers.clone()
                    },
                    status: RunStatus::Pending,
                    total: 0,
                    completed: 0,
                    failed: 0,
                    started_at: None,
                    completed_at: None,
                };
                self.book.upsert(run.clone());
                self.book.set_active(Some(run));
            }
            RunEvent::RunStarted(_)
            | RunEvent::QuestionComplete(_)
            | RunEvent::ExecutionComplete(_)
            | RunEvent::EvaluationStart(_)
            | RunEvent::RunComplete(_)
            | RunEvent::Error(_) => {
                let status = match snap.status {
                    ProgressStatus::Created => RunStatus::Pending,
                    ProgressStatus::Running => RunStatus::Running,
                    ProgressStatus::Evaluating => RunStatus::Evaluating,
                    ProgressStatus::Completed => RunStatus::Completed,
                    ProgressStatus::Failed => RunStatus::Failed,
                };
                let mut run = self.book.get(&run_id).unwrap_or_else(|| Run {
                    id: run_id.clone(),
                    project_id: req.project_id.clone(),
                    question_set_id: snap.question_set_id.clone(),
                    name: req.name.clone(),
                    providers: req.providers.clone(),
                    status,
                    total: 0,
                    completed: 0,
                    failed: 0,
                    started_at: None,
                    completed_at: None,
                });
                if matches!(event, RunEvent::RunStarted(_)) {
                    run.started_at = Some(Utc::now());
                }
                if status.is_terminal() {
                    run.completed_at = Some(Utc::now());
                }
                run.status = status;
                run.total = snap.total_calls;
                run.completed = snap.completed_calls;
                run.failed = snap.failed_calls;
                self.book.upsert(run);
            }
            _ => {}
        }
    }
}
