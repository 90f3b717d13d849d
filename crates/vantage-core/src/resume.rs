//! Re-attaching to runs by polling their status endpoint.
//!
//! Used on startup for a run a previous session left `running`/`evaluating`,
//! and by the stream consumer when its live connection is lost mid-run. A
//! failed poll never ends the loop: it only pushes the next poll further out.

use crate::api::RunApi;
use crate::cache::ResultsCache;
use crate::driver::{DriverKind, DriverRegistry, DriverSlot};
use crate::errors::RunError;
use crate::model::{LogKind, ProgressStatus, Run};
use crate::progress::{ProgressFeed, ProgressMachine, Transition};
use crate::session::RunBook;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed { run_id: String, results_loaded: bool },
    Failed { run_id: String, error: String },
}

impl PollOutcome {
    pub fn into_result(self) -> Result<String, RunError> {
        match self {
            PollOutcome::Completed { run_id, .. } => Ok(run_id),
            PollOutcome::Failed { error, .. } => Err(RunError::Protocol(error)),
        }
    }
}

#[derive(Clone)]
pub struct PollFallback {
    api: Arc<dyn RunApi>,
    registry: DriverRegistry,
    book: RunBook,
    cache: Arc<ResultsCache>,
    feed: ProgressFeed,
    interval: Duration,
    retry_interval: Duration,
}

impl PollFallback {
    pub fn new(
        api: Arc<dyn RunApi>,
        registry: DriverRegistry,
        book: RunBook,
        cache: Arc<ResultsCache>,
        feed: ProgressFeed,
    ) -> Self {
        Self {
            api,
            registry,
            book,
            cache,
            feed,
            interval: Duration::from_secs(3),
            retry_interval: Duration::from_secs(5),
        }
    }

    pub fn with_intervals(mut self, interval: Duration, retry_interval: Duration) -> Self {
        self.interval = interval;
        self.retry_interval = retry_interval;
        self
    }

    /// Attaches a poller to the first in-flight run nobody is driving yet.
    ///
    /// At most one poller is started per call. A run already streamed or
    /// polled in this session is skipped, so repeated calls never stack
    /// pollers on the same run.
    pub fn resume_in_flight(&self, runs: &[Run]) -> Option<PollHandle> {
        for run in runs.iter().filter(|r| r.status.is_in_flight()) {
            if self.registry.is_driven(&run.id) {
                continue;
            }
            let Some(slot) = self.registry.try_acquire(&run.id, DriverKind::Poll) else {
                continue;
            };

            tracing::info!(
                event = "vantage.resume.attach",
                run_id = %run.id,
                status = %run.status,
                completed = run.completed,
                total = run.total,
            );

            let machine = ProgressMachine::resume(run, self.feed.clone());
            let this = self.clone();
            let task = tokio::spawn(async move {
                let mut machine = machine;
                this.follow(&mut machine, slot).await
            });
            return Some(PollHandle {
                run_id: run.id.clone(),
                task,
            });
        }
        None
    }

    /// Polls `slot`'s run until it reports a terminal status, then releases the slot.
    pub async fn follow(&self, machine: &mut ProgressMachine, slot: DriverSlot) -> PollOutcome {
        slot.handover(DriverKind::Poll);
        let outcome = self.poll_until_done(machine, slot.run_id()).await;
        drop(slot);
        outcome
    }

    pub async fn poll_until_done(&self, machine: &mut ProgressMachine, run_id: &str) -> PollOutcome {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let delay = match self.api.run_status(run_id).await {
                Ok(resp) => {
                    self.refresh_runs(run_id).await;
                    match machine.apply_poll(&resp) {
                        Transition::Completed(id) => {
                            let results_loaded = self.fetch_results(&id).await;
                            return PollOutcome::Completed {
                                run_id: id,
                                results_loaded,
                            };
                        }
                        Transition::Failed(error) => {
                            tracing::warn!(
                                event = "vantage.poll.run_failed",
                                run_id = %run_id,
                                error = %error,
                            );
                            return PollOutcome::Failed {
                                run_id: run_id.to_string(),
                                error,
                            };
                        }
                        Transition::Continue => {
                            if let Some(outcome) = terminal_outcome(machine, run_id) {
                                return outcome;
                            }
                            self.interval
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        event = "vantage.poll.request_failed",
                        run_id = %run_id,
                        attempt = attempt,
                        error = %e,
                        "status poll failed; retrying"
                    );
                    self.retry_interval
                }
            };
            tokio::time::sleep(delay).await;
        }
    }

    async fn refresh_runs(&self, run_id: &str) {
        let project = self.book.get(run_id).map(|r| r.project_id);
        match self.api.list_runs(project.as_deref()).await {
            Ok(runs) => {
                self.book.replace_runs(runs);
            }
            Err(e) => tracing::debug!(
                event = "vantage.poll.refresh_failed",
                run_id = %run_id,
                error = %e,
            ),
        }
    }

    async fn fetch_results(&self, run_id: &str) -> bool {
        match self.cache.load(run_id).await {
            Ok(loaded) => {
                tracing::info!(
                    event = "vantage.poll.results_loaded",
                    run_id = %run_id,
                    held = loaded.results().len(),
                    total = loaded.entry.total,
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    event = "vantage.poll.results_failed",
                    run_id = %run_id,
                    error = %e,
                );
                false
            }
        }
    }
}

fn terminal_outcome(machine: &ProgressMachine, run_id: &str) -> Option<PollOutcome> {
    let snap = machine.snapshot();
    match snap.status {
        ProgressStatus::Completed => Some(PollOutcome::Completed {
            run_id: run_id.to_string(),
            results_loaded: false,
        }),
        ProgressStatus::Failed => Some(PollOutcome::Failed {
            run_id: run_id.to_string(),
            error: snap.error.clone().unwrap_or_default(),
        }),
        _ => None,
    }
}

/// A running poll loop. Dropping the handle leaves the loop running.
pub struct PollHandle {
    run_id: String,
    task: JoinHandle<PollOutcome>,
}

impl PollHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop at its next suspension point and frees the run.
    pub fn cancel(&self) {
        tracing::info!(event = "vantage.poll.cancelled", run_id = %self.run_id);
        self.task.abort();
    }

    pub async fn join(self) -> Result<PollOutcome, RunError> {
        self.task.await.map_err(|e| {
            if e.is_cancelled() {
                RunError::Connection(format!("poller for {} cancelled", self.run_id))
            } else {
                RunError::Connection(format!("poller for {} crashed: {}", self.run_id, e))
            }
        })
    }
}

/// Convenience for noting the switch from live updates to polling.
pub(crate) fn note_degraded(machine: &mut ProgressMachine, reason: &str) {
    machine.note(
        LogKind::Info,
        format!("Live updates interrupted ({}); following progress by polling", reason),
    );
}
