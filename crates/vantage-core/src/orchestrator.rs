use crate::api::http::HttpRunApi;
use crate::api::RunApi;
use crate::cache::{LoadMore, LoadedRun, Pagination, ResultsCache};
use crate::config::ClientConfig;
use crate::driver::DriverRegistry;
use crate::errors::RunError;
use crate::model::{ResultFilters, ResultRecord, Run, RunStatus, StartRunRequest};
use crate::progress::{ProgressFeed, Snapshot};
use crate::resume::{PollFallback, PollHandle};
use crate::session::{RunBook, RunsState, SessionStore};
use crate::stream::{RunCallbacks, StreamConsumer};
use std::sync::Arc;
use tokio::sync::watch;

/// Entry point for collaborators: one instance per client session.
pub struct Orchestrator {
    api: Arc<dyn RunApi>,
    registry: DriverRegistry,
    book: RunBook,
    feed: ProgressFeed,
    cache: Arc<ResultsCache>,
    fallback: PollFallback,
    consumer: StreamConsumer,
}

impl Orchestrator {
    pub fn new(cfg: &ClientConfig, api: Arc<dyn RunApi>, book: RunBook) -> Self {
        let registry = DriverRegistry::new();
        let feed = ProgressFeed::new();
        let cache = Arc::new(ResultsCache::new(
            api.clone(),
            cfg.page_size,
            cfg.cache_entries,
        ));
        let fallback = PollFallback::new(
            api.clone(),
            registry.clone(),
            book.clone(),
            cache.clone(),
            feed.clone(),
        )
        .with_intervals(cfg.poll_interval(), cfg.poll_retry_interval());
        let consumer = StreamConsumer::new(
            api.clone(),
            registry.clone(),
            book.clone(),
            feed.clone(),
            fallback.clone(),
        );

        Self {
            api,
            registry,
            book,
            feed,
            cache,
            fallback,
            consumer,
        }
    }

    /// Wires the HTTP client and the on-disk session store from `cfg`.
    pub fn from_config(cfg: &ClientConfig) -> anyhow::Result<Self> {
        cfg.validate()?;
        let store = SessionStore::open(&cfg.db_path)?;
        let book = RunBook::with_store(store)?;
        let api: Arc<dyn RunApi> = Arc::new(HttpRunApi::from_config(cfg));
        Ok(Self::new(cfg, api, book))
    }

    /// Starts a run over the live stream and waits for it to finish.
    pub async fn start_run(
        &self,
        req: &StartRunRequest,
        callbacks: &dyn RunCallbacks,
    ) -> Result<String, RunError> {
        tracing::info!(
            event = "vantage.run.start",
            project_id = %req.project_id,
            question_set_id = %req.question_set_id,
            providers = ?req.providers,
        );
        let run_id = self.consumer.run_stream(req, callbacks).await?;
        if let Err(e) = self.cache.load(&run_id).await {
            tracing::warn!(
                event = "vantage.run.results_deferred",
                run_id = %run_id,
                error = %e,
                "results will be fetched on next load"
            );
        }
        Ok(run_id)
    }

    /// Re-attaches to a run the previous session left in flight.
    ///
    /// The active run pointer is considered first, then the run list.
    pub fn resume_on_start(&self) -> Option<PollHandle> {
        let mut candidates: Vec<Run> = self.book.snapshot().active.iter().cloned().collect();
        candidates.extend(self.book.in_flight());
        self.fallback.resume_in_flight(&candidates)
    }

    pub async fn refresh_runs(&self, project_id: Option<&str>) -> Result<Arc<RunsState>, RunError> {
        let runs = self.api.list_runs(project_id).await?;
        Ok(self.book.replace_runs(runs))
    }

    pub async fn load_results(&self, run_id: &str) -> Result<LoadedRun, RunError> {
        self.cache.load(run_id).await
    }

    pub async fn load_results_filtered(
        &self,
        run_id: &str,
        filters: &ResultFilters,
    ) -> Result<LoadedRun, RunError> {
        self.cache.load_filtered(run_id, filters).await
    }

    pub async fn load_more(&self, run_id: &str) -> Result<LoadMore, RunError> {
        self.cache.load_more(run_id).await
    }

    pub fn patch_result(&self, result_id: &str, record: ResultRecord) -> usize {
        self.cache.patch(result_id, record)
    }

    pub async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<Run, RunError> {
        crate::mutate::set_run_status(&self.book, self.api.as_ref(), run_id, status).await
    }

    pub fn progress(&self) -> Option<Snapshot> {
        self.feed.current()
    }

    /// Progress of a specific run, including one displaced from the active feed.
    pub fn progress_of(&self, run_id: &str) -> Option<Snapshot> {
        self.feed.snapshot_of(run_id)
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Option<Snapshot>> {
        self.feed.subscribe()
    }

    pub fn pagination(&self) -> Option<Pagination> {
        self.cache.pagination()
    }

    pub fn runs(&self) -> Arc<RunsState> {
        self.book.snapshot()
    }

    pub fn cache(&self) -> &ResultsCache {
        &self.cache
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }
}
