//! Scripted in-memory `RunApi` for tests and offline demos.

use super::{ChunkStream, RunApi};
use crate::errors::RunError;
use crate::model::{
    ResultFilters, ResultRecord, ResultsPage, Run, RunStatus, RunStatusResponse, StartRunRequest,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type StreamScript = Result<Vec<Result<Vec<u8>, RunError>>, RunError>;

#[derive(Default)]
pub struct FakeRunApi {
    streams: Mutex<VecDeque<StreamScript>>,
    statuses: Mutex<HashMap<String, VecDeque<Result<RunStatusResponse, RunError>>>>,
    runs: Mutex<Vec<Run>>,
    results: Mutex<HashMap<String, Vec<ResultRecord>>>,
    fail_updates: Mutex<Option<RunError>>,

    pub open_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
}

impl FakeRunApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runs(self, runs: Vec<Run>) -> Self {
        *self.runs.lock().unwrap() = runs;
        self
    }

    /// Queues a stream whose body is delivered as the given chunks, then closes.
    pub fn push_stream<S: AsRef<str>>(&self, chunks: &[S]) {
        let script = chunks
            .iter()
            .map(|c| Ok(c.as_ref().as_bytes().to_vec()))
            .collect();
        self.streams.lock().unwrap().push_back(Ok(script));
    }

    /// Queues a stream that delivers `chunks` and then fails with `err`.
    pub fn push_broken_stream<S: AsRef<str>>(&self, chunks: &[S], err: RunError) {
        let mut script: Vec<Result<Vec<u8>, RunError>> = chunks
            .iter()
            .map(|c| Ok(c.as_ref().as_bytes().to_vec()))
            .collect();
        script.push(Err(err));
        self.streams.lock().unwrap().push_back(Ok(script));
    }

    pub fn push_open_error(&self, err: RunError) {
        self.streams.lock().unwrap().push_back(Err(err));
    }

    /// Queues a status answer. The last queued answer for a run repeats forever.
    pub fn push_status(&self, run_id: &str, resp: Result<RunStatusResponse, RunError>) {
        self.statuses
            .lock()
            .unwrap()
            .entry(run_id.to_string())
            .or_default()
            .push_back(resp);
    }

    pub fn set_results(&self, run_id: &str, records: Vec<ResultRecord>) {
        self.results
            .lock()
            .unwrap()
            .insert(run_id.to_string(), records);
    }

    pub fn set_run(&self, run: Run) {
        let mut runs = self.runs.lock().unwrap();
        match runs.iter_mut().find(|r| r.id == run.id) {
            Some(slot) => *slot = run,
            None => runs.push(run),
        }
    }

    pub fn fail_updates(&self, err: Option<RunError>) {
        *self.fail_updates.lock().unwrap() = err;
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

struct ScriptedStream {
    chunks: VecDeque<Result<Vec<u8>, RunError>>,
}

#[async_trait]
impl ChunkStream for ScriptedStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RunError> {
        tokio::task::yield_now().await;
        match self.chunks.pop_front() {
            Some(Ok(c)) => Ok(Some(c)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

fn matches(rec: &ResultRecord, filters: &ResultFilters) -> bool {
    filters.engine.as_ref().map_or(true, |e| &rec.engine == e)
        && filters
            .channel
            .as_ref()
            .map_or(true, |c| rec.channel.as_ref() == Some(c))
        && filters
            .risk_level
            .as_ref()
            .map_or(true, |r| rec.risk_level.as_ref() == Some(r))
}

#[async_trait]
impl RunApi for FakeRunApi {
    async fn open_run_stream(
        &self,
        _req: &StartRunRequest,
    ) -> Result<Box<dyn ChunkStream>, RunError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(RunError::Connection("no scripted stream".into())))?;
        Ok(Box::new(ScriptedStream {
            chunks: script.into(),
        }))
    }

    async fn run_status(&self, run_id: &str) -> Result<RunStatusResponse, RunError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().unwrap();
        let queue = statuses
            .get_mut(run_id)
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))?;
        if queue.len() > 1 {
            queue
                .pop_front()
                .unwrap_or_else(|| Err(RunError::NotFound(run_id.to_string())))
        } else {
            queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(RunError::NotFound(run_id.to_string())))
        }
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, RunError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.runs
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == run_id)
            .cloned()
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))
    }

    async fn list_runs(&self, project_id: Option<&str>) -> Result<Vec<Run>, RunError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .filter(|r| project_id.map_or(true, |p| r.project_id == p))
            .cloned()
            .collect())
    }

    async fn fetch_results(
        &self,
        run_id: &str,
        page: u32,
        per_page: u32,
        filters: &ResultFilters,
    ) -> Result<ResultsPage, RunError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let all = self.results.lock().unwrap();
        let rows: Vec<&ResultRecord> = all
            .get(run_id)
            .map(|v| v.iter().filter(|r| matches(r, filters)).collect())
            .unwrap_or_default();
        let start = (page.saturating_sub(1) as usize) * per_page as usize;
        let results = rows
            .iter()
            .skip(start)
            .take(per_page as usize)
            .map(|r| (*r).clone())
            .collect();
        Ok(ResultsPage {
            results,
            total: rows.len() as u64,
        })
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<Run, RunError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if let Some(err) = self.fail_updates.lock().unwrap().clone() {
            return Err(err);
        }
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))?;
        run.status = status;
        Ok(run.clone())
    }
}
