use crate::errors::RunError;
use crate::model::{ResultFilters, ResultsPage, Run, RunStatus, RunStatusResponse, StartRunRequest};
use async_trait::async_trait;

/// Raw body of an open run stream, read one chunk at a time.
#[async_trait]
pub trait ChunkStream: Send {
    /// `Ok(None)` once the server closed the body.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RunError>;
}

/// Remote operations the orchestration core depends on.
#[async_trait]
pub trait RunApi: Send + Sync {
    async fn open_run_stream(
        &self,
        req: &StartRunRequest,
    ) -> Result<Box<dyn ChunkStream>, RunError>;

    async fn run_status(&self, run_id: &str) -> Result<RunStatusResponse, RunError>;

    async fn get_run(&self, run_id: &str) -> Result<Run, RunError>;

    async fn list_runs(&self, project_id: Option<&str>) -> Result<Vec<Run>, RunError>;

    async fn fetch_results(
        &self,
        run_id: &str,
        page: u32,
        per_page: u32,
        filters: &ResultFilters,
    ) -> Result<ResultsPage, RunError>;

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<Run, RunError>;
}

pub mod fake;
pub mod http;
