use super::{ChunkStream, RunApi};
use crate::config::ClientConfig;
use crate::errors::RunError;
use crate::model::{ResultFilters, ResultsPage, Run, RunStatus, RunStatusResponse, StartRunRequest};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

pub struct HttpRunApi {
    pub base_url: String,
    pub timeout: Duration,
    pub client: reqwest::Client,
}

impl HttpRunApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(cfg: &ClientConfig) -> Self {
        Self::new(cfg.base_url.clone(), cfg.request_timeout())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, RunError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(RunError::NotFound(body));
    }
    Err(RunError::HttpStatus {
        status: status.as_u16(),
        body,
    })
}

async fn json_body<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, RunError> {
    let resp = check(resp).await?;
    resp.json::<T>()
        .await
        .map_err(|e| RunError::Connection(format!("invalid response body: {}", e)))
}

struct HttpChunkStream {
    resp: reqwest::Response,
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RunError> {
        let chunk = self.resp.chunk().await?;
        Ok(chunk.map(|b| b.to_vec()))
    }
}

#[async_trait]
impl RunApi for HttpRunApi {
    async fn open_run_stream(
        &self,
        req: &StartRunRequest,
    ) -> Result<Box<dyn ChunkStream>, RunError> {
        // No request timeout here: a run stream stays open for as long as the run lasts.
        let resp = self
            .client
            .post(self.url("/simulation/runs/stream"))
            .header("Accept", "text/event-stream")
            .json(req)
            .send()
            .await?;
        let resp = check(resp).await?;
        Ok(Box::new(HttpChunkStream { resp }))
    }

    async fn run_status(&self, run_id: &str) -> Result<RunStatusResponse, RunError> {
        let resp = self
            .client
            .get(self.url(&format!("/simulation/runs/{}/status", run_id)))
            .timeout(self.timeout)
            .send()
            .await?;
        json_body(resp).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, RunError> {
        let resp = self
            .client
            .get(self.url(&format!("/simulation/runs/{}", run_id)))
            .timeout(self.timeout)
            .send()
            .await?;
        json_body(resp).await
    }

    async fn list_runs(&self, project_id: Option<&str>) -> Result<Vec<Run>, RunError> {
        let mut req = self
            .client
            .get(self.url("/simulation/runs"))
            .timeout(self.timeout);
        if let Some(p) = project_id {
            req = req.query(&[("project_id", p)]);
        }
        json_body(req.send().await?).await
    }

    async fn fetch_results(
        &self,
        run_id: &str,
        page: u32,
        per_page: u32,
        filters: &ResultFilters,
    ) -> Result<ResultsPage, RunError> {
        let mut query = vec![("page", page.to_string()), ("per_page", per_page.to_string())];
        query.extend(filters.query_pairs());
        let resp = self
            .client
            .get(self.url(&format!("/simulation/runs/{}/results", run_id)))
            .query(&query)
            .timeout(self.timeout)
            .send()
            .await?;
        json_body(resp).await
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<Run, RunError> {
        let resp = self
            .client
            .patch(self.url(&format!("/simulation/runs/{}", run_id)))
            .json(&json!({ "status": status }))
            .timeout(self.timeout)
            .send()
            .await?;
        json_body(resp).await
    }
}
