#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use vantage_core::config::ClientConfig;
use vantage_core::model::{ResultRecord, Run, RunStatus, RunStatusResponse, StartRunRequest};

pub const ENGINES: [&str; 4] = ["chatgpt", "gemini", "perplexity", "claude"];

pub fn config() -> ClientConfig {
    ClientConfig::default()
}

pub fn ts(min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 9, min, 0).unwrap()
}

pub fn run(id: &str, status: RunStatus, completed: u64, total: u64) -> Run {
    Run {
        id: id.into(),
        project_id: "acme".into(),
        question_set_id: "qs-crm".into(),
        name: Some(format!("sweep {}", id)),
        providers: ENGINES.iter().map(|s| s.to_string()).collect(),
        status,
        total,
        completed,
        failed: 0,
        started_at: Some(ts(0)),
        completed_at: if status.is_terminal() { Some(ts(30)) } else { None },
    }
}

pub fn status(run_id: &str, status: RunStatus, completed_calls: u64, total_calls: u64) -> RunStatusResponse {
    RunStatusResponse {
        run_id: run_id.into(),
        status,
        current_stage: None,
        total_questions: total_calls / 4,
        completed_questions: completed_calls / 4,
        total_calls,
        completed_calls,
        failed_calls: 0,
        error: None,
        started_at: Some(ts(0)),
        completed_at: None,
    }
}

pub fn records(run_id: &str, n: usize) -> Vec<ResultRecord> {
    (0..n)
        .map(|i| ResultRecord {
            id: format!("{}-res-{:03}", run_id, i),
            run_id: run_id.into(),
            question_id: format!("q{}", i / 4),
            engine: ENGINES[i % 4].into(),
            channel: Some(if i % 2 == 0 { "web" } else { "api" }.into()),
            risk_level: Some(if i % 5 == 0 { "high" } else { "low" }.into()),
            answer: Some(format!("answer {}", i)),
            analysis: None,
            extra: Default::default(),
        })
        .collect()
}

pub fn request() -> StartRunRequest {
    StartRunRequest {
        project_id: "acme".into(),
        question_set_id: "qs-crm".into(),
        providers: ENGINES.iter().map(|s| s.to_string()).collect(),
        name: Some("weekly sweep".into()),
    }
}

/// Encodes one frame the way the server writes it.
pub fn frame(event: &str, data: serde_json::Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}
