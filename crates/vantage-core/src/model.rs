use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Ready,
    Running,
    Evaluating,
    Completed,
    Failed,
}

impl RunStatus {
    /// A run left in one of these states by a previous session can be re-attached.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Evaluating)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Ready => "ready",
            RunStatus::Running => "running",
            RunStatus::Evaluating => "evaluating",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "ready" => Some(RunStatus::Ready),
            "running" => Some(RunStatus::Running),
            "evaluating" => Some(RunStatus::Evaluating),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One simulation execution as the backend reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub question_set_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub providers: Vec<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Created,
    Running,
    Evaluating,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub message: String,
    pub kind: LogKind,
}

/// Ephemeral progress of the one in-flight run. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRunProgress {
    pub run_id: Option<String>,
    pub question_set_id: String,
    pub status: ProgressStatus,
    pub total_questions: u64,
    pub total_calls: u64,
    pub current_question: u64,
    pub completed_calls: u64,
    pub failed_calls: u64,
    pub current_question_text: Option<String>,
    pub current_stage: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub log: Vec<LogEntry>,
}

impl ActiveRunProgress {
    pub fn new(question_set_id: impl Into<String>) -> Self {
        Self {
            run_id: None,
            question_set_id: question_set_id.into(),
            status: ProgressStatus::Created,
            total_questions: 0,
            total_calls: 0,
            current_question: 0,
            completed_calls: 0,
            failed_calls: 0,
            current_question_text: None,
            current_stage: None,
            last_heartbeat_at: None,
            error: None,
            log: Vec::new(),
        }
    }
}

/// One engine's answer to one question within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub question_id: String,
    #[serde(default, alias = "provider")]
    pub engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Status endpoint payload used by the poll driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusResponse {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub current_stage: Option<String>,
    #[serde(default)]
    pub total_questions: u64,
    #[serde(default)]
    pub completed_questions: u64,
    #[serde(default)]
    pub total_calls: u64,
    #[serde(default)]
    pub completed_calls: u64,
    #[serde(default)]
    pub failed_calls: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsPage {
    pub results: Vec<ResultRecord>,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
}

impl ResultFilters {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(v) = &self.engine {
            pairs.push(("engine", v.clone()));
        }
        if let Some(v) = &self.channel {
            pairs.push(("channel", v.clone()));
        }
        if let Some(v) = &self.risk_level {
            pairs.push(("risk_level", v.clone()));
        }
        pairs
    }
}

/// What the caller asks to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRunRequest {
    pub project_id: String,
    pub question_set_id: String,
    pub providers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
