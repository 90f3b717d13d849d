use super::decoder::Frame;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCreated {
    pub run_id: String,
    #[serde(default)]
    pub question_set_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub providers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStarted {
    pub run_id: String,
    #[serde(default)]
    pub total_questions: u64,
    #[serde(default)]
    pub total_calls: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionStart {
    #[serde(default)]
    pub question_id: String,
    #[serde(default)]
    pub question_text: String,
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderComplete {
    #[serde(default)]
    pub question_id: String,
    pub provider: String,
    pub success: bool,
    #[serde(default)]
    pub time_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionComplete {
    #[serde(default)]
    pub question_id: String,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failed_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionComplete {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub success: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationStart {
    #[serde(default)]
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationProgress {
    pub stage: String,
    #[serde(default)]
    pub current: u64,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisComplete {
    #[serde(default)]
    pub analysis_id: Option<String>,
    #[serde(default)]
    pub summary_preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunComplete {
    pub run_id: String,
    #[serde(default)]
    pub analysis_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamError {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl StreamError {
    pub fn message(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "run failed".to_string())
    }
}

/// One named event of the run stream with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunCreated(RunCreated),
    RunStarted(RunStarted),
    QuestionStart(QuestionStart),
    ProviderComplete(ProviderComplete),
    QuestionComplete(QuestionComplete),
    ExecutionComplete(ExecutionComplete),
    EvaluationStart(EvaluationStart),
    EvaluationProgress(EvaluationProgress),
    AnalysisComplete(AnalysisComplete),
    RunComplete(RunComplete),
    Heartbeat(Heartbeat),
    Error(StreamError),
}

impl RunEvent {
    /// Returns `None` for unknown event names and for payloads missing required keys.
    pub fn decode(frame: &Frame) -> Option<RunEvent> {
        let ev = match frame.event.as_str() {
            "run_created" => RunEvent::RunCreated(payload(frame)?),
            "run_started" => RunEvent::RunStarted(payload(frame)?),
            "question_start" => RunEvent::QuestionStart(payload(frame)?),
            "provider_complete" => RunEvent::ProviderComplete(payload(frame)?),
            "question_complete" => RunEvent::QuestionComplete(payload(frame)?),
            "execution_complete" => RunEvent::ExecutionComplete(payload(frame)?),
            "evaluation_start" => RunEvent::EvaluationStart(payload(frame)?),
            "evaluation_progress" => RunEvent::EvaluationProgress(payload(frame)?),
            "analysis_complete" => RunEvent::AnalysisComplete(payload(frame)?),
            "run_complete" => RunEvent::RunComplete(payload(frame)?),
            "heartbeat" => RunEvent::Heartbeat(payload(frame)?),
            "error" => RunEvent::Error(payload(frame)?),
            _ => return None,
        };
        Some(ev)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunCreated(_) => "run_created",
            RunEvent::RunStarted(_) => "run_started",
            RunEvent::QuestionStart(_) => "question_start",
            RunEvent::ProviderComplete(_) => "provider_complete",
            RunEvent::QuestionComplete(_) => "question_complete",
            RunEvent::ExecutionComplete(_) => "execution_complete",
            RunEvent::EvaluationStart(_) => "evaluation_start",
            RunEvent::EvaluationProgress(_) => "evaluation_progress",
            RunEvent::AnalysisComplete(_) => "analysis_complete",
            RunEvent::RunComplete(_) => "run_complete",
            RunEvent::Heartbeat(_) => "heartbeat",
            RunEvent::Error(_) => "error",
        }
    }
}

fn payload<T: DeserializeOwned>(frame: &Frame) -> Option<T> {
    match serde_json::from_value(frame.data.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(
                event = "vantage.stream.payload_rejected",
                name = %frame.event,
                error = %e,
                "frame payload does not match event shape"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(event: &str, data: serde_json::Value) -> Frame {
        Frame {
            event: event.to_string(),
            data,
        }
    }

    #[test]
    fn test_decode_known_events() {
        let ev = RunEvent::decode(&frame(
            "provider_complete",
            json!({"question_id": "q1", "provider": "gemini", "success": false, "time_ms": 812, "error": "timeout"}),
        ));
        match ev {
            Some(RunEvent::ProviderComplete(p)) => {
                assert!(!p.success);
                assert_eq!(p.error.as_deref(), Some("timeout"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let ev = RunEvent::decode(&frame("heartbeat", json!({"message": "alive"}))).unwrap();
        assert_eq!(ev.name(), "heartbeat");
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        assert!(RunEvent::decode(&frame("stage_metrics", json!({"a": 1}))).is_none());
    }

    #[test]
    fn test_missing_required_key_is_ignored() {
        assert!(RunEvent::decode(&frame("run_complete", json!({"status": "completed"}))).is_none());
    }

    #[test]
    fn test_error_message_prefers_error_key() {
        let e = StreamError {
            error: Some("quota".into()),
            message: Some("other".into()),
        };
        assert_eq!(e.message(), "quota");
        let e = StreamError {
            error: None,
            message: Some("engine unreachable".into()),
        };
        assert_eq!(e.message(), "engine unreachable");
    }
}
