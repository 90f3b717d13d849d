use thiserror::Error;

/// Failure taxonomy for the orchestration core.
///
/// Malformed `data:` payloads never reach this type: the frame decoder drops
/// them because they cannot be told apart from a chunk split mid-line.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    /// The stream, poll or fetch request could not be opened or read.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server answered with a non-success status before any data was read.
    #[error("http {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// The server reported the run as failed (`error` frame or `failed` status).
    /// Carries the server-provided text verbatim.
    #[error("{0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Another driver in this session already owns the run.
    #[error("run {0} is already being followed")]
    AlreadyDriven(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RunError {
    /// Protocol failures end the run. Everything else describes the channel,
    /// not the run, and may be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunError::Protocol(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, RunError::Connection(_) | RunError::HttpStatus { .. })
    }
}

impl From<reqwest::Error> for RunError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return RunError::HttpStatus {
                status: status.as_u16(),
                body: e.to_string(),
            };
        }
        RunError::Connection(e.to_string())
    }
}

impl From<rusqlite::Error> for RunError {
    fn from(e: rusqlite::Error) -> Self {
        RunError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_is_terminal() {
        assert!(RunError::Protocol("quota exceeded".into()).is_terminal());
        assert!(!RunError::Connection("reset".into()).is_terminal());
        assert!(RunError::HttpStatus {
            status: 502,
            body: "bad gateway".into()
        }
        .is_connection());
    }

    #[test]
    fn test_protocol_display_is_server_text() {
        let e = RunError::Protocol("engine quota exceeded".into());
        assert_eq!(e.to_string(), "engine quota exceeded");
    }
}
