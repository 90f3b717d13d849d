mod common;

use common::*;
use std::sync::{Arc, Mutex};
use vantage_core::api::fake::FakeRunApi;
use vantage_core::errors::RunError;
use vantage_core::model::RunStatus;
use vantage_core::orchestrator::Orchestrator;
use vantage_core::session::{RunBook, SessionStore};

fn outage() -> RunError {
    RunError::HttpStatus {
        status: 502,
        body: "bad gateway".into(),
    }
}

#[tokio::test]
async fn test_rollback_restores_status_and_active_pointer() {
    let r3 = run("r3", RunStatus::Pending, 0, 24);
    let api = Arc::new(FakeRunApi::new().with_runs(vec![r3.clone()]));
    api.fail_updates(Some(outage()));

    let book = RunBook::new();
    book.replace_runs(vec![r3.clone(), run("r1", RunStatus::Completed, 24, 24)]);
    book.set_active(Some(r3.clone()));
    let orch = Orchestrator::new(&config(), api.clone(), book);

    let err = orch.set_run_status("r3", RunStatus::Ready).await.unwrap_err();
    assert_eq!(err, outage());

    let state = orch.runs();
    assert_eq!(state.get("r3").unwrap(), &r3);
    assert_eq!(state.active.as_ref(), Some(&r3));
    assert_eq!(state.runs.len(), 2);
    assert_eq!(FakeRunApi::count(&api.update_calls), 1);
}

#[tokio::test]
async fn test_optimistic_value_visible_while_request_in_flight() {
    let r3 = run("r3", RunStatus::Pending, 0, 24);
    let api = Arc::new(FakeRunApi::new().with_runs(vec![r3.clone()]));
    api.fail_updates(Some(outage()));
    let book = RunBook::new();
    book.replace_runs(vec![r3]);

    let observer = book.clone();
    let seen = Mutex::new(None);
    let (res, _) = tokio::join!(
        vantage_core::mutate::set_run_status(&book, api.as_ref(), "r3", RunStatus::Ready),
        async {
            *seen.lock().unwrap() = observer.get("r3").map(|r| r.status);
        }
    );
    assert!(res.is_err());
    assert_eq!(*seen.lock().unwrap(), Some(RunStatus::Ready));
    assert_eq!(book.get("r3").unwrap().status, RunStatus::Pending);
}

#[tokio::test]
async fn test_unrelated_update_survives_rollback() {
    let r3 = run("r3", RunStatus::Pending, 0, 24);
    let api = Arc::new(FakeRunApi::new().with_runs(vec![r3.clone()]));
    api.fail_updates(Some(outage()));
    let book = RunBook::new();
    book.replace_runs(vec![r3.clone()]);

    // r4 lands while r3's request is outstanding.
    let other = book.clone();
    let (res, _) = tokio::join!(
        vantage_core::mutate::set_run_status(&book, api.as_ref(), "r3", RunStatus::Ready),
        async {
            other.upsert(run("r4", RunStatus::Running, 2, 24));
        }
    );
    assert!(res.is_err());

    let state = book.snapshot();
    assert_eq!(state.get("r3").unwrap(), &r3);
    assert_eq!(state.get("r4").unwrap().status, RunStatus::Running);
    assert_eq!(
        state.runs.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
        vec!["r4", "r3"]
    );
}

#[tokio::test]
async fn test_confirmed_status_is_persisted() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("session.db");
    let r3 = run("r3", RunStatus::Pending, 0, 24);
    let api = Arc::new(FakeRunApi::new().with_runs(vec![r3.clone()]));

    {
        let book = RunBook::with_store(SessionStore::open(&path)?)?;
        book.replace_runs(vec![r3.clone()]);
        book.set_active(Some(r3));
        let orch = Orchestrator::new(&config(), api.clone(), book);
        let confirmed = orch.set_run_status("r3", RunStatus::Ready).await?;
        assert_eq!(confirmed.status, RunStatus::Ready);
    }

    let reopened = RunBook::with_store(SessionStore::open(&path)?)?;
    let state = reopened.snapshot();
    assert_eq!(state.get("r3").unwrap().status, RunStatus::Ready);
    assert_eq!(state.active.as_ref().unwrap().status, RunStatus::Ready);
    Ok(())
}

#[tokio::test]
async fn test_rollback_emits_structured_log() {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let buffer_clone = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_writer(move || MockWriter(buffer_clone.clone()))
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let api = Arc::new(FakeRunApi::new().with_runs(vec![run("r3", RunStatus::Pending, 0, 24)]));
    api.fail_updates(Some(outage()));
    let book = RunBook::new();
    book.replace_runs(vec![run("r3", RunStatus::Pending, 0, 24)]);
    let orch = Orchestrator::new(&config(), api.clone(), book);
    let _ = orch.set_run_status("r3", RunStatus::Ready).await;

    let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    assert!(output.contains("\"event\":\"vantage.run.status_rolled_back\""));
    assert!(output.contains("\"run_id\":\"r3\""));
    assert!(output.contains("\"attempted\":\"ready\""));
    assert!(output.contains("\"restored\":\"pending\""));
    assert!(output.contains("502"));
}

struct MockWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
