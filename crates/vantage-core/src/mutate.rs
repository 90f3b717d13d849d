use crate::api::RunApi;
use crate::errors::RunError;
use crate::model::{Run, RunStatus};
use crate::session::RunBook;

/// Sets a run's status locally first, then remotely.
///
/// On remote failure the touched record and the active pointer are put back
/// exactly as they were before the call. Records other than `run_id` are
/// left alone, so unrelated updates made in the meantime survive the rollback.
pub async fn set_run_status(
    book: &RunBook,
    api: &dyn RunApi,
    run_id: &str,
    status: RunStatus,
) -> Result<Run, RunError> {
    let before = book.snapshot();
    let prior_record = before
        .get(run_id)
        .cloned()
        .ok_or_else(|| RunError::NotFound(run_id.to_string()))?;
    let prior_active = before.active.clone();

    book.update(|s| {
        if let Some(r) = s.runs.iter_mut().find(|r| r.id == run_id) {
            r.status = status;
        }
        if let Some(a) = s.active.as_mut() {
            if a.id == run_id {
                a.status = status;
            }
        }
    });

    match api.update_run_status(run_id, status).await {
        Ok(confirmed) => {
            book.upsert(confirmed.clone());
            tracing::info!(
                event = "vantage.run.status_set",
                run_id = %run_id,
                status = %status,
            );
            Ok(confirmed)
        }
        Err(e) => {
            book.update(|s| {
                if let Some(r) = s.runs.iter_mut().find(|r| r.id == run_id) {
                    *r = prior_record.clone();
                }
                s.active = prior_active.clone();
            });
            tracing::warn!(
                event = "vantage.run.status_rolled_back",
                run_id = %run_id,
                attempted = %status,
                restored = %prior_record.status,
                error = %e,
            );
            Err(e)
        }
    }
}
