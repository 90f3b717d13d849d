//! Versioned, paginated cache of run results.
//!
//! Entries are keyed by run id and tagged with a version token derived from the
//! lightweight run record. A `load` whose token matches the cached entry is
//! answered without fetching any results. Entries only grow (`load_more`) or
//! are replaced as a whole; they are never trimmed. The store is bounded by
//! entry count and evicts whole entries only.

use crate::api::RunApi;
use crate::errors::RunError;
use crate::model::{ResultFilters, ResultRecord, Run};
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub results: Vec<ResultRecord>,
    pub version: String,
    pub fetched_at: DateTime<Utc>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub filters: ResultFilters,
    /// The server returned an empty page before `total` was reached.
    pub exhausted: bool,
}

impl CacheEntry {
    pub fn has_more(&self) -> bool {
        !self.exhausted && (self.results.len() as u64) < self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub has_more: bool,
    pub is_loading_more: bool,
}

#[derive(Debug, Clone)]
pub struct LoadedRun {
    pub run: Run,
    pub entry: Arc<CacheEntry>,
    pub cache_hit: bool,
}

impl LoadedRun {
    pub fn results(&self) -> &[ResultRecord] {
        &self.entry.results
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMore {
    Loaded { added: usize, has_more: bool },
    NoMore,
    InFlight,
    /// The entry was replaced by a newer `load` while the page was in flight.
    Superseded,
}

/// Cache token for a run: its completion time once terminal, its completed
/// counter while still moving.
pub fn version_token(run: &Run) -> String {
    if run.status.is_terminal() {
        match &run.completed_at {
            Some(ts) => format!("done:{}", ts.to_rfc3339()),
            None => format!("done:{}:{}", run.status, run.completed),
        }
    } else {
        format!("progress:{}", run.completed)
    }
}

struct LiveView {
    run_id: String,
    entry: Arc<CacheEntry>,
}

pub struct ResultsCache {
    api: Arc<dyn RunApi>,
    page_size: u32,
    entries: Cache<String, Arc<CacheEntry>>,
    view: Mutex<Option<LiveView>>,
    loading: Arc<Mutex<HashSet<String>>>,
    fetches: AtomicUsize,
}

struct LoadingGuard {
    run_id: String,
    loading: Arc<Mutex<HashSet<String>>>,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.loading.lock().unwrap().remove(&self.run_id);
    }
}

impl ResultsCache {
    pub fn new(api: Arc<dyn RunApi>, page_size: u32, max_entries: u64) -> Self {
        Self {
            api,
            page_size: page_size.max(1),
            entries: Cache::new(max_entries.max(1)),
            view: Mutex::new(None),
            loading: Arc::new(Mutex::new(HashSet::new())),
            fetches: AtomicUsize::new(0),
        }
    }

    pub async fn load(&self, run_id: &str) -> Result<LoadedRun, RunError> {
        self.load_filtered(run_id, &ResultFilters::default()).await
    }

    pub async fn load_filtered(
        &self,
        run_id: &str,
        filters: &ResultFilters,
    ) -> Result<LoadedRun, RunError> {
        let run = self.api.get_run(run_id).await?;
        let version = version_token(&run);

        if let Some(entry) = self.entries.get(run_id) {
            if entry.version == version && entry.filters == *filters {
                tracing::debug!(
                    event = "vantage.cache.hit",
                    run_id = %run_id,
                    version = %version,
                    held = entry.results.len(),
                );
                self.show(run_id, entry.clone());
                return Ok(LoadedRun {
                    run,
                    entry,
                    cache_hit: true,
                });
            }
        }

        let page = self.fetch_page(run_id, 1, filters).await?;
        let entry = Arc::new(CacheEntry {
            exhausted: page.results.is_empty(),
            results: page.results,
            version: version.clone(),
            fetched_at: Utc::now(),
            total: page.total,
            page: 1,
            per_page: self.page_size,
            filters: filters.clone(),
        });
        self.entries.insert(run_id.to_string(), entry.clone());
        self.show(run_id, entry.clone());

        tracing::debug!(
            event = "vantage.cache.miss",
            run_id = %run_id,
            version = %version,
            total = entry.total,
        );
        Ok(LoadedRun {
            run,
            entry,
            cache_hit: false,
        })
    }

    /// Fetches the page after the last one held and appends it.
    pub async fn load_more(&self, run_id: &str) -> Result<LoadMore, RunError> {
        let base = self
            .entries
            .get(run_id)
            .ok_or_else(|| RunError::NotFound(format!("no cached results for run {}", run_id)))?;
        if !base.has_more() {
            return Ok(LoadMore::NoMore);
        }

        let _guard = {
            let mut loading = self.loading.lock().unwrap();
            if !loading.insert(run_id.to_string()) {
                return Ok(LoadMore::InFlight);
            }
            LoadingGuard {
                run_id: run_id.to_string(),
                loading: self.loading.clone(),
            }
        };

        let next_page = base.page + 1;
        let page = self.fetch_page(run_id, next_page, &base.filters).await?;

        let held: HashSet<&str> = base.results.iter().map(|r| r.id.as_str()).collect();
        let fresh: Vec<ResultRecord> = page
            .results
            .iter()
            .filter(|r| !held.contains(r.id.as_str()))
            .cloned()
            .collect();
        let added = fresh.len();

        let mut next = (*base).clone();
        next.results.extend(fresh);
        next.page = next_page;
        next.total = page.total;
        next.exhausted = page.results.is_empty();
        next.fetched_at = Utc::now();
        let next = Arc::new(next);

        // Only append onto the entry we read; a newer load wins.
        match self.entries.get(run_id) {
            Some(current) if Arc::ptr_eq(&current, &base) => {}
            _ => return Ok(LoadMore::Superseded),
        }
        self.entries.insert(run_id.to_string(), next.clone());
        self.show_if_current(run_id, next.clone());

        Ok(LoadMore::Loaded {
            added,
            has_more: next.has_more(),
        })
    }

    pub fn invalidate(&self, run_id: &str) {
        self.entries.invalidate(run_id);
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    /// Replaces the record with `result_id` wherever it is held. Returns how
    /// many places were updated.
    pub fn patch(&self, result_id: &str, record: ResultRecord) -> usize {
        let mut patched = 0;

        let touched: Vec<(Arc<String>, Arc<CacheEntry>)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.results.iter().any(|r| r.id == result_id))
            .collect();
        for (key, entry) in touched {
            let next = Arc::new(replace_record(&entry, result_id, &record));
            self.entries.insert((*key).clone(), next);
            patched += 1;
        }

        let mut view = self.view.lock().unwrap();
        if let Some(v) = view.as_mut() {
            if v.entry.results.iter().any(|r| r.id == result_id) {
                v.entry = Arc::new(replace_record(&v.entry, result_id, &record));
                patched += 1;
            }
        }
        patched
    }

    pub fn entry(&self, run_id: &str) -> Option<Arc<CacheEntry>> {
        self.entries.get(run_id)
    }

    /// Results of the run currently on screen.
    pub fn live_results(&self) -> Option<Arc<CacheEntry>> {
        self.view.lock().unwrap().as_ref().map(|v| v.entry.clone())
    }

    pub fn pagination(&self) -> Option<Pagination> {
        let view = self.view.lock().unwrap();
        let v = view.as_ref()?;
        Some(Pagination {
            page: v.entry.page,
            per_page: v.entry.per_page,
            total: v.entry.total,
            has_more: v.entry.has_more(),
            is_loading_more: self.loading.lock().unwrap().contains(&v.run_id),
        })
    }

    /// Number of result pages fetched from the network so far.
    pub fn network_fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn fetch_page(
        &self,
        run_id: &str,
        page: u32,
        filters: &ResultFilters,
    ) -> Result<crate::model::ResultsPage, RunError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.api
            .fetch_results(run_id, page, self.page_size, filters)
            .await
    }

    fn show(&self, run_id: &str, entry: Arc<CacheEntry>) {
        *self.view.lock().unwrap() = Some(LiveView {
            run_id: run_id.to_string(),
            entry,
        });
    }

    fn show_if_current(&self, run_id: &str, entry: Arc<CacheEntry>) {
        let mut view = self.view.lock().unwrap();
        if let Some(v) = view.as_mut() {
            if v.run_id == run_id {
                v.entry = entry;
            }
        }
    }
}

fn replace_record(entry: &CacheEntry, result_id: &str, record: &ResultRecord) -> CacheEntry {
    let mut next = entry.clone();
    for r in next.results.iter_mut().filter(|r| r.id == result_id) {
        *r = record.clone();
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunStatus;
    use chrono::TimeZone;

    fn run(status: RunStatus, completed: u64, completed_at: Option<DateTime<Utc>>) -> Run {
        Run {
            id: "r1".into(),
            project_id: "p1".into(),
            question_set_id: "qs".into(),
            name: None,
            providers: vec![],
            status,
            total: 24,
            completed,
            failed: 0,
            started_at: None,
            completed_at,
        }
    }

    #[test]
    fn test_version_token_running_vs_done() {
        assert_eq!(version_token(&run(RunStatus::Running, 10, None)), "progress:10");
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            version_token(&run(RunStatus::Completed, 24, Some(ts))),
            "done:2026-03-01T12:00:00+00:00"
        );
        assert_ne!(
            version_token(&run(RunStatus::Completed, 24, None)),
            version_token(&run(RunStatus::Running, 24, None))
        );
    }

    #[test]
    fn test_has_more_tracks_total() {
        let mut e = CacheEntry {
            results: vec![],
            version: "v".into(),
            fetched_at: Utc::now(),
            total: 0,
            page: 1,
            per_page: 50,
            filters: ResultFilters::default(),
            exhausted: false,
        };
        assert!(!e.has_more());
        e.total = 3;
        assert!(e.has_more());
        e.exhausted = true;
        assert!(!e.has_more());
    }
}
