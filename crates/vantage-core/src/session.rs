//! Lightweight state that survives a restart: the run list and the single
//! "currently active" run pointer. Result sets are never written here; they
//! are rebuilt from the network by the results cache on the next session.

use crate::model::Run;
use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const DDL: &str = "
CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    position    INTEGER NOT NULL,
    run_json    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS active_run (
    slot        INTEGER PRIMARY KEY CHECK (slot = 1),
    run_json    TEXT NOT NULL
);
";

#[derive(Clone)]
pub struct SessionStore {
    pub conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path).context("failed to open session db")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory session db")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(DDL)?;
        Ok(())
    }

    pub fn save_runs(&self, runs: &[Run]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM runs", [])?;
        for (i, run) in runs.iter().enumerate() {
            tx.execute(
                "INSERT INTO runs(id, position, run_json) VALUES (?1, ?2, ?3)",
                params![run.id, i as i64, serde_json::to_string(run)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_runs(&self) -> anyhow::Result<Vec<Run>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT run_json FROM runs ORDER BY position")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut runs = Vec::new();
        for r in rows {
            let raw = r?;
            match serde_json::from_str::<Run>(&raw) {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!(
                    event = "vantage.session.skip_row",
                    error = %e,
                    "skipping unreadable persisted run"
                ),
            }
        }
        Ok(runs)
    }

    pub fn save_active(&self, active: Option<&Run>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        match active {
            Some(run) => {
                conn.execute(
                    "INSERT INTO active_run(slot, run_json) VALUES (1, ?1)
                     ON CONFLICT(slot) DO UPDATE SET run_json=excluded.run_json",
                    params![serde_json::to_string(run)?],
                )?;
            }
            None => {
                conn.execute("DELETE FROM active_run", [])?;
            }
        }
        Ok(())
    }

    pub fn load_active(&self) -> anyhow::Result<Option<Run>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row("SELECT run_json FROM active_run WHERE slot = 1", [], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunsState {
    pub runs: Vec<Run>,
    pub active: Option<Run>,
}

impl RunsState {
    pub fn get(&self, run_id: &str) -> Option<&Run> {
        self.runs.iter().find(|r| r.id == run_id)
    }
}

/// In-memory owner of the run list and active pointer, written through to a
/// [SessionStore] when one is attached. Every update swaps in a new `Arc`.
#[derive(Clone, Default)]
pub struct RunBook {
    state: Arc<Mutex<Arc<RunsState>>>,
    store: Option<SessionStore>,
}

impl RunBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads whatever the previous session persisted.
    pub fn with_store(store: SessionStore) -> anyhow::Result<Self> {
        let state = RunsState {
            runs: store.load_runs()?,
            active: store.load_active()?,
        };
        Ok(Self {
            state: Arc::new(Mutex::new(Arc::new(state))),
            store: Some(store),
        })
    }

    pub fn snapshot(&self) -> Arc<RunsState> {
        self.state.lock().unwrap().clone()
    }

    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.snapshot().get(run_id).cloned()
    }

    pub fn in_flight(&self) -> Vec<Run> {
        self.snapshot()
            .runs
            .iter()
            .filter(|r| r.status.is_in_flight())
            .cloned()
            .collect()
    }

    /// Applies `f` to a copy of the state and installs the copy atomically.
    pub fn update<F>(&self, f: F) -> Arc<RunsState>
    where
        F: FnOnce(&mut RunsState),
    {
        // The store is written under the state lock so writes land in install order.
        let mut guard = self.state.lock().unwrap();
        let mut next = (**guard).clone();
        f(&mut next);
        let next = Arc::new(next);
        *guard = next.clone();
        self.persist(&next);
        next
    }

    /// Replaces the run list with a fresh server listing, keeping the active
    /// pointer in step with its record.
    pub fn replace_runs(&self, runs: Vec<Run>) -> Arc<RunsState> {
        self.update(|s| {
            if let Some(active) = s.active.as_mut() {
                if let Some(fresh) = runs.iter().find(|r| r.id == active.id) {
                    *active = fresh.clone();
                }
            }
            s.runs = runs;
        })
    }

    pub fn upsert(&self, run: Run) -> Arc<RunsState> {
        self.update(|s| {
            if let Some(active) = s.active.as_mut() {
                if active.id == run.id {
                    *active = run.clone();
                }
            }
            match s.runs.iter_mut().find(|r| r.id == run.id) {
                Some(slot) => *slot = run,
                None => s.runs.insert(0, run),
            }
        })
    }

    pub fn set_active(&self, run: Option<Run>) -> Arc<RunsState> {
        self.update(|s| s.active = run)
    }

    /// Puts back a previously taken snapshot wholesale.
    pub fn restore(&self, state: Arc<RunsState>) {
        let mut guard = self.state.lock().unwrap();
        *guard = state.clone();
        self.persist(&state);
    }

    fn persist(&self, state: &RunsState) {
        let Some(store) = &self.store else {
            return;
        };
        let res = store
            .save_runs(&state.runs)
            .and_then(|_| store.save_active(state.active.as_ref()));
        if let Err(e) = res {
            tracing::warn!(
                event = "vantage.session.persist_failed",
                error = %e,
                "session state kept in memory only"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunStatus;

    fn run(id: &str, status: RunStatus) -> Run {
        Run {
            id: id.into(),
            project_id: "p1".into(),
            question_set_id: "qs-1".into(),
            name: None,
            providers: vec!["chatgpt".into()],
            status,
            total: 24,
            completed: 0,
            failed: 0,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_store_roundtrip_preserves_order_and_active() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/session.db");
        {
            let book = RunBook::with_store(SessionStore::open(&path)?)?;
            book.replace_runs(vec![run("r2", RunStatus::Running), run("r1", RunStatus::Completed)]);
            book.set_active(Some(run("r2", RunStatus::Running)));
        }

        let book = RunBook::with_store(SessionStore::open(&path)?)?;
        let s = book.snapshot();
        assert_eq!(
            s.runs.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["r2", "r1"]
        );
        assert_eq!(s.active.as_ref().map(|r| r.id.as_str()), Some("r2"));
        assert_eq!(book.in_flight().len(), 1);
        Ok(())
    }

    #[test]
    fn test_upsert_updates_active_copy() {
        let book = RunBook::new();
        book.replace_runs(vec![run("r1", RunStatus::Running)]);
        book.set_active(Some(run("r1", RunStatus::Running)));
        book.upsert(run("r1", RunStatus::Completed));
        let s = book.snapshot();
        assert_eq!(s.runs.len(), 1);
        assert_eq!(s.active.as_ref().unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn test_restore_reinstates_snapshot() -> anyhow::Result<()> {
        let book = RunBook::with_store(SessionStore::memory()?)?;
        book.replace_runs(vec![run("r1", RunStatus::Pending)]);
        let saved = book.snapshot();
        book.upsert(run("r2", RunStatus::Running));
        book.set_active(Some(run("r2", RunStatus::Running)));

        book.restore(saved.clone());
        assert_eq!(*book.snapshot(), *saved);
        let store = book.store.as_ref().unwrap();
        assert_eq!(store.load_runs()?.len(), 1);
        assert!(store.load_active()?.is_none());
        Ok(())
    }

    #[test]
    fn test_concurrent_updates_persist_last_installed_state() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("session.db");
        let book = RunBook::with_store(SessionStore::open(&path)?)?;

        std::thread::scope(|scope| {
            for t in 0..4 {
                let book = book.clone();
                scope.spawn(move || {
                    for i in 0..10 {
                        let r = run(&format!("r{}-{}", t, i), RunStatus::Running);
                        book.upsert(r.clone());
                        book.set_active(Some(r));
                    }
                });
            }
        });

        let mem = book.snapshot();
        let reopened = SessionStore::open(&path)?;
        assert_eq!(mem.runs.len(), 40);
        assert_eq!(reopened.load_runs()?, mem.runs);
        assert_eq!(reopened.load_active()?, mem.active);
        Ok(())
    }

    #[test]
    fn test_old_snapshot_unchanged_after_update() {
        let book = RunBook::new();
        book.replace_runs(vec![run("r1", RunStatus::Pending)]);
        let before = book.snapshot();
        book.upsert(run("r1", RunStatus::Ready));
        assert_eq!(before.runs[0].status, RunStatus::Pending);
        assert_eq!(book.get("r1").unwrap().status, RunStatus::Ready);
    }
}
