//! Registry enforcing a single driver (stream or poller) per run.
//!
//! A [DriverSlot] must be held for the whole time a run is being driven. The
//! slot is released when it is dropped, so a driver that ends by any path
//! (terminal transition, error, cancellation, panic) frees its run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Stream,
    Poll,
}

#[derive(Clone, Default)]
pub struct DriverRegistry {
    active: Arc<Mutex<HashMap<String, DriverKind>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when another driver already owns `run_id`.
    pub fn try_acquire(&self, run_id: &str, kind: DriverKind) -> Option<DriverSlot> {
        let mut active = self.active.lock().unwrap();
        if let Some(existing) = active.get(run_id) {
            tracing::debug!(
                event = "vantage.driver.busy",
                run_id = %run_id,
                held_by = ?existing,
                requested = ?kind,
            );
            return None;
        }
        active.insert(run_id.to_string(), kind);
        Some(DriverSlot {
            run_id: run_id.to_string(),
            registry: self.clone(),
        })
    }

    pub fn is_driven(&self, run_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(run_id)
    }

    pub fn kind_of(&self, run_id: &str) -> Option<DriverKind> {
        self.active.lock().unwrap().get(run_id).copied()
    }

    pub fn active(&self) -> Vec<(String, DriverKind)> {
        let mut v: Vec<_> = self
            .active
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v
    }

    fn release(&self, run_id: &str) {
        self.active.lock().unwrap().remove(run_id);
    }

    fn set_kind(&self, run_id: &str, kind: DriverKind) {
        if let Some(k) = self.active.lock().unwrap().get_mut(run_id) {
            *k = kind;
        }
    }
}

/// Proof of ownership of one run. Dropping it releases the run.
pub struct DriverSlot {
    run_id: String,
    registry: DriverRegistry,
}

impl DriverSlot {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Switches the driver kind without releasing the run in between.
    pub fn handover(&self, kind: DriverKind) {
        self.registry.set_kind(&self.run_id, kind);
    }
}

impl Drop for DriverSlot {
    fn drop(&mut self) {
        self.registry.release(&self.run_id);
    }
}

impl std::fmt::Debug for DriverSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSlot")
            .field("run_id", &self.run_id)
            .finish()
    }
}
