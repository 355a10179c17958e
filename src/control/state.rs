//! Session state

use std::sync::Arc;

use parking_lot::Mutex;

/// Per-session control state, mutated only by the control loop.
///
/// `last_applied` starts out empty so the first decoded reading applies
/// unconditionally.
#[derive(Debug, Default)]
pub struct ControlState {
    last_applied: Option<f64>,
}

impl ControlState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_applied(&self) -> Option<f64> {
        self.last_applied
    }

    pub fn mark_applied(&mut self, level: f64) {
        self.last_applied = Some(level);
    }
}

/// Control session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionPhase::Starting => "starting",
            SessionPhase::Running => "running",
            SessionPhase::Draining => "draining",
            SessionPhase::Stopped => "stopped",
            SessionPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Shared, observable session phase.
///
/// Written by the loop task, read by the host.
#[derive(Clone)]
pub struct PhaseCell(Arc<Mutex<SessionPhase>>);

impl PhaseCell {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(SessionPhase::Starting)))
    }

    pub fn get(&self) -> SessionPhase {
        *self.0.lock()
    }

    pub(crate) fn set(&self, phase: SessionPhase) {
        *self.0.lock() = phase;
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}
