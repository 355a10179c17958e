//! Serial-to-volume control loop

pub mod debounce;
pub mod session;
pub mod state;

pub use debounce::DebounceFilter;
pub use session::{ControlConfig, ControlLoop, ControlSession};
pub use state::{ControlState, PhaseCell, SessionPhase};
