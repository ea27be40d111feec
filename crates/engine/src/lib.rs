mod config;
mod delta;
mod error;
mod pass;
mod pricer;
mod reconcile;

pub use config::EngineConfig;
pub use delta::{CoarseDelta, GlobalDelta, PassComputation, PrevState, compute_pass};
pub use error::{EngineError, Result};
pub use pass::{PassStats, run_pass};
pub use pricer::Pricer;
pub use reconcile::{ReconcileOutcome, reconcile_all, reset_status};
