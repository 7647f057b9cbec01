//! Crate-wide error taxonomy.

use crate::ids::{MachineId, StateName};
use crate::persistence::PersistenceError;
use thiserror::Error;

/// Result type alias used across the engine and registry.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors that can occur during registry or engine operations.
///
/// `sendEvent` never returns one of these for *expected* failure modes
/// (capacity, throttling, unknown machine); those are represented as an
/// [`crate::registry::Outcome`] instead. `EngineError` is reserved for the
/// smaller set of genuinely
/// exceptional conditions: persistence failures surfaced to a caller that is
/// synchronously waiting on them, scheduler shutdown races, malformed
/// templates, and user action failures converted at the boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    /// `register` was called with an id already present in the active set.
    #[error("machine {0:?} is already registered")]
    AlreadyRegistered(MachineId),

    /// `register` was called while the active set is already at
    /// `maxConcurrentMachines`. `sendEvent`'s own
    /// capacity rejection surfaces as [`crate::registry::Outcome::CapacityFull`]
    /// instead, since `sendEvent` never errors on expected failure modes;
    /// `register` is a direct call with no such guarantee.
    #[error("registry is at capacity (max_concurrent_machines reached)")]
    CapacityFull,

    /// A state referenced by a transition, timeout, or trigger was never
    /// declared on the template.
    #[error("state {0:?} is not registered on this template")]
    StateNotRegistered(StateName),

    /// `fire`/`restoreState` was called before `start`/`init`.
    #[error("state machine has not been initialized")]
    NotInitialized,

    /// The template has no initial state configured.
    #[error("machine template has no initial state")]
    NoInitialState,

    /// Wraps a [`PersistenceError`] bubbled up to a caller that needed the
    /// result synchronously (e.g. `initialize()` at startup).
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The timeout scheduler refused to arm a new timeout because it is
    /// shutting down.
    #[error("timeout scheduler is shutting down")]
    TimeoutSchedulerShutdown,

    /// An entry/exit/stay action reported failure via
    /// [`crate::action::ActionOutcome::Failed`].
    #[error("user action failed: {0}")]
    UserActionFailed(String),

    /// Catch-all for conditions that don't warrant a dedicated variant.
    #[error("{0}")]
    Custom(String),
}
