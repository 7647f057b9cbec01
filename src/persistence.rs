//! The Persistence Port and the Persistent Context shape.
//!
//! The core dictates only the required columns; `PCU` is the caller's
//! opaque, round-tripping payload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::ids::MachineId;

/// The durable per-machine record. Required columns are `id`,
/// `current_state`, `last_state_change`, and `complete`; `user` carries
/// whatever additional fields the caller's machine definition needs. They
/// are opaque to the core and simply round-trip through the
/// [`PersistencePort`].
#[derive(Debug, Clone)]
pub struct PersistentContext<PCU> {
    /// The machine this record belongs to.
    pub id: MachineId,
    /// The state the machine was in as of `last_state_change`.
    pub current_state: crate::ids::StateName,
    /// When `current_state` was last set.
    pub last_state_change: DateTime<Utc>,
    /// Whether the machine has reached a final state.
    pub complete: bool,
    /// Caller-defined fields, opaque to the core.
    pub user: PCU,
}

impl<PCU> PersistentContext<PCU> {
    /// Build a fresh, non-complete context for a brand-new machine.
    pub fn new(id: MachineId, current_state: crate::ids::StateName, user: PCU) -> Self {
        Self {
            id,
            current_state,
            last_state_change: Utc::now(),
            complete: false,
            user,
        }
    }
}

/// An error from the persistence boundary. `retryable` lets callers decide
/// whether to back off and retry or give up.
#[derive(Debug, Error, Clone)]
#[error("persistence error for machine {id:?}: {message} (retryable={retryable})")]
pub struct PersistenceError {
    /// The machine the failing operation was for.
    pub id: MachineId,
    /// Human-readable detail.
    pub message: String,
    /// Whether the caller should back off and retry.
    pub retryable: bool,
}

impl PersistenceError {
    /// A transient failure worth retrying.
    pub fn retryable(id: MachineId, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure the caller should not retry.
    pub fn fatal(id: MachineId, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
            retryable: false,
        }
    }
}

/// Save/load of persistent context keyed by machine id.
///
/// `save` is "best effort in flight, durable eventually". Implementations
/// may queue asynchronously as long as per-id ordering is preserved for a
/// single id.
#[async_trait]
pub trait PersistencePort<PCU>: Send + Sync
where
    PCU: Send + Sync,
{
    /// One-time schema/setup hook, called once before the registry starts
    /// accepting events.
    async fn initialize(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// Upsert the persistent context for `pc.id`.
    async fn save(&self, pc: &PersistentContext<PCU>) -> Result<(), PersistenceError>;

    /// Load by id; `Ok(None)` if absent.
    async fn load(&self, id: &MachineId) -> Result<Option<PersistentContext<PCU>>, PersistenceError>;
}

/// A reference, in-memory [`PersistencePort`] implementation. Not a stand-in
/// for a production database driver; this exists so the crate, its tests,
/// and its examples are runnable without an external collaborator.
pub struct MemoryStore<PCU> {
    rows: DashMap<MachineId, PersistentContext<PCU>>,
}

impl<PCU> MemoryStore<PCU> {
    /// A store with no rows.
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }
}

impl<PCU> Default for MemoryStore<PCU> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<PCU> PersistencePort<PCU> for MemoryStore<PCU>
where
    PCU: Clone + Send + Sync,
{
    async fn save(&self, pc: &PersistentContext<PCU>) -> Result<(), PersistenceError> {
        self.rows.insert(pc.id.clone(), pc.clone());
        Ok(())
    }

    async fn load(&self, id: &MachineId) -> Result<Option<PersistentContext<PCU>>, PersistenceError> {
        Ok(self.rows.get(id).map(|r| r.value().clone()))
    }
}

/// Convenience alias for a shared, trait-object persistence port.
pub type SharedPersistence<PCU> = Arc<dyn PersistencePort<PCU>>;
