//! The Observer Bus: listener fan-out for lifecycle and transition events.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use crate::ids::{EventTag, MachineId, StateName};
use crate::persistence::PersistentContext;
use crate::registry::IgnoredReason;

/// Listener callbacks for registry and engine lifecycle events.
///
/// All methods have empty default bodies so a listener only needs to
/// implement the notifications it cares about.
#[async_trait]
pub trait Observer<PCU, V>: Send + Sync
where
    PCU: Send + Sync,
    V: Send + Sync,
{
    /// A brand-new machine was created and started.
    async fn on_registry_create(&self, _id: &MachineId) {}
    /// A machine was restored from persistence.
    async fn on_registry_rehydrate(&self, _id: &MachineId) {}
    /// A machine left the active set (eviction, final state, or offline
    /// state).
    async fn on_registry_remove(&self, _id: &MachineId) {}

    /// A machine transitioned (including its initial transition, where
    /// `old_state` is `None`).
    async fn on_state_machine_event(
        &self,
        _id: &MachineId,
        _old_state: Option<&StateName>,
        _new_state: &StateName,
        _pc: &PersistentContext<PCU>,
        _vc: &V,
    ) {
    }

    /// An event was dispatched but produced neither a transition nor a stay
    /// action.
    async fn on_event_ignored(
        &self,
        _id: &MachineId,
        _state: Option<&StateName>,
        _tag: &EventTag,
        _reason: IgnoredReason,
    ) {
    }
}

/// A copy-on-write list of listeners, fanned out to synchronously on the
/// caller's execution context. A listener that panics is caught
/// and logged rather than propagated; other listeners still run.
pub struct ObserverBus<PCU, V>
where
    PCU: Send + Sync,
    V: Send + Sync,
{
    listeners: RwLock<Vec<Arc<dyn Observer<PCU, V>>>>,
}

impl<PCU, V> ObserverBus<PCU, V>
where
    PCU: Send + Sync,
    V: Send + Sync,
{
    /// A bus with no listeners attached.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Attach a listener. Does not replace any existing listener.
    pub fn add_listener(&self, listener: Arc<dyn Observer<PCU, V>>) {
        let mut guard = self.listeners.write().expect("observer list poisoned");
        let mut next = guard.clone();
        next.push(listener);
        *guard = next;
    }

    /// Detach a previously-attached listener, matched by `Arc` identity.
    pub fn remove_listener(&self, listener: &Arc<dyn Observer<PCU, V>>) {
        let mut guard = self.listeners.write().expect("observer list poisoned");
        let next: Vec<_> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        *guard = next;
    }

    fn snapshot(&self) -> Vec<Arc<dyn Observer<PCU, V>>> {
        self.listeners.read().expect("observer list poisoned").clone()
    }

    /// Fan out [`Observer::on_registry_create`] to every listener.
    pub async fn notify_create(&self, id: &MachineId) {
        for l in self.snapshot() {
            self.guard(l.on_registry_create(id)).await;
        }
    }

    /// Fan out [`Observer::on_registry_rehydrate`] to every listener.
    pub async fn notify_rehydrate(&self, id: &MachineId) {
        for l in self.snapshot() {
            self.guard(l.on_registry_rehydrate(id)).await;
        }
    }

    /// Fan out [`Observer::on_registry_remove`] to every listener.
    pub async fn notify_remove(&self, id: &MachineId) {
        for l in self.snapshot() {
            self.guard(l.on_registry_remove(id)).await;
        }
    }

    /// Fan out [`Observer::on_state_machine_event`] to every listener.
    pub async fn notify_state_machine_event(
        &self,
        id: &MachineId,
        old_state: Option<&StateName>,
        new_state: &StateName,
        pc: &PersistentContext<PCU>,
        vc: &V,
    ) {
        for l in self.snapshot() {
            self.guard(l.on_state_machine_event(id, old_state, new_state, pc, vc))
                .await;
        }
    }

    /// Fan out [`Observer::on_event_ignored`] to every listener.
    pub async fn notify_event_ignored(
        &self,
        id: &MachineId,
        state: Option<&StateName>,
        tag: &EventTag,
        reason: IgnoredReason,
    ) {
        for l in self.snapshot() {
            self.guard(l.on_event_ignored(id, state, tag, reason.clone()))
                .await;
        }
    }

    async fn guard<F: std::future::Future<Output = ()>>(&self, fut: F) {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            tracing::error!(?panic, "observer listener panicked; other listeners still ran");
        }
    }
}

impl<PCU, V> Default for ObserverBus<PCU, V>
where
    PCU: Send + Sync,
    V: Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}
