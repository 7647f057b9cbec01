//! The Registry: process-wide owner of active machines.
//!
//! Orchestrates lookup (memory → persistence → auto-create-on-trigger),
//! capacity and rate shaping, eviction, and rehydration with timeout
//! catch-up. A [`Machine`] never holds a reference back to its `Registry`;
//! instead each machine is handed a pair of boxed callbacks, closed over a
//! [`Weak<Registry<..>>`] so the active-machine map and the machines it
//! stores never form an ownership cycle.

use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::action::{Event, TaggedEvent, TimeoutEvent};
use crate::config::RegistryConfig;
use crate::debug::{CompleteStatus, CurrentState, EventMetadata, MachineSummary};
use crate::error::EngineResult;
use crate::fsm::{FireOutcome, IdCallback, Machine, MachineTemplate, TimeoutDueCallback};
use crate::ids::{EventTag, MachineId, StateName};
use crate::observer::ObserverBus;
use crate::persistence::{PersistencePort, PersistentContext};
use crate::ratelimit::TokenBucket;
use crate::timeout::TimeoutScheduler;

/// Result of `send_event`. Never an error for expected failure
/// modes (capacity, throttling, and an unknown id are all outcomes, not
/// exceptions); `send_event` always returns an `Outcome`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The event was dispatched and processed (transition, stay, or a
    /// harmless no-op ignore of a stale timeout).
    Accepted,
    /// Rejected by the system-wide token bucket.
    ThrottledSystem,
    /// Rejected by this machine's own token bucket.
    ThrottledPerMachine,
    /// Dispatched, but the machine didn't act on it; see [`IgnoredReason`].
    Ignored(IgnoredReason),
    /// No active machine or persisted record for this id, and the active
    /// set is already at `max_concurrent_machines`.
    CapacityFull,
    /// A persisted record exists for this id but is already `complete`; the
    /// registry will not rehydrate it.
    NotFoundFinal,
    /// No active machine, no persisted record, and the event's tag is not a
    /// registered creation trigger. Reserved for direct [`Registry::create_or_get`]
    /// callers that bypass trigger auto-creation; `send_event` resolves this
    /// same condition to [`Outcome::Ignored`]`(`[`IgnoredReason::NoSuchMachine`]`)`
    /// instead.
    NotFound,
}

/// Why an event was ignored rather than causing a transition. The first
/// three are assigned by the registry;
/// `NoTransitionAndNoStay` is assigned by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredReason {
    /// No active machine, no persisted record, and the tag is not a
    /// registered creation trigger.
    NoSuchMachine,
    /// The active machine has already reached a final state.
    InFinalState,
    /// The persisted record for this id is already `complete`.
    MachineComplete,
    /// The current state declares neither a transition nor a stay action
    /// for this tag.
    NoTransitionAndNoStay,
}

/// A registered auto-creation trigger: the factories used to build a brand
/// new machine's contexts when `send_event` targets an absent id whose event
/// tag matches a registered trigger.
#[derive(Clone)]
struct TriggerFactory<PCU, V> {
    pc_factory: Arc<dyn Fn(&MachineId) -> PCU + Send + Sync>,
    vc_factory: Arc<dyn Fn() -> V + Send + Sync>,
}

/// Outcome of [`Registry::create_or_get`], widened with the practical
/// cases a caller needs to distinguish: whether the returned handle was
/// already active, freshly created, or rehydrated from persistence.
pub enum CreateOrGetResult<U, PCU, V> {
    /// The id was already active.
    Existing(Arc<Mutex<Machine<U, PCU, V>>>),
    /// No active machine or persisted record existed; a fresh one was built
    /// and started.
    Created(Arc<Mutex<Machine<U, PCU, V>>>),
    /// A persisted, non-complete record was found and restored.
    Rehydrated(Arc<Mutex<Machine<U, PCU, V>>>),
    /// A persisted record exists for this id but is already `complete`.
    Complete,
    /// The active set is already at `max_concurrent_machines`.
    CapacityFull,
}

/// Process-wide owner of a fleet of machines sharing one [`MachineTemplate`].
pub struct Registry<U, PCU, V> {
    template: Arc<MachineTemplate<U, PCU, V>>,
    persistence: Arc<dyn PersistencePort<PCU>>,
    observers: Arc<ObserverBus<PCU, V>>,
    scheduler: Arc<TimeoutScheduler>,
    config: RegistryConfig,
    default_vc_factory: Arc<dyn Fn() -> V + Send + Sync>,
    active: DashMap<MachineId, Arc<Mutex<Machine<U, PCU, V>>>>,
    machine_buckets: DashMap<MachineId, Arc<TokenBucket>>,
    system_bucket: TokenBucket,
    triggers: DashMap<EventTag, TriggerFactory<PCU, V>>,
    self_weak: Weak<Registry<U, PCU, V>>,
}

impl<U, PCU, V> Registry<U, PCU, V>
where
    U: TaggedEvent + Send + Sync + 'static,
    PCU: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Build a registry for one machine template, sharing one persistence
    /// port, observer bus, and timeout scheduler across every machine it
    /// owns. `default_vc_factory` builds the volatile context used when
    /// rehydrating a machine whose original volatile context is gone.
    pub fn new(
        template: Arc<MachineTemplate<U, PCU, V>>,
        persistence: Arc<dyn PersistencePort<PCU>>,
        observers: Arc<ObserverBus<PCU, V>>,
        scheduler: Arc<TimeoutScheduler>,
        config: RegistryConfig,
        default_vc_factory: Arc<dyn Fn() -> V + Send + Sync>,
    ) -> Arc<Self> {
        let system_bucket = TokenBucket::new(
            config.target_tps as f64,
            config.target_tps as f64 * config.system_burst_multiplier,
        );
        Arc::new_cyclic(|weak| Self {
            template,
            persistence,
            observers,
            scheduler,
            config,
            default_vc_factory,
            active: DashMap::new(),
            machine_buckets: DashMap::new(),
            system_bucket,
            triggers: DashMap::new(),
            self_weak: weak.clone(),
        })
    }

    /// Register `tag` as a creation trigger. Re-registering the same tag
    /// replaces its factories.
    pub fn add_trigger(
        &self,
        tag: impl Into<EventTag>,
        pc_factory: Arc<dyn Fn(&MachineId) -> PCU + Send + Sync>,
        vc_factory: Arc<dyn Fn() -> V + Send + Sync>,
    ) {
        self.triggers.insert(tag.into(), TriggerFactory { pc_factory, vc_factory });
    }

    /// Number of machines currently active (in memory, not counting
    /// persisted-but-inactive records).
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn has_capacity(&self) -> bool {
        self.active.len() < self.config.max_concurrent_machines
    }

    fn build_machine(&self, id: MachineId, pc: PersistentContext<PCU>, vc: V) -> Machine<U, PCU, V> {
        let on_timeout_due: TimeoutDueCallback = {
            let weak = self.self_weak.clone();
            Arc::new(move |id, source, target| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(registry) = weak.upgrade() {
                        registry.route_timeout(id, source, target).await;
                    }
                })
            })
        };
        let on_evict: IdCallback = {
            let weak = self.self_weak.clone();
            Arc::new(move |id| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(registry) = weak.upgrade() {
                        registry.evict_after_transition(id).await;
                    }
                })
            })
        };
        Machine::new(
            id,
            self.template.clone(),
            pc,
            vc,
            self.persistence.clone(),
            self.observers.clone(),
            self.scheduler.clone(),
            on_timeout_due,
            on_evict.clone(),
            on_evict,
        )
    }

    /// Explicitly construct and start a fresh machine for `id` from `pc_user`/`vc`,
    /// wiring the same transition/offline callbacks `createOrGet` and
    /// `sendEvent`'s auto-create path use, then add it to the active set and
    /// notify `onRegistryCreate`. Unlike auto-creation, a collision is not
    /// silently absorbed: fails with [`EngineError::AlreadyRegistered`] if
    /// `id` is already active, and with [`EngineError::CapacityFull`] if the
    /// active set is already at `maxConcurrentMachines`.
    pub async fn register(
        &self,
        id: MachineId,
        pc_user: PCU,
        vc: V,
    ) -> EngineResult<Arc<Mutex<Machine<U, PCU, V>>>> {
        if self.active.contains_key(&id) {
            return Err(crate::error::EngineError::AlreadyRegistered(id));
        }
        if !self.has_capacity() {
            return Err(crate::error::EngineError::CapacityFull);
        }

        let pc = PersistentContext::new(id.clone(), self.template.initial_state().clone(), pc_user);
        let mut machine = self.build_machine(id.clone(), pc, vc);
        machine.start().await?;
        let arc = Arc::new(Mutex::new(machine));
        self.active.insert(id.clone(), arc.clone());
        self.observers.notify_create(&id).await;
        Ok(arc)
    }

    /// Lookup path: memory → persistence (rehydrate if present and not
    /// complete) → create new via `factory`.
    pub async fn create_or_get<F>(&self, id: &MachineId, factory: F) -> EngineResult<CreateOrGetResult<U, PCU, V>>
    where
        F: FnOnce() -> (PCU, V),
    {
        if let Some(entry) = self.active.get(id) {
            return Ok(CreateOrGetResult::Existing(entry.value().clone()));
        }

        let loaded = match self.persistence.load(id).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(machine_id = %id, error = %e, "persistence load failed, treating as absent");
                None
            }
        };

        match loaded {
            Some(pc) if pc.complete => Ok(CreateOrGetResult::Complete),
            Some(pc) => {
                if !self.has_capacity() {
                    return Ok(CreateOrGetResult::CapacityFull);
                }
                let vc = (self.default_vc_factory)();
                let mut machine = self.build_machine(id.clone(), pc, vc);
                machine.restore_state().await?;
                // Timeout catch-up during restore_state may have already
                // carried the machine into a final state; it must never
                // land in the active set in that case.
                if machine.is_complete() {
                    return Ok(CreateOrGetResult::Complete);
                }
                let arc = Arc::new(Mutex::new(machine));
                self.active.insert(id.clone(), arc.clone());
                self.observers.notify_rehydrate(id).await;
                Ok(CreateOrGetResult::Rehydrated(arc))
            }
            None => {
                if !self.has_capacity() {
                    return Ok(CreateOrGetResult::CapacityFull);
                }
                let (pc_user, vc) = factory();
                let pc = PersistentContext::new(id.clone(), self.template.initial_state().clone(), pc_user);
                let mut machine = self.build_machine(id.clone(), pc, vc);
                machine.start().await?;
                let arc = Arc::new(Mutex::new(machine));
                self.active.insert(id.clone(), arc.clone());
                self.observers.notify_create(id).await;
                Ok(CreateOrGetResult::Created(arc))
            }
        }
    }

    /// Route an event for `id` into the machine it belongs to.
    pub async fn send_event(&self, id: MachineId, event: U) -> EngineResult<Outcome> {
        let tag = event.event_tag();

        if !self.system_bucket.try_acquire() {
            return Ok(Outcome::ThrottledSystem);
        }

        if let Some(entry) = self.active.get(&id) {
            let machine_arc = entry.value().clone();
            drop(entry);
            return self.fire_on_existing(machine_arc, &id, &tag, event).await;
        }

        let loaded = match self.persistence.load(&id).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(machine_id = %id, error = %e, "persistence load failed, treating as absent");
                None
            }
        };

        match loaded {
            Some(pc) if pc.complete => {
                self.observers
                    .notify_event_ignored(&id, Some(&pc.current_state), &tag, IgnoredReason::MachineComplete)
                    .await;
                Ok(Outcome::NotFoundFinal)
            }
            Some(pc) => {
                if !self.has_capacity() {
                    return Ok(Outcome::CapacityFull);
                }
                let vc = (self.default_vc_factory)();
                let mut machine = self.build_machine(id.clone(), pc, vc);
                machine.restore_state().await?;
                // Timeout catch-up during restore_state may have already
                // carried the machine into a final state; it must never
                // land in the active set in that case, and the triggering
                // event is moot since there's no machine left to deliver it to.
                if machine.is_complete() {
                    let state = machine.current_state().cloned();
                    self.observers
                        .notify_event_ignored(&id, state.as_ref(), &tag, IgnoredReason::MachineComplete)
                        .await;
                    return Ok(Outcome::NotFoundFinal);
                }
                let arc = Arc::new(Mutex::new(machine));
                self.active.insert(id.clone(), arc.clone());
                self.observers.notify_rehydrate(&id).await;
                self.fire_on_existing(arc, &id, &tag, event).await
            }
            None => {
                let trigger = self.triggers.get(&tag).map(|t| t.value().clone());
                let Some(trigger) = trigger else {
                    self.observers
                        .notify_event_ignored(&id, None, &tag, IgnoredReason::NoSuchMachine)
                        .await;
                    return Ok(Outcome::Ignored(IgnoredReason::NoSuchMachine));
                };

                if !self.has_capacity() {
                    return Ok(Outcome::CapacityFull);
                }

                // The machine is registered (entry action run, timeout
                // armed) before the triggering event itself is delivered.
                let pc_user = (trigger.pc_factory)(&id);
                let vc = (trigger.vc_factory)();
                let pc = PersistentContext::new(id.clone(), self.template.initial_state().clone(), pc_user);
                let mut machine = self.build_machine(id.clone(), pc, vc);
                machine.start().await?;
                let arc = Arc::new(Mutex::new(machine));
                self.active.insert(id.clone(), arc.clone());
                self.observers.notify_create(&id).await;
                self.fire_on_existing(arc, &id, &tag, event).await
            }
        }
    }

    async fn fire_on_existing(
        &self,
        machine_arc: Arc<Mutex<Machine<U, PCU, V>>>,
        id: &MachineId,
        tag: &EventTag,
        event: U,
    ) -> EngineResult<Outcome> {
        let mut machine = machine_arc.lock().await;

        if machine.is_complete() {
            let state = machine.current_state().cloned();
            drop(machine);
            self.observers
                .notify_event_ignored(id, state.as_ref(), tag, IgnoredReason::InFinalState)
                .await;
            return Ok(Outcome::Ignored(IgnoredReason::InFinalState));
        }

        let bucket = self
            .machine_buckets
            .entry(id.clone())
            .or_insert_with(|| {
                let rate = self.config.max_events_per_machine_per_second as f64;
                Arc::new(TokenBucket::new(rate, rate))
            })
            .clone();

        if !bucket.try_acquire() {
            return Ok(Outcome::ThrottledPerMachine);
        }

        match machine.fire(Event::User(event)).await? {
            FireOutcome::Transitioned(_) | FireOutcome::StayHandled => Ok(Outcome::Accepted),
            FireOutcome::Ignored => Ok(Outcome::Ignored(IgnoredReason::NoTransitionAndNoStay)),
            // `send_event` never fires a synthetic timeout, so the stale-timeout
            // arm is unreachable here; route_timeout is the only caller that
            // produces it.
            FireOutcome::IgnoredStaleTimeout => Ok(Outcome::Accepted),
        }
    }

    /// Entry point for a due timeout (bound to each machine at construction
    /// as `on_timeout_due`). Drops silently if the machine
    /// has since been evicted.
    async fn route_timeout(&self, id: MachineId, source: StateName, target: StateName) {
        let machine_arc = match self.active.get(&id) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        let mut machine = machine_arc.lock().await;
        if let Err(e) = machine.fire(Event::Timeout(TimeoutEvent { source, target })).await {
            tracing::error!(machine_id = %id, error = %e, "timeout fire failed");
        }
    }

    /// Bound to each machine as both `on_final` and `on_offline`: the
    /// transition procedure has already persisted the
    /// machine by the time this runs, so eviction here is just dropping the
    /// active-set entry and notifying observers, never re-locking the
    /// machine, since this callback can itself run from inside a `fire()`
    /// call that is still holding that machine's lock.
    async fn evict_after_transition(&self, id: MachineId) {
        self.active.remove(&id);
        self.machine_buckets.remove(&id);
        self.observers.notify_remove(&id).await;
    }

    /// Persist once more and remove, regardless of why the caller wants it
    /// gone.
    pub async fn remove_machine(&self, id: &MachineId) {
        if let Some((_, machine_arc)) = self.active.remove(id) {
            let machine = machine_arc.lock().await;
            if let Err(e) = self.persistence.save(&machine.pc).await {
                tracing::error!(machine_id = %id, error = %e, "persistence save failed during removal");
            }
        }
        self.machine_buckets.remove(id);
        self.observers.notify_remove(id).await;
    }

    /// LRU eviction of idle machines once the active set exceeds
    /// `machine_eviction_threshold`. Machines whose
    /// lock is currently held by an in-flight `fire()` are skipped for this
    /// sweep rather than waited on.
    pub async fn evict_idle_over_threshold(&self) {
        if self.active.len() <= self.config.machine_eviction_threshold {
            return;
        }

        let now = Instant::now();
        let mut candidates: Vec<(MachineId, Instant)> = self
            .active
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .try_lock()
                    .ok()
                    .map(|m| (entry.key().clone(), m.last_event_at()))
            })
            .filter(|(_, last)| now.duration_since(*last) > self.config.machine_idle_timeout)
            .collect();

        candidates.sort_by_key(|(_, last)| *last);

        let over = self.active.len().saturating_sub(self.config.machine_eviction_threshold);
        for (id, _) in candidates.into_iter().take(over) {
            self.remove_machine(&id).await;
        }
    }

    /// Shutdown: persist every active PC once, refuse new timeouts, and
    /// stop accepting events. Pending timeouts are cancelled as a side
    /// effect of dropping each machine's last `Arc` (`TimeoutHandle`'s
    /// `Drop` aborts its task). Bounded by `shutdown_timeout`; stragglers
    /// beyond that are abandoned.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        let ids: Vec<MachineId> = self.active.iter().map(|e| e.key().clone()).collect();

        let drain = async {
            for id in ids {
                if let Some((_, machine_arc)) = self.active.remove(&id) {
                    let machine = machine_arc.lock().await;
                    if let Err(e) = self.persistence.save(&machine.pc).await {
                        tracing::error!(machine_id = %id, error = %e, "persistence save failed during shutdown");
                    }
                }
            }
        };

        if tokio::time::timeout(self.config.shutdown_timeout, drain).await.is_err() {
            tracing::warn!("shutdown timed out; remaining in-flight saves are considered lost");
        }
        self.machine_buckets.clear();
    }

    /// Attach a listener to this registry's observer bus.
    pub fn add_listener(&self, listener: Arc<dyn crate::observer::Observer<PCU, V>>) {
        self.observers.add_listener(listener);
    }

    /// Detach a previously-attached listener.
    pub fn remove_listener(&self, listener: &Arc<dyn crate::observer::Observer<PCU, V>>) {
        self.observers.remove_listener(listener);
    }

    /// Periodic registry-wide summary snapshot.
    pub fn complete_status(&self) -> CompleteStatus {
        let machines = self
            .active
            .iter()
            .map(|entry| MachineSummary {
                id: entry.key().clone(),
                current_state: entry
                    .value()
                    .try_lock()
                    .ok()
                    .and_then(|m| m.current_state().cloned())
                    .unwrap_or_else(|| StateName::from("UNKNOWN")),
            })
            .collect();
        CompleteStatus {
            active_machine_count: self.active.len(),
            machines,
            max_concurrent_machines: self.config.max_concurrent_machines,
        }
    }

    /// On-demand snapshot for one machine.
    pub async fn current_state_snapshot(&self, id: &MachineId) -> Option<CurrentState> {
        let machine_arc = self.active.get(id)?.value().clone();
        let machine = machine_arc.lock().await;
        Some(CurrentState {
            id: id.clone(),
            current_state: machine.current_state()?.clone(),
            complete: machine.is_complete(),
        })
    }

    /// Event metadata catalog, derived from the
    /// builder-owned transition/stay tables.
    pub fn event_metadata_snapshot(&self) -> Vec<EventMetadata> {
        self.template
            .states()
            .filter_map(|s| self.template.event_metadata(s))
            .collect()
    }
}
