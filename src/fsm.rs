//! The FSM Engine: per-machine states, the transition procedure, stay
//! actions, and rehydration with timeout catch-up.
//!
//! Per-state action hooks (one entry/exit closure per state) are paired with
//! builder-owned routing data: a `StateDef`'s `transitions` and
//! `stay_actions` maps. Routing is introspectable data, not opaque
//! trait-object logic, so the live debug channel's event-metadata catalog
//! can be derived from it directly instead of re-deriving it by probing
//! handlers.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::action::{ActionOutcome, EntryExitAction, Event, StayAction, TaggedEvent, TimeoutEvent};
use crate::error::{EngineError, EngineResult};
use crate::ids::{EventTag, MachineId, StateName};
use crate::observer::ObserverBus;
use crate::persistence::{PersistencePort, PersistentContext};
use crate::registry::IgnoredReason;
use crate::timeout::{TimeoutHandle, TimeoutScheduler};

/// A callback keyed only by machine id, boxed so a [`Machine`] can invoke it
/// without holding a reference back to whatever registered it. Callbacks
/// are registered explicitly rather than via an owning back-pointer.
pub type IdCallback = Arc<dyn Fn(MachineId) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Callback fired when an armed timeout comes due: `(machine, source state,
/// target state)`.
pub type TimeoutDueCallback =
    Arc<dyn Fn(MachineId, StateName, StateName) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Per-state definition. Built exclusively
/// through [`crate::builder::MachineTemplateBuilder`]. There is no public
/// constructor, so a `StateDef` is always builder-validated data.
pub struct StateDef<U, PCU, V> {
    pub(crate) on_entry: Option<EntryExitAction<PCU, V>>,
    pub(crate) on_exit: Option<EntryExitAction<PCU, V>>,
    pub(crate) timeout: Option<(Duration, StateName)>,
    pub(crate) transitions: HashMap<EventTag, StateName>,
    pub(crate) stay_actions: HashMap<EventTag, StayAction<U, PCU, V>>,
    pub(crate) is_final: bool,
    pub(crate) is_offline: bool,
}

/// An immutable machine definition: a named initial state plus the set of
/// state definitions.
pub struct MachineTemplate<U, PCU, V> {
    pub(crate) initial_state: StateName,
    pub(crate) states: HashMap<StateName, StateDef<U, PCU, V>>,
}

impl<U, PCU, V> MachineTemplate<U, PCU, V> {
    /// The state a freshly-created machine starts in.
    pub fn initial_state(&self) -> &StateName {
        &self.initial_state
    }

    /// All declared state names, in no particular order.
    pub fn states(&self) -> impl Iterator<Item = &StateName> {
        self.states.keys()
    }

    /// Whether `state` was declared with [`crate::builder::StateBuilder::final_state`].
    /// Returns `false` for a name not declared on this template at all.
    pub fn is_final(&self, state: &StateName) -> bool {
        self.states.get(state).map(|d| d.is_final).unwrap_or(false)
    }

    /// Declared event metadata for `state`, used by the live debug channel's
    /// event-metadata catalog, derived straight from the builder-owned
    /// tables, never from reflection.
    pub fn event_metadata(&self, state: &StateName) -> Option<crate::debug::EventMetadata> {
        let def = self.states.get(state)?;
        Some(crate::debug::EventMetadata {
            state: state.clone(),
            transitions: def.transitions.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            stay_events: def.stay_actions.keys().cloned().collect(),
        })
    }
}

/// Outcome of processing one event through [`Machine::fire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// The event matched a transition and the machine moved to a new state.
    Transitioned(StateName),
    /// The event matched a stay action; no state change occurred.
    StayHandled,
    /// Neither a transition nor a stay action matched this tag in the
    /// current state.
    Ignored,
    /// A synthetic timeout event arrived for a state the machine has
    /// already left (a stale timeout racing a transition). Silently
    /// dropped, no observer notification.
    IgnoredStaleTimeout,
}

/// A template plus its live, mutable per-machine state.
pub struct Machine<U, PCU, V> {
    pub(crate) id: MachineId,
    template: Arc<MachineTemplate<U, PCU, V>>,
    current_state: Option<StateName>,
    pub(crate) pc: PersistentContext<PCU>,
    pub(crate) vc: V,
    pending_timeout: Option<TimeoutHandle>,
    ignored_count: u64,
    last_event_at: Instant,

    persistence: Arc<dyn PersistencePort<PCU>>,
    observers: Arc<ObserverBus<PCU, V>>,
    scheduler: Arc<TimeoutScheduler>,

    on_timeout_due: TimeoutDueCallback,
    on_final: IdCallback,
    on_offline: IdCallback,
}

impl<U, PCU, V> Machine<U, PCU, V>
where
    U: TaggedEvent + Send + Sync + 'static,
    PCU: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Construct a runtime machine. Only the registry calls this; it owns
    /// the callbacks that wire timeout-firing and eviction back into
    /// itself, without the machine ever holding a reference to the
    /// registry.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: MachineId,
        template: Arc<MachineTemplate<U, PCU, V>>,
        pc: PersistentContext<PCU>,
        vc: V,
        persistence: Arc<dyn PersistencePort<PCU>>,
        observers: Arc<ObserverBus<PCU, V>>,
        scheduler: Arc<TimeoutScheduler>,
        on_timeout_due: TimeoutDueCallback,
        on_final: IdCallback,
        on_offline: IdCallback,
    ) -> Self {
        Self {
            id,
            template,
            current_state: None,
            pc,
            vc,
            pending_timeout: None,
            ignored_count: 0,
            last_event_at: Instant::now(),
            persistence,
            observers,
            scheduler,
            on_timeout_due,
            on_final,
            on_offline,
        }
    }

    /// This machine's id.
    pub fn id(&self) -> &MachineId {
        &self.id
    }

    /// The state the machine is currently in, `None` before `start`/`restore_state`.
    pub fn current_state(&self) -> Option<&StateName> {
        self.current_state.as_ref()
    }

    /// The template this machine was built from.
    pub fn template(&self) -> &MachineTemplate<U, PCU, V> {
        &self.template
    }

    /// Whether the machine has reached a final state.
    pub fn is_complete(&self) -> bool {
        self.pc.complete
    }

    /// The machine's durable record.
    pub fn persistent_context(&self) -> &PersistentContext<PCU> {
        &self.pc
    }

    /// The machine's in-memory, non-persisted context.
    pub fn volatile_context(&self) -> &V {
        &self.vc
    }

    /// Mutable access to the machine's in-memory, non-persisted context.
    pub fn volatile_context_mut(&mut self) -> &mut V {
        &mut self.vc
    }

    /// Count of events dispatched that matched neither a transition nor a
    /// stay action.
    pub fn ignored_count(&self) -> u64 {
        self.ignored_count
    }

    /// When this machine last processed an event.
    pub fn last_event_at(&self) -> Instant {
        self.last_event_at
    }

    /// Legal only from the uninitialized pseudo-state: enters the template's
    /// initial state.
    pub async fn start(&mut self) -> EngineResult<()> {
        if self.current_state.is_some() {
            return Err(EngineError::Custom("machine already started".to_string()));
        }
        let initial = self.template.initial_state.clone();
        self.transition_to(initial).await
    }

    /// Sets `current_state` from the persisted record without running its
    /// entry action, then performs timeout catch-up.
    pub async fn restore_state(&mut self) -> EngineResult<()> {
        let state_name = self.pc.current_state.clone();
        self.current_state = Some(state_name.clone());

        let timeout_info = {
            let def = self
                .template
                .states
                .get(&state_name)
                .ok_or_else(|| EngineError::StateNotRegistered(state_name.clone()))?;
            def.timeout.clone()
        };

        if let Some((duration, target)) = timeout_info {
            let elapsed = Utc::now()
                .signed_duration_since(self.pc.last_state_change)
                .to_std()
                .unwrap_or(Duration::ZERO);

            if elapsed > duration {
                // Timeout catch-up: the due timeout becomes the first
                // transition observed after rehydration.
                let synthetic = TimeoutEvent {
                    source: state_name.clone(),
                    target: target.clone(),
                };
                self.fire(Event::Timeout(synthetic)).await?;
            } else {
                let remaining = duration - elapsed;
                self.arm_timeout(state_name.clone(), target, remaining);
            }
        }

        Ok(())
    }

    /// Process one event.
    pub async fn fire(&mut self, event: Event<U>) -> EngineResult<FireOutcome> {
        let current = self
            .current_state
            .clone()
            .ok_or(EngineError::NotInitialized)?;
        self.last_event_at = Instant::now();

        if let Event::Timeout(te) = &event {
            if te.source != current {
                return Ok(FireOutcome::IgnoredStaleTimeout);
            }
            let target = te.target.clone();
            self.transition_to(target.clone()).await?;
            return Ok(FireOutcome::Transitioned(target));
        }

        let tag = event.tag();

        enum Decision<U, PCU, V> {
            Transition(StateName),
            Stay(StayAction<U, PCU, V>),
            None,
        }

        let decision = {
            let def = self
                .template
                .states
                .get(&current)
                .ok_or_else(|| EngineError::StateNotRegistered(current.clone()))?;
            // Transitions shadow stay rules for the same tag.
            if let Some(target) = def.transitions.get(&tag) {
                Decision::Transition(target.clone())
            } else if let Some(stay) = def.stay_actions.get(&tag) {
                Decision::Stay(stay.clone())
            } else {
                Decision::None
            }
        };

        match decision {
            Decision::Transition(target) => {
                self.transition_to(target.clone()).await?;
                Ok(FireOutcome::Transitioned(target))
            }
            Decision::Stay(stay) => {
                let user_event = match &event {
                    Event::User(u) => u,
                    Event::Timeout(_) => unreachable!("timeout events handled above"),
                };
                let outcome = stay(&mut self.pc, &mut self.vc, user_event);
                if let ActionOutcome::Failed(msg) = &outcome.outcome {
                    tracing::warn!(machine_id = %self.id, state = %current, "stay action failed: {msg}");
                }
                if outcome.request_save {
                    if let Err(e) = self.persistence.save(&self.pc).await {
                        tracing::error!(machine_id = %self.id, error = %e, "save failed after stay action");
                    }
                }
                Ok(FireOutcome::StayHandled)
            }
            Decision::None => {
                self.ignored_count += 1;
                self.observers
                    .notify_event_ignored(&self.id, Some(&current), &tag, IgnoredReason::NoTransitionAndNoStay)
                    .await;
                Ok(FireOutcome::Ignored)
            }
        }
    }

    fn arm_timeout(&mut self, source: StateName, target: StateName, duration: Duration) {
        let id = self.id.clone();
        let callback = self.on_timeout_due.clone();
        match self
            .scheduler
            .schedule_timeout(duration, async move { callback(id, source, target).await })
        {
            Ok(handle) => self.pending_timeout = Some(handle),
            Err(e) => tracing::warn!(machine_id = %self.id, error = %e, "failed to arm timeout"),
        }
    }

    /// The atomic transition procedure.
    async fn transition_to(&mut self, target: StateName) -> EngineResult<()> {
        // 1. Cancel the pending timeout for the state we're leaving.
        if let Some(handle) = self.pending_timeout.take() {
            handle.cancel();
        }

        let old_state = self.current_state.clone();

        // 2. Exit action of the old state, if any. Failures are logged, not
        // propagated.
        if let Some(old) = &old_state {
            if let Some(def) = self.template.states.get(old) {
                if let Some(exit) = &def.on_exit {
                    let outcome = exit(&mut self.pc, &mut self.vc);
                    if let ActionOutcome::Failed(msg) = &outcome {
                        tracing::warn!(machine_id = %self.id, state = %old, "exit action failed: {msg}");
                    }
                }
            }
        }

        // 3. Swap state, stamp lastStateChange.
        self.current_state = Some(target.clone());
        self.pc.current_state = target.clone();
        self.pc.last_state_change = Utc::now();

        let (on_entry, timeout, is_final, is_offline) = {
            let def = self
                .template
                .states
                .get(&target)
                .ok_or_else(|| EngineError::StateNotRegistered(target.clone()))?;
            (def.on_entry.clone(), def.timeout.clone(), def.is_final, def.is_offline)
        };

        // 4. Entry action of the new state.
        if let Some(entry) = &on_entry {
            let outcome = entry(&mut self.pc, &mut self.vc);
            if let ActionOutcome::Failed(msg) = &outcome {
                tracing::warn!(machine_id = %self.id, state = %target, "entry action failed: {msg}");
            }
        }

        // 5. Arm the new state's timeout, if declared.
        if let Some((duration, timeout_target)) = timeout {
            self.arm_timeout(target.clone(), timeout_target, duration);
        }

        // 6. Final states flip `complete` now so the persisted record
        // carries it. The actual eviction request is deferred until after
        // the save completes.
        if is_final {
            self.pc.complete = true;
        }

        // 8. Persist. A failure here is logged and observed; in-memory
        // state proceeds regardless.
        if let Err(e) = self.persistence.save(&self.pc).await {
            tracing::error!(machine_id = %self.id, error = %e, "persistence save failed after transition");
        }

        // 9. Notify observers.
        self.observers
            .notify_state_machine_event(&self.id, old_state.as_ref(), &target, &self.pc, &self.vc)
            .await;

        // 7 / Eviction: request eviction now that the transition and save
        // are both complete.
        if is_final {
            (self.on_final)(self.id.clone()).await;
        } else if is_offline {
            (self.on_offline)(self.id.clone()).await;
        }

        Ok(())
    }
}
