//! The builder DSL for machine templates.
//!
//! A fluent chain like `state(name).onEntry(fn)...on(tag, target)` that
//! returns to the parent builder mid-chain isn't expressible in Rust without
//! either handing back an enum of "am I a state builder or the parent" or
//! losing move semantics, so `state()` here takes a closure instead: the
//! sub-builder it configures never needs to know how to get back to its
//! parent, because it never leaves the closure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::action::{ActionOutcome, EntryExitAction, StayAction, StayOutcome};
use crate::error::{EngineError, EngineResult};
use crate::fsm::{MachineTemplate, StateDef};
use crate::ids::{EventTag, StateName};
use crate::persistence::PersistentContext;

/// Configures a single state. Obtained only as the argument to the closure
/// passed to [`MachineTemplateBuilder::state`].
pub struct StateBuilder<U, PCU, V> {
    name: StateName,
    on_entry: Option<EntryExitAction<PCU, V>>,
    on_exit: Option<EntryExitAction<PCU, V>>,
    timeout: Option<(Duration, StateName)>,
    transitions: HashMap<EventTag, StateName>,
    stay_actions: HashMap<EventTag, StayAction<U, PCU, V>>,
    is_final: bool,
    is_offline: bool,
}

impl<U, PCU, V> StateBuilder<U, PCU, V> {
    fn new(name: StateName) -> Self {
        Self {
            name,
            on_entry: None,
            on_exit: None,
            timeout: None,
            transitions: HashMap::new(),
            stay_actions: HashMap::new(),
            is_final: false,
            is_offline: false,
        }
    }

    /// Entry action, run once per transition into this
    /// state, after the state swap.
    pub fn on_entry<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut PersistentContext<PCU>, &mut V) -> ActionOutcome + Send + Sync + 'static,
    {
        self.on_entry = Some(Arc::new(f));
        self
    }

    /// Exit action, run once per transition out of this
    /// state, before the state swap.
    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut PersistentContext<PCU>, &mut V) -> ActionOutcome + Send + Sync + 'static,
    {
        self.on_exit = Some(Arc::new(f));
        self
    }

    /// Arm a timeout on entry to this state; if still here after `duration`
    /// with no intervening transition, the machine moves to `target`.
    pub fn timeout(mut self, duration: Duration, target: impl Into<StateName>) -> Self {
        self.timeout = Some((duration, target.into()));
        self
    }

    /// Declare a transition: when `tag` is fired in this state, move to
    /// `target`.
    pub fn on(mut self, tag: impl Into<EventTag>, target: impl Into<StateName>) -> Self {
        self.transitions.insert(tag.into(), target.into());
        self
    }

    /// Declare a stay action: when `tag` is fired in this state and no
    /// transition claims it, run `f` without changing state.
    pub fn stay<F>(mut self, tag: impl Into<EventTag>, f: F) -> Self
    where
        F: Fn(&mut PersistentContext<PCU>, &mut V, &U) -> StayOutcome + Send + Sync + 'static,
    {
        self.stay_actions.insert(tag.into(), Arc::new(f));
        self
    }

    /// Mark this state final: entering it sets
    /// `complete` and the machine is evicted after its save completes.
    pub fn final_state(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Mark this state an offline state: entering it
    /// persists and evicts the machine, but without setting `complete`.
    pub fn offline(mut self) -> Self {
        self.is_offline = true;
        self
    }

    fn build(self) -> StateDef<U, PCU, V> {
        StateDef {
            on_entry: self.on_entry,
            on_exit: self.on_exit,
            timeout: self.timeout,
            transitions: self.transitions,
            stay_actions: self.stay_actions,
            is_final: self.is_final,
            is_offline: self.is_offline,
        }
    }
}

/// Builds an immutable [`MachineTemplate`] from a set of named, individually
/// configured states.
pub struct MachineTemplateBuilder<U, PCU, V> {
    initial_state: Option<StateName>,
    states: HashMap<StateName, StateDef<U, PCU, V>>,
}

impl<U, PCU, V> MachineTemplateBuilder<U, PCU, V> {
    /// A builder with no initial state and no declared states.
    pub fn new() -> Self {
        Self {
            initial_state: None,
            states: HashMap::new(),
        }
    }

    /// The state a freshly-created machine starts in.
    pub fn initial_state(mut self, name: impl Into<StateName>) -> Self {
        self.initial_state = Some(name.into());
        self
    }

    /// Declare a state. `configure` receives a fresh [`StateBuilder`] and
    /// must return it; whatever it built is stored under `name`, replacing
    /// any earlier declaration of the same name.
    pub fn state<F>(mut self, name: impl Into<StateName>, configure: F) -> Self
    where
        F: FnOnce(StateBuilder<U, PCU, V>) -> StateBuilder<U, PCU, V>,
    {
        let name = name.into();
        let builder = configure(StateBuilder::new(name.clone()));
        self.states.insert(name, builder.build());
        self
    }

    /// Validate referential integrity and produce the immutable template.
    ///
    /// Checks: an initial state is set and declared; every transition and
    /// timeout target names a declared state (all state references must be
    /// closed over the template's own state set).
    pub fn build(self) -> EngineResult<MachineTemplate<U, PCU, V>> {
        let initial_state = self.initial_state.ok_or(EngineError::NoInitialState)?;
        if !self.states.contains_key(&initial_state) {
            return Err(EngineError::StateNotRegistered(initial_state));
        }

        for def in self.states.values() {
            for target in def.transitions.values() {
                if !self.states.contains_key(target) {
                    return Err(EngineError::StateNotRegistered(target.clone()));
                }
            }
            if let Some((_, target)) = &def.timeout {
                if !self.states.contains_key(target) {
                    return Err(EngineError::StateNotRegistered(target.clone()));
                }
            }
        }

        Ok(MachineTemplate {
            initial_state,
            states: self.states,
        })
    }
}

impl<U, PCU, V> Default for MachineTemplateBuilder<U, PCU, V> {
    fn default() -> Self {
        Self::new()
    }
}
