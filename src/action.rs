//! Action outcomes, the event wrapper, and the event-identity trait.
//!
//! Entry, exit, and stay actions report their result through an explicit
//! [`ActionOutcome`] rather than by throwing. There is nothing to convert at
//! the boundary because there is no boundary to cross.

use crate::ids::EventTag;
use std::fmt::Debug;
use std::sync::Arc;

use crate::persistence::PersistentContext;

/// Outcome of an entry, exit, or stay action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action did nothing observable (e.g. a state with no declared
    /// entry/exit action).
    None,
    /// The action ran to completion.
    Executed,
    /// The action ran but reported a failure. A failed exit/entry action
    /// does not abort the transition; the outcome is recorded and the
    /// transition proceeds.
    Failed(String),
}

impl ActionOutcome {
    /// True if the action reported [`ActionOutcome::Failed`].
    pub fn is_failed(&self) -> bool {
        matches!(self, ActionOutcome::Failed(_))
    }
}

/// Result of a stay action: its outcome, plus whether it requests an
/// out-of-band save (a save is issued only if the stay action explicitly
/// requests it).
#[derive(Debug, Clone)]
pub struct StayOutcome {
    /// What the stay action reported.
    pub outcome: ActionOutcome,
    /// Whether the stay action wants its mutated context persisted
    /// immediately rather than waiting for the next transition.
    pub request_save: bool,
}

impl StayOutcome {
    /// A stay action that ran successfully and does not need a save.
    pub fn handled() -> Self {
        Self {
            outcome: ActionOutcome::Executed,
            request_save: false,
        }
    }

    /// A stay action that ran successfully and wants its mutated context
    /// persisted immediately.
    pub fn handled_and_save() -> Self {
        Self {
            outcome: ActionOutcome::Executed,
            request_save: true,
        }
    }
}

/// Entry/exit action: a closure over the persistent and volatile context.
pub type EntryExitAction<PCU, V> =
    Arc<dyn Fn(&mut PersistentContext<PCU>, &mut V) -> ActionOutcome + Send + Sync>;

/// Stay action: a closure over the persistent/volatile context and the
/// triggering user event.
pub type StayAction<U, PCU, V> =
    Arc<dyn Fn(&mut PersistentContext<PCU>, &mut V, &U) -> StayOutcome + Send + Sync>;

/// Maps a user event to a stable wire-level tag, the event catalog's unit of
/// currency. Implement this once per event enum; the
/// engine never inspects the event's Rust type beyond this trait.
pub trait TaggedEvent: Debug + Send + Sync {
    /// The wire tag for this particular event value.
    fn event_tag(&self) -> EventTag;
}

/// The synthetic timeout event: `source` is the state that armed the
/// timeout, `target` is the state the timeout transitions into. Dropped by
/// the engine if `source` no longer matches the current state (a stale
/// timeout racing a transition that already moved the machine elsewhere).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutEvent {
    /// The state that armed this timeout.
    pub source: crate::ids::StateName,
    /// The state the timeout transitions into.
    pub target: crate::ids::StateName,
}

/// The event type the engine actually dispatches: either a user event or a
/// synthetic timeout firing.
#[derive(Debug, Clone)]
pub enum Event<U> {
    /// A caller-supplied event value.
    User(U),
    /// A synthetic timeout firing.
    Timeout(TimeoutEvent),
}

impl<U: TaggedEvent> Event<U> {
    /// The wire tag used for transition-table lookups. Timeout events always
    /// use the reserved `TIMEOUT` tag.
    pub fn tag(&self) -> EventTag {
        match self {
            Event::User(u) => u.event_tag(),
            Event::Timeout(_) => EventTag::timeout(),
        }
    }
}
