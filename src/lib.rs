//! # telecom-fsm-rt
//!
//! An async runtime for large fleets of long-lived, event-driven finite
//! state machines: per-machine transition tables, timeout arming with
//! catch-up on rehydration, pluggable persistence, an observer bus, and
//! system/per-machine rate shaping.
//!
//! ## Features
//!
//! - 🔄 **Async/Await Support**: entry/exit/stay actions and persistence are
//!   ordinary synchronous/async Rust, driven by a tokio runtime
//! - 📋 **Data-Driven Transitions**: each state's transition and stay tables
//!   are plain maps, introspectable for tooling rather than hidden behind
//!   trait dispatch
//! - ⏰ **Timeout Catch-Up**: a rehydrated machine whose armed timeout has
//!   already elapsed processes it immediately, rather than silently missing it
//! - 🛡️ **Capacity & Rate Control**: a hard cap on concurrent machines, a
//!   system-wide token bucket, and an independent per-machine bucket
//! - 🧵 **Thread Safe**: built on `tokio::sync::Mutex` and `dashmap`
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use telecom_fsm_rt::prelude::*;
//!
//! #[derive(Debug, Clone)]
//! enum CallEvent {
//!     IncomingCall,
//!     Answer,
//!     Hangup,
//! }
//!
//! impl TaggedEvent for CallEvent {
//!     fn event_tag(&self) -> EventTag {
//!         match self {
//!             CallEvent::IncomingCall => "INCOMING_CALL".into(),
//!             CallEvent::Answer => "ANSWER".into(),
//!             CallEvent::Hangup => "HANGUP".into(),
//!         }
//!     }
//! }
//!
//! #[derive(Debug, Clone, Default)]
//! struct CallRecord;
//!
//! #[derive(Default)]
//! struct CallSession;
//!
//! # async fn example() -> EngineResult<()> {
//! let template = MachineTemplateBuilder::new()
//!     .initial_state("IDLE")
//!     .state("IDLE", |s| s.on("INCOMING_CALL", "RINGING"))
//!     .state("RINGING", |s| {
//!         s.timeout(Duration::from_secs(30), "IDLE").on("ANSWER", "CONNECTED")
//!     })
//!     .state("CONNECTED", |s| s.on("HANGUP", "IDLE"))
//!     .build()?;
//!
//! let registry = Registry::new(
//!     Arc::new(template),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(ObserverBus::new()),
//!     Arc::new(TimeoutScheduler::new()),
//!     RegistryConfig::default(),
//!     Arc::new(CallSession::default),
//! );
//! registry.add_trigger("INCOMING_CALL", Arc::new(|_id: &MachineId| CallRecord::default()), Arc::new(CallSession::default));
//!
//! let outcome = registry.send_event(MachineId::from("call-1"), CallEvent::IncomingCall).await?;
//! assert_eq!(outcome, Outcome::Accepted);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod action;
mod builder;
mod catalog;
mod config;
mod debug;
mod error;
mod fsm;
mod ids;
mod observer;
mod persistence;
mod ratelimit;
mod registry;
mod timeout;

pub use action::{ActionOutcome, Event, StayOutcome, TaggedEvent, TimeoutEvent};
pub use builder::{MachineTemplateBuilder, StateBuilder};
pub use catalog::EventCatalog;
pub use config::{RegistryConfig, SampleLogging};
pub use debug::{
    CompleteStatus, CurrentState, DebugMessage, EventMetadata, InboundEvent, MachineSummary,
    StateChange, TimeoutCountdown,
};
pub use error::{EngineError, EngineResult};
pub use fsm::{FireOutcome, Machine, MachineTemplate};
pub use ids::{EventTag, MachineId, StateName};
pub use observer::{Observer, ObserverBus};
pub use persistence::{MemoryStore, PersistenceError, PersistencePort, PersistentContext, SharedPersistence};
pub use ratelimit::TokenBucket;
pub use registry::{CreateOrGetResult, IgnoredReason, Outcome, Registry};
pub use timeout::{TimeoutHandle, TimeoutScheduler};

pub use async_trait::async_trait;

/// Convenience re-export of the items most call sites need.
pub mod prelude {
    pub use crate::{
        ActionOutcome, CompleteStatus, CreateOrGetResult, CurrentState, DebugMessage, EngineError,
        EngineResult, Event, EventCatalog, EventMetadata, EventTag, FireOutcome, IgnoredReason,
        InboundEvent, Machine, MachineId, MachineSummary, MachineTemplate, MachineTemplateBuilder,
        MemoryStore, Observer, ObserverBus, Outcome, PersistenceError, PersistencePort,
        PersistentContext, Registry, RegistryConfig, SampleLogging, SharedPersistence, StateBuilder,
        StateChange, StateName, StayOutcome, TaggedEvent, TimeoutCountdown, TimeoutEvent,
        TimeoutHandle, TimeoutScheduler, TokenBucket, async_trait,
    };
}
