//! Property-based checks for deterministic transitions and capacity
//! enforcement.
//!
//! These are the two invariants that benefit most from randomized sequences
//! rather than a handful of hand-picked examples; everything else is
//! covered by the example-based scenarios in `tests/integration_tests.rs`.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use telecom_fsm_rt::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallEvent {
    IncomingCall,
    Answer,
    Hangup,
    SessionProgress,
}

impl TaggedEvent for CallEvent {
    fn event_tag(&self) -> EventTag {
        match self {
            CallEvent::IncomingCall => "INCOMING_CALL".into(),
            CallEvent::Answer => "ANSWER".into(),
            CallEvent::Hangup => "HANGUP".into(),
            CallEvent::SessionProgress => "SESSION_PROGRESS".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefState {
    Idle,
    Ringing,
    Connected,
}

/// A pure reference implementation of the same transition table the builder
/// below encodes, used only to predict the expected state.
fn reference_step(state: RefState, event: CallEvent) -> RefState {
    match (state, event) {
        (RefState::Idle, CallEvent::IncomingCall) => RefState::Ringing,
        (RefState::Ringing, CallEvent::Answer) => RefState::Connected,
        (RefState::Connected, CallEvent::Hangup) => RefState::Idle,
        // SessionProgress is a stay action in Ringing; everything else
        // unhandled in its state leaves the state unchanged.
        (s, _) => s,
    }
}

fn ref_state_name(s: RefState) -> &'static str {
    match s {
        RefState::Idle => "IDLE",
        RefState::Ringing => "RINGING",
        RefState::Connected => "CONNECTED",
    }
}

#[derive(Default)]
struct NoVc;

fn call_template() -> MachineTemplate<CallEvent, (), NoVc> {
    MachineTemplateBuilder::new()
        .initial_state("IDLE")
        .state("IDLE", |s| s.on("INCOMING_CALL", "RINGING"))
        .state("RINGING", |s| {
            s.timeout(Duration::from_secs(3600), "IDLE")
                .on("ANSWER", "CONNECTED")
                .stay("SESSION_PROGRESS", |_pc, _vc, _e| StayOutcome::handled())
        })
        .state("CONNECTED", |s| s.on("HANGUP", "IDLE"))
        .build()
        .expect("template is internally consistent")
}

fn event_strategy() -> impl Strategy<Value = CallEvent> {
    prop_oneof![
        Just(CallEvent::IncomingCall),
        Just(CallEvent::Answer),
        Just(CallEvent::Hangup),
        Just(CallEvent::SessionProgress),
    ]
}

proptest! {
    /// For any sequence of events, the engine's resulting state always
    /// matches the same transition table evaluated in plain Rust; the
    /// builder-owned table is not drifting from its own declared transitions.
    #[test]
    fn p1_transitions_match_the_declared_table(events in prop::collection::vec(event_strategy(), 0..30)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let template = Arc::new(call_template());
            let mut config = RegistryConfig::default();
            // The reference model steps on every generated event; the bucket
            // must never throttle one away or the two diverge. 30 is the
            // widest generated sequence, so a burst well past that is enough.
            config.max_events_per_machine_per_second = 1_000;
            config.target_tps = 1_000;
            let registry = Registry::new(
                template,
                Arc::new(MemoryStore::<()>::new()),
                Arc::new(ObserverBus::new()),
                Arc::new(TimeoutScheduler::new()),
                config,
                Arc::new(NoVc::default),
            );
            registry.add_trigger("INCOMING_CALL", Arc::new(|_id: &MachineId| ()), Arc::new(NoVc::default));

            let id = MachineId::from("prop-1");
            let mut reference = RefState::Idle;
            for event in events {
                let outcome = registry.send_event(id.clone(), event).await.unwrap();
                if outcome == Outcome::Accepted {
                    reference = reference_step(reference, event);
                }
            }

            match registry.current_state_snapshot(&id).await {
                Some(snapshot) => assert_eq!(snapshot.current_state.as_str(), ref_state_name(reference)),
                None => assert_eq!(reference, RefState::Idle),
            }
        });
    }

    /// No matter how many ids attempt to auto-create, active machine
    /// count never exceeds the configured cap.
    #[test]
    fn p8_active_count_never_exceeds_the_configured_cap(attempts in 0usize..40, cap in 1usize..10) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let template = Arc::new(call_template());
            let mut config = RegistryConfig::default();
            config.max_concurrent_machines = cap;
            let registry = Registry::new(
                template,
                Arc::new(MemoryStore::<()>::new()),
                Arc::new(ObserverBus::new()),
                Arc::new(TimeoutScheduler::new()),
                config,
                Arc::new(NoVc::default),
            );
            registry.add_trigger("INCOMING_CALL", Arc::new(|_id: &MachineId| ()), Arc::new(NoVc::default));

            for n in 0..attempts {
                let id = MachineId::from(format!("cap-{n}"));
                registry.send_event(id, CallEvent::IncomingCall).await.unwrap();
                assert!(registry.active_count() <= cap);
            }
        });
    }
}
