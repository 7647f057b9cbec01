//! End-to-end tests driving a [`Registry`] the way a real caller would:
//! through `send_event`, never by reaching into engine internals.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use telecom_fsm_rt::prelude::*;

#[derive(Debug, Clone)]
enum CallEvent {
    IncomingCall { from: String },
    Answer,
    Hangup,
    SessionProgress,
}

impl TaggedEvent for CallEvent {
    fn event_tag(&self) -> EventTag {
        match self {
            CallEvent::IncomingCall { .. } => "INCOMING_CALL".into(),
            CallEvent::Answer => "ANSWER".into(),
            CallEvent::Hangup => "HANGUP".into(),
            CallEvent::SessionProgress => "SESSION_PROGRESS".into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CallRecord {
    from: String,
}

#[derive(Debug, Default)]
struct CallSession {
    ring_count: u32,
}

/// `IDLE --INCOMING_CALL--> RINGING (timeout -> IDLE) --ANSWER--> CONNECTED
/// --HANGUP--> IDLE`.
/// `ringing_timeout` is shortened to milliseconds so the timeout tests
/// run fast instead of needing real minutes.
fn call_template(ringing_timeout: Duration) -> MachineTemplate<CallEvent, CallRecord, CallSession> {
    MachineTemplateBuilder::new()
        .initial_state("IDLE")
        .state("IDLE", |s| s.on("INCOMING_CALL", "RINGING"))
        .state("RINGING", |s| {
            s.timeout(ringing_timeout, "IDLE")
                .on("ANSWER", "CONNECTED")
                .stay("SESSION_PROGRESS", |_pc, vc: &mut CallSession, _e| {
                    vc.ring_count += 1;
                    StayOutcome::handled()
                })
        })
        .state("CONNECTED", |s| s.on("HANGUP", "IDLE"))
        .build()
        .expect("template is internally consistent")
}

fn new_registry(
    ringing_timeout: Duration,
    config: RegistryConfig,
    persistence: Arc<MemoryStore<CallRecord>>,
) -> Arc<Registry<CallEvent, CallRecord, CallSession>> {
    let registry = Registry::new(
        Arc::new(call_template(ringing_timeout)),
        persistence,
        Arc::new(ObserverBus::new()),
        Arc::new(TimeoutScheduler::new()),
        config,
        Arc::new(CallSession::default),
    );
    registry.add_trigger(
        "INCOMING_CALL",
        Arc::new(|_id: &MachineId| CallRecord::default()),
        Arc::new(CallSession::default),
    );
    registry
}

#[tokio::test]
async fn ring_then_answer_then_hangup() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let registry = new_registry(Duration::from_secs(30), RegistryConfig::default(), store);
    let id = MachineId::from("c1");

    let outcome = registry
        .send_event(id.clone(), CallEvent::IncomingCall { from: "+1-555-1".to_string() })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Accepted);

    let outcome = registry.send_event(id.clone(), CallEvent::Answer).await.unwrap();
    assert_eq!(outcome, Outcome::Accepted);

    let outcome = registry.send_event(id.clone(), CallEvent::Hangup).await.unwrap();
    assert_eq!(outcome, Outcome::Accepted);

    let snapshot = registry.current_state_snapshot(&id).await.unwrap();
    assert_eq!(snapshot.current_state.as_str(), "IDLE");
    assert!(!snapshot.complete);
}

#[tokio::test]
async fn ring_then_timeout_falls_back_to_idle() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let registry = new_registry(Duration::from_millis(50), RegistryConfig::default(), store);
    let id = MachineId::from("c2");

    registry
        .send_event(id.clone(), CallEvent::IncomingCall { from: "x".to_string() })
        .await
        .unwrap();
    let snapshot = registry.current_state_snapshot(&id).await.unwrap();
    assert_eq!(snapshot.current_state.as_str(), "RINGING");

    tokio::time::sleep(Duration::from_millis(150)).await;

    let snapshot = registry.current_state_snapshot(&id).await.unwrap();
    assert_eq!(snapshot.current_state.as_str(), "IDLE");
}

#[tokio::test]
async fn stay_action_counts_progress_without_rearming_the_timeout_clock() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let registry = new_registry(Duration::from_millis(200), RegistryConfig::default(), store);
    let id = MachineId::from("c3");

    registry
        .send_event(id.clone(), CallEvent::IncomingCall { from: "x".to_string() })
        .await
        .unwrap();

    for _ in 0..3 {
        let outcome = registry.send_event(id.clone(), CallEvent::SessionProgress).await.unwrap();
        assert_eq!(outcome, Outcome::Accepted);
    }

    let outcome = registry.send_event(id.clone(), CallEvent::Answer).await.unwrap();
    assert_eq!(outcome, Outcome::Accepted);

    let snapshot = registry.current_state_snapshot(&id).await.unwrap();
    assert_eq!(snapshot.current_state.as_str(), "CONNECTED");
}

#[tokio::test]
async fn rehydrate_with_catch_up_resumes_past_a_due_timeout() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());

    {
        let registry = new_registry(Duration::from_millis(30), RegistryConfig::default(), store.clone());
        registry
            .send_event(MachineId::from("c4"), CallEvent::IncomingCall { from: "y".to_string() })
            .await
            .unwrap();
        // Evict without letting the timeout fire, so the persisted record
        // still reads RINGING with a stale `lastStateChange`.
        registry.remove_machine(&MachineId::from("c4")).await;
    }

    // Simulate time passing offline, well past the 30ms timeout, before a
    // fresh registry rehydrates from the same persisted store.
    tokio::time::sleep(Duration::from_millis(80)).await;

    let registry = new_registry(Duration::from_millis(30), RegistryConfig::default(), store);
    let outcome = registry
        .send_event(MachineId::from("c4"), CallEvent::SessionProgress)
        .await
        .unwrap();
    // By the time the registry rehydrates "c4" to deliver this event, the
    // timeout catch-up has already fired and moved it to IDLE, where
    // SESSION_PROGRESS has no stay action.
    assert_eq!(outcome, Outcome::Ignored(IgnoredReason::NoTransitionAndNoStay));

    let snapshot = registry.current_state_snapshot(&MachineId::from("c4")).await.unwrap();
    assert_eq!(snapshot.current_state.as_str(), "IDLE");
    assert!(!snapshot.complete);
}

#[tokio::test]
async fn auto_create_on_trigger_then_non_trigger_for_absent_id_is_ignored() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let registry = new_registry(Duration::from_secs(30), RegistryConfig::default(), store);

    let outcome = registry
        .send_event(
            MachineId::from("new-1"),
            CallEvent::IncomingCall { from: "z".to_string() },
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Accepted);
    assert_eq!(registry.active_count(), 1);

    let outcome = registry
        .send_event(MachineId::from("unseen"), CallEvent::Answer)
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Ignored(IgnoredReason::NoSuchMachine));
    assert_eq!(registry.active_count(), 1);
}

#[tokio::test]
async fn capacity_full_blocks_further_auto_creation() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let mut config = RegistryConfig::default();
    config.max_concurrent_machines = 2;
    let registry = new_registry(Duration::from_secs(30), config, store);

    for id in ["c1", "c2"] {
        let outcome = registry
            .send_event(MachineId::from(id), CallEvent::IncomingCall { from: "a".to_string() })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Accepted);
    }

    let outcome = registry
        .send_event(MachineId::from("c3"), CallEvent::IncomingCall { from: "a".to_string() })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::CapacityFull);
    assert_eq!(registry.active_count(), 2);
}

#[tokio::test]
async fn final_state_machine_is_evicted_and_ignores_further_events() {
    let template = MachineTemplateBuilder::new()
        .initial_state("IDLE")
        .state("IDLE", |s: StateBuilder<CallEvent, CallRecord, CallSession>| {
            s.on("HANGUP", "DONE")
        })
        .state("DONE", |s| s.final_state())
        .build()
        .unwrap();

    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let registry = Registry::new(
        Arc::new(template),
        store,
        Arc::new(ObserverBus::new()),
        Arc::new(TimeoutScheduler::new()),
        RegistryConfig::default(),
        Arc::new(CallSession::default),
    );
    registry.add_trigger("HANGUP", Arc::new(|_id: &MachineId| CallRecord::default()), Arc::new(CallSession::default));

    let id = MachineId::from("done-1");
    let outcome = registry.send_event(id.clone(), CallEvent::Hangup).await.unwrap();
    assert_eq!(outcome, Outcome::Accepted);
    assert_eq!(registry.active_count(), 0);

    let outcome = registry.send_event(id.clone(), CallEvent::Hangup).await.unwrap();
    assert_eq!(outcome, Outcome::NotFoundFinal);
}

/// An [`Observer`] that records every notification it receives, for
/// asserting on ordering without the test reaching into engine
/// internals.
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn new() -> Self {
        Self { events: Mutex::new(Vec::new()) }
    }

    fn snapshot(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Observer<CallRecord, CallSession> for Recorder {
    async fn on_registry_create(&self, id: &MachineId) {
        self.events.lock().unwrap().push(format!("create:{id}"));
    }

    async fn on_state_machine_event(
        &self,
        id: &MachineId,
        old_state: Option<&telecom_fsm_rt::prelude::StateName>,
        new_state: &telecom_fsm_rt::prelude::StateName,
        _pc: &PersistentContext<CallRecord>,
        _vc: &CallSession,
    ) {
        let old = old_state.map(|s| s.as_str()).unwrap_or("<none>");
        self.events.lock().unwrap().push(format!("transition:{id}:{old}->{new_state}"));
    }

    async fn on_event_ignored(
        &self,
        id: &MachineId,
        _state: Option<&telecom_fsm_rt::prelude::StateName>,
        tag: &EventTag,
        reason: IgnoredReason,
    ) {
        self.events.lock().unwrap().push(format!("ignored:{id}:{tag}:{reason:?}"));
    }
}

#[tokio::test]
async fn observer_sees_create_then_transitions_in_fifo_order() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let registry = new_registry(Duration::from_secs(30), RegistryConfig::default(), store);
    let recorder = Arc::new(Recorder::new());
    registry.add_listener(recorder.clone());

    let id = MachineId::from("c5");
    registry
        .send_event(id.clone(), CallEvent::IncomingCall { from: "q".to_string() })
        .await
        .unwrap();
    registry.send_event(id.clone(), CallEvent::Answer).await.unwrap();
    registry.send_event(id.clone(), CallEvent::Hangup).await.unwrap();
    registry.send_event(id.clone(), CallEvent::Answer).await.unwrap(); // unhandled in IDLE

    assert_eq!(
        recorder.snapshot(),
        vec![
            "create:c5".to_string(),
            "transition:c5:IDLE->RINGING".to_string(),
            "transition:c5:RINGING->CONNECTED".to_string(),
            "transition:c5:CONNECTED->IDLE".to_string(),
            "ignored:c5:ANSWER:NoTransitionAndNoStay".to_string(),
        ]
    );
}

#[tokio::test]
async fn system_throttle_rejects_once_the_bucket_is_dry() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let mut config = RegistryConfig::default();
    config.target_tps = 1;
    config.system_burst_multiplier = 1.0;
    let registry = new_registry(Duration::from_secs(30), config, store);

    let first = registry
        .send_event(MachineId::from("a"), CallEvent::IncomingCall { from: "x".to_string() })
        .await
        .unwrap();
    assert_eq!(first, Outcome::Accepted);

    let second = registry
        .send_event(MachineId::from("b"), CallEvent::IncomingCall { from: "x".to_string() })
        .await
        .unwrap();
    assert_eq!(second, Outcome::ThrottledSystem);
}

#[tokio::test]
async fn per_machine_throttle_is_independent_of_system_throttle() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let mut config = RegistryConfig::default();
    config.max_events_per_machine_per_second = 1;
    let registry = new_registry(Duration::from_secs(30), config, store);
    let id = MachineId::from("hot");

    let first = registry
        .send_event(id.clone(), CallEvent::IncomingCall { from: "x".to_string() })
        .await
        .unwrap();
    assert_eq!(first, Outcome::Accepted);

    let second = registry.send_event(id.clone(), CallEvent::SessionProgress).await.unwrap();
    assert_eq!(second, Outcome::ThrottledPerMachine);
}

#[tokio::test]
async fn explicit_register_fails_on_collision() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let registry = new_registry(Duration::from_secs(30), RegistryConfig::default(), store);

    registry
        .register(MachineId::from("explicit-1"), CallRecord::default(), CallSession::default())
        .await
        .unwrap();
    assert_eq!(registry.active_count(), 1);

    let result = registry
        .register(MachineId::from("explicit-1"), CallRecord::default(), CallSession::default())
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyRegistered(_))));
}

#[tokio::test]
async fn persisted_context_round_trips_through_the_store() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let id = MachineId::from("rt-1");
    let pc = PersistentContext::new(id.clone(), telecom_fsm_rt::prelude::StateName::from("RINGING"), CallRecord {
        from: "+1-555-9".to_string(),
    });
    store.save(&pc).await.unwrap();

    let loaded = store.load(&id).await.unwrap().expect("row present");
    assert_eq!(loaded.id, pc.id);
    assert_eq!(loaded.current_state, pc.current_state);
    assert_eq!(loaded.complete, pc.complete);
    assert_eq!(loaded.user.from, pc.user.from);
}

#[tokio::test]
async fn shutdown_persists_active_machines_and_refuses_further_timeouts() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let registry = new_registry(Duration::from_secs(30), RegistryConfig::default(), store.clone());
    let id = MachineId::from("shut-1");

    registry
        .send_event(id.clone(), CallEvent::IncomingCall { from: "x".to_string() })
        .await
        .unwrap();

    registry.shutdown().await;

    let loaded = store.load(&id).await.unwrap().expect("persisted on shutdown");
    assert_eq!(loaded.current_state.as_str(), "RINGING");
}

#[tokio::test]
async fn idle_eviction_reclaims_least_recently_eventful_machines_over_threshold() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let mut config = RegistryConfig::default();
    config.machine_eviction_threshold = 1;
    config.machine_idle_timeout = Duration::from_millis(10);
    let registry = new_registry(Duration::from_secs(30), config, store);

    registry
        .send_event(MachineId::from("old"), CallEvent::IncomingCall { from: "x".to_string() })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    registry
        .send_event(MachineId::from("new"), CallEvent::IncomingCall { from: "x".to_string() })
        .await
        .unwrap();

    assert_eq!(registry.active_count(), 2);
    registry.evict_idle_over_threshold().await;
    assert_eq!(registry.active_count(), 1);
    assert!(registry.current_state_snapshot(&MachineId::from("old")).await.is_none());
    assert!(registry.current_state_snapshot(&MachineId::from("new")).await.is_some());
}

#[tokio::test]
async fn event_metadata_snapshot_reflects_builder_tables_not_reflection() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let registry = new_registry(Duration::from_secs(30), RegistryConfig::default(), store);

    let metadata = registry.event_metadata_snapshot();
    let ringing = metadata
        .iter()
        .find(|m| m.state.as_str() == "RINGING")
        .expect("RINGING metadata present");
    assert_eq!(ringing.transitions.get(&EventTag::from("ANSWER")).unwrap().as_str(), "CONNECTED");
    assert!(ringing.stay_events.contains(&EventTag::from("SESSION_PROGRESS")));
}

#[tokio::test]
async fn concurrent_events_on_distinct_machines_all_land() {
    let store: Arc<MemoryStore<CallRecord>> = Arc::new(MemoryStore::new());
    let registry = new_registry(Duration::from_secs(30), RegistryConfig::default(), store);
    let accepted = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for n in 0..20 {
        let registry = registry.clone();
        let accepted = accepted.clone();
        handles.push(tokio::spawn(async move {
            let id = MachineId::from(format!("m{n}"));
            let outcome = registry
                .send_event(id, CallEvent::IncomingCall { from: "x".to_string() })
                .await
                .unwrap();
            if outcome == Outcome::Accepted {
                accepted.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 20);
    assert_eq!(registry.active_count(), 20);
}
