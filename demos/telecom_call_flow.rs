//! Call-flow example: a per-call state machine driven through a `Registry`.

use std::sync::Arc;
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

#[derive(Default)]
struct CallSession {
    ring_count: u32,
}

fn call_template() -> MachineTemplate<CallEvent, CallRecord, CallSession> {
    MachineTemplateBuilder::new()
        .initial_state("IDLE")
        .state("IDLE", |s| {
            s.on_entry(|_pc, _vc| {
                println!("📴 idle, waiting for a call");
                ActionOutcome::Executed
            })
            .on("INCOMING_CALL", "RINGING")
        })
        .state("RINGING", |s| {
            s.on_entry(|pc, _vc| {
                println!("📞 ringing for {}", pc.user.from);
                ActionOutcome::Executed
            })
            .timeout(Duration::from_secs(30), "IDLE")
            .on("ANSWER", "CONNECTED")
            .stay("SESSION_PROGRESS", |_pc, vc, _e| {
                vc.ring_count += 1;
                StayOutcome::handled()
            })
        })
        .state("CONNECTED", |s| {
            s.on_entry(|_pc, _vc| {
                println!("☎️  connected");
                ActionOutcome::Executed
            })
            .on("HANGUP", "IDLE")
        })
        .build()
        .expect("template is internally consistent")
}

#[tokio::main]
async fn main() -> EngineResult<()> {
    println!("📟 Telecom call-flow example\n");

    let registry = Registry::new(
        Arc::new(call_template()),
        Arc::new(MemoryStore::new()),
        Arc::new(ObserverBus::new()),
        Arc::new(TimeoutScheduler::new()),
        RegistryConfig::default(),
        Arc::new(CallSession::default),
    );

    registry.add_trigger(
        "INCOMING_CALL",
        Arc::new(|_id: &MachineId| CallRecord::default()),
        Arc::new(CallSession::default),
    );

    let id = MachineId::from("c1");

    let outcome = registry
        .send_event(
            id.clone(),
            CallEvent::IncomingCall {
                from: "+1-555-0100".to_string(),
            },
        )
        .await?;
    println!("sendEvent(INCOMING_CALL) -> {outcome:?}");

    let outcome = registry.send_event(id.clone(), CallEvent::SessionProgress).await?;
    println!("sendEvent(SESSION_PROGRESS) -> {outcome:?}");

    let outcome = registry.send_event(id.clone(), CallEvent::Answer).await?;
    println!("sendEvent(ANSWER) -> {outcome:?}");

    let outcome = registry.send_event(id.clone(), CallEvent::Hangup).await?;
    println!("sendEvent(HANGUP) -> {outcome:?}");

    registry.shutdown().await;
    Ok(())
}
