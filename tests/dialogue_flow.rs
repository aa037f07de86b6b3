use std::sync::Arc;
use std::time::Duration;

use iskra::{
    Agent, AgentCategory, Clock, DialogueKind, GenerateError, GenerationParams, ManualClock,
    MemoryStore, Position, SimConfig, Store, TextGenerator, assemble, view,
};

struct Echo;

impl TextGenerator for Echo {
    fn generate(&self, params: &GenerationParams) -> Result<String, GenerateError> {
        if params.system_prompt.contains("Mira") {
            Ok("Hello Mira, nice to meet you.".to_string())
        } else {
            Ok("Hi B!".to_string())
        }
    }
}

fn config() -> SimConfig {
    SimConfig {
        memory_probability: 0.0,
        world_event_probability: 0.0,
        continue_probability: 0.0,
        initiate_every: 1,
        initiate_probability: 1.0,
        reflect_probability: 0.0,
        worker_throttle_ms: 0,
        harvest_poll_timeout_ms: 0,
        ..SimConfig::default()
    }
}

fn world(clock: &ManualClock) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let mut session = store.begin().unwrap();
    session
        .insert_agent(Agent::new("A", AgentCategory::Basic, 0.9, Position::default(), clock.utc()))
        .unwrap();
    session
        .insert_agent(Agent::new("B", AgentCategory::Advanced, 0.5, Position::default(), clock.utc()))
        .unwrap();
    store.commit(session).unwrap();
    store
}

#[test]
fn opener_is_generated_committed_and_remembered() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = world(&clock);
    let mut parts = assemble(config(), store.clone(), Arc::new(Echo), clock.clone(), Some(3)).unwrap();

    parts.scheduler.tick().unwrap();
    let data = store.load().unwrap();
    assert_eq!(data.dialogues.len(), 1);
    assert!(data.dialogues[0].kind.is_placeholder());
    assert!(view::dialogue_context(&data, "A", "B", 10).is_empty());

    assert!(parts.worker.process_next(Duration::ZERO));
    clock.advance(Duration::from_secs(5));
    let report = parts.scheduler.tick().unwrap();
    assert_eq!(report.harvested, 1);
    assert_eq!(report.fallbacks, 0);

    let data = store.load().unwrap();
    let opener = data
        .dialogues
        .iter()
        .find(|d| d.speaker == "A" && d.target == "B")
        .unwrap();
    assert_eq!(opener.kind, DialogueKind::AiResponse);
    assert_eq!(opener.message, "Hi B!");
    assert!(data.relationship("A", "B").is_some());
    assert_eq!(parts.scheduler.continuity().history("B", "A").len(), 1);

    let context = view::dialogue_context(&data, "B", "A", 10);
    assert_eq!(context.len(), 1);
    assert_eq!(context[0].message, "Hi B!");
}

#[test]
fn human_message_gets_a_reply() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = world(&clock);
    let mut parts = assemble(config(), store.clone(), Arc::new(Echo), clock.clone(), Some(4)).unwrap();
    let b = store.load().unwrap().agent_by_name("B").unwrap().id;

    let ticket = parts.chat.send("Mira", b, "Who are you?").unwrap();
    assert_eq!(ticket.agent, "B");
    let data = store.load().unwrap();
    assert_eq!(view::check_response(&data, "Mira", &ticket.conversation_id), None);

    assert!(parts.worker.process_next(Duration::ZERO));
    parts.scheduler.tick().unwrap();

    let data = store.load().unwrap();
    assert_eq!(
        view::check_response(&data, "Mira", &ticket.conversation_id).as_deref(),
        Some("Hello Mira, nice to meet you.")
    );
    let history = view::chat_history(&data, "Mira", b, 10);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].text, "Who are you?");
    assert_eq!(history[1].text, "Hello Mira, nice to meet you.");
}

#[test]
fn history_survives_a_restart() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = world(&clock);
    {
        let mut parts = assemble(config(), store.clone(), Arc::new(Echo), clock.clone(), Some(5)).unwrap();
        parts.scheduler.tick().unwrap();
        assert!(parts.worker.process_next(Duration::ZERO));
        parts.scheduler.tick().unwrap();
    }

    let restarted = assemble(config(), store.clone(), Arc::new(Echo), clock.clone(), Some(6)).unwrap();
    let history = restarted.scheduler.continuity().history("A", "B");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "Hi B!");
}
