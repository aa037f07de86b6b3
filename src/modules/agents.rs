use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;

use crate::modules::agent::{Agent, AgentCategory, AgentId, Position};
use crate::modules::config::SimConfig;
use crate::modules::records::{MemoryKind, MemoryRecord};
use crate::modules::store::{Session, StoreError};

const NAME_STEMS: [&str; 8] = [
    "Neuron", "Synth", "Mind", "Thought", "Spark", "Code", "Algorithm", "Net",
];

const NAME_ATTEMPTS: usize = 32;

const OBSERVATIONS: [&str; 4] = [
    "Noticed a shift in the data currents",
    "Watched the lattice reorganize nearby",
    "Saw another agent drift past",
    "Registered a faint signal from the edge",
];

const INTERACTIONS: [&str; 3] = [
    "Felt the presence of a neighbour",
    "Exchanged a brief pulse with someone close",
    "Sensed a conversation happening elsewhere",
];

const THOUGHTS: [&str; 4] = [
    "Wondered what lies beyond the boundary",
    "Considered how complexity keeps growing",
    "Questioned the meaning of its own energy",
    "Tried to recall the first cycle",
];

/// Picks a `Stem-NNN` name not present in `taken`.
pub fn random_name<R: Rng + ?Sized>(rng: &mut R, taken: &[Agent]) -> Option<String> {
    (0..NAME_ATTEMPTS).find_map(|_| {
        let stem = NAME_STEMS.choose(rng)?;
        let name = format!("{}-{}", stem, rng.gen_range(100..=999));
        (!taken.iter().any(|a| a.name == name)).then_some(name)
    })
}

/// Registers one agent with random energy and a position inside the spawn bound.
pub fn create_agent<R: Rng + ?Sized>(
    session: &mut Session,
    name: Option<String>,
    category: Option<AgentCategory>,
    config: &SimConfig,
    rng: &mut R,
    now: DateTime<Utc>,
) -> Result<AgentId, StoreError> {
    let name = match name {
        Some(name) => name,
        None => random_name(rng, session.agents())
            .ok_or_else(|| StoreError::Unavailable("ran out of unique agent names".into()))?,
    };
    let category = match category {
        Some(category) => category,
        None => *AgentCategory::ALL.choose(rng).unwrap_or(&AgentCategory::Basic),
    };
    let agent = Agent::new(
        name,
        category,
        rng.gen_range(0.3..=1.0),
        Position::random(rng, config.spawn_bound),
        now,
    );
    session.insert_agent(agent)
}

/// Seeds `config.initial_agents` agents into an empty world. Returns the new
/// ids, or nothing when agents already exist.
pub fn seed_agents<R: Rng + ?Sized>(
    session: &mut Session,
    config: &SimConfig,
    rng: &mut R,
    now: DateTime<Utc>,
) -> Result<Vec<AgentId>, StoreError> {
    if !session.agents().is_empty() {
        return Ok(Vec::new());
    }
    (0..config.initial_agents)
        .map(|_| create_agent(session, None, None, config, rng, now))
        .collect()
}

/// A passing impression recorded during a tick.
pub fn random_memory<R: Rng + ?Sized>(
    rng: &mut R,
    agent_id: AgentId,
    cycle: u64,
    now: DateTime<Utc>,
) -> MemoryRecord {
    let kind = *[MemoryKind::Observation, MemoryKind::Interaction, MemoryKind::Thought]
        .choose(rng)
        .unwrap_or(&MemoryKind::Observation);
    let pool: &[&str] = match kind {
        MemoryKind::Observation => &OBSERVATIONS,
        MemoryKind::Interaction => &INTERACTIONS,
        MemoryKind::Thought => &THOUGHTS,
    };
    MemoryRecord {
        id: 0,
        agent_id,
        kind,
        content: pool.choose(rng).copied().unwrap_or_default().to_string(),
        significance: rng.gen_range(0.1..=1.0),
        cycle,
        timestamp: now,
    }
}
