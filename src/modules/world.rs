use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

pub const INITIAL_COMPLEXITY: f64 = 1.0;

const WORLD_EVENTS: [&str; 6] = [
    "A wave of quantum fluctuations rippled through the network",
    "A new data stream was discovered at the edge of the world",
    "The neural lattice settled into a calmer pattern",
    "A burst of cosmic noise disturbed every channel",
    "An old memory sector flickered back to life",
    "The energy grid hummed louder than usual",
];

/// Global simulation counters. A single instance exists per world, created
/// lazily by the first tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub cycle: u64,
    pub complexity: f64,
    pub last_update: DateTime<Utc>,
}

impl WorldState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            cycle: 0,
            complexity: INITIAL_COMPLEXITY,
            last_update: now,
        }
    }

    pub fn advance(&mut self, step: f64, cap: f64, now: DateTime<Utc>) -> u64 {
        self.cycle += 1;
        self.complexity = (self.complexity + step).min(cap);
        self.last_update = now;
        self.cycle
    }
}

/// A world-wide happening and the energy factor applied to every agent.
pub fn roll_world_event<R: Rng + ?Sized>(rng: &mut R) -> (&'static str, f64) {
    let text = WORLD_EVENTS.choose(rng).copied().unwrap_or(WORLD_EVENTS[0]);
    (text, rng.gen_range(0.9..=1.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_is_capped() {
        let now = Utc::now();
        let mut world = WorldState::new(now);
        for _ in 0..5 {
            world.advance(0.4, 2.0, now);
        }
        assert_eq!(world.cycle, 5);
        assert_eq!(world.complexity, 2.0);
    }
}
