use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::modules::config::SimConfig;

pub type AgentId = u64;

pub const MIN_ENERGY: f64 = 0.1;
pub const MAX_ENERGY: f64 = 1.0;

const TIRED_BELOW: f64 = 0.3;
const EXCITED_ABOVE: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AgentCategory {
    Basic,
    Advanced,
    Infinite,
}

impl AgentCategory {
    pub const ALL: [AgentCategory; 3] = [
        AgentCategory::Basic,
        AgentCategory::Advanced,
        AgentCategory::Infinite,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AgentCategory::Basic => "basic",
            AgentCategory::Advanced => "advanced",
            AgentCategory::Infinite => "infinite",
        }
    }
}

impl fmt::Display for AgentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AgentCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "basic" => Ok(AgentCategory::Basic),
            "advanced" => Ok(AgentCategory::Advanced),
            "infinite" => Ok(AgentCategory::Infinite),
            other => Err(format!(
                "unknown agent category '{}', use basic|advanced|infinite",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Curious,
    Neutral,
    Excited,
    Tired,
    Focused,
}

impl Mood {
    const MID_RANGE: [Mood; 3] = [Mood::Curious, Mood::Neutral, Mood::Focused];

    pub fn label(self) -> &'static str {
        match self {
            Mood::Curious => "curious",
            Mood::Neutral => "neutral",
            Mood::Excited => "excited",
            Mood::Tired => "tired",
            Mood::Focused => "focused",
        }
    }

    /// Low energy is always tired and high energy always excited; anything
    /// in between picks one of the calmer moods at random.
    pub fn for_energy<R: Rng + ?Sized>(energy: f64, rng: &mut R) -> Mood {
        if energy < TIRED_BELOW {
            Mood::Tired
        } else if energy > EXCITED_ABOVE {
            Mood::Excited
        } else {
            *Self::MID_RANGE.choose(rng).unwrap_or(&Mood::Neutral)
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn clamp_energy(value: f64) -> f64 {
    if value.is_nan() {
        MIN_ENERGY
    } else {
        value.clamp(MIN_ENERGY, MAX_ENERGY)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R, bound: f64) -> Self {
        Self {
            x: rng.gen_range(-bound..=bound),
            y: rng.gen_range(-bound..=bound),
            z: rng.gen_range(-bound..=bound),
        }
    }

    pub fn clamped(self, bound: f64) -> Self {
        Self {
            x: self.x.clamp(-bound, bound),
            y: self.y.clamp(-bound, bound),
            z: self.z.clamp(-bound, bound),
        }
    }

    pub fn within(&self, bound: f64) -> bool {
        [self.x, self.y, self.z].iter().all(|c| c.abs() <= bound)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub category: AgentCategory,
    pub mood: Mood,
    pub energy: f64,
    pub position: Position,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Agent {
    /// Builds an unsaved agent; the store assigns the id on insert.
    pub fn new(
        name: impl Into<String>,
        category: AgentCategory,
        energy: f64,
        position: Position,
        now: DateTime<Utc>,
    ) -> Self {
        let energy = clamp_energy(energy);
        let mood = if energy < TIRED_BELOW {
            Mood::Tired
        } else if energy > EXCITED_ABOVE {
            Mood::Excited
        } else {
            Mood::Neutral
        };
        Self {
            id: 0,
            name: name.into(),
            category,
            mood,
            energy,
            position,
            created_at: now,
            last_active: now,
        }
    }

    /// Per-tick state drift: energy wanders, the agent takes a small step and
    /// its mood follows the new energy level.
    pub fn drift<R: Rng + ?Sized>(&mut self, rng: &mut R, config: &SimConfig, now: DateTime<Utc>) {
        let jitter = config.energy_jitter;
        self.energy = clamp_energy(self.energy + rng.gen_range(-jitter..=jitter));

        let step = config.move_step;
        let moved = Position::new(
            self.position.x + rng.gen_range(-step..=step),
            self.position.y + rng.gen_range(-step..=step),
            self.position.z + rng.gen_range(-step..=step),
        );
        self.position = moved.clamped(config.world_bound);

        self.mood = Mood::for_energy(self.energy, rng);
        self.last_active = now;
    }

    pub fn scale_energy(&mut self, factor: f64) {
        self.energy = clamp_energy(self.energy * factor);
    }
}
