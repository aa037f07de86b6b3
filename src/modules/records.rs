use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::modules::agent::AgentId;

pub type RecordId = u64;

/// Actor name used on events that no agent caused.
pub const SYSTEM_ACTOR: &str = "SYSTEM";

pub const TYPING_TEXT: &str = "typing a reply...";
pub const PENDING_TEXT: &str = "thinking...";

/// Unordered pair of agent names. `PairKey::new("B", "A") == PairKey::new("A", "B")`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    low: String,
    high: String,
}

impl PairKey {
    pub fn new(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    pub fn low(&self) -> &str {
        &self.low
    }

    pub fn high(&self) -> &str {
        &self.high
    }

    pub fn contains(&self, name: &str) -> bool {
        self.low == name || self.high == name
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.low, self.high)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DialogueKind {
    /// Reply in flight to a specific message.
    TypingPlaceholder,
    /// Opening line or continuation in flight.
    PendingPlaceholder,
    AiResponse,
    /// Scripted line written without generation.
    Initiated,
}

impl DialogueKind {
    pub fn is_placeholder(self) -> bool {
        matches!(
            self,
            DialogueKind::TypingPlaceholder | DialogueKind::PendingPlaceholder
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            DialogueKind::TypingPlaceholder => "typing-placeholder",
            DialogueKind::PendingPlaceholder => "pending-placeholder",
            DialogueKind::AiResponse => "ai-response",
            DialogueKind::Initiated => "initiated",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DialogueRecord {
    pub id: RecordId,
    pub speaker_id: AgentId,
    pub speaker: String,
    pub target_id: AgentId,
    pub target: String,
    pub message: String,
    pub kind: DialogueKind,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    /// The message this record answers.
    pub response_to: Option<RecordId>,
    /// Text of the first reply this message received. Set once.
    pub response: Option<String>,
    pub response_id: Option<RecordId>,
}

impl DialogueRecord {
    pub fn placeholder(
        kind: DialogueKind,
        speaker: (AgentId, &str),
        target: (AgentId, &str),
        cycle: u64,
        now: DateTime<Utc>,
        response_to: Option<RecordId>,
    ) -> Self {
        let message = if kind == DialogueKind::TypingPlaceholder {
            TYPING_TEXT
        } else {
            PENDING_TEXT
        };
        Self {
            id: 0,
            speaker_id: speaker.0,
            speaker: speaker.1.to_string(),
            target_id: target.0,
            target: target.1.to_string(),
            message: message.to_string(),
            kind,
            cycle,
            timestamp: now,
            response_to,
            response: None,
            response_id: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        !self.kind.is_placeholder()
    }

    pub fn involves(&self, name: &str) -> bool {
        self.speaker == name || self.target == name
    }

    pub fn partner_of(&self, name: &str) -> Option<(AgentId, &str)> {
        if self.speaker == name {
            Some((self.target_id, &self.target))
        } else if self.target == name {
            Some((self.speaker_id, &self.speaker))
        } else {
            None
        }
    }

    pub fn pair(&self) -> PairKey {
        PairKey::new(&self.speaker, &self.target)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Observation,
    Interaction,
    Thought,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: RecordId,
    pub agent_id: AgentId,
    pub kind: MemoryKind,
    pub content: String,
    pub significance: f64,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThoughtKind {
    Reflection,
    /// Canned reflection used when generation never delivered.
    Scripted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThoughtRecord {
    pub id: RecordId,
    pub agent_id: AgentId,
    pub agent: String,
    pub thought: String,
    pub kind: ThoughtKind,
    pub significance: f64,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub pair: PairKey,
    /// Affinity in [-1, 1].
    pub value: f64,
    pub updated_at: DateTime<Utc>,
}

impl RelationshipRecord {
    pub fn adjust(&mut self, delta: f64, now: DateTime<Utc>) -> f64 {
        self.value = (self.value + delta).clamp(-1.0, 1.0);
        self.updated_at = now;
        self.value
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Dialogue,
    Reflection,
    Interaction,
    World,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: RecordId,
    pub kind: EventKind,
    pub text: String,
    pub actor: String,
    pub other: Option<String>,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(
        kind: EventKind,
        text: impl Into<String>,
        actor: &str,
        other: Option<&str>,
        cycle: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            kind,
            text: text.into(),
            actor: actor.to_string(),
            other: other.map(str::to_string),
            cycle,
            timestamp: now,
        }
    }

    pub fn mentions(&self, name: &str) -> bool {
        self.actor == name || self.other.as_deref() == Some(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    User,
    Agent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HumanChatRecord {
    pub id: RecordId,
    pub user: String,
    pub agent_id: AgentId,
    pub sender: SenderKind,
    pub message: Option<String>,
    pub response: Option<String>,
    pub conversation_id: String,
    pub task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub response_received: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_ignores_order() {
        let ab = PairKey::new("Neuron-100", "Synth-200");
        let ba = PairKey::new("Synth-200", "Neuron-100");
        assert_eq!(ab, ba);
        assert_eq!(ab.low(), "Neuron-100");
        assert_eq!(ab.to_string(), "Neuron-100|Synth-200");
        assert!(ab.contains("Synth-200"));
        assert!(!ab.contains("Mind-300"));
    }

    #[test]
    fn relationship_is_clamped() {
        let now = Utc::now();
        let mut rel = RelationshipRecord {
            pair: PairKey::new("a", "b"),
            value: 0.95,
            updated_at: now,
        };
        assert_eq!(rel.adjust(0.2, now), 1.0);
        assert_eq!(rel.adjust(-3.0, now), -1.0);
    }

    #[test]
    fn placeholder_text_depends_on_kind() {
        let now = Utc::now();
        let typing = DialogueRecord::placeholder(
            DialogueKind::TypingPlaceholder,
            (1, "a"),
            (2, "b"),
            3,
            now,
            Some(9),
        );
        assert_eq!(typing.message, TYPING_TEXT);
        assert!(!typing.is_finalized());
        assert_eq!(typing.partner_of("b"), Some((1, "a")));

        let pending =
            DialogueRecord::placeholder(DialogueKind::PendingPlaceholder, (1, "a"), (2, "b"), 3, now, None);
        assert_eq!(pending.message, PENDING_TEXT);
    }
}
