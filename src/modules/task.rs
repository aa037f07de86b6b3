use std::fmt;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::modules::agent::AgentId;
use crate::modules::limiter::CacheKey;
use crate::modules::llm::GenerationParams;
use crate::modules::records::RecordId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Response,
    FirstMessage,
    Reflection,
    HumanResponse,
    Continuation,
}

impl RequestKind {
    pub fn label(self) -> &'static str {
        match self {
            RequestKind::Response => "response",
            RequestKind::FirstMessage => "first_message",
            RequestKind::Reflection => "reflection",
            RequestKind::HumanResponse => "human_response",
            RequestKind::Continuation => "continuation",
        }
    }

    /// Replies to people are always generated fresh.
    pub fn cacheable(self) -> bool {
        !matches!(self, RequestKind::HumanResponse)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// `kind-agent-sequence-random`, unique for the life of the process.
    pub fn generate(kind: RequestKind, agent: &str, sequence: u64) -> Self {
        let mut bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut bytes);
        let slug: String = agent
            .chars()
            .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        Self(format!(
            "{}-{}-{:06}-{}",
            kind.label(),
            slug,
            sequence,
            hex::encode(bytes)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the worker needs to produce one piece of text.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    pub kind: RequestKind,
    /// Rate-limited identity: an agent name.
    pub agent: String,
    pub cache_key: CacheKey,
    pub params: GenerationParams,
    /// Published instead of a generated text when generation fails.
    pub fallback: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentRef {
    pub id: AgentId,
    pub name: String,
}

impl AgentRef {
    pub fn new(id: AgentId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }
}

/// Per-kind data needed to commit a result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskPayload {
    Answer {
        partner: AgentRef,
        original_id: RecordId,
        placeholder_id: RecordId,
    },
    FirstMessage {
        partner: AgentRef,
        placeholder_id: RecordId,
    },
    Continuation {
        partner: AgentRef,
        placeholder_id: RecordId,
    },
    Reflection,
    HumanAnswer {
        user: String,
        chat_id: RecordId,
        conversation_id: String,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            TaskPayload::Answer { .. } => RequestKind::Response,
            TaskPayload::FirstMessage { .. } => RequestKind::FirstMessage,
            TaskPayload::Continuation { .. } => RequestKind::Continuation,
            TaskPayload::Reflection => RequestKind::Reflection,
            TaskPayload::HumanAnswer { .. } => RequestKind::HumanResponse,
        }
    }

    pub fn partner_name(&self) -> Option<&str> {
        match self {
            TaskPayload::Answer { partner, .. }
            | TaskPayload::FirstMessage { partner, .. }
            | TaskPayload::Continuation { partner, .. } => Some(&partner.name),
            TaskPayload::HumanAnswer { user, .. } => Some(user),
            TaskPayload::Reflection => None,
        }
    }

    /// The dialogue placeholder this task will finalize, if it has one.
    pub fn placeholder_id_mut(&mut self) -> Option<&mut RecordId> {
        match self {
            TaskPayload::Answer { placeholder_id, .. }
            | TaskPayload::FirstMessage { placeholder_id, .. }
            | TaskPayload::Continuation { placeholder_id, .. } => Some(placeholder_id),
            TaskPayload::Reflection | TaskPayload::HumanAnswer { .. } => None,
        }
    }
}

/// A submitted request the scheduler is waiting on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTask {
    pub task_id: TaskId,
    pub agent: AgentRef,
    pub payload: TaskPayload,
    pub cycle: u64,
    pub issued_at: DateTime<Utc>,
    /// Harvest polls that came back empty.
    pub attempts: u32,
}

impl PendingTask {
    pub fn new(
        task_id: TaskId,
        agent: AgentRef,
        payload: TaskPayload,
        cycle: u64,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            agent,
            payload,
            cycle,
            issued_at,
            attempts: 0,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique_and_readable() {
        let a = TaskId::generate(RequestKind::FirstMessage, "Neuron-100", 1);
        let b = TaskId::generate(RequestKind::FirstMessage, "Neuron-100", 1);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("first_message-neuron_100-000001-"));
    }

    #[test]
    fn only_human_replies_skip_the_cache() {
        assert!(!RequestKind::HumanResponse.cacheable());
        assert!(RequestKind::Response.cacheable());
        assert!(RequestKind::Reflection.cacheable());
    }

    #[test]
    fn only_dialogue_tasks_carry_a_placeholder() {
        let partner = AgentRef::new(2, "Synth-200");
        let mut answer = TaskPayload::Answer {
            partner: partner.clone(),
            original_id: 4,
            placeholder_id: 7,
        };
        if let Some(id) = answer.placeholder_id_mut() {
            *id = 9;
        }
        assert_eq!(
            answer,
            TaskPayload::Answer {
                partner,
                original_id: 4,
                placeholder_id: 9
            }
        );
        assert!(TaskPayload::Reflection.placeholder_id_mut().is_none());
    }
}
