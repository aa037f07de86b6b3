use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::modules::agent::AgentId;
use crate::modules::clock::Clock;
use crate::modules::config::SimConfig;
use crate::modules::limiter::CacheKey;
use crate::modules::prompt;
use crate::modules::queue::{Refusal, RequestQueue};
use crate::modules::records::{HumanChatRecord, SenderKind};
use crate::modules::store::{Session, Store, StoreError};
use crate::modules::task::{AgentRef, GenerationRequest, PendingTask, RequestKind, TaskId, TaskPayload};

const COMMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ChatRefusal {
    #[error("message is empty")]
    Empty,
    #[error("message is {len} characters; the limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("agent {0} does not exist")]
    UnknownAgent(AgentId),
    #[error("agent is still answering your previous message")]
    Busy { retry_after: Duration },
    #[error("agent is resting")]
    Cooldown { retry_after: Duration },
    #[error("agents are overloaded")]
    QueueFull { retry_after: Duration },
    #[error("simulation is not running")]
    Closed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChatRefusal {
    /// Whole seconds to wait before trying again, when waiting helps.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ChatRefusal::Busy { retry_after }
            | ChatRefusal::Cooldown { retry_after }
            | ChatRefusal::QueueFull { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        }
    }
}

impl From<Refusal> for ChatRefusal {
    fn from(refusal: Refusal) -> Self {
        match refusal {
            Refusal::Cooldown { retry_after, .. } => ChatRefusal::Cooldown { retry_after },
            Refusal::QueueFull { retry_after } => ChatRefusal::QueueFull { retry_after },
            Refusal::Closed => ChatRefusal::Closed,
        }
    }
}

/// Receipt for an accepted human message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HumanTicket {
    pub conversation_id: String,
    pub task_id: TaskId,
    pub agent: String,
}

/// Front-end entry point for people talking to agents. Accepted messages
/// are persisted and handed to the scheduler, which commits the reply.
#[derive(Clone)]
pub struct ChatGateway {
    config: SimConfig,
    store: Arc<dyn Store>,
    queue: RequestQueue,
    inbox: Sender<PendingTask>,
    clock: Arc<dyn Clock>,
}

impl ChatGateway {
    pub fn new(
        config: SimConfig,
        store: Arc<dyn Store>,
        queue: RequestQueue,
        inbox: Sender<PendingTask>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            inbox,
            clock,
        }
    }

    pub fn send(&self, user: &str, agent_id: AgentId, message: &str) -> Result<HumanTicket, ChatRefusal> {
        let text = message.trim();
        if text.is_empty() {
            return Err(ChatRefusal::Empty);
        }
        let len = text.chars().count();
        if len > self.config.human_message_max_chars {
            return Err(ChatRefusal::TooLong {
                len,
                max: self.config.human_message_max_chars,
            });
        }

        let now = self.clock.utc();
        let data = self.store.load()?;
        let agent = data
            .agent(agent_id)
            .cloned()
            .ok_or(ChatRefusal::UnknownAgent(agent_id))?;

        let window = ChronoDuration::seconds(self.config.human_pending_window_secs as i64);
        if let Some(previous) = data.pending_user_message(agent_id) {
            if now - previous.timestamp < window {
                return Err(ChatRefusal::Busy {
                    retry_after: Duration::from_secs(self.config.human_busy_retry_secs),
                });
            }
            let lost = previous.id;
            self.commit_retrying(|session| {
                if let Some(previous) = session.human_chat_mut(lost) {
                    previous.response_received = true;
                }
            })?;
            info!(agent = %agent.name, chat = lost, "unanswered message marked lost");
        }

        if let Some(reply) = data.last_agent_reply(agent_id) {
            let rested = (now - reply.timestamp).num_seconds().max(0) as u64;
            if rested < self.config.human_rest_secs {
                return Err(ChatRefusal::Cooldown {
                    retry_after: Duration::from_secs(self.config.human_rest_secs - rested),
                });
            }
        }

        let mut rng = rand::thread_rng();
        let request = GenerationRequest {
            kind: RequestKind::HumanResponse,
            agent: agent.name.clone(),
            cache_key: CacheKey::pair(&agent.name, user, RequestKind::HumanResponse),
            params: prompt::human_reply_prompt(&agent, user, text),
            fallback: prompt::scripted_line(RequestKind::HumanResponse, Some(user), &mut rng),
        };
        let task_id = self.queue.submit(request)?;

        let conversation_id = format!(
            "user-{}-agent-{}-{}",
            user,
            agent_id,
            now.timestamp_millis()
        );

        let chat_id = self.commit_retrying(|session| {
            session.insert_human_chat(HumanChatRecord {
                id: 0,
                user: user.to_string(),
                agent_id,
                sender: SenderKind::User,
                message: Some(text.to_string()),
                response: None,
                conversation_id: conversation_id.clone(),
                task_id: Some(task_id.to_string()),
                timestamp: now,
                response_received: false,
            })
        })?;

        let task = PendingTask::new(
            task_id.clone(),
            AgentRef::new(agent.id, &agent.name),
            TaskPayload::HumanAnswer {
                user: user.to_string(),
                chat_id,
                conversation_id: conversation_id.clone(),
            },
            0,
            now,
        );
        self.inbox.send(task).map_err(|_| ChatRefusal::Closed)?;

        info!(user, agent = %agent.name, task = %task_id, "human message accepted");
        Ok(HumanTicket {
            conversation_id,
            task_id,
            agent: agent.name,
        })
    }

    /// Applies `write` to a fresh session and commits it, starting over when
    /// a tick committed in between.
    fn commit_retrying<T>(&self, mut write: impl FnMut(&mut Session) -> T) -> Result<T, ChatRefusal> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut session = self.store.begin()?;
            let value = write(&mut session);
            match self.store.commit(session) {
                Ok(_) => return Ok(value),
                Err(StoreError::Conflict { .. }) if attempt < COMMIT_ATTEMPTS => {
                    debug!(attempt, "chat commit raced a tick; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::agent::{Agent, AgentCategory, Position};
    use crate::modules::clock::ManualClock;
    use crate::modules::llm::OfflineGenerator;
    use crate::modules::simulation::{Parts, assemble};
    use crate::modules::store::MemoryStore;

    fn setup() -> (Parts, Arc<MemoryStore>, Arc<ManualClock>, AgentId) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let mut session = store.begin().unwrap();
        let agent = session
            .insert_agent(Agent::new("Mind-404", AgentCategory::Infinite, 0.6, Position::default(), clock.utc()))
            .unwrap();
        store.commit(session).unwrap();
        let config = SimConfig {
            worker_throttle_ms: 0,
            ..SimConfig::default()
        };
        let parts = assemble(config, store.clone(), Arc::new(OfflineGenerator), clock.clone(), Some(5)).unwrap();
        (parts, store, clock, agent)
    }

    #[test]
    fn invalid_messages_are_rejected_without_side_effects() {
        let (parts, store, _, agent) = setup();

        assert!(matches!(parts.chat.send("alice", agent, "   "), Err(ChatRefusal::Empty)));
        let long = "x".repeat(501);
        assert!(matches!(
            parts.chat.send("alice", agent, &long),
            Err(ChatRefusal::TooLong { len: 501, max: 500 })
        ));
        assert!(matches!(
            parts.chat.send("alice", 999, "hi"),
            Err(ChatRefusal::UnknownAgent(999))
        ));
        assert!(store.load().unwrap().human_chats.is_empty());
    }

    #[test]
    fn busy_then_cooldown_then_accepted() {
        let (parts, store, clock, agent) = setup();

        let first = parts.chat.send("alice", agent, "hello").unwrap();
        assert_eq!(first.agent, "Mind-404");

        let busy = parts.chat.send("alice", agent, "are you there?").unwrap_err();
        assert!(matches!(busy, ChatRefusal::Busy { .. }));
        assert_eq!(busy.retry_after_secs(), Some(5));

        clock.advance(Duration::from_secs(31));
        let resting = parts.chat.send("alice", agent, "hello again").unwrap_err();
        assert!(matches!(resting, ChatRefusal::Cooldown { .. }));
        assert_eq!(resting.retry_after_secs(), Some(29));
        let chats = store.load().unwrap().human_chats;
        assert_eq!(chats.len(), 1);
        assert!(chats[0].response_received);

        clock.advance(Duration::from_secs(30));
        let second = parts.chat.send("alice", agent, "third time").unwrap();
        assert_ne!(first.task_id, second.task_id);

        let chats = store.load().unwrap().human_chats;
        assert_eq!(chats.len(), 2);
        assert!(chats[0].response_received);
        assert!(!chats[1].response_received);
        assert_eq!(chats[1].task_id.as_deref(), Some(second.task_id.as_str()));
    }

    #[test]
    fn agent_rests_briefly_after_replying() {
        let (mut parts, _, clock, agent) = setup();
        parts.chat.send("bob", agent, "ping").unwrap();
        assert!(parts.worker.process_next(Duration::ZERO));
        parts.scheduler.tick().unwrap();

        let resting = parts.chat.send("carol", agent, "hi").unwrap_err();
        assert!(matches!(resting, ChatRefusal::Cooldown { .. }));
        assert_eq!(resting.retry_after_secs(), Some(3));

        clock.advance(Duration::from_secs(2));
        let resting = parts.chat.send("carol", agent, "hi").unwrap_err();
        assert_eq!(resting.retry_after_secs(), Some(1));

        clock.advance(Duration::from_secs(60));
        let ticket = parts.chat.send("carol", agent, "hi").unwrap();
        assert_eq!(ticket.agent, "Mind-404");
    }

    #[test]
    fn accepted_message_is_answered_by_the_next_tick() {
        let (mut parts, store, _, agent) = setup();
        let ticket = parts.chat.send("bob", agent, "What are you?").unwrap();

        assert!(parts.worker.process_next(Duration::ZERO));
        parts.scheduler.tick().unwrap();

        let data = store.load().unwrap();
        let reply = crate::modules::view::check_response(&data, "bob", &ticket.conversation_id);
        let reply = reply.expect("reply committed");
        assert!(reply.contains("bob"));
        assert!(data.human_chats[0].response_received);
        assert_eq!(data.human_chats[0].response.as_deref(), Some(reply.as_str()));
        assert!(!parts.scheduler.is_tracking(&ticket.task_id));
    }
}
