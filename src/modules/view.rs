use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::modules::agent::{Agent, AgentCategory, AgentId, Mood, Position};
use crate::modules::records::{
    DialogueRecord, EventRecord, MemoryRecord, SenderKind, ThoughtRecord,
};
use crate::modules::store::WorldData;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub name: String,
    pub category: AgentCategory,
    pub mood: Mood,
    pub energy: f64,
    pub position: Position,
    pub last_active: DateTime<Utc>,
}

impl From<&Agent> for AgentSnapshot {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id,
            name: agent.name.clone(),
            category: agent.category,
            mood: agent.mood,
            energy: agent.energy,
            position: agent.position,
            last_active: agent.last_active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub cycle: u64,
    pub complexity: f64,
    pub agents: Vec<AgentSnapshot>,
    pub mean_energy: f64,
    pub dialogues: usize,
    pub thoughts: usize,
    pub relationships: usize,
    pub taken_at: DateTime<Utc>,
}

/// Everything shown on an agent's page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentFeed {
    pub agent: AgentSnapshot,
    pub thoughts: Vec<ThoughtRecord>,
    pub memories: Vec<MemoryRecord>,
    pub dialogues: Vec<DialogueRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatLine {
    pub sender: SenderKind,
    pub text: String,
    pub conversation_id: String,
    pub timestamp: DateTime<Utc>,
}

pub fn world_snapshot(data: &WorldData, now: DateTime<Utc>) -> WorldSnapshot {
    let agents: Vec<AgentSnapshot> = data.agents.iter().map(AgentSnapshot::from).collect();
    let mean_energy = if agents.is_empty() {
        0.0
    } else {
        agents.iter().map(|a| a.energy).sum::<f64>() / agents.len() as f64
    };
    let (cycle, complexity) = data
        .world
        .as_ref()
        .map(|w| (w.cycle, w.complexity))
        .unwrap_or((0, crate::modules::world::INITIAL_COMPLEXITY));

    WorldSnapshot {
        cycle,
        complexity,
        agents,
        mean_energy,
        dialogues: data.dialogues.iter().filter(|d| d.is_finalized()).count(),
        thoughts: data.thoughts.len(),
        relationships: data.relationships.len(),
        taken_at: now,
    }
}

/// Newest events first.
pub fn latest_events(data: &WorldData, limit: usize) -> Vec<EventRecord> {
    data.events.iter().rev().take(limit).cloned().collect()
}

/// Newest finalized dialogue lines first.
pub fn latest_dialogues(data: &WorldData, limit: usize) -> Vec<DialogueRecord> {
    let mut records: Vec<&DialogueRecord> =
        data.dialogues.iter().filter(|d| d.is_finalized()).collect();
    records.sort_by_key(|d| std::cmp::Reverse((d.timestamp, d.id)));
    records.into_iter().take(limit).cloned().collect()
}

pub fn latest_thoughts(data: &WorldData, limit: usize) -> Vec<ThoughtRecord> {
    data.thoughts.iter().rev().take(limit).cloned().collect()
}

pub fn agent_feed(data: &WorldData, agent_id: AgentId, limit: usize) -> Option<AgentFeed> {
    let agent = data.agent(agent_id)?;
    let mut dialogues: Vec<&DialogueRecord> = data
        .dialogues
        .iter()
        .filter(|d| d.is_finalized() && d.involves(&agent.name))
        .collect();
    dialogues.sort_by_key(|d| std::cmp::Reverse((d.timestamp, d.id)));

    Some(AgentFeed {
        agent: AgentSnapshot::from(agent),
        thoughts: data
            .thoughts
            .iter()
            .rev()
            .filter(|t| t.agent_id == agent_id)
            .take(limit)
            .cloned()
            .collect(),
        memories: data
            .memories
            .iter()
            .rev()
            .filter(|m| m.agent_id == agent_id)
            .take(limit)
            .cloned()
            .collect(),
        dialogues: dialogues.into_iter().take(limit).cloned().collect(),
    })
}

/// The last `limit` finalized messages between two agents, oldest first.
pub fn dialogue_context(data: &WorldData, a: &str, b: &str, limit: usize) -> Vec<DialogueRecord> {
    let records = data.pair_dialogue(a, b);
    let start = records.len().saturating_sub(limit);
    records[start..].iter().map(|d| (*d).clone()).collect()
}

/// A user's conversation with one agent, oldest first.
pub fn chat_history(data: &WorldData, user: &str, agent_id: AgentId, limit: usize) -> Vec<ChatLine> {
    let lines: Vec<ChatLine> = data
        .human_chats
        .iter()
        .filter(|c| c.user == user && c.agent_id == agent_id)
        .filter_map(|c| {
            let text = match c.sender {
                SenderKind::User => c.message.clone(),
                SenderKind::Agent => c.response.clone(),
            }?;
            Some(ChatLine {
                sender: c.sender,
                text,
                conversation_id: c.conversation_id.clone(),
                timestamp: c.timestamp,
            })
        })
        .collect();
    let start = lines.len().saturating_sub(limit);
    lines[start..].to_vec()
}

/// The agent's reply in `conversation_id`, once it exists.
pub fn check_response(data: &WorldData, user: &str, conversation_id: &str) -> Option<String> {
    data.human_chats
        .iter()
        .find(|c| {
            c.user == user && c.conversation_id == conversation_id && c.sender == SenderKind::Agent
        })
        .and_then(|c| c.response.clone())
}

fn snapshot_dir() -> PathBuf {
    PathBuf::from(".iskra")
}

pub fn snapshot_file_path() -> PathBuf {
    snapshot_dir().join("world_snapshot.json")
}

pub fn save_world_snapshot(snapshot: &WorldSnapshot) -> io::Result<PathBuf> {
    let path = snapshot_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(snapshot)?;
    fs::write(&path, json)?;
    Ok(path)
}

pub fn load_world_snapshot() -> io::Result<Option<WorldSnapshot>> {
    let path = snapshot_file_path();
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path)?;
    if bytes.is_empty() {
        return Ok(None);
    }
    let snapshot = serde_json::from_slice(&bytes)?;
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::records::{DialogueKind, HumanChatRecord};
    use crate::modules::store::Session;

    fn world_with_pair() -> (WorldData, AgentId, AgentId) {
        let now = Utc::now();
        let mut session = Session::new(WorldData::default());
        let a = session
            .insert_agent(Agent::new("Neuron-1", AgentCategory::Basic, 0.4, Position::default(), now))
            .unwrap();
        let b = session
            .insert_agent(Agent::new("Synth-2", AgentCategory::Advanced, 0.8, Position::default(), now))
            .unwrap();
        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            let (from, to) = if i % 2 == 0 { ((a, "Neuron-1"), (b, "Synth-2")) } else { ((b, "Synth-2"), (a, "Neuron-1")) };
            let mut record = DialogueRecord::placeholder(
                DialogueKind::PendingPlaceholder,
                from,
                to,
                i as u64,
                now + chrono::Duration::seconds(i as i64),
                None,
            );
            record.kind = DialogueKind::AiResponse;
            record.message = text.to_string();
            session.insert_dialogue(record);
        }
        session.insert_dialogue(DialogueRecord::placeholder(
            DialogueKind::TypingPlaceholder,
            (a, "Neuron-1"),
            (b, "Synth-2"),
            9,
            now + chrono::Duration::seconds(10),
            None,
        ));
        (session.into_parts().1, a, b)
    }

    #[test]
    fn context_is_oldest_first_and_finalized_only() {
        let (data, _, _) = world_with_pair();
        let context = dialogue_context(&data, "Synth-2", "Neuron-1", 2);
        let texts: Vec<_> = context.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(texts, ["two", "three"]);
    }

    #[test]
    fn latest_dialogues_leave_out_placeholders() {
        let (data, _, _) = world_with_pair();
        let latest = latest_dialogues(&data, 10);
        assert!(latest.iter().all(|d| !d.kind.is_placeholder()));
        let texts: Vec<_> = latest.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(texts, ["three", "two", "one"]);
    }

    #[test]
    fn snapshot_summarizes_agents() {
        let (data, a, _) = world_with_pair();
        let snapshot = world_snapshot(&data, Utc::now());
        assert_eq!(snapshot.agents.len(), 2);
        assert!((snapshot.mean_energy - 0.6).abs() < 1e-9);
        assert_eq!(snapshot.dialogues, 3);

        let feed = agent_feed(&data, a, 10).unwrap();
        assert_eq!(feed.dialogues.len(), 3);
        assert_eq!(feed.dialogues[0].message, "three");
    }

    #[test]
    fn chat_history_and_response_check() {
        let (mut data, a, _) = world_with_pair();
        let now = Utc::now();
        let base = HumanChatRecord {
            id: 0,
            user: "alice".into(),
            agent_id: a,
            sender: SenderKind::User,
            message: Some("hello agent".into()),
            response: None,
            conversation_id: "conv-1".into(),
            task_id: None,
            timestamp: now,
            response_received: false,
        };
        data.human_chats.push(base.clone());
        assert_eq!(check_response(&data, "alice", "conv-1"), None);

        data.human_chats.push(HumanChatRecord {
            sender: SenderKind::Agent,
            message: None,
            response: Some("hello human".into()),
            response_received: true,
            ..base
        });
        assert_eq!(check_response(&data, "alice", "conv-1"), Some("hello human".into()));
        assert_eq!(check_response(&data, "bob", "conv-1"), None);

        let history = chat_history(&data, "alice", a, 10);
        let texts: Vec<_> = history.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, ["hello agent", "hello human"]);
    }
}
