use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::agent::{Agent, AgentId};
use crate::modules::lock;
use crate::modules::records::{
    DialogueRecord, EventRecord, HumanChatRecord, MemoryRecord, PairKey, RecordId,
    RelationshipRecord, SenderKind, ThoughtRecord,
};
use crate::modules::world::WorldState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] io::Error),
    #[error("store data is corrupt: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("concurrent update: expected revision {expected}, found {found}")]
    Conflict { expected: u64, found: u64 },
    #[error("agent name '{0}' is already taken")]
    DuplicateAgent(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Everything the engine persists, versioned by `revision`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldData {
    pub revision: u64,
    pub world: Option<WorldState>,
    pub agents: Vec<Agent>,
    pub dialogues: Vec<DialogueRecord>,
    pub memories: Vec<MemoryRecord>,
    pub thoughts: Vec<ThoughtRecord>,
    pub relationships: Vec<RelationshipRecord>,
    pub events: Vec<EventRecord>,
    pub human_chats: Vec<HumanChatRecord>,
    next_id: u64,
}

impl WorldData {
    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn agent_by_name(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn dialogue(&self, id: RecordId) -> Option<&DialogueRecord> {
        self.dialogues.iter().find(|d| d.id == id)
    }

    /// Oldest finalized message addressed to `name` that has no reply yet,
    /// skipping the ids in `skip`.
    pub fn oldest_unanswered_for(
        &self,
        name: &str,
        skip: &HashSet<RecordId>,
    ) -> Option<&DialogueRecord> {
        self.dialogues
            .iter()
            .filter(|d| {
                d.target == name && d.is_finalized() && d.response.is_none() && !skip.contains(&d.id)
            })
            .min_by_key(|d| (d.timestamp, d.id))
    }

    /// Most recent finalized message sent or received by `name`.
    pub fn latest_exchange_for(&self, name: &str) -> Option<&DialogueRecord> {
        self.dialogues
            .iter()
            .filter(|d| d.is_finalized() && d.involves(name))
            .max_by_key(|d| (d.timestamp, d.id))
    }

    /// When the pair last exchanged anything, placeholders included.
    pub fn last_contact(&self, a: &str, b: &str) -> Option<DateTime<Utc>> {
        self.dialogues
            .iter()
            .filter(|d| (d.speaker == a && d.target == b) || (d.speaker == b && d.target == a))
            .map(|d| d.timestamp)
            .max()
    }

    /// Finalized messages between the pair, oldest first.
    pub fn pair_dialogue(&self, a: &str, b: &str) -> Vec<&DialogueRecord> {
        let pair = PairKey::new(a, b);
        let mut records: Vec<&DialogueRecord> = self
            .dialogues
            .iter()
            .filter(|d| d.is_finalized() && d.pair() == pair)
            .collect();
        records.sort_by_key(|d| (d.timestamp, d.id));
        records
    }

    /// Newest events mentioning `name`, newest first.
    pub fn recent_events_for(&self, name: &str, limit: usize) -> Vec<&EventRecord> {
        self.events
            .iter()
            .rev()
            .filter(|e| e.mentions(name))
            .take(limit)
            .collect()
    }

    pub fn relationship(&self, a: &str, b: &str) -> Option<&RelationshipRecord> {
        let pair = PairKey::new(a, b);
        self.relationships.iter().find(|r| r.pair == pair)
    }

    /// Latest user message to `agent_id` still waiting for a reply.
    pub fn pending_user_message(&self, agent_id: AgentId) -> Option<&HumanChatRecord> {
        self.human_chats
            .iter()
            .rev()
            .find(|c| c.agent_id == agent_id && c.sender == SenderKind::User && !c.response_received)
    }

    /// Most recent chat reply written by `agent_id`, to any user.
    pub fn last_agent_reply(&self, agent_id: AgentId) -> Option<&HumanChatRecord> {
        self.human_chats
            .iter()
            .filter(|c| c.agent_id == agent_id && c.sender == SenderKind::Agent)
            .max_by_key(|c| (c.timestamp, c.id))
    }
}

/// A working copy of the world. Mutations stay local until the owning
/// [`Store`] commits the session; dropping it discards them.
#[derive(Debug)]
pub struct Session {
    base_revision: u64,
    data: WorldData,
}

impl Session {
    pub fn new(data: WorldData) -> Self {
        Self {
            base_revision: data.revision,
            data,
        }
    }

    pub fn data(&self) -> &WorldData {
        &self.data
    }

    pub fn into_parts(self) -> (u64, WorldData) {
        (self.base_revision, self.data)
    }

    fn allocate_id(&mut self) -> RecordId {
        self.data.next_id += 1;
        self.data.next_id
    }

    pub fn world_or_create(&mut self, now: DateTime<Utc>) -> &mut WorldState {
        self.data.world.get_or_insert_with(|| WorldState::new(now))
    }

    pub fn agents(&self) -> &[Agent] {
        &self.data.agents
    }

    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.data.agent(id)
    }

    pub fn agent_mut(&mut self, id: AgentId) -> Option<&mut Agent> {
        self.data.agents.iter_mut().find(|a| a.id == id)
    }

    pub fn agents_mut(&mut self) -> impl Iterator<Item = &mut Agent> {
        self.data.agents.iter_mut()
    }

    pub fn insert_agent(&mut self, mut agent: Agent) -> Result<AgentId, StoreError> {
        if self.data.agent_by_name(&agent.name).is_some() {
            return Err(StoreError::DuplicateAgent(agent.name));
        }
        let id = self.allocate_id();
        agent.id = id;
        self.data.agents.push(agent);
        Ok(id)
    }

    pub fn insert_dialogue(&mut self, mut record: DialogueRecord) -> RecordId {
        let id = self.allocate_id();
        record.id = id;
        self.data.dialogues.push(record);
        id
    }

    pub fn dialogue_mut(&mut self, id: RecordId) -> Option<&mut DialogueRecord> {
        self.data.dialogues.iter_mut().find(|d| d.id == id)
    }

    pub fn push_memory(&mut self, mut record: MemoryRecord) -> RecordId {
        let id = self.allocate_id();
        record.id = id;
        self.data.memories.push(record);
        id
    }

    pub fn push_thought(&mut self, mut record: ThoughtRecord) -> RecordId {
        let id = self.allocate_id();
        record.id = id;
        self.data.thoughts.push(record);
        id
    }

    pub fn push_event(&mut self, mut record: EventRecord) -> RecordId {
        let id = self.allocate_id();
        record.id = id;
        self.data.events.push(record);
        id
    }

    pub fn adjust_relationship(&mut self, a: &str, b: &str, delta: f64, now: DateTime<Utc>) -> f64 {
        let pair = PairKey::new(a, b);
        match self.data.relationships.iter_mut().find(|r| r.pair == pair) {
            Some(existing) => existing.adjust(delta, now),
            None => {
                let mut record = RelationshipRecord {
                    pair,
                    value: 0.0,
                    updated_at: now,
                };
                let value = record.adjust(delta, now);
                self.data.relationships.push(record);
                value
            }
        }
    }

    pub fn insert_human_chat(&mut self, mut record: HumanChatRecord) -> RecordId {
        let id = self.allocate_id();
        record.id = id;
        self.data.human_chats.push(record);
        id
    }

    pub fn human_chat_mut(&mut self, id: RecordId) -> Option<&mut HumanChatRecord> {
        self.data.human_chats.iter_mut().find(|c| c.id == id)
    }

    /// Drops the oldest events beyond `keep`. Memories and thoughts are
    /// never removed.
    pub fn prune(&mut self, keep: usize) {
        if self.data.events.len() > keep {
            let drop = self.data.events.len() - keep;
            self.data.events.drain(0..drop);
        }
    }
}

/// Transactional persistence. A commit succeeds only when nobody committed
/// since the session was opened, so a failed tick leaves no partial writes.
pub trait Store: Send + Sync {
    fn load(&self) -> Result<WorldData, StoreError>;

    /// Persists the session and returns the new revision.
    fn commit(&self, session: Session) -> Result<u64, StoreError>;

    fn begin(&self) -> Result<Session, StoreError> {
        Ok(Session::new(self.load()?))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<WorldData>,
    failing_commits: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with [`StoreError::Unavailable`].
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Result<WorldData, StoreError> {
        Ok(lock(&self.data).clone())
    }

    fn commit(&self, session: Session) -> Result<u64, StoreError> {
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }

        let (base, mut data) = session.into_parts();
        let mut current = lock(&self.data);
        if current.revision != base {
            return Err(StoreError::Conflict {
                expected: base,
                found: current.revision,
            });
        }
        data.revision = base + 1;
        *current = data;
        Ok(current.revision)
    }
}

/// Whole-world JSON file, replaced atomically on each commit.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(".iskra").join("world.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<WorldData, StoreError> {
        if !self.path.exists() {
            return Ok(WorldData::default());
        }
        let bytes = fs::read(&self.path)?;
        if bytes.is_empty() {
            return Ok(WorldData::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl Store for JsonStore {
    fn load(&self) -> Result<WorldData, StoreError> {
        let _guard = lock(&self.guard);
        self.read()
    }

    fn commit(&self, session: Session) -> Result<u64, StoreError> {
        let _guard = lock(&self.guard);
        let found = self.read()?.revision;
        let (base, mut data) = session.into_parts();
        if found != base {
            return Err(StoreError::Conflict {
                expected: base,
                found,
            });
        }
        data.revision = base + 1;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&data)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(data.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::agent::{AgentCategory, Position};
    use crate::modules::records::{DialogueKind, EventKind, MemoryKind, ThoughtKind};

    fn agent(name: &str) -> Agent {
        Agent::new(name, AgentCategory::Basic, 0.5, Position::default(), Utc::now())
    }

    #[test]
    fn commit_bumps_revision_and_detects_conflicts() {
        let store = MemoryStore::new();
        let mut first = store.begin().unwrap();
        let second = store.begin().unwrap();

        first.insert_agent(agent("Neuron-101")).unwrap();
        assert_eq!(store.commit(first).unwrap(), 1);

        let err = store.commit(second).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 0, found: 1 }));
        assert_eq!(store.load().unwrap().agents.len(), 1);
    }

    #[test]
    fn dropped_session_leaves_store_untouched() {
        let store = MemoryStore::new();
        {
            let mut session = store.begin().unwrap();
            session.world_or_create(Utc::now()).advance(0.001, 2.0, Utc::now());
        }
        assert!(store.load().unwrap().world.is_none());
    }

    #[test]
    fn injected_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);
        let session = store.begin().unwrap();
        assert!(matches!(store.commit(session), Err(StoreError::Unavailable(_))));
        let session = store.begin().unwrap();
        assert_eq!(store.commit(session).unwrap(), 1);
    }

    #[test]
    fn duplicate_agent_names_are_refused() {
        let store = MemoryStore::new();
        let mut session = store.begin().unwrap();
        session.insert_agent(agent("Spark-300")).unwrap();
        let err = session.insert_agent(agent("Spark-300")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAgent(name) if name == "Spark-300"));
    }

    #[test]
    fn unanswered_lookup_skips_placeholders_and_replied() {
        let store = MemoryStore::new();
        let mut session = store.begin().unwrap();
        let now = Utc::now();
        let a = session.insert_agent(agent("a")).unwrap();
        let b = session.insert_agent(agent("b")).unwrap();

        let mut replied = DialogueRecord::placeholder(DialogueKind::PendingPlaceholder, (a, "a"), (b, "b"), 1, now, None);
        replied.kind = DialogueKind::AiResponse;
        replied.response = Some("ok".into());
        session.insert_dialogue(replied);

        session.insert_dialogue(DialogueRecord::placeholder(
            DialogueKind::PendingPlaceholder,
            (a, "a"),
            (b, "b"),
            1,
            now,
            None,
        ));

        let mut open = DialogueRecord::placeholder(DialogueKind::PendingPlaceholder, (a, "a"), (b, "b"), 2, now, None);
        open.kind = DialogueKind::AiResponse;
        open.message = "hello".into();
        let open_id = session.insert_dialogue(open);

        let found = session.data().oldest_unanswered_for("b", &HashSet::new()).unwrap();
        assert_eq!(found.id, open_id);
        assert!(session.data().oldest_unanswered_for("b", &HashSet::from([open_id])).is_none());
        assert!(session.data().oldest_unanswered_for("a", &HashSet::new()).is_none());
    }

    #[test]
    fn prune_keeps_newest_records() {
        let mut session = Session::new(WorldData::default());
        for i in 0..10 {
            session.push_event(EventRecord::new(EventKind::World, format!("e{i}"), "SYSTEM", None, i, Utc::now()));
        }
        session.prune(3);
        let texts: Vec<_> = session.data().events.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["e7", "e8", "e9"]);
    }

    #[test]
    fn prune_leaves_memories_and_thoughts_alone() {
        let mut session = Session::new(WorldData::default());
        let now = Utc::now();
        for i in 0..5 {
            session.push_event(EventRecord::new(EventKind::World, format!("e{i}"), "SYSTEM", None, i, now));
            session.push_memory(MemoryRecord {
                id: 0,
                agent_id: 1,
                kind: MemoryKind::Observation,
                content: format!("m{i}"),
                significance: 0.5,
                cycle: i,
                timestamp: now,
            });
            session.push_thought(ThoughtRecord {
                id: 0,
                agent_id: 1,
                agent: "a".into(),
                thought: format!("t{i}"),
                kind: ThoughtKind::Scripted,
                significance: 0.5,
                cycle: i,
                timestamp: now,
            });
        }
        session.prune(2);
        assert_eq!(session.data().events.len(), 2);
        assert_eq!(session.data().memories.len(), 5);
        assert_eq!(session.data().thoughts.len(), 5);
        assert_eq!(session.data().thoughts[0].thought, "t0");
    }

    #[test]
    fn json_store_persists_and_checks_revision() {
        let dir = std::env::temp_dir().join(format!(
            "iskra-store-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let store = JsonStore::open(dir.join("world.json"));

        let mut session = store.begin().unwrap();
        session.insert_agent(agent("Code-777")).unwrap();
        let stale = store.begin().unwrap();
        assert_eq!(store.commit(session).unwrap(), 1);
        assert!(matches!(store.commit(stale), Err(StoreError::Conflict { .. })));

        let reopened = JsonStore::open(dir.join("world.json"));
        let data = reopened.load().unwrap();
        assert_eq!(data.revision, 1);
        assert_eq!(data.agents[0].name, "Code-777");

        let _ = fs::remove_dir_all(dir);
    }
}
