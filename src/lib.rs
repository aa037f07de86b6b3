pub mod modules;

pub use modules::agent::{Agent, AgentCategory, AgentId, MAX_ENERGY, MIN_ENERGY, Mood, Position};
pub use modules::agents;
pub use modules::chat::{ChatGateway, ChatRefusal, HumanTicket};
pub use modules::clock::{Clock, ManualClock, SystemClock};
pub use modules::config::{ConfigError, LlmSettings, SimConfig};
pub use modules::continuity::{ContinuityTracker, Turn};
pub use modules::limiter::{CacheKey, RateLimiter, ResponseCache};
pub use modules::llm::{
    GenerateError, GenerationParams, LlmClient, LlmProvider, OfflineGenerator, TextGenerator,
};
pub use modules::policy::{CommAction, PolicyInput, PolicyThresholds, decide};
pub use modules::queue::{Refusal, RequestQueue, Worker, request_pipeline};
pub use modules::records::{
    DialogueKind, DialogueRecord, EventKind, EventRecord, HumanChatRecord, MemoryKind,
    MemoryRecord, PairKey, RecordId, RelationshipRecord, SenderKind, ThoughtKind, ThoughtRecord,
};
pub use modules::registry::PendingRegistry;
pub use modules::scheduler::{Scheduler, TickReport};
pub use modules::simulation::{Parts, SimError, Simulation, assemble};
pub use modules::state::{self, RuntimeState, Status};
pub use modules::store::{JsonStore, MemoryStore, Session, Store, StoreError, WorldData};
pub use modules::task::{PendingTask, RequestKind, TaskId, TaskPayload};
pub use modules::view::{
    self, AgentFeed, AgentSnapshot, ChatLine, WorldSnapshot, load_world_snapshot,
    save_world_snapshot,
};
pub use modules::world::WorldState;
