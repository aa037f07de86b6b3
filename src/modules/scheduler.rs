use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::modules::agent::{Agent, AgentId};
use crate::modules::agents::random_memory;
use crate::modules::clock::Clock;
use crate::modules::config::SimConfig;
use crate::modules::continuity::{ContinuityTracker, Turn};
use crate::modules::limiter::CacheKey;
use crate::modules::llm::GenerationParams;
use crate::modules::policy::{
    Candidate, CommAction, InboundMessage, LastExchange, PolicyInput, PolicyThresholds, decide,
};
use crate::modules::prompt;
use crate::modules::queue::RequestQueue;
use crate::modules::records::{
    DialogueKind, DialogueRecord, EventKind, EventRecord, HumanChatRecord, RecordId, SYSTEM_ACTOR,
    SenderKind, ThoughtKind, ThoughtRecord,
};
use crate::modules::registry::PendingRegistry;
use crate::modules::store::{Session, Store, StoreError};
use crate::modules::task::{AgentRef, GenerationRequest, PendingTask, RequestKind, TaskId, TaskPayload};
use crate::modules::view;
use crate::modules::world::roll_world_event;

/// Slice used when sleeping between ticks so a stop request is noticed quickly.
const STOP_POLL: Duration = Duration::from_millis(250);

/// Outcome of one tick, for logs and callers driving ticks by hand.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub cycle: u64,
    pub harvested: usize,
    pub fallbacks: usize,
    pub submitted: usize,
    /// Requests from an uncommitted tick that were re-attached this tick.
    pub restored: usize,
    pub refused: usize,
    pub scripted: usize,
    pub world_event: Option<String>,
    pub pending: usize,
}

#[derive(Clone, Debug)]
enum Resolution {
    Generated(String),
    Fallback(String),
}

impl Resolution {
    fn text(&self) -> &str {
        match self {
            Resolution::Generated(text) | Resolution::Fallback(text) => text,
        }
    }
}

/// A request accepted by the queue together with the placeholder written for it.
#[derive(Clone, Debug)]
struct Submission {
    task: PendingTask,
    placeholder: Option<DialogueRecord>,
}

/// Side effects of a tick that only apply once its session is committed.
#[derive(Default)]
struct TickEffects {
    resolved: Vec<TaskId>,
    submitted: Vec<Submission>,
    turns: Vec<(String, String, Turn)>,
}

impl TickEffects {
    fn answers_in_flight(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.submitted.iter().filter_map(|s| match s.task.payload {
            TaskPayload::Answer { original_id, .. } => Some(original_id),
            _ => None,
        })
    }
}

/// Drives the world one tick at a time: harvest finished generations, update
/// agents, let each agent communicate, and commit everything atomically.
pub struct Scheduler {
    config: SimConfig,
    thresholds: PolicyThresholds,
    store: Arc<dyn Store>,
    queue: RequestQueue,
    registry: Arc<PendingRegistry>,
    clock: Arc<dyn Clock>,
    tracker: ContinuityTracker,
    pending: BTreeMap<TaskId, PendingTask>,
    ready: HashMap<TaskId, Resolution>,
    /// Requests already queued by a tick whose commit failed.
    carried: Vec<Submission>,
    inbox: Receiver<PendingTask>,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(
        config: SimConfig,
        store: Arc<dyn Store>,
        queue: RequestQueue,
        registry: Arc<PendingRegistry>,
        clock: Arc<dyn Clock>,
        inbox: Receiver<PendingTask>,
        rng: StdRng,
    ) -> Self {
        Self {
            thresholds: PolicyThresholds::from_config(&config),
            tracker: ContinuityTracker::new(config.history_limit),
            config,
            store,
            queue,
            registry,
            clock,
            pending: BTreeMap::new(),
            ready: HashMap::new(),
            carried: Vec::new(),
            inbox,
            rng,
        }
    }

    /// Reloads conversation histories from the stored dialogues.
    pub fn rebuild_continuity(&mut self) -> Result<(), StoreError> {
        let data = self.store.load()?;
        self.tracker.rebuild_from(&data.dialogues);
        info!(pairs = self.tracker.pairs(), "conversation history rebuilt");
        Ok(())
    }

    pub fn continuity(&self) -> &ContinuityTracker {
        &self.tracker
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_tracking(&self, task_id: &TaskId) -> bool {
        self.pending.contains_key(task_id)
    }

    /// Ticks until `running` is cleared or `max_ticks` ticks succeeded. A
    /// failed tick is logged and retried after the error backoff.
    pub fn run(&mut self, running: &AtomicBool, max_ticks: Option<u64>) {
        info!(
            interval_ms = self.config.tick_interval_ms,
            "scheduler started"
        );
        let mut completed = 0u64;
        while running.load(Ordering::Acquire) {
            let started = self.clock.elapsed();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.tick()));
            match outcome {
                Ok(Ok(report)) => {
                    completed += 1;
                    self.log_report(&report);
                    if max_ticks.is_some_and(|limit| completed >= limit) {
                        break;
                    }
                    let spent = self.clock.elapsed().saturating_sub(started);
                    self.pause(self.config.tick_interval().saturating_sub(spent), running);
                }
                Ok(Err(err)) => {
                    error!(error = %err, "tick failed; backing off");
                    self.pause(self.config.error_backoff(), running);
                }
                Err(_) => {
                    error!("tick panicked; backing off");
                    self.pause(self.config.error_backoff(), running);
                }
            }
        }
        info!(ticks = completed, pending = self.pending.len(), "scheduler stopped");
    }

    fn pause(&self, total: Duration, running: &AtomicBool) {
        let mut left = total;
        while left > Duration::ZERO && running.load(Ordering::Acquire) {
            let slice = left.min(STOP_POLL);
            self.clock.sleep(slice);
            left -= slice;
        }
    }

    fn log_report(&self, report: &TickReport) {
        debug!(
            cycle = report.cycle,
            harvested = report.harvested,
            submitted = report.submitted,
            restored = report.restored,
            refused = report.refused,
            pending = report.pending,
            "tick complete"
        );
        let every = self.config.status_log_every;
        if every == 0 || report.cycle % every != 0 {
            return;
        }
        let data = match self.store.load() {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "status summary skipped");
                return;
            }
        };
        let snapshot = view::world_snapshot(&data, self.clock.utc());
        info!(
            cycle = report.cycle,
            agents = snapshot.agents.len(),
            thoughts = data.thoughts.len(),
            memories = data.memories.len(),
            relationships = data.relationships.len(),
            pending = report.pending,
            complexity = snapshot.complexity,
            mean_energy = snapshot.mean_energy,
            conversations = self.tracker.pairs(),
            uncollected = self.registry.len(),
            "status"
        );
    }

    /// Runs one tick inside a single store session. Either the whole tick is
    /// committed or none of it is, and in-memory bookkeeping follows suit.
    pub fn tick(&mut self) -> Result<TickReport, StoreError> {
        self.drain_inbox();

        let now = self.clock.utc();
        let mut session = self.store.begin()?;
        let cycle = session
            .world_or_create(now)
            .advance(self.config.complexity_step, self.config.complexity_cap, now);

        let mut report = TickReport {
            cycle,
            ..TickReport::default()
        };
        let mut effects = TickEffects::default();

        self.harvest(&mut session, cycle, now, &mut effects, &mut report);
        self.restore_carried(&mut session, &mut effects, &mut report);

        let agent_ids: Vec<AgentId> = session.agents().iter().map(|a| a.id).collect();
        for id in &agent_ids {
            if let Some(agent) = session.agent_mut(*id) {
                agent.drift(&mut self.rng, &self.config, now);
            }
            if self.rng.gen_bool(self.config.memory_probability) {
                session.push_memory(random_memory(&mut self.rng, *id, cycle, now));
            }
        }

        for id in &agent_ids {
            self.communicate(&mut session, *id, cycle, now, &mut effects, &mut report);
        }

        if self.rng.gen_bool(self.config.world_event_probability) {
            let (text, factor) = roll_world_event(&mut self.rng);
            for agent in session.agents_mut() {
                agent.scale_energy(factor);
            }
            session.push_event(EventRecord::new(EventKind::World, text, SYSTEM_ACTOR, None, cycle, now));
            report.world_event = Some(text.to_string());
        }

        session.prune(self.config.retained_events);

        if let Err(err) = self.store.commit(session) {
            if !effects.submitted.is_empty() {
                warn!(
                    carried = effects.submitted.len(),
                    "tick not committed; requests stay queued for the next tick"
                );
            }
            self.carried = effects.submitted;
            return Err(err);
        }

        self.apply(effects);
        self.registry
            .discard_stale(self.clock.elapsed(), self.config.stale_result_age());
        report.pending = self.pending.len();
        Ok(report)
    }

    fn drain_inbox(&mut self) {
        while let Ok(task) = self.inbox.try_recv() {
            debug!(task = %task.task_id, "tracking task from chat gateway");
            self.pending.insert(task.task_id.clone(), task);
        }
    }

    fn apply(&mut self, effects: TickEffects) {
        for task_id in effects.resolved {
            self.pending.remove(&task_id);
            self.ready.remove(&task_id);
        }
        for (a, b, turn) in effects.turns {
            self.tracker.record(&a, &b, turn);
        }
        for submission in effects.submitted {
            let task = submission.task;
            self.pending.insert(task.task_id.clone(), task);
        }
    }

    /// Re-attaches requests queued by a tick that failed to commit. Their
    /// placeholders were never stored, so they are written again under fresh ids.
    fn restore_carried(&mut self, session: &mut Session, effects: &mut TickEffects, report: &mut TickReport) {
        for mut submission in std::mem::take(&mut self.carried) {
            if let Some(placeholder) = submission.placeholder.clone() {
                let id = session.insert_dialogue(placeholder);
                if let Some(slot) = submission.task.payload.placeholder_id_mut() {
                    *slot = id;
                }
            }
            debug!(task = %submission.task.task_id, "re-attached request from uncommitted tick");
            report.restored += 1;
            effects.submitted.push(submission);
        }
    }

    /// Collects finished generations and writes them into the session.
    /// Results stay in `ready` until the tick commits, so a failed commit
    /// loses nothing.
    fn harvest(
        &mut self,
        session: &mut Session,
        cycle: u64,
        now: DateTime<Utc>,
        effects: &mut TickEffects,
        report: &mut TickReport,
    ) {
        let poll_timeout = self.config.harvest_poll_timeout();
        let threshold = self.config.harvest_attempt_threshold;
        let ids: Vec<TaskId> = self.pending.keys().cloned().collect();

        for task_id in ids {
            let resolution = match self.ready.get(&task_id) {
                Some(resolution) => resolution.clone(),
                None => {
                    let Some(task) = self.pending.get_mut(&task_id) else {
                        continue;
                    };
                    let resolution = match self.registry.poll(&task_id, poll_timeout) {
                        Some(text) => Resolution::Generated(text),
                        None => {
                            task.attempts += 1;
                            if task.attempts <= threshold {
                                continue;
                            }
                            warn!(task = %task_id, attempts = task.attempts, "no result; using scripted text");
                            let kind = task.kind();
                            let partner = task.payload.partner_name().map(str::to_string);
                            Resolution::Fallback(prompt::scripted_line(kind, partner.as_deref(), &mut self.rng))
                        }
                    };
                    self.ready.insert(task_id.clone(), resolution.clone());
                    resolution
                }
            };

            let Some(task) = self.pending.get(&task_id).cloned() else {
                continue;
            };
            self.commit_result(session, &task, &resolution, cycle, now, effects);
            info!(
                task = %task_id,
                kind = %task.kind(),
                agent = %task.agent.name,
                fallback = matches!(resolution, Resolution::Fallback(_)),
                "task harvested"
            );
            effects.resolved.push(task_id);
            report.harvested += 1;
            if matches!(resolution, Resolution::Fallback(_)) {
                report.fallbacks += 1;
            }
        }
    }

    fn commit_result(
        &mut self,
        session: &mut Session,
        task: &PendingTask,
        resolution: &Resolution,
        cycle: u64,
        now: DateTime<Utc>,
        effects: &mut TickEffects,
    ) {
        let text = resolution.text();
        let agent = &task.agent;

        match &task.payload {
            TaskPayload::Answer {
                partner,
                original_id,
                placeholder_id,
            } => {
                let reply_id = finalize_dialogue(
                    session,
                    *placeholder_id,
                    agent,
                    partner,
                    text,
                    cycle,
                    now,
                    Some(*original_id),
                );
                if let Some(original) = session.dialogue_mut(*original_id) {
                    if original.response.is_none() {
                        original.response = Some(text.to_string());
                        original.response_id = Some(reply_id);
                    }
                }
                self.record_exchange(session, agent, partner, text, cycle, now, effects);
                session.push_event(EventRecord::new(
                    EventKind::Dialogue,
                    format!("{} replied to {}: {}", agent.name, partner.name, text),
                    &agent.name,
                    Some(&partner.name),
                    cycle,
                    now,
                ));
            }
            TaskPayload::FirstMessage {
                partner,
                placeholder_id,
            }
            | TaskPayload::Continuation {
                partner,
                placeholder_id,
            } => {
                finalize_dialogue(session, *placeholder_id, agent, partner, text, cycle, now, None);
                self.record_exchange(session, agent, partner, text, cycle, now, effects);
                session.push_event(EventRecord::new(
                    EventKind::Dialogue,
                    format!("{} -> {}: {}", agent.name, partner.name, text),
                    &agent.name,
                    Some(&partner.name),
                    cycle,
                    now,
                ));
            }
            TaskPayload::Reflection => {
                let kind = match resolution {
                    Resolution::Generated(_) => ThoughtKind::Reflection,
                    Resolution::Fallback(_) => ThoughtKind::Scripted,
                };
                session.push_thought(ThoughtRecord {
                    id: 0,
                    agent_id: agent.id,
                    agent: agent.name.clone(),
                    thought: text.to_string(),
                    kind,
                    significance: self.rng.gen_range(0.3..=1.0),
                    cycle,
                    timestamp: now,
                });
                session.push_event(EventRecord::new(
                    EventKind::Reflection,
                    format!("{} reflects: \"{}\"", agent.name, text),
                    &agent.name,
                    None,
                    cycle,
                    now,
                ));
            }
            TaskPayload::HumanAnswer {
                user,
                chat_id,
                conversation_id,
            } => {
                let Some(message) = session.human_chat_mut(*chat_id) else {
                    warn!(task = %task.task_id, "chat message vanished; dropping reply");
                    return;
                };
                if message.response_received {
                    debug!(task = %task.task_id, "chat message already settled; dropping reply");
                    return;
                }
                message.response = Some(text.to_string());
                message.response_received = true;
                session.insert_human_chat(HumanChatRecord {
                    id: 0,
                    user: user.clone(),
                    agent_id: agent.id,
                    sender: SenderKind::Agent,
                    message: None,
                    response: Some(text.to_string()),
                    conversation_id: conversation_id.clone(),
                    task_id: Some(task.task_id.to_string()),
                    timestamp: now,
                    response_received: true,
                });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_exchange(
        &mut self,
        session: &mut Session,
        agent: &AgentRef,
        partner: &AgentRef,
        text: &str,
        cycle: u64,
        now: DateTime<Utc>,
        effects: &mut TickEffects,
    ) {
        let delta = self
            .rng
            .gen_range(self.config.relationship_delta_min..=self.config.relationship_delta_max);
        session.adjust_relationship(&agent.name, &partner.name, delta, now);
        effects.turns.push((
            agent.name.clone(),
            partner.name.clone(),
            Turn {
                speaker_id: agent.id,
                text: text.to_string(),
                at: now,
            },
        ));
        debug!(cycle, from = %agent.name, to = %partner.name, "dialogue committed");
    }

    fn communicate(
        &mut self,
        session: &mut Session,
        agent_id: AgentId,
        cycle: u64,
        now: DateTime<Utc>,
        effects: &mut TickEffects,
        report: &mut TickReport,
    ) {
        let Some(agent) = session.agent(agent_id).cloned() else {
            return;
        };

        let in_flight: HashSet<RecordId> = self
            .pending
            .values()
            .filter_map(|task| match task.payload {
                TaskPayload::Answer { original_id, .. } => Some(original_id),
                _ => None,
            })
            .chain(effects.answers_in_flight())
            .collect();

        let data = session.data();
        let unanswered = data
            .oldest_unanswered_for(&agent.name, &in_flight)
            .filter(|d| data.agent(d.speaker_id).is_some())
            .map(|d| InboundMessage {
                dialogue_id: d.id,
                sender_id: d.speaker_id,
                sender: d.speaker.clone(),
                text: d.message.clone(),
            });
        let last_exchange = data.latest_exchange_for(&agent.name).and_then(|d| {
            let (partner_id, partner) = d.partner_of(&agent.name)?;
            data.agent(partner_id)?;
            Some(LastExchange {
                partner_id,
                partner: partner.to_string(),
                at: d.timestamp,
            })
        });
        let candidates: Vec<Candidate> = data
            .agents
            .iter()
            .filter(|other| other.id != agent.id)
            .map(|other| Candidate {
                id: other.id,
                name: other.name.clone(),
                last_contact: data.last_contact(&agent.name, &other.name),
            })
            .collect();

        let input = PolicyInput {
            cycle,
            now,
            unanswered,
            last_exchange,
            candidates: &candidates,
        };
        let actions = decide(&input, &self.thresholds, &mut self.rng);

        for action in actions {
            match action {
                CommAction::Answer(message) => {
                    let Some(partner) = session.agent(message.sender_id).cloned() else {
                        continue;
                    };
                    let history =
                        self.tracker
                            .recent(&agent.name, &partner.name, self.config.answer_context_limit);
                    let params = prompt::reply_prompt(&agent, &partner, &history, &message.text);
                    self.dispatch_dialogue(
                        session,
                        &agent,
                        &partner,
                        RequestKind::Response,
                        params,
                        Some(message.dialogue_id),
                        cycle,
                        now,
                        effects,
                        report,
                    );
                }
                CommAction::Continue { partner_id, .. } => {
                    let Some(partner) = session.agent(partner_id).cloned() else {
                        continue;
                    };
                    let history = self.tracker.history(&agent.name, &partner.name);
                    let params = prompt::continuation_prompt(&agent, &partner, &history);
                    self.dispatch_dialogue(
                        session,
                        &agent,
                        &partner,
                        RequestKind::Continuation,
                        params,
                        None,
                        cycle,
                        now,
                        effects,
                        report,
                    );
                }
                CommAction::Initiate { target_id, .. } => {
                    let Some(partner) = session.agent(target_id).cloned() else {
                        continue;
                    };
                    let params = prompt::first_message_prompt(&agent, &partner);
                    self.dispatch_dialogue(
                        session,
                        &agent,
                        &partner,
                        RequestKind::FirstMessage,
                        params,
                        None,
                        cycle,
                        now,
                        effects,
                        report,
                    );
                }
                CommAction::Reflect => {
                    let recent: Vec<String> = session
                        .data()
                        .recent_events_for(&agent.name, self.config.reflection_event_limit)
                        .into_iter()
                        .map(|e| e.text.clone())
                        .collect();
                    let params = prompt::reflection_prompt(&agent, &recent);
                    let request = GenerationRequest {
                        kind: RequestKind::Reflection,
                        agent: agent.name.clone(),
                        cache_key: CacheKey::solo(&agent.name, RequestKind::Reflection),
                        params,
                        fallback: prompt::scripted_line(RequestKind::Reflection, None, &mut self.rng),
                    };
                    match self.queue.submit(request) {
                        Ok(task_id) => {
                            report.submitted += 1;
                            effects.submitted.push(Submission {
                                task: PendingTask::new(
                                    task_id,
                                    AgentRef::new(agent.id, &agent.name),
                                    TaskPayload::Reflection,
                                    cycle,
                                    now,
                                ),
                                placeholder: None,
                            });
                        }
                        Err(refusal) => {
                            report.refused += 1;
                            debug!(agent = %agent.name, %refusal, "reflection refused");
                        }
                    }
                }
            }
        }
    }

    /// Submits a dialogue request and, when accepted, stores its placeholder
    /// and schedules the task. Refused openers may fall back to a scripted
    /// interaction event.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_dialogue(
        &mut self,
        session: &mut Session,
        agent: &Agent,
        partner: &Agent,
        kind: RequestKind,
        params: GenerationParams,
        response_to: Option<RecordId>,
        cycle: u64,
        now: DateTime<Utc>,
        effects: &mut TickEffects,
        report: &mut TickReport,
    ) {
        let request = GenerationRequest {
            kind,
            agent: agent.name.clone(),
            cache_key: CacheKey::pair(&agent.name, &partner.name, kind),
            params,
            fallback: prompt::scripted_line(kind, Some(&partner.name), &mut self.rng),
        };

        let task_id = match self.queue.submit(request) {
            Ok(task_id) => task_id,
            Err(refusal) => {
                report.refused += 1;
                debug!(agent = %agent.name, kind = %kind, %refusal, "request refused");
                if kind == RequestKind::FirstMessage && self.config.scripted_fallback_on_refusal {
                    session.push_event(EventRecord::new(
                        EventKind::Interaction,
                        format!("{} waved at {}", agent.name, partner.name),
                        &agent.name,
                        Some(&partner.name),
                        cycle,
                        now,
                    ));
                    report.scripted += 1;
                }
                return;
            }
        };

        let placeholder_kind = if kind == RequestKind::Response {
            DialogueKind::TypingPlaceholder
        } else {
            DialogueKind::PendingPlaceholder
        };
        let placeholder = DialogueRecord::placeholder(
            placeholder_kind,
            (agent.id, &agent.name),
            (partner.id, &partner.name),
            cycle,
            now,
            response_to,
        );
        let placeholder_id = session.insert_dialogue(placeholder.clone());
        let partner_ref = AgentRef::new(partner.id, &partner.name);
        let payload = match (kind, response_to) {
            (RequestKind::Response, Some(original_id)) => TaskPayload::Answer {
                partner: partner_ref,
                original_id,
                placeholder_id,
            },
            (RequestKind::FirstMessage, _) => TaskPayload::FirstMessage {
                partner: partner_ref,
                placeholder_id,
            },
            _ => TaskPayload::Continuation {
                partner: partner_ref,
                placeholder_id,
            },
        };
        report.submitted += 1;
        effects.submitted.push(Submission {
            task: PendingTask::new(task_id, AgentRef::new(agent.id, &agent.name), payload, cycle, now),
            placeholder: Some(placeholder),
        });
    }
}

/// Turns the placeholder into the final message, or writes a fresh record
/// when the placeholder is gone. Returns the id of the final message.
#[allow(clippy::too_many_arguments)]
fn finalize_dialogue(
    session: &mut Session,
    placeholder_id: RecordId,
    speaker: &AgentRef,
    target: &AgentRef,
    text: &str,
    cycle: u64,
    now: DateTime<Utc>,
    response_to: Option<RecordId>,
) -> RecordId {
    if let Some(record) = session.dialogue_mut(placeholder_id) {
        if record.kind.is_placeholder() {
            record.kind = DialogueKind::AiResponse;
            record.message = text.to_string();
            record.timestamp = now;
            record.cycle = cycle;
            record.response_to = response_to;
            return record.id;
        }
    }

    let mut record = DialogueRecord::placeholder(
        DialogueKind::AiResponse,
        (speaker.id, &speaker.name),
        (target.id, &target.name),
        cycle,
        now,
        response_to,
    );
    record.message = text.to_string();
    session.insert_dialogue(record)
}
