use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::modules::clock::Clock;
use crate::modules::config::SimConfig;
use crate::modules::limiter::{RateLimiter, ResponseCache};
use crate::modules::llm::{GenerateError, TextGenerator};
use crate::modules::lock;
use crate::modules::prompt::redact;
use crate::modules::registry::PendingRegistry;
use crate::modules::task::{GenerationRequest, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Refusal {
    #[error("{agent} is cooling down; retry in {}s", .retry_after.as_secs().max(1))]
    Cooldown { agent: String, retry_after: Duration },
    #[error("request queue is full")]
    QueueFull { retry_after: Duration },
    #[error("request worker has stopped")]
    Closed,
}

impl Refusal {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Refusal::Cooldown { retry_after, .. } | Refusal::QueueFull { retry_after } => {
                Some(*retry_after)
            }
            Refusal::Closed => None,
        }
    }
}

#[derive(Debug)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub request: GenerationRequest,
}

/// Submission side of the request pipeline. Cheap to clone; every clone
/// shares one rate limiter and one bounded channel.
#[derive(Clone)]
pub struct RequestQueue {
    sender: SyncSender<QueuedTask>,
    limiter: Arc<Mutex<RateLimiter>>,
    clock: Arc<dyn Clock>,
    sequence: Arc<AtomicU64>,
    full_retry: Duration,
}

impl RequestQueue {
    /// Enqueues `request` unless its agent is cooling down or the queue is
    /// full. A refused request leaves nothing behind in the queue.
    pub fn submit(&self, request: GenerationRequest) -> Result<TaskId, Refusal> {
        let now = self.clock.elapsed();
        lock(&self.limiter)
            .allow(&request.agent, now)
            .map_err(|retry_after| Refusal::Cooldown {
                agent: request.agent.clone(),
                retry_after,
            })?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let task_id = TaskId::generate(request.kind, &request.agent, sequence);
        let queued = QueuedTask {
            task_id: task_id.clone(),
            request,
        };
        match self.sender.try_send(queued) {
            Ok(()) => {
                debug!(task = %task_id, "request queued");
                Ok(task_id)
            }
            Err(TrySendError::Full(_)) => Err(Refusal::QueueFull {
                retry_after: self.full_retry,
            }),
            Err(TrySendError::Disconnected(_)) => Err(Refusal::Closed),
        }
    }
}

/// Drains the queue one request at a time: cache, generate, redact, publish.
/// Failures publish the request's scripted fallback so a result always appears.
pub struct Worker {
    receiver: Receiver<QueuedTask>,
    cache: ResponseCache,
    generator: Arc<dyn TextGenerator>,
    registry: Arc<PendingRegistry>,
    clock: Arc<dyn Clock>,
    redacted_terms: Vec<String>,
    poll: Duration,
    throttle: Duration,
    external_calls: u64,
}

/// Wires a queue to its worker.
pub fn request_pipeline(
    config: &SimConfig,
    clock: Arc<dyn Clock>,
    generator: Arc<dyn TextGenerator>,
    registry: Arc<PendingRegistry>,
) -> (RequestQueue, Worker) {
    let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);
    let queue = RequestQueue {
        sender,
        limiter: Arc::new(Mutex::new(RateLimiter::new(config.request_cooldown()))),
        clock: Arc::clone(&clock),
        sequence: Arc::new(AtomicU64::new(0)),
        full_retry: config.worker_throttle().max(Duration::from_secs(1)),
    };
    let worker = Worker {
        receiver,
        cache: ResponseCache::new(config.cache_ttl()),
        generator,
        registry,
        clock,
        redacted_terms: config.redacted_terms.clone(),
        poll: config.worker_poll(),
        throttle: config.worker_throttle(),
        external_calls: 0,
    };
    (queue, worker)
}

impl Worker {
    /// Processes requests until `running` is cleared or every queue handle is dropped.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        info!("request worker started");
        while running.load(Ordering::Acquire) {
            match self.receiver.recv_timeout(self.poll) {
                Ok(task) => {
                    self.process(task);
                    self.clock.sleep(self.throttle);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(external_calls = self.external_calls, "request worker stopped");
    }

    /// Handles at most one queued request, waiting up to `wait` for it.
    pub fn process_next(&mut self, wait: Duration) -> bool {
        match self.receiver.recv_timeout(wait) {
            Ok(task) => {
                self.process(task);
                true
            }
            Err(_) => false,
        }
    }

    pub fn external_calls(&self) -> u64 {
        self.external_calls
    }

    fn process(&mut self, task: QueuedTask) {
        let QueuedTask { task_id, request } = task;
        let now = self.clock.elapsed();

        let cached = if request.kind.cacheable() {
            self.cache.get(&request.cache_key, now)
        } else {
            None
        };

        let text = match cached {
            Some(text) => {
                debug!(task = %task_id, "served from cache");
                text
            }
            None => match self.generate(&request) {
                Ok(text) => {
                    if request.kind.cacheable() {
                        self.cache.put(request.cache_key.clone(), text.clone(), now);
                    }
                    text
                }
                Err(err) => {
                    warn!(task = %task_id, kind = %request.kind, error = %err, "generation failed; using scripted text");
                    request.fallback.clone()
                }
            },
        };

        self.registry.publish(task_id, text, self.clock.elapsed());
    }

    fn generate(&mut self, request: &GenerationRequest) -> Result<String, GenerateError> {
        self.external_calls += 1;
        let generator = Arc::clone(&self.generator);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| generator.generate(&request.params)))
            .unwrap_or_else(|_| Err(GenerateError::Provider("generator panicked".into())))?;

        let cleaned = redact(outcome.trim(), &self.redacted_terms);
        if cleaned.trim().is_empty() {
            return Err(GenerateError::Provider("empty completion".into()));
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::clock::ManualClock;
    use crate::modules::limiter::CacheKey;
    use crate::modules::llm::GenerationParams;
    use crate::modules::task::RequestKind;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        calls: AtomicUsize,
        reply: Result<String, GenerateError>,
    }

    impl TextGenerator for Counting {
        fn generate(&self, _params: &GenerationParams) -> Result<String, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn request(kind: RequestKind, agent: &str, partner: &str) -> GenerationRequest {
        GenerationRequest {
            kind,
            agent: agent.to_string(),
            cache_key: CacheKey::pair(agent, partner, kind),
            params: GenerationParams {
                system_prompt: "sys".into(),
                user_input: "hi".into(),
                temperature: 0.9,
                max_tokens: 50,
            },
            fallback: format!("scripted for {partner}"),
        }
    }

    fn pipeline(
        reply: Result<String, GenerateError>,
        config: SimConfig,
    ) -> (RequestQueue, Worker, Arc<PendingRegistry>, Arc<ManualClock>, Arc<Counting>) {
        let clock = Arc::new(ManualClock::starting_now());
        let generator = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            reply,
        });
        let registry = Arc::new(PendingRegistry::new());
        let (queue, worker) = request_pipeline(
            &config,
            clock.clone(),
            generator.clone(),
            Arc::clone(&registry),
        );
        (queue, worker, registry, clock, generator)
    }

    #[test]
    fn refused_submission_enqueues_nothing() {
        let (queue, mut worker, _, _, _) = pipeline(Ok("hey".into()), SimConfig::default());

        queue.submit(request(RequestKind::FirstMessage, "a", "b")).unwrap();
        let refusal = queue
            .submit(request(RequestKind::Reflection, "a", "a"))
            .unwrap_err();
        assert!(matches!(refusal, Refusal::Cooldown { ref agent, .. } if agent == "a"));
        assert_eq!(refusal.retry_after(), Some(Duration::from_secs(60)));

        assert!(worker.process_next(Duration::ZERO));
        assert!(!worker.process_next(Duration::ZERO));
    }

    #[test]
    fn cache_hit_skips_the_generator() {
        let (queue, mut worker, registry, clock, generator) =
            pipeline(Ok("Hello there".into()), SimConfig::default());

        let first = queue.submit(request(RequestKind::FirstMessage, "a", "b")).unwrap();
        worker.process_next(Duration::ZERO);
        clock.advance(Duration::from_secs(1));
        let second = queue.submit(request(RequestKind::FirstMessage, "b", "a")).unwrap();
        worker.process_next(Duration::ZERO);

        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(worker.external_calls(), 1);
        assert_eq!(registry.poll(&first, Duration::ZERO), Some("Hello there".into()));
        assert_eq!(registry.poll(&second, Duration::ZERO), Some("Hello there".into()));
    }

    #[test]
    fn human_replies_bypass_the_cache() {
        let (queue, mut worker, _, _, generator) = pipeline(Ok("hi human".into()), SimConfig::default());

        queue.submit(request(RequestKind::HumanResponse, "a", "alice")).unwrap();
        worker.process_next(Duration::ZERO);
        queue.submit(request(RequestKind::HumanResponse, "b", "alice")).unwrap();
        worker.process_next(Duration::ZERO);

        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_publishes_the_fallback() {
        let (queue, mut worker, registry, _, _) = pipeline(
            Err(GenerateError::Unavailable("offline".into())),
            SimConfig::default(),
        );

        let id = queue.submit(request(RequestKind::Response, "a", "b")).unwrap();
        worker.process_next(Duration::ZERO);
        assert_eq!(registry.poll(&id, Duration::ZERO), Some("scripted for b".into()));
    }

    #[test]
    fn generated_text_is_redacted() {
        let (queue, mut worker, registry, _, _) =
            pipeline(Ok("  Let's talk about Drugs  ".into()), SimConfig::default());

        let id = queue.submit(request(RequestKind::Reflection, "a", "a")).unwrap();
        worker.process_next(Duration::ZERO);
        assert_eq!(
            registry.poll(&id, Duration::ZERO),
            Some("Let's talk about [redacted]".into())
        );
    }

    #[test]
    fn full_queue_is_refused() {
        let config = SimConfig {
            queue_capacity: 1,
            ..SimConfig::default()
        };
        let (queue, _worker, _, _, _) = pipeline(Ok("x".into()), config);

        queue.submit(request(RequestKind::FirstMessage, "a", "b")).unwrap();
        let refusal = queue
            .submit(request(RequestKind::FirstMessage, "c", "d"))
            .unwrap_err();
        assert!(matches!(refusal, Refusal::QueueFull { .. }));
    }
}
