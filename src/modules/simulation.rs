use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;
use tracing::{info, warn};

use crate::modules::agent::AgentId;
use crate::modules::chat::{ChatGateway, ChatRefusal, HumanTicket};
use crate::modules::clock::Clock;
use crate::modules::config::SimConfig;
use crate::modules::llm::TextGenerator;
use crate::modules::queue::{Worker, request_pipeline};
use crate::modules::registry::PendingRegistry;
use crate::modules::scheduler::Scheduler;
use crate::modules::store::{Store, StoreError, WorldData};

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// All engine parts wired together but not yet running.
pub struct Parts {
    pub scheduler: Scheduler,
    pub worker: Worker,
    pub chat: ChatGateway,
    pub registry: Arc<PendingRegistry>,
}

/// Builds the scheduler, worker and chat gateway around one store and clock.
/// Conversation history is rebuilt from the store before returning.
pub fn assemble(
    config: SimConfig,
    store: Arc<dyn Store>,
    generator: Arc<dyn TextGenerator>,
    clock: Arc<dyn Clock>,
    seed: Option<u64>,
) -> Result<Parts, StoreError> {
    let registry = Arc::new(PendingRegistry::new());
    let (queue, worker) = request_pipeline(&config, Arc::clone(&clock), generator, Arc::clone(&registry));
    let (inbox_tx, inbox_rx) = mpsc::channel();
    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let chat = ChatGateway::new(
        config.clone(),
        Arc::clone(&store),
        queue.clone(),
        inbox_tx,
        Arc::clone(&clock),
    );
    let mut scheduler = Scheduler::new(
        config,
        store,
        queue,
        Arc::clone(&registry),
        clock,
        inbox_rx,
        rng,
    );
    scheduler.rebuild_continuity()?;

    Ok(Parts {
        scheduler,
        worker,
        chat,
        registry,
    })
}

/// A running engine: one scheduler thread and one request worker thread.
pub struct Simulation {
    store: Arc<dyn Store>,
    chat: ChatGateway,
    running: Arc<AtomicBool>,
    scheduler: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Simulation {
    /// Starts both threads. With `max_ticks` the scheduler stops by itself
    /// after that many committed ticks.
    pub fn start(
        config: SimConfig,
        store: Arc<dyn Store>,
        generator: Arc<dyn TextGenerator>,
        clock: Arc<dyn Clock>,
        seed: Option<u64>,
        max_ticks: Option<u64>,
    ) -> Result<Self, SimError> {
        let Parts {
            mut scheduler,
            worker,
            chat,
            ..
        } = assemble(config, Arc::clone(&store), generator, clock, seed)?;

        let running = Arc::new(AtomicBool::new(true));

        let worker_flag = Arc::clone(&running);
        let worker = thread::Builder::new()
            .name("iskra-worker".into())
            .spawn(move || worker.run(worker_flag))
            .map_err(|source| SimError::Spawn {
                name: "worker",
                source,
            })?;

        let scheduler_flag = Arc::clone(&running);
        let spawned = thread::Builder::new()
            .name("iskra-scheduler".into())
            .spawn(move || {
                scheduler.run(&scheduler_flag, max_ticks);
                scheduler_flag.store(false, Ordering::Release);
            });
        let scheduler = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                running.store(false, Ordering::Release);
                let _ = worker.join();
                return Err(SimError::Spawn {
                    name: "scheduler",
                    source,
                });
            }
        };

        info!("simulation started");
        Ok(Self {
            store,
            chat,
            running,
            scheduler: Some(scheduler),
            worker: Some(worker),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn send_human_message(
        &self,
        user: &str,
        agent_id: AgentId,
        message: &str,
    ) -> Result<HumanTicket, ChatRefusal> {
        if !self.is_running() {
            return Err(ChatRefusal::Closed);
        }
        self.chat.send(user, agent_id, message)
    }

    /// Current persisted world, for read-only views.
    pub fn snapshot(&self) -> Result<WorldData, StoreError> {
        self.store.load()
    }

    /// Blocks until the scheduler finishes its tick budget, then stops the worker.
    pub fn wait(mut self) {
        if let Some(handle) = self.scheduler.take() {
            if handle.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }
        self.shutdown();
    }

    /// Signals both threads and waits for them. Work in progress is
    /// abandoned; ticks already committed stay committed.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        for handle in [self.scheduler.take(), self.worker.take()].into_iter().flatten() {
            if handle.join().is_err() {
                warn!("engine thread panicked");
            }
        }
        info!("simulation stopped");
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        if self.scheduler.is_some() || self.worker.is_some() {
            self.shutdown();
        }
    }
}
