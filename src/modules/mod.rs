pub mod agent;
pub mod agents;
pub mod chat;
pub mod clock;
pub mod config;
pub mod continuity;
pub mod limiter;
pub mod llm;
pub mod policy;
pub mod prompt;
pub mod queue;
pub mod records;
pub mod registry;
pub mod scheduler;
pub mod simulation;
pub mod state;
pub mod store;
pub mod task;
pub mod view;
pub mod world;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
