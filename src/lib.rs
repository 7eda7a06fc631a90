pub mod call;
pub mod config;
pub mod db;
pub mod events;
pub mod hub;
pub mod orchestrator;
pub mod presence;
pub mod prom_metrics;
pub mod server;
pub mod telephony;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering from poisoning.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
