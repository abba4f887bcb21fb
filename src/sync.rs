//! Small helpers around `std::sync` primitives.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// The guarded state here is bookkeeping (maps, counters, queues) that stays
/// structurally valid even when a panic interrupts an update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
