use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) mod event;

pub(crate) use event::Event;

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Every critical section in this crate leaves the protected state
/// consistent before doing anything that may panic, so a poisoned lock still
/// guards valid data.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
