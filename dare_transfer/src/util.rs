use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, carrying on with the inner value if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
