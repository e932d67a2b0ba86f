//! Lock helpers

use std::sync::{Mutex, MutexGuard};

/// Lock `mutex`, taking the guard back if a previous holder panicked
///
/// Every mutex in the crate guards plain state that stays consistent between
/// statements, so a poisoned lock is still safe to use.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
