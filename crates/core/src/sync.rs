//! Lifecycle accounting primitives.

use crate::error::Error;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Atomic reference counter for stream/connection lifecycle accounting.
///
/// `incr` is fluent; `decr` returns the post-decrement value so the caller
/// can run its cleanup exactly once, on the transition to zero.
#[derive(Debug, Default)]
pub struct RefCount(AtomicU32);

impl RefCount {
    pub fn new(n: u32) -> Self {
        Self(AtomicU32::new(n))
    }

    pub fn incr(&self) -> &Self {
        self.0.fetch_add(1, Ordering::SeqCst);
        self
    }

    /// Decrements and returns the new value. Must be paired with a prior
    /// `incr` (or nonzero initial value).
    pub fn decr(&self) -> u32 {
        let prev = self.0.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "refcount underflow");
        prev - 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared holder for the cause of a closure.
///
/// The closing side of an inproc connection stores its cause in the peer's
/// cell; the peer's next operation loads it without blocking. Later stores
/// overwrite earlier ones.
#[derive(Debug, Default)]
pub struct ErrorCell(Mutex<Option<Error>>);

impl ErrorCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, err: Error) {
        *self.0.lock().expect("error cell poisoned") = Some(err);
    }

    pub fn load(&self) -> Option<Error> {
        self.0.lock().expect("error cell poisoned").clone()
    }

    /// Loads the stored cause, falling back to `Closed`.
    pub fn cause(&self) -> Error {
        self.load().unwrap_or(Error::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_transitions() {
        let ctr = RefCount::new(1);
        ctr.incr().incr();
        assert_eq!(ctr.get(), 3);
        assert_eq!(ctr.decr(), 2);
        assert_eq!(ctr.decr(), 1);
        assert_eq!(ctr.decr(), 0);
    }

    #[test]
    fn error_cell_defaults_to_none() {
        let cell = ErrorCell::new();
        assert_eq!(cell.load(), None);
        assert_eq!(cell.cause(), Error::Closed);
    }

    #[test]
    fn error_cell_store_persists_and_overwrites() {
        let cell = ErrorCell::new();
        cell.store(Error::Cancelled);
        assert_eq!(cell.load(), Some(Error::Cancelled));
        cell.store(Error::ServerClosed);
        assert_eq!(cell.cause(), Error::ServerClosed);
    }
}
