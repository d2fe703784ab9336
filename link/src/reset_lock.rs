//! One-shot holder for externally supplied callbacks.
//!
//! Whoever calls [`ResetLock::pop`] first takes the value; everyone after sees
//! `None`. A request completion racing its cancellation therefore fires at most
//! once, and never after the cancellation won.

use std::sync::{Mutex, PoisonError};

pub struct ResetLock<T> {
    value: Mutex<Option<T>>,
}

impl<T> ResetLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(Some(value)),
        }
    }

    pub fn empty() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    /// Take the value, leaving the lock empty.
    pub fn pop(&self) -> Option<T> {
        self.slot().take()
    }

    /// Drop the value without returning it.
    pub fn reset(&self) {
        self.slot().take();
    }

    pub fn is_set(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> ResetLock<T> {
    /// Clone the value out, leaving it in place.
    pub fn read(&self) -> Option<T> {
        self.slot().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_pop_takes_once() {
        let lock = ResetLock::new(5);
        assert_eq!(lock.pop(), Some(5));
        assert_eq!(lock.pop(), None);
        assert!(!lock.is_set());
    }

    #[test]
    fn test_read_leaves_value() {
        let lock = ResetLock::new("value".to_string());
        assert_eq!(lock.read().as_deref(), Some("value"));
        assert!(lock.is_set());
    }

    #[test]
    fn test_reset_clears() {
        let lock = ResetLock::new(1);
        lock.reset();
        assert_eq!(lock.read(), None);
        assert_eq!(lock.pop(), None);
    }

    #[test]
    fn test_concurrent_pops_yield_single_winner() {
        let lock = Arc::new(ResetLock::new(()));
        let winners = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if lock.pop().is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
