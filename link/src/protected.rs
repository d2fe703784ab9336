//! Mutual-exclusion container for shared state.
//!
//! [`Protected`] serializes every read and mutation of the value it wraps.
//! A mutation may return a handoff value; the handoff is only delivered (on a
//! [`DispatchQueue`]) after the lock has been released, so callbacks never run
//! while the state is locked and may freely call back into the container.

use crate::dispatch::DispatchQueue;
use std::cell::RefCell;
use std::sync::{Mutex, PoisonError};

thread_local! {
    /// Addresses of the containers locked by the current thread.
    static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

pub struct Protected<T> {
    value: Mutex<T>,
}

impl<T> Protected<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Run `f` with shared access. Intended for pure reads.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.with_lock(|value| f(value))
    }

    /// Run `f` with exclusive access and hand its result back to the caller.
    ///
    /// The result can be delivered elsewhere with [`Handoff::deliver_on`].
    pub fn mutate<H>(&self, f: impl FnOnce(&mut T) -> H) -> Handoff<H> {
        Handoff(self.with_lock(f))
    }

    fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let address = self as *const Self as usize;
        let reentrant = HELD.with(|held| held.borrow().contains(&address));
        debug_assert!(
            !reentrant,
            "Protected state accessed from inside its own critical section"
        );

        let mut guard = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        HELD.with(|held| held.borrow_mut().push(address));
        let _release = ReleaseMarker(address);
        f(&mut guard)
    }
}

impl<T: Default> Default for Protected<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

struct ReleaseMarker(usize);

impl Drop for ReleaseMarker {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(index) = held.iter().rposition(|address| *address == self.0) {
                held.remove(index);
            }
        });
    }
}

/// The value a mutation handed out, available once the lock is released.
pub struct Handoff<H>(H);

impl<H> Handoff<H> {
    pub fn into_inner(self) -> H {
        self.0
    }
}

impl<H: Send + 'static> Handoff<H> {
    /// Deliver the handoff to `f` on `queue`.
    pub fn deliver_on(self, queue: &DispatchQueue, f: impl FnOnce(H) + Send + 'static) {
        let value = self.0;
        queue.dispatch(move || f(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mutate_then_read() {
        let state = Protected::new(1);
        let previous = state
            .mutate(|value| {
                let previous = *value;
                *value += 1;
                previous
            })
            .into_inner();
        assert_eq!(previous, 1);
        assert_eq!(state.read(|value| *value), 2);
    }

    #[test]
    fn test_handoff_runs_after_lock_released() {
        let state = Arc::new(Protected::new(Vec::<u32>::new()));
        let queue = DispatchQueue::inline("protected-test");
        let observer = state.clone();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();

        state
            .mutate(|value| {
                value.push(5);
                value.len()
            })
            .deliver_on(&queue, move |len| {
                // Reading here would deadlock if the lock were still held.
                let snapshot = observer.read(|value| value.clone());
                *seen_clone.lock().unwrap() = Some((len, snapshot));
            });

        assert_eq!(*seen.lock().unwrap(), Some((1, vec![5])));
    }

    #[test]
    fn test_distinct_containers_may_nest() {
        let outer = Protected::new(1);
        let inner = Protected::new(2);
        let sum = outer.read(|a| inner.read(|b| a + b));
        assert_eq!(sum, 3);
    }

    #[test]
    #[should_panic(expected = "inside its own critical section")]
    #[cfg(debug_assertions)]
    fn test_reentrant_access_is_detected() {
        let state = Protected::new(0);
        state.read(|_| state.read(|value| *value));
    }
}
