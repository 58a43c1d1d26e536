//! A condition variable for async tasks, pairing a [`tokio::sync::Mutex`]
//! with a [`tokio::sync::Notify`].
//!
//! The transfer keeps all cross-peer state behind a single mutex, and peer
//! downloaders block on a predicate over that state ("is there a piece this
//! peer can work on", "are we still choked"). That is the classic condition
//! variable shape, which tokio does not provide directly:
//!
//! ```ignore
//! let mut state = shared.lock().await;
//! while !predicate(&state) {
//!     state = shared.wait(state).await;
//! }
//! ```

use tokio::sync::{Mutex, MutexGuard, Notify};

/// A mutex-guarded value with an attached condition variable.
pub(crate) struct CondMutex<T> {
    state: Mutex<T>,
    cond: Notify,
}

impl<T> CondMutex<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Notify::new(),
        }
    }

    /// Acquires the mutex.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().await
    }

    /// Releases the guard, suspends until the next [`CondMutex::broadcast`],
    /// and re-acquires the mutex.
    ///
    /// The waiter is registered with the notifier *before* the guard is
    /// dropped, so a broadcast issued between the release and the suspension
    /// cannot be missed. As with any condition variable, wakeups must be
    /// paired with re-checking the predicate in a loop.
    pub async fn wait<'a>(
        &'a self,
        guard: MutexGuard<'a, T>,
    ) -> MutexGuard<'a, T> {
        let notified = self.cond.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(guard);
        notified.await;
        self.state.lock().await
    }

    /// Wakes all tasks currently blocked in [`CondMutex::wait`].
    pub fn broadcast(&self) {
        self.cond.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn test_wait_wakes_on_broadcast() {
        let shared = Arc::new(CondMutex::new(false));

        let waiter = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut state = shared.lock().await;
                while !*state {
                    state = shared.wait(state).await;
                }
            })
        };

        // let the waiter block first
        tokio::time::sleep(Duration::from_millis(50)).await;
        *shared.lock().await = true;
        shared.broadcast();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter did not wake on broadcast")
            .unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_between_release_and_sleep_is_not_missed() {
        let shared = Arc::new(CondMutex::new(0u32));

        let waiter = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut state = shared.lock().await;
                while *state == 0 {
                    state = shared.wait(state).await;
                }
                *state
            })
        };

        for _ in 0..100 {
            {
                let mut state = shared.lock().await;
                *state = 1;
            }
            shared.broadcast();
            tokio::task::yield_now().await;
        }

        let val = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter missed the broadcast")
            .unwrap();
        assert_eq!(val, 1);
    }
}
