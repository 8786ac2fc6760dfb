//! Service lifecycle state.
//!
//! Uses `ArcSwap` for lock-free reads of the current state and a `watch`
//! channel so callers can await a transition.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::debug;

/// State machine: Created -> Starting -> Running -> Stopping -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built but never started, or a start attempt was aborted.
    Created,
    /// Running `before_start` hooks and starting the server.
    Starting,
    /// Server started; `after_start` hooks may still be running.
    Running,
    /// Running stop hooks and stopping the server. A service whose server
    /// failed to stop stays here.
    Stopping,
    Stopped,
}

#[derive(Debug)]
pub struct Lifecycle {
    state: ArcSwap<LifecycleState>,
    changed: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    /// Creates a tracker in the `Created` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Created);
        Self {
            state: ArcSwap::from_pointee(LifecycleState::Created),
            changed: tx,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    pub fn transition(&self, to: LifecycleState) {
        let from = *self.state.swap(Arc::new(to));
        self.changed.send_replace(to);
        debug!(?from, ?to, "lifecycle transition");
    }

    /// Atomically moves to `to` unless the current state is one of `blocked`.
    ///
    /// # Errors
    ///
    /// Returns the current state, unchanged, when it is blocked.
    pub fn transition_unless(&self, blocked: &[LifecycleState], to: LifecycleState) -> Result<(), LifecycleState> {
        let from = *self.state.rcu(|current| {
            if blocked.contains(&**current) {
                Arc::clone(current)
            } else {
                Arc::new(to)
            }
        });
        if blocked.contains(&from) {
            return Err(from);
        }
        self.changed.send_replace(to);
        debug!(?from, ?to, "lifecycle transition");
        Ok(())
    }

    /// Receiver notified on every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.changed.subscribe()
    }

    /// Waits until the state equals `target`.
    pub async fn wait_for(&self, target: LifecycleState) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|state| *state == target).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn starts_created_and_follows_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Created);

        for next in [
            LifecycleState::Starting,
            LifecycleState::Running,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
        ] {
            lifecycle.transition(next);
            assert_eq!(lifecycle.state(), next);
        }
    }

    #[test]
    fn subscribers_observe_latest_state() {
        let lifecycle = Lifecycle::new();
        let rx = lifecycle.subscribe();
        lifecycle.transition(LifecycleState::Starting);
        lifecycle.transition(LifecycleState::Running);
        assert_eq!(*rx.borrow(), LifecycleState::Running);
    }

    #[test]
    fn guarded_transition_refuses_blocked_state() {
        let lifecycle = Lifecycle::new();
        let busy = [LifecycleState::Starting, LifecycleState::Running];

        assert_eq!(lifecycle.transition_unless(&busy, LifecycleState::Starting), Ok(()));
        assert_eq!(
            lifecycle.transition_unless(&busy, LifecycleState::Starting),
            Err(LifecycleState::Starting)
        );
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
    }

    #[test]
    fn concurrent_guarded_transitions_admit_one_winner() {
        let lifecycle = Arc::new(Lifecycle::new());
        let busy = [LifecycleState::Starting, LifecycleState::Running];
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                std::thread::spawn(move || lifecycle.transition_unless(&busy, LifecycleState::Starting).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn wait_for_resolves_on_transition() {
        let lifecycle = Arc::new(Lifecycle::new());
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait_for(LifecycleState::Stopped).await })
        };

        lifecycle.transition(LifecycleState::Stopping);
        lifecycle.transition(LifecycleState::Stopped);

        tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
