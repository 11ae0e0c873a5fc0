//! Bookkeeping of in-flight work items and their outcomes.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::work::{Outcome, WorkItemId};

fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::Infrastructure(format!("Outcome tracker lock poisoned (thread panicked): {}", e))
}

#[derive(Default)]
struct TrackerState {
    pending: usize,
    outcomes: Vec<(WorkItemId, Outcome)>,
}

/// Counts registered items and collects their outcomes.
///
/// Registration happens before an item is handed to a worker, so a waiter
/// never sees zero pending while a submitted item is still unrecorded.
#[derive(Default)]
pub(crate) struct OutcomeTracker {
    state: Mutex<TrackerState>,
    done: Condvar,
}

impl OutcomeTracker {
    fn lock(&self) -> Result<MutexGuard<'_, TrackerState>> {
        self.state.lock().map_err(lock_error)
    }

    pub(crate) fn register(&self) -> Result<()> {
        self.lock()?.pending += 1;
        Ok(())
    }

    /// Undo a registration whose item never got scheduled.
    pub(crate) fn unregister(&self) {
        if let Ok(mut state) = self.lock() {
            state.pending = state.pending.saturating_sub(1);
            drop(state);
            self.done.notify_all();
        }
    }

    pub(crate) fn complete(&self, id: WorkItemId, outcome: Outcome) {
        // A poisoned lock still holds consistent data; keep the outcome.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.outcomes.push((id, outcome));
        state.pending = state.pending.saturating_sub(1);
        let finished = state.pending == 0;
        drop(state);
        if finished {
            self.done.notify_all();
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock().map(|s| s.pending).unwrap_or(0)
    }

    /// Block until nothing is pending, then take every recorded outcome.
    pub(crate) fn wait_all(&self) -> Result<Vec<(WorkItemId, Outcome)>> {
        let mut state = self.lock()?;
        while state.pending > 0 {
            state = self.done.wait(state).map_err(lock_error)?;
        }
        Ok(std::mem::take(&mut state.outcomes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_all_with_nothing_submitted() {
        let tracker = OutcomeTracker::default();
        assert!(tracker.wait_all().unwrap().is_empty());
    }

    #[test]
    fn test_wait_all_blocks_until_every_outcome() {
        let tracker = Arc::new(OutcomeTracker::default());
        for _ in 0..8 {
            tracker.register().unwrap();
        }

        let workers: Vec<_> = (0..8u64)
            .map(|i| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5 * (8 - i)));
                    tracker.complete(WorkItemId::new(i), Outcome::Success(Value::from(i)));
                })
            })
            .collect();

        let mut outcomes = tracker.wait_all().unwrap();
        assert_eq!(tracker.pending(), 0);
        outcomes.sort_by_key(|(id, _)| *id);
        let ids: Vec<u64> = outcomes.iter().map(|(id, _)| id.as_u64()).collect();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());

        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_outcomes_are_drained_per_round() {
        let tracker = OutcomeTracker::default();
        tracker.register().unwrap();
        tracker.complete(WorkItemId::new(1), Outcome::Success(Value::Null));
        assert_eq!(tracker.wait_all().unwrap().len(), 1);
        assert!(tracker.wait_all().unwrap().is_empty());

        tracker.register().unwrap();
        tracker.unregister();
        assert!(tracker.wait_all().unwrap().is_empty());
    }
}
