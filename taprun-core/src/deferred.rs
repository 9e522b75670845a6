// Deferred Results
// Futures for job outputs that only become valid once the job has finished

use crate::error::{ContextError, ContextResult};
use crate::job::JobState;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

type PendingSlot = Box<dyn FnOnce(&ContextResult<()>) + Send>;

/// Future resolving to a payload after the job reaches a terminal state
///
/// Resolves with the payload when the job succeeds, or fails with
/// [`ContextError::JobFailed`] carrying the observed state.
#[must_use = "a deferred result does nothing unless awaited"]
#[derive(Debug)]
pub struct Deferred<T> {
    receiver: oneshot::Receiver<ContextResult<T>>,
}

impl<T> Deferred<T> {
    /// Take the result if it has already settled, without waiting
    pub fn try_take(&mut self) -> Option<ContextResult<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(abandoned())),
        }
    }
}

impl<T> Future for Deferred<T> {
    type Output = ContextResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(abandoned())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The settling side went away without an outcome
fn abandoned() -> ContextError {
    ContextError::JobFailed {
        state: JobState::Unknown,
    }
}

/// Ordered list of result slots waiting for the job outcome
#[derive(Default)]
pub(crate) struct PendingResults {
    slots: Vec<PendingSlot>,
}

impl PendingResults {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a payload and hand back its future
    pub(crate) fn register<T: Send + 'static>(&mut self, payload: T) -> Deferred<T> {
        let (tx, rx) = oneshot::channel();
        self.slots.push(Box::new(move |outcome: &ContextResult<()>| {
            let result = match outcome {
                Ok(()) => Ok(payload),
                Err(err) => Err(err.clone()),
            };
            // The caller may have dropped its future
            let _ = tx.send(result);
        }));
        Deferred { receiver: rx }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Settle every slot from the terminal state, consuming the list
    ///
    /// Returns the number of slots settled.
    pub(crate) fn settle(self, state: JobState) -> usize {
        let outcome = if state.is_success() {
            Ok(())
        } else {
            Err(ContextError::JobFailed { state })
        };
        let count = self.slots.len();
        for slot in self.slots {
            slot(&outcome);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_resolves_every_slot() {
        let mut pending = PendingResults::new();
        let a = pending.register("a".to_string());
        let b = pending.register(42u32);

        assert_eq!(pending.settle(JobState::Done), 2);
        assert_eq!(a.await.unwrap(), "a");
        assert_eq!(b.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_updated_counts_as_success() {
        let mut pending = PendingResults::new();
        let a = pending.register(1u8);
        pending.settle(JobState::Updated);
        assert_eq!(a.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failure_fails_every_slot_with_state() {
        let mut pending = PendingResults::new();
        let a = pending.register(1u8);
        let b = pending.register(2u8);

        pending.settle(JobState::Cancelled);
        for deferred in [a, b] {
            assert_eq!(
                deferred.await.unwrap_err(),
                ContextError::JobFailed {
                    state: JobState::Cancelled
                }
            );
        }
    }

    #[test]
    fn test_try_take_before_and_after_settle() {
        let mut pending = PendingResults::new();
        let mut deferred = pending.register("x");
        assert!(deferred.try_take().is_none());

        pending.settle(JobState::Done);
        assert_eq!(deferred.try_take(), Some(Ok("x")));
    }

    #[tokio::test]
    async fn test_dropped_list_fails_deferred() {
        let mut pending = PendingResults::new();
        let deferred = pending.register(());
        drop(pending);
        assert!(deferred.await.unwrap_err().is_job_failure());
    }
}
