//! Reusable single-slot completion primitive.
//!
//! # Responsibilities
//! - Hand one result from a native callback thread to one waiting task
//! - Buffer a result that arrives before anyone waits for it
//! - Be reused for every operation of its owner (no allocation per read/write)
//!
//! # Design Decisions
//! - One slot, one waker: at most one `wait()` may be outstanding per instance
//! - Misuse (two concurrent waits) is caught by a debug assertion
//! - The slot is guarded by a std mutex; callers that also hold a state lock
//!   must take the state lock first

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

#[derive(Debug)]
struct Slot<T, E> {
    result: Option<Result<T, E>>,
    waker: Option<Waker>,
    waiting: bool,
}

/// A single-slot completion source that can be completed and awaited repeatedly.
///
/// A completion with no pending waiter is kept until the next `wait()` or
/// `poll_wait()` picks it up. Completing twice before anyone consumes the first
/// result replaces it.
#[derive(Debug)]
pub struct ResettableCompletionSource<T, E> {
    slot: Mutex<Slot<T, E>>,
}

impl<T, E> ResettableCompletionSource<T, E> {
    /// Create an empty completion source.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                result: None,
                waker: None,
                waiting: false,
            }),
        }
    }

    /// Deliver a successful result to the current (or next) waiter.
    pub fn complete(&self, value: T) {
        self.set(Ok(value));
    }

    /// Deliver a failure to the current (or next) waiter.
    pub fn complete_exception(&self, error: E) {
        self.set(Err(error));
    }

    fn set(&self, result: Result<T, E>) {
        let waker = {
            let mut slot = self.slot.lock().expect("completion source mutex poisoned");
            slot.result = Some(result);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Whether a result is buffered and not yet consumed.
    pub fn is_completed(&self) -> bool {
        self.slot
            .lock()
            .expect("completion source mutex poisoned")
            .result
            .is_some()
    }

    /// Drop any buffered result and registered waker.
    pub fn reset(&self) {
        let mut slot = self.slot.lock().expect("completion source mutex poisoned");
        slot.result = None;
        slot.waker = None;
    }

    /// Poll for the next result, registering `cx`'s waker if none is available.
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<T, E>> {
        let mut slot = self.slot.lock().expect("completion source mutex poisoned");
        match slot.result.take() {
            Some(result) => {
                slot.waker = None;
                Poll::Ready(result)
            }
            None => {
                match slot.waker {
                    Some(ref existing) if existing.will_wake(cx.waker()) => {}
                    _ => slot.waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
        }
    }

    /// Wait for the next result.
    ///
    /// Only one `Wait` may exist at a time for a given source.
    pub fn wait(&self) -> Wait<'_, T, E> {
        {
            let mut slot = self.slot.lock().expect("completion source mutex poisoned");
            debug_assert!(
                !slot.waiting,
                "concurrent wait on a ResettableCompletionSource"
            );
            slot.waiting = true;
        }
        Wait { source: self }
    }
}

impl<T, E> Default for ResettableCompletionSource<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`ResettableCompletionSource::wait`].
#[derive(Debug)]
pub struct Wait<'a, T, E> {
    source: &'a ResettableCompletionSource<T, E>,
}

impl<T, E> Future for Wait<'_, T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.source.poll_wait(cx)
    }
}

impl<T, E> Drop for Wait<'_, T, E> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.source.slot.lock() {
            slot.waiting = false;
            slot.waker = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn completion_before_wait_is_buffered() {
        let source: ResettableCompletionSource<u32, &'static str> = ResettableCompletionSource::new();
        source.complete(7);
        assert!(source.is_completed());
        assert_eq!(source.wait().await, Ok(7));
        assert!(!source.is_completed());
    }

    #[tokio::test]
    async fn reused_across_operations() {
        let source = Arc::new(ResettableCompletionSource::<u32, &'static str>::new());

        for round in 0..3u32 {
            let completer = Arc::clone(&source);
            let handle = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                if round == 1 {
                    completer.complete_exception("aborted");
                } else {
                    completer.complete(round);
                }
            });

            let result = source.wait().await;
            handle.join().unwrap();
            if round == 1 {
                assert_eq!(result, Err("aborted"));
            } else {
                assert_eq!(result, Ok(round));
            }
        }
    }

    #[tokio::test]
    async fn reset_discards_stale_result() {
        let source: ResettableCompletionSource<u32, ()> = ResettableCompletionSource::new();
        source.complete(1);
        source.reset();
        assert!(!source.is_completed());

        let waited = tokio::time::timeout(Duration::from_millis(20), source.wait()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn dropped_wait_allows_a_new_wait() {
        let source: ResettableCompletionSource<u32, ()> = ResettableCompletionSource::new();
        let _ = tokio::time::timeout(Duration::from_millis(5), source.wait()).await;
        source.complete(3);
        assert_eq!(source.wait().await, Ok(3));
    }
}
