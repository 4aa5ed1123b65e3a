//! Pool of reusable deadline timers.
//!
//! Handshakes under heavy connection churn each need a deadline. Rather than
//! allocating a fresh timer per handshake, timers are rented from this pool,
//! reset to the new deadline, and handed back when the handshake finishes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::{Instant, Sleep};

/// Upper bound on idle timers kept around for reuse.
pub const MAX_POOLED_TIMERS: usize = 1024;

/// A pool of `tokio::time::Sleep` instances.
#[derive(Debug)]
pub struct TimerPool {
    idle: Mutex<Vec<Pin<Box<Sleep>>>>,
    max_idle: usize,
}

impl TimerPool {
    /// Create a pool holding at most [`MAX_POOLED_TIMERS`] idle timers.
    pub fn new() -> Self {
        Self::with_capacity(MAX_POOLED_TIMERS)
    }

    /// Create a pool holding at most `max_idle` idle timers.
    pub fn with_capacity(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Rent a timer that fires `timeout` from now.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn rent(&self, timeout: Duration) -> PooledTimer<'_> {
        let deadline = Instant::now() + timeout;
        let reused = self.idle.lock().expect("timer pool mutex poisoned").pop();
        let sleep = match reused {
            Some(mut sleep) => {
                sleep.as_mut().reset(deadline);
                sleep
            }
            None => Box::pin(tokio::time::sleep_until(deadline)),
        };
        PooledTimer {
            pool: self,
            sleep: Some(sleep),
        }
    }

    /// Number of idle timers currently pooled.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("timer pool mutex poisoned").len()
    }

    fn give_back(&self, sleep: Pin<Box<Sleep>>) {
        let mut idle = self.idle.lock().expect("timer pool mutex poisoned");
        if idle.len() < self.max_idle {
            idle.push(sleep);
        }
    }
}

impl Default for TimerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A rented timer. Completes at its deadline; returns itself to the pool on drop.
#[derive(Debug)]
pub struct PooledTimer<'a> {
    pool: &'a TimerPool,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl PooledTimer<'_> {
    /// Whether the deadline has passed.
    pub fn is_elapsed(&self) -> bool {
        self.sleep.as_ref().map_or(true, |sleep| sleep.is_elapsed())
    }
}

impl Future for PooledTimer<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx),
            None => Poll::Ready(()),
        }
    }
}

impl Drop for PooledTimer<'_> {
    fn drop(&mut self) {
        if let Some(sleep) = self.sleep.take() {
            self.pool.give_back(sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timers_are_reused() {
        let pool = TimerPool::new();
        {
            let timer = pool.rent(Duration::from_millis(50));
            timer.await;
        }
        assert_eq!(pool.idle_count(), 1);

        let timer = pool.rent(Duration::from_secs(5));
        assert_eq!(pool.idle_count(), 0);
        assert!(!timer.is_elapsed());
        drop(timer);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reused_timer_honours_new_deadline() {
        let pool = TimerPool::new();
        pool.rent(Duration::from_millis(10)).await;

        let start = Instant::now();
        pool.rent(Duration::from_millis(200)).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn pool_is_bounded() {
        let pool = TimerPool::with_capacity(1);
        let a = pool.rent(Duration::from_secs(1));
        let b = pool.rent(Duration::from_secs(1));
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(), 1);
    }
}
