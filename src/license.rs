//! Limited-concurrency tokens for routing engine sessions.
//!
//! A [`TokenPool`] hands out at most `capacity` [`TokenGuard`]s at a time.
//! The guard gives its token back on drop, so every exit path of a worker
//! (including unwinding) returns the seat to the pool.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::RoutingError;

#[derive(Debug)]
struct PoolState {
    available: usize,
}

#[derive(Debug)]
struct PoolInner {
    capacity: usize,
    state: Mutex<PoolState>,
    released: Condvar,
}

/// Counting semaphore over engine licenses.
#[derive(Debug, Clone)]
pub struct TokenPool {
    inner: Arc<PoolInner>,
}

impl TokenPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                state: Mutex::new(PoolState {
                    available: capacity,
                }),
                released: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Takes a token without waiting.
    pub fn try_acquire(&self) -> Result<TokenGuard, RoutingError> {
        self.acquire_timeout(Duration::ZERO)
    }

    /// Waits up to `wait` for a token.
    pub fn acquire_timeout(&self, wait: Duration) -> Result<TokenGuard, RoutingError> {
        let mut state = self.inner.state.lock();
        if state.available == 0 && !wait.is_zero() {
            let deadline = std::time::Instant::now() + wait;
            while state.available == 0 {
                if self.inner.released.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }

        if state.available == 0 {
            return Err(RoutingError::License(format!(
                "all {} routing licenses are checked out",
                self.inner.capacity
            )));
        }

        state.available -= 1;
        tracing::debug!(available = state.available, "routing license checked out");
        Ok(TokenGuard {
            pool: Arc::clone(&self.inner),
        })
    }
}

/// A checked-out token. Returned to its pool on drop.
#[derive(Debug)]
pub struct TokenGuard {
    pool: Arc<PoolInner>,
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.available += 1;
        tracing::debug!(available = state.available, "routing license released");
        drop(state);
        self.pool.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_pool_reports_license_error() {
        let pool = TokenPool::new(1);
        let first = pool.try_acquire().expect("first token");
        let second = pool.try_acquire();
        assert!(matches!(second, Err(RoutingError::License(_))));
        drop(first);
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    fn test_token_released_on_panic() {
        let pool = TokenPool::new(1);
        let cloned = pool.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.try_acquire().expect("token");
            panic!("worker blew up");
        }));
        assert!(result.is_err());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_waiter_wakes_when_token_returns() {
        let pool = TokenPool::new(1);
        let guard = pool.try_acquire().expect("token");
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire_timeout(Duration::from_secs(5)).is_ok())
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(waiter.join().expect("waiter thread"));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_zero_capacity_never_grants() {
        let pool = TokenPool::new(0);
        assert!(pool.acquire_timeout(Duration::from_millis(10)).is_err());
        assert_eq!(pool.capacity(), 0);
    }
}
