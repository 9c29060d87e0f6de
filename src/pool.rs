//! Bounded object pools, used for per-party connection reuse.
//!
//! Checkout blocks while the pool is at capacity with nothing idle; a
//! [`Pooled`] guard returns its value on drop unless it was discarded.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A bounded pool of reusable values.
#[derive(Debug)]
pub struct Pool<T> {
    inner: Arc<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    idle: Mutex<VecDeque<T>>,
    slots: Arc<Semaphore>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Pool<T> {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// An empty pool with `capacity` slots.
    pub fn new(capacity: usize) -> Pool<T> {
        Pool {
            inner: Arc::new(Inner {
                idle: Mutex::new(VecDeque::with_capacity(capacity)),
                slots: Arc::new(Semaphore::new(capacity)),
            }),
        }
    }

    /// Takes an idle value, or acquires a free slot and builds a fresh one
    /// with `init`. Waits while all slots are checked out.
    pub async fn take<F, E, Fut>(&self, init: F) -> Result<Pooled<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        // The semaphore is never closed, so acquire cannot fail.
        let permit = Arc::clone(&self.inner.slots)
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("pool semaphore closed"));
        let idle = self.inner.idle.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        let value = match idle {
            Some(value) => value,
            None => match init().await {
                Ok(value) => value,
                Err(e) => return Err(e),
            },
        };
        Ok(Pooled {
            value: Some(value),
            reusable: true,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }
}

/// A checked-out pool value. Returned to the pool on drop.
#[derive(Debug)]
pub struct Pooled<T> {
    value: Option<T>,
    reusable: bool,
    pool: Arc<Inner<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T> Pooled<T> {
    /// Consumes the guard without returning the value to the pool. Used when
    /// the value is no longer reusable, e.g. a connection that hit an error.
    pub fn discard(mut self) {
        self.value = None;
    }

    /// Controls whether the value goes back to the pool on drop. A task that
    /// can be aborted mid-use clears this and re-arms it only once the value
    /// is back in a clean state.
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if !self.reusable {
            return;
        }
        if let Some(value) = self.value.take() {
            self.pool
                .idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(value);
        }
    }
}

impl<T> std::ops::Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().unwrap_or_else(|| unreachable!("pooled value taken"))
    }
}

impl<T> std::ops::DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap_or_else(|| unreachable!("pooled value taken"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::time::Duration;

    #[tokio::test]
    async fn reuses_returned_values() {
        let pool: Pool<u32> = Pool::new(2);
        let a = pool.take(|| async { Ok::<_, Infallible>(1) }).await.unwrap();
        assert_eq!(*a, 1);
        drop(a);
        // The idle value is handed out before init runs.
        let b = pool.take(|| async { Ok::<_, Infallible>(2) }).await.unwrap();
        assert_eq!(*b, 1);
    }

    #[tokio::test]
    async fn discard_makes_room_for_a_fresh_value() {
        let pool: Pool<u32> = Pool::new(1);
        let a = pool.take(|| async { Ok::<_, Infallible>(1) }).await.unwrap();
        a.discard();
        let b = pool.take(|| async { Ok::<_, Infallible>(2) }).await.unwrap();
        assert_eq!(*b, 2);
    }

    #[tokio::test]
    async fn unreusable_guards_drop_their_value() {
        let pool: Pool<u32> = Pool::new(1);
        let mut a = pool.take(|| async { Ok::<_, Infallible>(1) }).await.unwrap();
        a.set_reusable(false);
        drop(a);
        let mut b = pool.take(|| async { Ok::<_, Infallible>(2) }).await.unwrap();
        assert_eq!(*b, 2);
        // Re-arming restores the normal return path.
        b.set_reusable(false);
        b.set_reusable(true);
        drop(b);
        let c = pool.take(|| async { Ok::<_, Infallible>(3) }).await.unwrap();
        assert_eq!(*c, 2);
    }

    #[tokio::test]
    async fn blocks_at_capacity_until_a_value_returns() {
        let pool: Pool<u32> = Pool::new(1);
        let a = pool.take(|| async { Ok::<_, Infallible>(7) }).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                *pool.take(|| async { Ok::<_, Infallible>(8) }).await.unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(a);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn failed_init_releases_the_slot() {
        let pool: Pool<u32> = Pool::new(1);
        let err = pool.take(|| async { Err::<u32, _>("boom") }).await;
        assert!(err.is_err());
        let ok = pool.take(|| async { Ok::<_, &str>(3) }).await.unwrap();
        assert_eq!(*ok, 3);
    }
}
