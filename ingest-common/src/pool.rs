//! # Pool
//!
//! A FIFO pool of interchangeable, rate-limited credentials. The number of tokens seeded into a
//! `ResourcePool` is the maximum number of concurrent calls allowed against the scarce external
//! dependency they unlock.
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Anything that can be borrowed from a `ResourcePool`.
pub trait PoolToken: Send + 'static {
    /// A printable identifier. Must not leak the secret part of the token.
    fn id(&self) -> &str;
}

/// One API credential for the extraction service.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub id: String,
    pub key: String,
}

impl ApiKey {
    /// Number keys in the order they were configured.
    pub fn from_keys<I, S>(keys: I) -> Vec<ApiKey>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        keys.into_iter()
            .enumerate()
            .map(|(index, key)| ApiKey {
                id: index.to_string(),
                key: key.into(),
            })
            .collect()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl PoolToken for ApiKey {
    fn id(&self) -> &str {
        &self.id
    }
}

struct PoolState<T> {
    tokens: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
}

struct Inner<T> {
    name: String,
    state: Mutex<PoolState<T>>,
    /// Parent of every scheduled return. Cancelled by `ResourcePool::close`.
    scheduled: CancellationToken,
}

/// A pool of tokens where `pop` suspends while the pool is empty.
///
/// Waiters are served strictly in arrival order: a returned token is handed directly to the
/// oldest waiter still interested in it. `pop` never fails. A token that is never returned
/// permanently costs the pool one unit of concurrency, which is why `checkout` exists.
pub struct ResourcePool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: PoolToken> ResourcePool<T> {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_owned(),
                state: Mutex::new(PoolState {
                    tokens: VecDeque::new(),
                    waiters: VecDeque::new(),
                }),
                scheduled: CancellationToken::new(),
            }),
        }
    }

    /// Build a pool already holding `tokens`.
    pub fn seeded(name: &str, tokens: impl IntoIterator<Item = T>) -> Self {
        let pool = Self::new(name);
        for token in tokens {
            pool.push(token);
        }
        pool
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> MutexGuard<'_, PoolState<T>> {
        // Every critical section leaves the state consistent, so a poisoned lock is still usable.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return a token to the pool, waking the oldest waiter if there is one.
    pub fn push(&self, token: T) {
        debug!(pool = %self.inner.name, token = token.id(), "token returned to pool");

        let mut token = Some(token);
        let mut state = self.state();
        while let Some(unsent) = token.take() {
            let Some(waiter) = state.waiters.pop_front() else {
                token = Some(unsent);
                break;
            };
            if let Err(unsent) = waiter.send(unsent) {
                // That waiter was cancelled, try the next one.
                token = Some(unsent);
            }
        }
        if let Some(token) = token {
            state.tokens.push_back(token);
        }
        let available = state.tokens.len();
        drop(state);

        self.report_available(available);
    }

    /// Borrow a token, suspending until one is available.
    pub async fn pop(&self) -> T {
        loop {
            let mut waiter = {
                let mut state = self.state();
                if let Some(token) = state.tokens.pop_front() {
                    let available = state.tokens.len();
                    drop(state);
                    self.report_available(available);
                    debug!(pool = %self.inner.name, token = token.id(), "token borrowed from pool");
                    return token;
                }

                let (sender, receiver) = oneshot::channel();
                state.waiters.push_back(sender);
                Waiter {
                    receiver,
                    pool: self,
                }
            };

            if let Ok(token) = (&mut waiter.receiver).await {
                debug!(pool = %self.inner.name, token = token.id(), "token borrowed from pool after waiting");
                return token;
            }
        }
    }

    /// Borrow a token wrapped in a guard that returns it to the pool when dropped.
    pub async fn checkout(&self) -> Checkout<T> {
        let token = self.pop().await;
        Checkout {
            token: Some(token),
            pool: self.clone(),
        }
    }

    /// Return `token` once `delay` has elapsed.
    ///
    /// The return is withdrawn if the pool is closed before it fires, so a torn down pool never
    /// sees tokens come back from the past.
    pub fn push_after(&self, token: T, delay: time::Duration) -> ScheduledReturn {
        let cancel = self.inner.scheduled.child_token();
        let cancelled = cancel.clone();
        let pool = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    warn!(pool = %pool.inner.name, token = token.id(), "scheduled token return cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    pool.push(token);
                }
            }
        });

        ScheduledReturn { cancel }
    }

    /// Cancel every pending scheduled return.
    pub fn close(&self) {
        self.inner.scheduled.cancel();
    }

    /// Number of tokens sitting idle in the pool.
    pub fn available(&self) -> usize {
        self.state().tokens.len()
    }

    fn report_available(&self, available: usize) {
        let labels = [("pool", self.inner.name.clone())];
        metrics::gauge!("ingest_pool_available_tokens", &labels).set(available as f64);
    }
}

/// A pending `pop`. Dropping it after a token was handed over returns that token to the pool.
struct Waiter<'p, T: PoolToken> {
    receiver: oneshot::Receiver<T>,
    pool: &'p ResourcePool<T>,
}

impl<T: PoolToken> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        self.receiver.close();
        if let Ok(token) = self.receiver.try_recv() {
            self.pool.push(token);
        }
    }
}

/// Handle to a token return scheduled with `ResourcePool::push_after`.
#[derive(Debug, Clone)]
pub struct ScheduledReturn {
    cancel: CancellationToken,
}

impl ScheduledReturn {
    /// Withdraw the return. The token is dropped instead of going back to the pool.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A borrowed token. Goes back to its pool when released or dropped, including when the future
/// holding it is abandoned by a timeout.
pub struct Checkout<T: PoolToken> {
    token: Option<T>,
    pool: ResourcePool<T>,
}

impl<T: PoolToken> Checkout<T> {
    /// Return the token right away.
    pub fn release(mut self) {
        if let Some(token) = self.token.take() {
            self.pool.push(token);
        }
    }

    /// Return the token after a cooldown, e.g. after the external service rejected it.
    pub fn release_after(mut self, delay: time::Duration) -> Option<ScheduledReturn> {
        self.token
            .take()
            .map(|token| self.pool.push_after(token, delay))
    }
}

impl<T: PoolToken> Deref for Checkout<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.token
            .as_ref()
            .expect("a checkout holds its token until it is released")
    }
}

impl<T: PoolToken> Drop for Checkout<T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.pool.push(token);
        }
    }
}
