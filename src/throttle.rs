//! Trailing-edge throttle for an async unary function.
//!
//! Intended for slider-style inputs feeding set-speed: the first call fires
//! immediately, calls arriving inside the interval are buffered as a single
//! pending call holding the latest argument, and the pending call fires once
//! the interval has elapsed. A buffered call that is replaced before firing
//! fails with [`WalkPadError::Superseded`]. Errors from the wrapped function
//! propagate to the caller whose argument produced the firing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use crate::error::{Result, WalkPadError};

type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type ThrottledFn<T> = Box<dyn Fn(T) -> BoxFuture + Send + Sync>;

struct Pending<T> {
    arg: T,
    done: oneshot::Sender<Result<()>>,
}

struct Inner<T> {
    func: ThrottledFn<T>,
    interval: Duration,
    state: Mutex<State<T>>,
}

struct State<T> {
    last_fire: Option<Instant>,
    pending: Option<Pending<T>>,
    timer_armed: bool,
}

/// Trailing-edge throttle around an async unary function
pub struct Throttle<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Throttle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Throttle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("interval", &self.inner.interval)
            .finish()
    }
}

impl<T: Send + 'static> Throttle<T> {
    /// Wrap `func` with a minimum interval between firings.
    pub fn new<F, Fut>(interval: Duration, func: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                func: Box::new(move |arg| Box::pin(func(arg))),
                interval,
                state: Mutex::new(State {
                    last_fire: None,
                    pending: None,
                    timer_armed: false,
                }),
            }),
        }
    }

    /// Submit a call.
    ///
    /// Fires immediately when the interval has elapsed since the last firing,
    /// otherwise buffers the argument as the single pending call.
    ///
    /// # Errors
    ///
    /// Returns [`WalkPadError::Superseded`] when a newer call replaces this
    /// one before it fires; otherwise whatever the wrapped function returns.
    pub async fn call(&self, arg: T) -> Result<()> {
        let now = Instant::now();
        let rx = {
            let mut state = self.inner.state.lock().await;
            let elapsed_enough = state
                .last_fire
                .is_none_or(|last| now.duration_since(last) >= self.inner.interval);

            if elapsed_enough && state.pending.is_none() {
                state.last_fire = Some(now);
                drop(state);
                return (self.inner.func)(arg).await;
            }

            let (tx, rx) = oneshot::channel();
            if let Some(replaced) = state.pending.replace(Pending { arg, done: tx }) {
                let _ = replaced.done.send(Err(WalkPadError::Superseded));
            }
            if !state.timer_armed {
                state.timer_armed = true;
                let fire_at = state
                    .last_fire
                    .map_or(now, |last| last + self.inner.interval);
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep_until(fire_at).await;
                    let pending = {
                        let mut state = inner.state.lock().await;
                        state.timer_armed = false;
                        state.last_fire = Some(Instant::now());
                        state.pending.take()
                    };
                    if let Some(Pending { arg, done }) = pending {
                        let result = (inner.func)(arg).await;
                        let _ = done.send(result);
                    }
                });
            }
            rx
        };

        rx.await.unwrap_or(Err(WalkPadError::Superseded))
    }
}
