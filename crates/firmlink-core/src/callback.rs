//! User callbacks
//!
//! A [`Callback`] is anything that turns a value into a future. Plain
//! closures are wrapped into a lazy future, so sync and async
//! callbacks take the same path: the engine produces the futures while it
//! holds its state lock, then hands them to the [`CallbackQueue`], which runs
//! them one after the other on its own task.

use futures::future::{self, BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Callback futures waiting to be queued
pub type Pending = Vec<BoxFuture<'static, ()>>;

/// A user callback taking `T`
pub struct Callback<T>(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>);

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

impl<T: Send + 'static> Callback<T> {
    /// Wrap an async function
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Arc::new(move |value| f(value).boxed()))
    }

    /// Wrap a plain closure
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self(Arc::new(move |value| {
            let f = f.clone();
            future::lazy(move |_| f(value)).boxed()
        }))
    }

    /// Produce the future for one invocation without running it
    pub fn call(&self, value: T) -> BoxFuture<'static, ()> {
        (self.0)(value)
    }
}

/// Ordered executor for callback futures
#[derive(Clone)]
pub struct CallbackQueue {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

/// Receiving side of a [`CallbackQueue`]; drive it with [`CallbackRunner::run`]
pub struct CallbackRunner {
    rx: mpsc::UnboundedReceiver<BoxFuture<'static, ()>>,
}

impl CallbackQueue {
    pub fn new() -> (Self, CallbackRunner) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, CallbackRunner { rx })
    }

    /// Queue futures in order
    pub fn push_all(&self, pending: Pending) {
        for fut in pending {
            if self.tx.send(fut).is_err() {
                tracing::debug!("callback runner stopped; dropping callback");
                return;
            }
        }
    }
}

impl CallbackRunner {
    /// Run queued callbacks until every queue handle is dropped
    pub async fn run(mut self) {
        while let Some(fut) = self.rx.recv().await {
            fut.await;
        }
    }
}
