//! Success/error continuations and the adapter that issues one request per
//! transaction.

use crate::engine::{Engine, ObjectStore};
use crate::error::{Result, StoreError};
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

type Continuation<T> = Box<dyn FnOnce(T) + Send>;

/// The caller's continuations for one operation.
///
/// Exactly one of them runs, at most once: settling consumes the handlers.
/// Without an explicit error continuation, errors are logged at debug level
/// and otherwise dropped.
pub struct Handlers<T> {
    on_success: Continuation<T>,
    on_error: Continuation<StoreError>,
}

impl<T: 'static> Handlers<T> {
    pub fn new<S>(on_success: S) -> Self
    where
        S: FnOnce(T) + Send + 'static,
    {
        Self {
            on_success: Box::new(on_success),
            on_error: Box::new(|error| {
                debug!(target: "storehouse::db", error = %error, "Unhandled request error");
            }),
        }
    }

    /// Replace the error continuation.
    pub fn on_error<E>(mut self, on_error: E) -> Self
    where
        E: FnOnce(StoreError) + Send + 'static,
    {
        self.on_error = Box::new(on_error);
        self
    }

    /// Handlers that discard the outcome.
    pub fn ignore() -> Self {
        Self::new(|_| {})
    }

    /// Route both outcomes into one callback.
    pub fn from_result<F>(callback: F) -> Self
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        // Only one of the two continuations ever runs.
        let shared = Arc::new(Mutex::new(Some(callback)));
        let on_error = Arc::clone(&shared);
        Self::new(move |value| {
            if let Some(callback) = shared.lock().take() {
                callback(Ok(value));
            }
        })
        .on_error(move |error| {
            if let Some(callback) = on_error.lock().take() {
                callback(Err(error));
            }
        })
    }

    /// Handlers that deliver the outcome to a channel.
    pub fn channel() -> (Self, Receiver<Result<T>>)
    where
        T: Send,
    {
        let (tx, rx) = unbounded();
        let handlers = Self::from_result(move |result| {
            let _ = tx.send(result);
        });
        (handlers, rx)
    }

    /// Run the matching continuation.
    pub fn settle(self, result: Result<T>) {
        match result {
            Ok(value) => (self.on_success)(value),
            Err(error) => (self.on_error)(error),
        }
    }

    /// Handlers for an operation producing `U`, converted into `T` on success.
    pub fn map<U, F>(self, convert: F) -> Handlers<U>
    where
        U: 'static,
        F: FnOnce(U) -> T + Send + 'static,
    {
        let on_success = self.on_success;
        Handlers {
            on_success: Box::new(move |value| on_success(convert(value))),
            on_error: self.on_error,
        }
    }

    /// Report `error` on a later turn of the engine's event loop.
    pub(crate) fn fail_later(self, engine: &Engine, error: StoreError) {
        engine.defer(move || self.settle(Err(error)));
    }
}

impl<T> fmt::Debug for Handlers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handlers")
    }
}

/// Issue one request against `target`, or report why there is none.
///
/// Synchronous failures (closed database, unknown store) reach the error
/// continuation on a later turn, like every other outcome.
pub(crate) fn execute<T, F>(
    engine: &Engine,
    target: Result<ObjectStore>,
    handlers: Handlers<T>,
    issue: F,
) where
    T: 'static,
    F: FnOnce(ObjectStore, Handlers<T>),
{
    match target {
        Ok(store) => issue(store, handlers),
        Err(error) => handlers.fail_later(engine, error),
    }
}
