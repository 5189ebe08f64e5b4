// src/rabbitmq/flight.rs
// Single-flight slots: concurrent requests for one resource share one attempt

use std::future::Future;

use futures::future::{BoxFuture, FutureExt, Shared};

use super::errors::Result;

/// An in-flight creation whose outcome every waiter observes.
pub(crate) type Flight<T> = Shared<BoxFuture<'static, Result<T>>>;

pub(crate) fn flight<T, F>(attempt: F) -> Flight<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    attempt.boxed().shared()
}

/// A guarded slot: absent, pending with a shared completion, or ready.
pub(crate) enum Slot<T: Clone> {
    Pending { id: u64, flight: Flight<T> },
    Ready { id: u64, value: T },
}

impl<T: Clone> Slot<T> {
    pub(crate) fn id(&self) -> u64 {
        match self {
            Slot::Pending { id, .. } | Slot::Ready { id, .. } => *id,
        }
    }
}
