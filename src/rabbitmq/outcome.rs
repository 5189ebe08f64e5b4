// src/rabbitmq/outcome.rs

/// Result of an operation that is skipped, not failed, while the broker is
/// unreachable.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Not connected; nothing was sent to the broker.
    Skipped,
    Delivered(T),
}

impl<T> Outcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped)
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Outcome::Delivered(_))
    }

    pub fn delivered(self) -> Option<T> {
        match self {
            Outcome::Delivered(value) => Some(value),
            Outcome::Skipped => None,
        }
    }

    pub fn as_ref(&self) -> Outcome<&T> {
        match self {
            Outcome::Delivered(value) => Outcome::Delivered(value),
            Outcome::Skipped => Outcome::Skipped,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Delivered(value) => Outcome::Delivered(f(value)),
            Outcome::Skipped => Outcome::Skipped,
        }
    }
}

impl<T> From<Option<T>> for Outcome<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Outcome::Delivered(value),
            None => Outcome::Skipped,
        }
    }
}
