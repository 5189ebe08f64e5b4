// src/rabbitmq/naming.rs

/// A logical queue name paired with its fully-qualified broker name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueRef {
    logical: String,
    qualified: String,
}

impl QueueRef {
    pub fn logical(&self) -> &str {
        &self.logical
    }

    pub fn qualified(&self) -> &str {
        &self.qualified
    }
}

/// Maps logical queue names into the configured namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNaming {
    prefix: String,
}

impl QueueNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn complete_queue_name(&self, logical: &str) -> String {
        complete_queue_name(&self.prefix, logical)
    }

    pub fn resolve(&self, logical: &str) -> QueueRef {
        QueueRef {
            logical: logical.to_string(),
            qualified: self.complete_queue_name(logical),
        }
    }
}

/// `"{prefix}/{logical}"`, for any input including empty strings.
pub fn complete_queue_name(prefix: &str, logical: &str) -> String {
    format!("{}/{}", prefix, logical)
}
