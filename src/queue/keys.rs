// src/queue/keys.rs

/// Cache key layout shared by the queue and the progress synchronizer.
///
/// - `<prefix>:pending` and `<prefix>:processing` are the two queue lists.
/// - `task:<task_id>` holds the serialized Task Record mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn pending(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    pub fn processing(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    pub fn record(&self, task_id: &str) -> String {
        format!("task:{task_id}")
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new("analysis")
    }
}
