use std::collections::HashSet;

/// Cancellation intent per document id.
///
/// Cooperative: marks are only looked at at the ingestion checkpoints
/// (before a submission starts and after the index call returns). A mark
/// never interrupts an index call that is already running.
#[derive(Debug, Default)]
pub struct CancellationCoordinator {
    marked: HashSet<String>,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, id: impl Into<String>) {
        let id = id.into();
        tracing::debug!(id = %id, "cancellation recorded");
        self.marked.insert(id);
    }

    /// Check and clear in one step.
    pub fn consume_if_marked(&mut self, id: &str) -> bool {
        self.marked.remove(id)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }
}
