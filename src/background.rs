use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;

/// Detached persistence writes (asset cache write-back, index snapshots).
///
/// The operation that schedules a write completes before the write settles.
/// A failed write is logged and counted here, never returned to that
/// operation's caller.
#[derive(Clone, Default)]
pub struct BackgroundWrites {
    tasks: Arc<Mutex<JoinSet<()>>>,
    failures: Arc<AtomicUsize>,
}

impl BackgroundWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `write` on the runtime. Must be called from within a tokio runtime.
    pub fn spawn<F, E>(&self, what: &'static str, key: impl Into<String>, write: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let key = key.into();
        let failures = Arc::clone(&self.failures);
        let task = async move {
            match write.await {
                Ok(()) => tracing::debug!(what, key = %key, "background write settled"),
                Err(error) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(what, key = %key, %error, "background write failed");
                }
            }
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap whatever already finished so the set does not grow unbounded.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Number of writes that have failed so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Wait for every write scheduled so far, including ones spawned while waiting.
    pub async fn settle(&self) {
        loop {
            let mut pending = {
                let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *tasks)
            };
            if pending.is_empty() {
                return;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(error) = joined {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%error, "background write panicked or was cancelled");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn failures_are_counted_not_propagated() {
        let writes = BackgroundWrites::new();
        writes.spawn("test", "ok", async { Ok::<(), String>(()) });
        writes.spawn("test", "bad", async { Err::<(), _>("disk full".to_string()) });
        writes.settle().await;
        assert_eq!(writes.failures(), 1);
    }

    #[tokio::test]
    async fn settle_waits_for_slow_writes() {
        let writes = BackgroundWrites::new();
        let done = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&done);
        writes.spawn("test", "slow", async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(1, Ordering::SeqCst);
            Ok::<(), String>(())
        });
        writes.settle().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(writes.failures(), 0);
    }
}
