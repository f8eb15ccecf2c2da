//! A set of tasks sharing one cancellation root.
//!
//! The first task to fail records its error and cancels the others.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ApiError;

#[derive(Clone, Default)]
pub struct TaskGroup {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancel: CancellationToken,
    first_error: Mutex<Option<ApiError>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<(), ApiError>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            if let Err(e) = fut.await {
                debug!("Task {name} failed: {e}");
                inner.first_error.lock().get_or_insert(e);
                inner.cancel.cancel();
            }
        });
        self.inner.handles.lock().push(handle);
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await;
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn first_error(&self) -> Option<ApiError> {
        self.inner.first_error.lock().clone()
    }

    /// Cancel and wait for every task, aborting stragglers after `grace`.
    pub async fn shutdown(&self, grace: std::time::Duration) {
        self.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.inner.handles.lock());
        for mut h in handles {
            if tokio::time::timeout(grace, &mut h).await.is_err() {
                h.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_first_error_wins_and_cancels() {
        let group = TaskGroup::new();
        let token = group.token();
        group.spawn("waits", async move {
            token.cancelled().await;
            Ok(())
        });
        group.spawn("fails", async { Err(ApiError::AccessTime) });
        group.cancelled().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        group.spawn("late", async { Err(ApiError::Unauthorized) });
        group.shutdown(Duration::from_secs(1)).await;
        assert_eq!(group.first_error(), Some(ApiError::AccessTime));
    }

    #[tokio::test]
    async fn test_ok_tasks_do_not_cancel() {
        let group = TaskGroup::new();
        group.spawn("ok", async { Ok(()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!group.token().is_cancelled());
        assert!(group.first_error().is_none());
    }
}
