use crate::error::DispatchError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Ceiling for one upstream call, streaming included.
pub const CALL_CEILING: Duration = Duration::from_secs(30 * 60);

/// Cancellation scope for one upstream call. Clones share the same scope.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    cancel: Arc<watch::Sender<bool>>,
}

impl CallContext {
    pub fn new(ceiling: Duration) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            deadline: Instant::now() + ceiling,
            cancel: Arc::new(cancel),
        }
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || Instant::now() >= self.deadline
    }

    /// Resolves once the call is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        tokio::select! {
            _ = rx.wait_for(|cancelled| *cancelled) => {}
            _ = tokio::time::sleep_until(self.deadline) => {}
        }
    }

    /// Runs `fut` unless the call is cancelled first.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, DispatchError>
    where
        F: Future<Output = Result<T, DispatchError>>,
    {
        tokio::select! {
            res = fut => res,
            _ = self.cancelled() => Err(DispatchError::Canceled),
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new(CALL_CEILING)
    }
}

/// Aborts the wrapped task when dropped, unless it was released first.
#[derive(Debug)]
pub struct AbortOnDrop<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T> AbortOnDrop<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Lets the task keep running after this guard is gone.
    pub fn release(mut self) {
        self.handle.take();
    }

    pub fn handle_mut(&mut self) -> Option<&mut JoinHandle<T>> {
        self.handle.as_mut()
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
