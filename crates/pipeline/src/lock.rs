//! System-wide "one invocation at a time" lock.
//!
//! A backend session slot cannot serve two invocations at once, so every
//! pipeline sharing a backend must share one lock, across all watched sources.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct InvocationLock {
    inner: Arc<Mutex<()>>,
}

impl InvocationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the slot. Released when the guard drops.
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.inner.clone().lock_owned().await
    }

    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_the_slot() {
        let lock = InvocationLock::new();
        let other = lock.clone();

        let guard = lock.acquire().await;
        assert!(other.is_busy());
        drop(guard);
        assert!(!other.is_busy());
    }
}
