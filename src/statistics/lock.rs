use async_trait::async_trait;
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out after {timeout:?} waiting for lock {name}")]
    Timeout { name: String, timeout: Duration },
}

/// Proof of holding a named lock. The lock is released on drop.
pub struct LockGuard {
    name: String,
    token: Uuid,
    _release: Box<dyn Any + Send + Sync>,
}

impl LockGuard {
    pub fn new(name: impl Into<String>, release: Box<dyn Any + Send + Sync>) -> Self {
        let guard = Self {
            name: name.into(),
            token: Uuid::new_v4(),
            _release: release,
        };
        debug!(lock = %guard.name, token = %guard.token, "Lock acquired.");
        guard
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> Uuid {
        self.token
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!(lock = %self.name, token = %self.token, "Lock released.");
    }
}

/// Named mutual exclusion between jobs.
///
/// `try_acquire` never waits, `acquire` waits up to `timeout`. An
/// implementation backed by a shared store makes the exclusion hold across
/// processes.
#[async_trait]
pub trait LockService: Send + Sync {
    fn try_acquire(&self, name: &str) -> Option<LockGuard>;

    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard, LockError>;
}

/// Locks held in this process only.
#[derive(Default)]
pub struct LocalLockService {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks.entry(name.to_string()).or_default().clone()
    }
}

#[async_trait]
impl LockService for LocalLockService {
    fn try_acquire(&self, name: &str) -> Option<LockGuard> {
        let guard = self.mutex(name).try_lock_owned().ok()?;
        Some(LockGuard::new(name, Box::new(guard)))
    }

    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        let mutex = self.mutex(name);
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(LockGuard::new(name, Box::new(guard))),
            Err(_) => Err(LockError::Timeout {
                name: name.to_string(),
                timeout,
            }),
        }
    }
}
