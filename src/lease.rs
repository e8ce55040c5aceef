//! Single-flight guard for batch jobs.
//!
//! Two dispatcher invocations working the same event would both deliver and
//! both bump `attempts`, so a job holds a time-bounded lease in the shared
//! store for the length of its run.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;

/// Proof of ownership returned by [`JobLease::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub name: String,
    pub token: String,
}

#[async_trait]
pub trait JobLease: Send + Sync {
    /// Claim `name` for `ttl`. `Ok(None)` when another holder owns it.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LeaseToken>, StoreError>;

    /// Push the expiry of a held lease to `ttl` from now. `Ok(false)` when
    /// `lease` is no longer the current holder.
    async fn extend(&self, lease: &LeaseToken, ttl: Duration) -> Result<bool, StoreError>;

    /// Release only if `lease` is still the current holder.
    async fn release(&self, lease: &LeaseToken) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryLease {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLease {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLease for InMemoryLease {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LeaseToken>, StoreError> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        if let Some((_, expires)) = held.get(name) {
            if *expires > now {
                return Ok(None);
            }
        }
        let token = uuid::Uuid::new_v4().to_string();
        held.insert(name.to_string(), (token.clone(), now + ttl));
        Ok(Some(LeaseToken {
            name: name.to_string(),
            token,
        }))
    }

    async fn extend(&self, lease: &LeaseToken, ttl: Duration) -> Result<bool, StoreError> {
        let mut held = self.held.lock().await;
        match held.get_mut(&lease.name) {
            Some((token, expires)) if *token == lease.token => {
                *expires = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lease: &LeaseToken) -> Result<(), StoreError> {
        let mut held = self.held.lock().await;
        if held.get(&lease.name).is_some_and(|(token, _)| token == &lease.token) {
            held.remove(&lease.name);
        }
        Ok(())
    }
}
