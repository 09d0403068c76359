//! Lease store abstraction.

use crate::error::{LeaseError, LeaseResult};
use async_trait::async_trait;
use leasefeed_protocol::{ContinuationToken, Lease};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Persistence for leases, guarded by optimistic concurrency.
///
/// Every mutating call must present the etag the caller last saw. A
/// mismatch returns [`LeaseError::Conflict`], which the processor treats
/// as loss of ownership.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Takes ownership of a lease.
    async fn acquire(&self, lease_token: &str, owner: &str) -> LeaseResult<Lease>;

    /// Extends ownership of a lease.
    async fn renew(&self, lease: &Lease) -> LeaseResult<Lease>;

    /// Persists a continuation on a lease.
    async fn checkpoint(&self, lease: &Lease, continuation: &ContinuationToken)
        -> LeaseResult<Lease>;

    /// Gives up ownership of a lease.
    async fn release(&self, lease: &Lease) -> LeaseResult<()>;
}

#[async_trait]
impl<L: LeaseStore + ?Sized> LeaseStore for Arc<L> {
    async fn acquire(&self, lease_token: &str, owner: &str) -> LeaseResult<Lease> {
        (**self).acquire(lease_token, owner).await
    }

    async fn renew(&self, lease: &Lease) -> LeaseResult<Lease> {
        (**self).renew(lease).await
    }

    async fn checkpoint(
        &self,
        lease: &Lease,
        continuation: &ContinuationToken,
    ) -> LeaseResult<Lease> {
        (**self).checkpoint(lease, continuation).await
    }

    async fn release(&self, lease: &Lease) -> LeaseResult<()> {
        (**self).release(lease).await
    }
}

/// An in-memory lease store for testing.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: RwLock<HashMap<String, Lease>>,
    checkpoints: RwLock<Vec<(String, ContinuationToken)>>,
    fail_next_checkpoint: RwLock<Option<LeaseError>>,
}

impl MemoryLeaseStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an unowned lease if it does not exist yet.
    pub fn create(&self, lease_token: &str) -> Lease {
        self.leases
            .write()
            .entry(lease_token.to_string())
            .or_insert_with(|| Lease::new(lease_token))
            .clone()
    }

    /// Inserts or replaces a lease as-is.
    pub fn insert(&self, lease: Lease) {
        self.leases.write().insert(lease.lease_token.clone(), lease);
    }

    /// Returns the stored lease.
    pub fn get(&self, lease_token: &str) -> Option<Lease> {
        self.leases.read().get(lease_token).cloned()
    }

    /// Hands the lease to another owner, as a competing host would.
    pub fn steal(&self, lease_token: &str, owner: &str) -> LeaseResult<Lease> {
        let mut leases = self.leases.write();
        let lease = leases
            .get_mut(lease_token)
            .ok_or_else(|| LeaseError::NotFound {
                lease_token: lease_token.to_string(),
            })?;
        lease.owner = Some(owner.to_string());
        lease.etag += 1;
        Ok(lease.clone())
    }

    /// Makes the next checkpoint fail with `error`.
    pub fn fail_next_checkpoint(&self, error: LeaseError) {
        *self.fail_next_checkpoint.write() = Some(error);
    }

    /// Returns every checkpoint written, in order.
    pub fn checkpoints(&self) -> Vec<(String, ContinuationToken)> {
        self.checkpoints.read().clone()
    }

    fn update<F>(&self, lease: &Lease, apply: F) -> LeaseResult<Lease>
    where
        F: FnOnce(&mut Lease),
    {
        let mut leases = self.leases.write();
        let stored = leases
            .get_mut(&lease.lease_token)
            .ok_or_else(|| LeaseError::NotFound {
                lease_token: lease.lease_token.clone(),
            })?;

        if stored.etag != lease.etag || stored.owner != lease.owner {
            return Err(LeaseError::Conflict {
                lease_token: lease.lease_token.clone(),
            });
        }

        apply(stored);
        stored.etag += 1;
        Ok(stored.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn acquire(&self, lease_token: &str, owner: &str) -> LeaseResult<Lease> {
        let mut leases = self.leases.write();
        let lease = leases
            .get_mut(lease_token)
            .ok_or_else(|| LeaseError::NotFound {
                lease_token: lease_token.to_string(),
            })?;

        match &lease.owner {
            Some(current) if current != owner => Err(LeaseError::AlreadyOwned {
                lease_token: lease_token.to_string(),
                owner: current.clone(),
            }),
            _ => {
                lease.owner = Some(owner.to_string());
                lease.etag += 1;
                Ok(lease.clone())
            }
        }
    }

    async fn renew(&self, lease: &Lease) -> LeaseResult<Lease> {
        self.update(lease, |_| {})
    }

    async fn checkpoint(
        &self,
        lease: &Lease,
        continuation: &ContinuationToken,
    ) -> LeaseResult<Lease> {
        let injected = self.fail_next_checkpoint.write().take();
        if let Some(error) = injected {
            return Err(error);
        }

        let updated = self.update(lease, |stored| {
            stored.continuation = Some(continuation.clone());
        })?;
        self.checkpoints
            .write()
            .push((lease.lease_token.clone(), continuation.clone()));
        Ok(updated)
    }

    async fn release(&self, lease: &Lease) -> LeaseResult<()> {
        self.update(lease, |stored| stored.owner = None).map(|_| ())
    }
}
