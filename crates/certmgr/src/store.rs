//! Shared store and locker capabilities.
//!
//! A fleet shares one certificate bundle through a remote store; every
//! writer must hold the store's lock for the whole ACME transaction plus
//! the store write. The two capabilities are usually backed by the same
//! object (see [`VaultLockingStore`]) but are consumed separately.
//!
//! [`VaultLockingStore`]: crate::vault::VaultLockingStore

use async_trait::async_trait;
use tokio::sync::watch;

use crate::bundle::CertificateBundle;
use crate::error::StoreError;

/// Remote storage for the shared certificate bundle.
#[async_trait]
pub trait Storer: Send + Sync {
    /// Read the current bundle. Fails with [`StoreError::NotFound`] if the
    /// bundle has never been written.
    async fn read(&self) -> Result<CertificateBundle, StoreError>;

    /// Replace the stored bundle.
    async fn write(&self, bundle: &CertificateBundle) -> Result<(), StoreError>;
}

/// A remote locking mechanism.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Grab the lock, blocking (and retrying) until held.
    async fn lock(&self) -> Result<(), StoreError>;

    /// Release the lock. May fail if the lock was broken by a contender.
    async fn unlock(&self) -> Result<(), StoreError>;

    /// A channel signalled if the lock is lost while held (such as a lease
    /// timeout). A value of `true` means writes made after this instant
    /// may be invalid. `None` means the implementation cannot detect loss.
    fn lost_channel(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

/// A locker that always succeeds.
///
/// For single-instance deployments whose store backend has no real lock;
/// with more than one renewer this provides no mutual exclusion and the CA
/// may see duplicate orders.
#[derive(Debug, Default)]
pub struct NullLocker;

#[async_trait]
impl Locker for NullLocker {
    async fn lock(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn unlock(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_locker_never_blocks() {
        let locker = NullLocker;
        locker.lock().await.unwrap();
        locker.lock().await.unwrap();
        locker.unlock().await.unwrap();
        assert!(locker.lost_channel().is_none());
    }
}
