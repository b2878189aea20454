//! Locking certificate store over a versioned secret vault.
//!
//! The lock is a version-stage trick: every value written to the vault
//! creates a new version, and named stages can be moved between versions
//! atomically. Grabbing the lock means writing a dummy version whose value
//! is the lock's expiry epoch, then moving the well-known `LOCK` stage
//! onto it; the move fails while another version holds the stage. A
//! contender that observes an expired lock may strip the stage and retry,
//! so a crashed holder cannot wedge the fleet for more than the lock
//! lifetime.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_common::jitter::lock_retry_delay;

use crate::bundle::CertificateBundle;
use crate::codec::{decode_bundle, encode_bundle};
use crate::error::StoreError;
use crate::store::{Locker, Storer};

/// Stage label marking the version that holds the lock
const LOCK_STAGE: &str = "LOCK";
/// Scratch stage used while creating the lock version
const DUMMY_STAGE: &str = "DUMMY";
/// Lifetime of a lock before contenders may break it
const LOCK_LIFETIME: Duration = Duration::from_secs(15 * 60);

/// A versioned secret backend, reduced to the operations the locking store
/// consumes.
///
/// Semantics follow the common versioned-secret model: `put_value` creates
/// a new version; passing stages attaches them to the new version, pulling
/// each off whatever version held it before; passing no stages makes the
/// new version current. `move_stage` is atomic and refuses with
/// [`StoreError::StageConflict`] while the stage is attached elsewhere.
#[async_trait]
pub trait SecretVault: Send + Sync + Debug {
    /// Create a new version holding `value`, attaching `stages` to it.
    /// Returns the new version id.
    async fn put_value(&self, value: &str, stages: &[&str]) -> Result<String, StoreError>;

    /// Read the current (unstaged) value.
    async fn get_current(&self) -> Result<String, StoreError>;

    /// Read the value and version id carrying `stage`.
    async fn get_staged(&self, stage: &str) -> Result<(String, String), StoreError>;

    /// Atomically attach `stage` to `version`. Fails with `StageConflict`
    /// if another version holds the stage.
    async fn move_stage(&self, stage: &str, version: &str) -> Result<(), StoreError>;

    /// Detach `stage` from `version`. Detaching an absent stage is an
    /// error so a broken lock surfaces at unlock time.
    async fn remove_stage(&self, stage: &str, version: &str) -> Result<(), StoreError>;
}

/// [`Storer`] + [`Locker`] backed by one vault secret.
#[derive(Debug)]
pub struct VaultLockingStore {
    vault: Arc<dyn SecretVault>,
    secret_id: String,
    /// Version id of the lock we hold, if any
    lock_version: Mutex<Option<String>>,
    // Held so the lost channel stays open; reserved for a lease-loss notifier.
    _lost_tx: watch::Sender<bool>,
    lost_rx: watch::Receiver<bool>,
}

impl VaultLockingStore {
    pub fn new(vault: Arc<dyn SecretVault>, secret_id: impl Into<String>) -> Self {
        let (lost_tx, lost_rx) = watch::channel(false);
        Self {
            vault,
            secret_id: secret_id.into(),
            lock_version: Mutex::new(None),
            _lost_tx: lost_tx,
            lost_rx,
        }
    }

    /// Strip an expired `LOCK` stage. Called between grab attempts; does
    /// nothing while the current lock is still live.
    async fn break_expired_lock(&self) -> Result<(), StoreError> {
        let (value, version) = self.vault.get_staged(LOCK_STAGE).await?;
        match value.parse::<i64>() {
            Ok(expiry_epoch) if expiry_epoch > Utc::now().timestamp() => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                warn!(secret_id = %self.secret_id, value = %value, error = %e,
                    "unparseable lock expiry, breaking lock");
            }
        }
        self.vault.remove_stage(LOCK_STAGE, &version).await?;
        info!(secret_id = %self.secret_id, version = %version, "broke expired lock");
        Ok(())
    }
}

#[async_trait]
impl Locker for VaultLockingStore {
    async fn lock(&self) -> Result<(), StoreError> {
        if self.lock_version.lock().is_some() {
            return Err(StoreError::AlreadyHeld);
        }
        let expiry = (Utc::now() + LOCK_LIFETIME).timestamp().to_string();
        let version = self.vault.put_value(&expiry, &[DUMMY_STAGE]).await?;
        loop {
            match self.vault.move_stage(LOCK_STAGE, &version).await {
                Ok(()) => break,
                Err(StoreError::StageConflict { .. }) => {
                    debug!(secret_id = %self.secret_id, "lock contended, backing off");
                    tokio::time::sleep(lock_retry_delay()).await;
                    if let Err(e) = self.break_expired_lock().await {
                        warn!(secret_id = %self.secret_id, error = %e,
                            "failed to inspect contended lock");
                    }
                }
                Err(e) => return Err(e),
            }
        }
        if let Err(e) = self.vault.remove_stage(DUMMY_STAGE, &version).await {
            warn!(secret_id = %self.secret_id, error = %e, "unable to remove scratch stage");
        }
        *self.lock_version.lock() = Some(version);
        info!(secret_id = %self.secret_id, "locked certificate store");
        Ok(())
    }

    async fn unlock(&self) -> Result<(), StoreError> {
        let version = self
            .lock_version
            .lock()
            .take()
            .ok_or(StoreError::NotLocked)?;
        self.vault.remove_stage(LOCK_STAGE, &version).await?;
        info!(secret_id = %self.secret_id, "unlocked certificate store");
        Ok(())
    }

    fn lost_channel(&self) -> Option<watch::Receiver<bool>> {
        Some(self.lost_rx.clone())
    }
}

#[async_trait]
impl Storer for VaultLockingStore {
    async fn read(&self) -> Result<CertificateBundle, StoreError> {
        let value = self.vault.get_current().await?;
        let bundle = decode_bundle(&value)?;
        info!(secret_id = %self.secret_id, "read certificate bundle from store");
        Ok(bundle)
    }

    async fn write(&self, bundle: &CertificateBundle) -> Result<(), StoreError> {
        let encoded = encode_bundle(bundle)?;
        self.vault.put_value(&encoded, &[]).await?;
        info!(secret_id = %self.secret_id, "wrote certificate bundle to store");
        Ok(())
    }
}

/// In-memory [`SecretVault`], for tests and single-host deployments.
#[derive(Debug, Default)]
pub struct MemoryVault {
    state: Mutex<MemoryVaultState>,
}

#[derive(Debug, Default)]
struct MemoryVaultState {
    counter: u64,
    /// version id -> value
    versions: std::collections::HashMap<String, String>,
    /// stage -> version id
    stages: std::collections::HashMap<String, String>,
    current: Option<String>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretVault for MemoryVault {
    async fn put_value(&self, value: &str, stages: &[&str]) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        state.counter += 1;
        let version = format!("v{}", state.counter);
        state.versions.insert(version.clone(), value.to_string());
        if stages.is_empty() {
            state.current = Some(version.clone());
        } else {
            for stage in stages {
                state.stages.insert(stage.to_string(), version.clone());
            }
        }
        Ok(version)
    }

    async fn get_current(&self) -> Result<String, StoreError> {
        let state = self.state.lock();
        let version = state.current.as_ref().ok_or(StoreError::NotFound)?;
        Ok(state.versions[version].clone())
    }

    async fn get_staged(&self, stage: &str) -> Result<(String, String), StoreError> {
        let state = self.state.lock();
        let version = state.stages.get(stage).ok_or(StoreError::NotFound)?;
        Ok((state.versions[version].clone(), version.clone()))
    }

    async fn move_stage(&self, stage: &str, version: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(holder) = state.stages.get(stage) {
            if holder != version {
                return Err(StoreError::StageConflict {
                    stage: stage.to_string(),
                    version: holder.clone(),
                });
            }
        }
        state.stages.insert(stage.to_string(), version.to_string());
        Ok(())
    }

    async fn remove_stage(&self, stage: &str, version: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        match state.stages.get(stage) {
            Some(holder) if holder == version => {
                state.stages.remove(stage);
                Ok(())
            }
            Some(holder) => Err(StoreError::StageConflict {
                stage: stage.to_string(),
                version: holder.clone(),
            }),
            None => Err(StoreError::NotFound),
        }
    }
}
