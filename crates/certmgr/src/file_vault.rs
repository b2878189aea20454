//! Filesystem-backed secret vault.
//!
//! Stores versions and stage markers as files in one directory, which may
//! be a shared mount. Atomicity comes from the two POSIX primitives:
//! `rename` for value updates and create-new for stage acquisition. Fit
//! for small fleets sharing a filesystem; larger fleets should back
//! [`VaultLockingStore`] with a real versioned secret service.
//!
//! Layout:
//!
//! ```text
//! <dir>/
//! ├── versions/<id>     # one file per version, 0600
//! ├── stage.LOCK        # stage marker naming its version
//! └── current           # version id of the current value
//! ```
//!
//! [`VaultLockingStore`]: crate::vault::VaultLockingStore

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::vault::SecretVault;

/// A [`SecretVault`] in a directory.
#[derive(Debug)]
pub struct FileVault {
    dir: PathBuf,
}

impl FileVault {
    /// Open (creating if needed) a vault directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("versions")).map_err(backend)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
                .map_err(backend)?;
        }
        Ok(Self { dir })
    }

    fn version_path(&self, version: &str) -> PathBuf {
        self.dir.join("versions").join(version)
    }

    fn stage_path(&self, stage: &str) -> PathBuf {
        self.dir.join(format!("stage.{}", stage))
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join("current")
    }

    /// Write a small file and rename it into place.
    fn write_atomic(&self, path: &Path, contents: &str) -> Result<(), StoreError> {
        let tmp = self
            .dir
            .join(format!(".tmp.{}.{}", std::process::id(), rand::random::<u32>()));
        std::fs::write(&tmp, contents).map_err(backend)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .map_err(backend)?;
        }
        let renamed = std::fs::rename(&tmp, path);
        if renamed.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        renamed.map_err(backend)
    }

    fn read_stage(&self, stage: &str) -> Result<String, StoreError> {
        match std::fs::read_to_string(self.stage_path(stage)) {
            Ok(version) => Ok(version.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(backend(e)),
        }
    }
}

fn backend(e: std::io::Error) -> StoreError {
    StoreError::BackendUnavailable(e.to_string())
}

#[async_trait]
impl SecretVault for FileVault {
    async fn put_value(&self, value: &str, stages: &[&str]) -> Result<String, StoreError> {
        let version = format!("{}-{:08x}", std::process::id(), rand::random::<u32>());
        self.write_atomic(&self.version_path(&version), value)?;
        if stages.is_empty() {
            self.write_atomic(&self.current_path(), &version)?;
        } else {
            for stage in stages {
                self.write_atomic(&self.stage_path(stage), &version)?;
            }
        }
        Ok(version)
    }

    async fn get_current(&self) -> Result<String, StoreError> {
        let version = match std::fs::read_to_string(self.current_path()) {
            Ok(version) => version.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound);
            }
            Err(e) => return Err(backend(e)),
        };
        std::fs::read_to_string(self.version_path(&version)).map_err(backend)
    }

    async fn get_staged(&self, stage: &str) -> Result<(String, String), StoreError> {
        let version = self.read_stage(stage)?;
        let value = std::fs::read_to_string(self.version_path(&version)).map_err(backend)?;
        Ok((value, version))
    }

    async fn move_stage(&self, stage: &str, version: &str) -> Result<(), StoreError> {
        let path = self.stage_path(stage);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                file.write_all(version.as_bytes()).map_err(backend)?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = self.read_stage(stage)?;
                if holder == version {
                    Ok(())
                } else {
                    Err(StoreError::StageConflict {
                        stage: stage.to_string(),
                        version: holder,
                    })
                }
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn remove_stage(&self, stage: &str, version: &str) -> Result<(), StoreError> {
        let holder = self.read_stage(stage)?;
        if holder != version {
            return Err(StoreError::StageConflict {
                stage: stage.to_string(),
                version: holder,
            });
        }
        std::fs::remove_file(self.stage_path(stage)).map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Locker, Storer};
    use crate::testdata::{TEST_CHAIN_PEM, TEST_UNTYPED_KEY_PEM};
    use crate::vault::VaultLockingStore;
    use crate::CertificateBundle;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_put_get_current() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::open(dir.path()).unwrap();
        assert!(matches!(vault.get_current().await, Err(StoreError::NotFound)));
        vault.put_value("hello", &[]).await.unwrap();
        assert_eq!(vault.get_current().await.unwrap(), "hello");
        vault.put_value("world", &[]).await.unwrap();
        assert_eq!(vault.get_current().await.unwrap(), "world");
    }

    #[tokio::test]
    async fn test_staged_values_do_not_touch_current() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::open(dir.path()).unwrap();
        vault.put_value("bundle", &[]).await.unwrap();
        vault.put_value("1723622400", &["DUMMY"]).await.unwrap();
        assert_eq!(vault.get_current().await.unwrap(), "bundle");
        let (value, _) = vault.get_staged("DUMMY").await.unwrap();
        assert_eq!(value, "1723622400");
    }

    #[tokio::test]
    async fn test_stage_exclusivity() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::open(dir.path()).unwrap();
        let v1 = vault.put_value("a", &["DUMMY"]).await.unwrap();
        let v2 = vault.put_value("b", &["OTHER"]).await.unwrap();

        vault.move_stage("LOCK", &v1).await.unwrap();
        // Re-attaching to the same version is idempotent.
        vault.move_stage("LOCK", &v1).await.unwrap();
        let err = vault.move_stage("LOCK", &v2).await.unwrap_err();
        assert!(matches!(err, StoreError::StageConflict { .. }));

        vault.remove_stage("LOCK", &v1).await.unwrap();
        vault.move_stage("LOCK", &v2).await.unwrap();
        vault.remove_stage("LOCK", &v2).await.unwrap();
        assert!(matches!(
            vault.remove_stage("LOCK", &v2).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_locking_store_over_files() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(FileVault::open(dir.path()).unwrap());
        let store = VaultLockingStore::new(vault.clone(), dir.path().display().to_string());
        let second = VaultLockingStore::new(vault, dir.path().display().to_string());

        let bundle = CertificateBundle::from_pem(
            TEST_CHAIN_PEM.to_string(),
            TEST_UNTYPED_KEY_PEM.to_string(),
        )
        .unwrap();
        store.lock().await.unwrap();
        store.write(&bundle).await.unwrap();
        store.unlock().await.unwrap();

        assert_eq!(second.read().await.unwrap(), bundle);
    }
}
