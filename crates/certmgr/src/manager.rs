//! The certificate manager.
//!
//! Owns the current bundle, keeps it renewed through ACME, and shares it
//! with the rest of the fleet through the optional store. One background
//! task per manager runs the renewal control loop; everything else only
//! reads the current bundle under the manager's lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Duration as ChronoDuration;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType as AcmeChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::server::ClientHello;
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use flotilla_common::api::ACME_PATH;
use flotilla_common::jitter::jittery_hour;
use flotilla_config::{ChallengeType, KeyType};

use crate::bundle::{encode_pem, parse_chain, parse_key_pem, CertificateBundle};
use crate::error::CertError;
use crate::responder::Responder;
use crate::store::{Locker, NullLocker, Storer};

/// Time allowed for the ACME server to validate all challenges
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(120);
/// Time allowed for the issued certificate to appear after finalization
const ISSUANCE_TIMEOUT: Duration = Duration::from_secs(60);
/// RSA leaf key modulus size
const RSA_KEY_BITS: usize = 2048;

/// Construction parameters for [`CertificateManager::new`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Domain names (SANs); the first is the subject common name
    pub names: Vec<String>,
    /// Local certificate cache; `None` disables the file cache
    pub cert_file: Option<PathBuf>,
    /// Local key cache; `None` disables the file cache
    pub key_file: Option<PathBuf>,
    /// Challenge type the responder solves
    pub challenge_type: ChallengeType,
    /// Leaf key algorithm
    pub key_type: KeyType,
    /// ACME directory endpoint
    pub directory_url: String,
    /// Renew when this fraction of the lifetime remains; `None` picks a
    /// random value in [0.32, 0.34)
    pub renew_before: Option<f64>,
}

/// Manages one certificate: issuance, renewal, sharing, serving.
pub struct CertificateManager {
    shared: Arc<ManagerShared>,
    write_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

struct ManagerShared {
    names: Vec<String>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    renew_before: f64,
    write_tx: mpsc::Sender<()>,
    current: RwLock<Option<CurrentCertificate>>,
}

struct CurrentCertificate {
    bundle: Arc<CertificateBundle>,
    certified: Arc<CertifiedKey>,
}

impl CertificateManager {
    /// Create a manager and start its renewal task.
    ///
    /// The locker serializes ACME transactions across the fleet (`None`
    /// means no locking: single-renewer deployments only). The storer
    /// shares renewed bundles between instances; without one, every
    /// instance orders its own certificate and may hit CA duplicate
    /// limits.
    pub fn new(
        config: ManagerConfig,
        locker: Option<Arc<dyn Locker>>,
        responder: Arc<dyn Responder>,
        storer: Option<Arc<dyn Storer>>,
    ) -> Result<Self, CertError> {
        if config.names.is_empty() {
            return Err(CertError::Configuration("no domain names specified".into()));
        }
        if config.cert_file.is_some() != config.key_file.is_some() {
            return Err(CertError::Configuration(
                "cert_file and key_file must be set together".into(),
            ));
        }
        let renew_before = match config.renew_before {
            Some(value) if (0.0..1.0).contains(&value) => value,
            Some(value) => {
                return Err(CertError::Configuration(format!(
                    "renew_before = {} is outside (0, 1)",
                    value
                )));
            }
            // Spread renewals across the fleet: 0.32..0.34.
            None => 0.32 + 0.02 * f64::from(rand::thread_rng().gen_range(0u8..=255)) / 256.0,
        };

        let (write_tx, write_rx) = mpsc::channel(1);
        let shared = Arc::new(ManagerShared {
            names: config.names.clone(),
            cert_file: config.cert_file.clone(),
            key_file: config.key_file.clone(),
            renew_before,
            write_tx,
            current: RwLock::new(None),
        });

        let task = RenewalTask {
            shared: shared.clone(),
            locker: locker.unwrap_or_else(|| Arc::new(NullLocker)),
            responder,
            storer,
            challenge_type: config.challenge_type,
            key_type: config.key_type,
            directory_url: config.directory_url,
            account: None,
            order: None,
            leaf_key: None,
        };
        tokio::spawn(task.run());

        Ok(Self {
            shared,
            write_rx: Mutex::new(Some(write_rx)),
        })
    }

    /// Create a manager that only serves certificates loaded from the
    /// given files; no ACME, no renewal task.
    pub fn load_only(cert_file: PathBuf, key_file: PathBuf) -> Result<Self, CertError> {
        let (write_tx, write_rx) = mpsc::channel(1);
        let shared = Arc::new(ManagerShared {
            names: Vec::new(),
            cert_file: Some(cert_file),
            key_file: Some(key_file),
            renew_before: 0.33,
            write_tx,
            current: RwLock::new(None),
        });
        shared.file_load()?;
        Ok(Self {
            shared,
            write_rx: Mutex::new(Some(write_rx)),
        })
    }

    /// The most recently adopted bundle's TLS identity.
    ///
    /// Fails with [`CertError::NoCertificate`] until the first successful
    /// issuance, store adoption or file load.
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>, CertError> {
        self.shared
            .current
            .read()
            .as_ref()
            .map(|current| current.certified.clone())
            .ok_or(CertError::NoCertificate)
    }

    /// The most recently adopted bundle, if any.
    pub fn current_bundle(&self) -> Option<Arc<CertificateBundle>> {
        self.shared
            .current
            .read()
            .as_ref()
            .map(|current| current.bundle.clone())
    }

    /// Take the write-notification channel. One signal is delivered after
    /// every successful local file write; can only be taken once.
    pub fn take_write_notifier(&self) -> Option<mpsc::Receiver<()>> {
        self.write_rx.lock().take()
    }
}

impl ResolvesServerCert for CertificateManager {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.certified_key().ok()
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("names", &self.shared.names)
            .field("has_certificate", &self.shared.current.read().is_some())
            .finish()
    }
}

impl ManagerShared {
    fn current_bundle(&self) -> Option<Arc<CertificateBundle>> {
        self.current.read().as_ref().map(|c| c.bundle.clone())
    }

    /// Replace the current bundle unconditionally.
    fn adopt(&self, bundle: CertificateBundle) -> Result<Arc<CertificateBundle>, CertError> {
        let certified = Arc::new(build_certified_key(&bundle)?);
        let bundle = Arc::new(bundle);
        *self.current.write() = Some(CurrentCertificate {
            bundle: bundle.clone(),
            certified,
        });
        Ok(bundle)
    }

    /// Replace the current bundle only if the candidate expires later.
    /// Returns the adopted bundle, or `None` if the candidate was ignored.
    fn adopt_if_newer(
        &self,
        bundle: CertificateBundle,
    ) -> Result<Option<Arc<CertificateBundle>>, CertError> {
        let certified = Arc::new(build_certified_key(&bundle)?);
        let mut current = self.current.write();
        match current.as_ref() {
            Some(existing) if !bundle.is_newer_than(Some(&existing.bundle)) => {
                debug!(
                    current = %existing.bundle.not_after(),
                    candidate = %bundle.not_after(),
                    "ignoring certificate that expires sooner"
                );
                Ok(None)
            }
            _ => {
                let bundle = Arc::new(bundle);
                *current = Some(CurrentCertificate {
                    bundle: bundle.clone(),
                    certified,
                });
                Ok(Some(bundle))
            }
        }
    }

    fn file_load(&self) -> Result<(), CertError> {
        let (Some(cert_file), Some(key_file)) = (&self.cert_file, &self.key_file) else {
            return Ok(());
        };
        let cert_pem = std::fs::read_to_string(cert_file)?;
        let key_pem = std::fs::read_to_string(key_file)?;
        let bundle = CertificateBundle::from_pem(cert_pem, key_pem)?;
        info!(
            path = %cert_file.display(),
            expires = %bundle.not_after(),
            "loaded certificate from file"
        );
        self.adopt(bundle)?;
        Ok(())
    }

    /// Write the bundle to the local files and fire the write notifier.
    /// A write failure is logged, not propagated: the in-memory bundle is
    /// already adopted and keeps being served.
    fn file_write(&self, bundle: &CertificateBundle) {
        match self.file_write_atomic(bundle) {
            Ok(true) => {
                if let Some(cert_file) = &self.cert_file {
                    info!(path = %cert_file.display(), "wrote certificate to file");
                }
            }
            Ok(false) => {}
            Err(e) => error!(error = %e, "failed to write certificate files"),
        }
        // Non-blocking notify; a pending signal already says it all.
        let _ = self.write_tx.try_send(());
    }

    /// Write to `path~pid~` siblings, then rename over the real files.
    /// Returns false when no file cache is configured.
    fn file_write_atomic(&self, bundle: &CertificateBundle) -> Result<bool, CertError> {
        use std::os::unix::fs::PermissionsExt;

        let (Some(cert_file), Some(key_file)) = (&self.cert_file, &self.key_file) else {
            return Ok(false);
        };
        let pid = std::process::id();
        let cert_tmp = sibling(cert_file, pid);
        let key_tmp = sibling(key_file, pid);

        let result = (|| -> Result<(), CertError> {
            std::fs::write(&cert_tmp, bundle.cert_pem())?;
            std::fs::set_permissions(&cert_tmp, std::fs::Permissions::from_mode(0o644))?;
            std::fs::write(&key_tmp, bundle.key_pem())?;
            std::fs::set_permissions(&key_tmp, std::fs::Permissions::from_mode(0o600))?;
            std::fs::rename(&cert_tmp, cert_file)?;
            std::fs::rename(&key_tmp, key_file)?;
            Ok(())
        })();
        let _ = std::fs::remove_file(&cert_tmp);
        let _ = std::fs::remove_file(&key_tmp);
        result.map(|()| true)
    }
}

fn sibling(path: &std::path::Path, pid: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!("~{}~", pid));
    PathBuf::from(name)
}

/// Build the rustls identity for a bundle. Also serves as the validation
/// that the key material is usable before the bundle is adopted.
fn build_certified_key(bundle: &CertificateBundle) -> Result<CertifiedKey, CertError> {
    let chain: Vec<CertificateDer<'static>> = bundle
        .chain_der()
        .iter()
        .map(|der| CertificateDer::from(der.clone()))
        .collect();
    let (label, der) = parse_key_pem(bundle.key_pem())?;
    let key: PrivateKeyDer<'static> = match label.as_str() {
        "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der)),
        "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(der)),
        "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der)),
        other => return Err(CertError::UnsupportedKeyType(other.to_string())),
    };
    let signing_key = any_supported_type(&key)
        .map_err(|e| CertError::CertificateParse(format!("unusable private key: {}", e)))?;
    Ok(CertifiedKey::new(chain, signing_key))
}

struct LeafKey {
    key_pair: rcgen::KeyPair,
    key_pem: String,
}

/// The renewal control loop. Only this task touches the ACME client
/// state, the open order and the leaf key.
struct RenewalTask {
    shared: Arc<ManagerShared>,
    locker: Arc<dyn Locker>,
    responder: Arc<dyn Responder>,
    storer: Option<Arc<dyn Storer>>,
    challenge_type: ChallengeType,
    key_type: KeyType,
    directory_url: String,
    account: Option<Account>,
    order: Option<Order>,
    leaf_key: Option<LeafKey>,
}

impl RenewalTask {
    async fn run(mut self) {
        if let Err(e) = self.shared.file_load() {
            info!(error = %e, "no local certificate loaded");
        }
        loop {
            let wait = self.check_renew().await;
            info!(wait_secs = wait.as_secs(), "scheduling next certificate renewal check");
            tokio::time::sleep(wait).await;
        }
    }

    /// One check: serve, adopt from the store, or renew. Returns how long
    /// to sleep before the next check.
    async fn check_renew(&mut self) -> Duration {
        let renew_before = self.shared.renew_before;
        if let Some(bundle) = self.shared.current_bundle() {
            let remaining = bundle.time_until_renewal(renew_before);
            if remaining > ChronoDuration::zero() {
                return to_std(remaining);
            }
        }
        // A peer may have renewed already; prefer its bundle to an order.
        if let Some(storer) = self.storer.clone() {
            match storer.read().await {
                Ok(bundle) => {
                    let remaining = bundle.time_until_renewal(renew_before);
                    match self.shared.adopt_if_newer(bundle) {
                        Ok(Some(adopted)) => self.shared.file_write(&adopted),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "cannot adopt stored certificate"),
                    }
                    if remaining > ChronoDuration::zero() {
                        return to_std(remaining);
                    }
                }
                Err(e) => warn!(error = %e, "failed to read certificate from store"),
            }
        }
        if let Err(e) = self.renew().await {
            error!(error = %e, "certificate renewal failed");
            return jittery_hour();
        }
        match self.shared.current_bundle() {
            Some(bundle) => {
                let remaining = bundle.time_until_renewal(renew_before);
                if remaining > ChronoDuration::hours(1) {
                    to_std(remaining)
                } else {
                    jittery_hour()
                }
            }
            None => jittery_hour(),
        }
    }

    /// A locked ACME transaction.
    async fn renew(&mut self) -> Result<(), CertError> {
        self.locker.lock().await?;
        let result = self.renew_locked().await;
        if let Err(e) = self.locker.unlock().await {
            warn!(error = %e, "failed to release store lock");
        }
        result
    }

    async fn renew_locked(&mut self) -> Result<(), CertError> {
        // Double-checked: another peer may have renewed while we waited
        // for the lock.
        if let Some(storer) = self.storer.clone() {
            if let Ok(bundle) = storer.read().await {
                if let Some(adopted) = self.shared.adopt_if_newer(bundle)? {
                    self.shared.file_write(&adopted);
                    return Ok(());
                }
            }
        }

        let lost = self.locker.lost_channel();
        let bundle = self.request_certificate().await?;
        info!(
            name = %self.shared.names[0],
            expires = %bundle.not_after(),
            "certificate issued"
        );
        let bundle = self.shared.adopt(bundle)?;
        self.shared.file_write(&bundle);

        // Write to the store only if we still hold the lock.
        if let Some(rx) = lost {
            if *rx.borrow() {
                return Err(CertError::LockLost);
            }
        }
        if let Some(storer) = &self.storer {
            storer.write(&bundle).await?;
        }
        Ok(())
    }

    /// Drive a full ACME order to an issued bundle.
    async fn request_certificate(&mut self) -> Result<CertificateBundle, CertError> {
        self.ensure_account().await?;
        self.ensure_order().await?;
        let mut order = self
            .order
            .take()
            .ok_or_else(|| CertError::OrderCreation("no open order".into()))?;
        match self.drive_order(&mut order).await {
            Ok(bundle) => Ok(bundle),
            Err(e) => {
                // Keep the order; the next attempt may resume it.
                self.order = Some(order);
                Err(e)
            }
        }
    }

    async fn drive_order(&mut self, order: &mut Order) -> Result<CertificateBundle, CertError> {
        self.authorize_all(order).await?;
        let result = self.finalize_order(order).await;
        self.responder.cleanup().await;
        result
    }

    /// Fulfill every pending authorization with the configured challenge.
    async fn authorize_all(&mut self, order: &mut Order) -> Result<(), CertError> {
        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| {
                CertError::OrderCreation(format!("failed to get authorization: {}", e))
            })?;
            let domain = match &authz.identifier().identifier {
                Identifier::Dns(domain) => domain.clone(),
                _ => continue,
            };
            if authz.status == AuthorizationStatus::Valid {
                debug!(domain = %domain, "authorization already valid");
                continue;
            }
            let acme_type = match self.challenge_type {
                ChallengeType::Dns01 => AcmeChallengeType::Dns01,
                ChallengeType::Http01 => AcmeChallengeType::Http01,
            };
            let mut challenge =
                authz
                    .challenge(acme_type)
                    .ok_or_else(|| CertError::Authorization {
                        domain: domain.clone(),
                        message: "no viable challenge type found".into(),
                    })?;
            let key_authorization = challenge.key_authorization();
            let (key, value) = match self.challenge_type {
                ChallengeType::Http01 => (
                    format!("{}/{}", ACME_PATH, challenge.token),
                    key_authorization.as_str().to_string(),
                ),
                ChallengeType::Dns01 => (
                    format!("_acme-challenge.{}", domain),
                    dns01_digest(key_authorization.as_str()),
                ),
            };
            self.responder.respond(&key, &value).await?;
            challenge
                .set_ready()
                .await
                .map_err(|e| CertError::Authorization {
                    domain,
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn finalize_order(&mut self, order: &mut Order) -> Result<CertificateBundle, CertError> {
        // Wait for the CA to validate the challenges.
        let deadline = tokio::time::Instant::now() + CHALLENGE_TIMEOUT;
        loop {
            let state = order.refresh().await.map_err(|e| {
                CertError::OrderCreation(format!("failed to refresh order: {}", e))
            })?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(CertError::OrderCreation("order became invalid".into()));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(CertError::Timeout(
                            "waiting for order to become ready".into(),
                        ));
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        debug!("order was authorized");

        self.ensure_leaf_key()?;
        let Some(leaf_key) = self.leaf_key.as_ref() else {
            return Err(CertError::Finalization("leaf key unavailable".into()));
        };
        let mut params = rcgen::CertificateParams::new(self.shared.names.clone())
            .map_err(|e| CertError::Finalization(format!("failed to create CSR params: {}", e)))?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, self.shared.names[0].clone());
        let csr = params
            .serialize_request(&leaf_key.key_pair)
            .map_err(|e| CertError::Finalization(format!("failed to serialize CSR: {}", e)))?
            .der()
            .to_vec();
        order
            .finalize_csr(&csr)
            .await
            .map_err(|e| CertError::Finalization(format!("failed to finalize order: {}", e)))?;

        // Wait for the certificate to be issued.
        let deadline = tokio::time::Instant::now() + ISSUANCE_TIMEOUT;
        let chain_pem = loop {
            let state = order.refresh().await.map_err(|e| {
                CertError::Finalization(format!("failed to refresh order: {}", e))
            })?;
            match state.status {
                OrderStatus::Valid => {
                    let chain = order.certificate().await.map_err(|e| {
                        CertError::Finalization(format!("failed to fetch certificate: {}", e))
                    })?;
                    break chain.ok_or_else(|| {
                        CertError::Finalization("no certificate in response".into())
                    })?;
                }
                OrderStatus::Invalid => {
                    return Err(CertError::Finalization("order became invalid".into()));
                }
                _ => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(CertError::Timeout("waiting for certificate".into()));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        let chain_der = parse_chain(&chain_pem)?;
        CertificateBundle::from_der_chain(chain_der, leaf_key.key_pem.clone())
    }

    /// Register an ephemeral ACME account on first use.
    async fn ensure_account(&mut self) -> Result<(), CertError> {
        if self.account.is_some() {
            return Ok(());
        }
        info!(directory = %self.directory_url, "registering ACME account");
        let (account, _credentials) = Account::builder()
            .map_err(|e| CertError::AccountCreation(e.to_string()))?
            .create(
                &NewAccount {
                    contact: &[],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await
            .map_err(|e| CertError::AccountCreation(e.to_string()))?;
        self.account = Some(account);
        Ok(())
    }

    /// Reuse the open order while the CA still honors it.
    async fn ensure_order(&mut self) -> Result<(), CertError> {
        let mut keep = false;
        if let Some(order) = self.order.as_mut() {
            keep = match order.refresh().await {
                Ok(state) => state.status != OrderStatus::Invalid,
                Err(e) => {
                    debug!(error = %e, "discarding stale order");
                    false
                }
            };
        }
        if keep {
            return Ok(());
        }
        self.order = None;

        let account = self
            .account
            .as_ref()
            .ok_or_else(|| CertError::AccountCreation("no ACME account".into()))?;
        let identifiers: Vec<Identifier> = self
            .shared
            .names
            .iter()
            .map(|name| Identifier::Dns(name.clone()))
            .collect();
        let order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| CertError::OrderCreation(e.to_string()))?;
        self.order = Some(order);
        Ok(())
    }

    /// Generate the persistent leaf key on first renewal.
    fn ensure_leaf_key(&mut self) -> Result<(), CertError> {
        if self.leaf_key.is_some() {
            return Ok(());
        }
        let leaf_key = match self.key_type {
            KeyType::Ec => {
                let key_pair = rcgen::KeyPair::generate().map_err(|e| {
                    CertError::Finalization(format!("failed to generate EC key: {}", e))
                })?;
                let key_pem = key_pair.serialize_pem();
                LeafKey { key_pair, key_pem }
            }
            KeyType::Rsa => {
                use rsa::pkcs8::EncodePrivateKey;
                let private_key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
                    .map_err(|e| {
                        CertError::Finalization(format!("failed to generate RSA key: {}", e))
                    })?;
                let der = private_key.to_pkcs8_der().map_err(|e| {
                    CertError::Finalization(format!("failed to encode RSA key: {}", e))
                })?;
                let pkcs8 = PrivatePkcs8KeyDer::from(der.as_bytes());
                let key_pair =
                    rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256)
                        .map_err(|e| {
                            CertError::Finalization(format!("failed to load RSA key: {}", e))
                        })?;
                let key_pem = encode_pem("PRIVATE KEY", der.as_bytes());
                LeafKey { key_pair, key_pem }
            }
        };
        self.leaf_key = Some(leaf_key);
        Ok(())
    }
}

/// Compute the dns-01 TXT value: base64url SHA-256 of the key
/// authorization.
fn dns01_digest(key_authorization: &str) -> String {
    let digest = Sha256::digest(key_authorization.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

fn to_std(duration: ChronoDuration) -> Duration {
    duration.to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata::{TEST_CHAIN_PEM, TEST_UNTYPED_KEY_PEM};

    fn shared() -> (tempfile::TempDir, Arc<ManagerShared>, mpsc::Receiver<()>) {
        let dir = tempfile::tempdir().unwrap();
        let (write_tx, write_rx) = mpsc::channel(1);
        let shared = Arc::new(ManagerShared {
            names: vec!["www.example.com".to_string()],
            cert_file: Some(dir.path().join("cert.pem")),
            key_file: Some(dir.path().join("key.pem")),
            renew_before: 0.33,
            write_tx,
            current: RwLock::new(None),
        });
        (dir, shared, write_rx)
    }

    fn full_bundle() -> CertificateBundle {
        CertificateBundle::from_pem(TEST_CHAIN_PEM.to_string(), TEST_UNTYPED_KEY_PEM.to_string())
            .unwrap()
    }

    /// The CA certificate alone; expires earlier than the full chain's
    /// leaf.
    fn older_bundle() -> CertificateBundle {
        let chain = parse_chain(TEST_CHAIN_PEM).unwrap();
        let ca_pem = crate::bundle::pem_from_chain(&chain[1..]);
        CertificateBundle::from_pem(ca_pem, TEST_UNTYPED_KEY_PEM.to_string()).unwrap()
    }

    #[test]
    fn test_adoption_is_monotone() {
        let (_dir, shared, _rx) = shared();
        let newer = full_bundle();
        let older = older_bundle();
        assert!(newer.not_after() > older.not_after());

        assert!(shared.adopt_if_newer(older.clone()).unwrap().is_some());
        assert!(shared.adopt_if_newer(newer.clone()).unwrap().is_some());
        // Once the newer bundle is in, the older one is refused.
        assert!(shared.adopt_if_newer(older).unwrap().is_none());
        assert_eq!(shared.current_bundle().unwrap().as_ref(), &newer);
    }

    #[test]
    fn test_file_write_and_notify() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, shared, mut rx) = shared();
        let bundle = full_bundle();
        shared.file_write(&bundle);

        let cert_file = shared.cert_file.as_ref().unwrap();
        let key_file = shared.key_file.as_ref().unwrap();
        assert_eq!(std::fs::read_to_string(cert_file).unwrap(), bundle.cert_pem());
        assert_eq!(std::fs::read_to_string(key_file).unwrap(), bundle.key_pem());
        let key_mode = std::fs::metadata(key_file).unwrap().permissions().mode();
        assert_eq!(key_mode & 0o777, 0o600);
        let cert_mode = std::fs::metadata(cert_file).unwrap().permissions().mode();
        assert_eq!(cert_mode & 0o777, 0o644);

        // Exactly one pending signal, even after two writes.
        shared.file_write(&bundle);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // No sibling temp files left behind.
        let dir = cert_file.parent().unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains('~'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_load_only_serves_certified_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert_file = dir.path().join("cert.pem");
        let key_file = dir.path().join("key.pem");
        std::fs::write(&cert_file, TEST_CHAIN_PEM).unwrap();
        std::fs::write(&key_file, TEST_UNTYPED_KEY_PEM).unwrap();

        let manager = CertificateManager::load_only(cert_file, key_file).unwrap();
        let certified = manager.certified_key().unwrap();
        assert_eq!(certified.cert.len(), 2);
        assert!(manager.current_bundle().is_some());
    }

    #[tokio::test]
    async fn test_missing_files_fail_load_only() {
        let dir = tempfile::tempdir().unwrap();
        let result = CertificateManager::load_only(
            dir.path().join("cert.pem"),
            dir.path().join("key.pem"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_dns01_digest_shape() {
        let value = dns01_digest("token.thumbprint");
        assert!(!value.is_empty());
        assert!(!value.contains('+'));
        assert!(!value.contains('/'));
        assert!(!value.contains('='));
    }

    #[test]
    fn test_sibling_naming() {
        let path = sibling(std::path::Path::new("/var/lib/cert.pem"), 42);
        assert_eq!(path, PathBuf::from("/var/lib/cert.pem~42~"));
    }
}
