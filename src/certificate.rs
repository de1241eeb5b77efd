//! Certificate store for per-domain TLS certificates signed by the local CA.
//!
//! Certificates are never renewed automatically: an expired certificate stays
//! listed (and reported invalid) until it is regenerated or deleted.

use crate::authority::{CertificateAuthority, TrustStore};
use crate::database::{Certificate, CertificateKind, DatabaseManager};
use crate::error::{Error, Result};
use crate::events::{ChangeEvent, EventBus};
use crate::registry::validate_domain;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RootCaStatus {
    Available,
    Missing,
}

/// A certificate as reported to callers, validity evaluated at read time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    pub domain: String,
    pub kind: CertificateKind,
    pub issuer: String,
    pub expires_at: DateTime<Utc>,
    pub is_valid: bool,
}

impl Certificate {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

pub struct CertificateStore {
    db: Arc<DatabaseManager>,
    authority: Arc<dyn CertificateAuthority>,
    trust: Arc<dyn TrustStore>,
    certs_dir: PathBuf,
    events: EventBus,
    certs: RwLock<BTreeMap<String, Certificate>>,
}

impl CertificateStore {
    /// Load persisted certificates and record the authority's root
    pub fn open<P: AsRef<Path>>(
        certs_dir: P,
        db: Arc<DatabaseManager>,
        authority: Arc<dyn CertificateAuthority>,
        trust: Arc<dyn TrustStore>,
        events: EventBus,
    ) -> Result<Self> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        fs::create_dir_all(&certs_dir)?;

        let mut certs: BTreeMap<String, Certificate> = db
            .list_certificates()?
            .into_iter()
            .map(|c| (c.domain.clone(), c))
            .collect();

        certs.retain(|_, c| c.kind == CertificateKind::Leaf);
        if let Some(root) = authority.root() {
            let record = Certificate {
                domain: authority.name().to_string(),
                kind: CertificateKind::RootAuthority,
                issuer: authority.name().to_string(),
                expires_at: root.expires_at,
                cert_path: root.cert_path,
                key_path: root.key_path,
                created_at: Utc::now(),
            };
            db.upsert_certificate(&record)?;
            certs.insert(record.domain.clone(), record);
        }

        Ok(Self {
            db,
            authority,
            trust,
            certs_dir,
            events,
            certs: RwLock::new(certs),
        })
    }

    /// Issue a leaf for `domain`, replacing any previous one
    pub fn generate(&self, domain: &str) -> Result<Certificate> {
        let domain = validate_domain(domain).map_err(|e| Error::Ca(e.to_string()))?;

        let mut certs = self.certs.write();
        if matches!(certs.get(&domain), Some(c) if c.kind == CertificateKind::RootAuthority) {
            return Err(Error::Ca(format!("{domain} is the root CA name")));
        }

        let signed = self.authority.sign(&domain)?;

        let stem = Self::sanitize_domain(&domain);
        let cert_path = self.certs_dir.join(format!("{stem}.crt"));
        let key_path = self.certs_dir.join(format!("{stem}.key"));

        let record = Certificate {
            domain: domain.clone(),
            kind: CertificateKind::Leaf,
            issuer: self.authority.name().to_string(),
            expires_at: signed.expires_at,
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
            created_at: Utc::now(),
        };

        let files = [
            PendingFile::new(cert_path, &signed.cert_pem),
            PendingFile::new(key_path, &signed.key_pem),
        ];
        self.commit(&files, &record)?;

        certs.insert(domain.clone(), record.clone());
        drop(certs);

        info!("Issued certificate for {} (expires {})", domain, record.expires_at);
        self.events.publish(ChangeEvent::CertificateIssued { domain });

        Ok(record)
    }

    pub fn delete(&self, domain: &str) -> Result<()> {
        let domain = domain.trim().to_ascii_lowercase();
        let mut certs = self.certs.write();

        let existing = match certs.get(&domain) {
            Some(c) if c.kind == CertificateKind::Leaf => c.clone(),
            Some(_) => return Err(Error::Validation("the root CA cannot be deleted".to_string())),
            None => return Err(Error::NotFound(format!("certificate for {domain}"))),
        };

        self.db.delete_certificate(&domain)?;
        certs.remove(&domain);
        drop(certs);

        for path in [&existing.cert_path, &existing.key_path] {
            if let Err(e) = fs::remove_file(path) {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }

        info!("Deleted certificate for {}", domain);
        self.events.publish(ChangeEvent::CertificateRemoved { domain });

        Ok(())
    }

    pub fn list_certificates(&self) -> Vec<CertificateInfo> {
        self.list_certificates_at(Utc::now())
    }

    /// Certificates ordered by domain, validity evaluated against `now`
    pub fn list_certificates_at(&self, now: DateTime<Utc>) -> Vec<CertificateInfo> {
        self.certs
            .read()
            .values()
            .map(|c| CertificateInfo {
                domain: c.domain.clone(),
                kind: c.kind,
                issuer: c.issuer.clone(),
                expires_at: c.expires_at,
                is_valid: c.is_valid_at(now),
            })
            .collect()
    }

    /// Domains holding a valid leaf certificate at `now`
    pub fn certified_domains(&self, now: DateTime<Utc>) -> BTreeSet<String> {
        self.certs
            .read()
            .values()
            .filter(|c| c.kind == CertificateKind::Leaf && c.is_valid_at(now))
            .map(|c| c.domain.clone())
            .collect()
    }

    /// Idempotent: an already trusted root is a successful no-op
    pub fn install_root_ca(&self) -> Result<()> {
        let root = self
            .authority
            .root()
            .ok_or_else(|| Error::Install("root CA is missing".to_string()))?;
        let name = self.authority.name();

        if self.trust.is_installed(name) {
            info!("Root CA already trusted");
            return Ok(());
        }

        self.trust.install(&root.pem, name)
    }

    pub fn root_ca_status(&self) -> RootCaStatus {
        if self.authority.root().is_some() {
            RootCaStatus::Available
        } else {
            RootCaStatus::Missing
        }
    }

    pub fn root_ca_pem(&self) -> Option<String> {
        self.authority.root().map(|r| r.pem)
    }

    /// Signing material for a domain with a valid leaf, ready for rustls
    pub fn tls_material(&self, domain: &str, now: DateTime<Utc>) -> Option<Arc<CertifiedKey>> {
        let cert = self.certs.read().get(domain).cloned()?;
        if cert.kind != CertificateKind::Leaf || !cert.is_valid_at(now) {
            return None;
        }

        match load_certified_key(&cert.cert_path, &cert.key_path) {
            Ok(key) => Some(Arc::new(key)),
            Err(e) => {
                warn!("Cannot load TLS material for {}: {}", domain, e);
                None
            }
        }
    }

    /// Put the new files in place and record them, or leave the previous
    /// files and row untouched. The row is written last.
    fn commit(&self, files: &[PendingFile], record: &Certificate) -> Result<()> {
        for file in files {
            if let Err(e) = fs::write(&file.staged, &file.contents) {
                Self::discard(files);
                return Err(e.into());
            }
        }

        let mut moved: Vec<&PendingFile> = Vec::new();
        let outcome = files
            .iter()
            .try_for_each(|file| {
                file.swap_in()?;
                moved.push(file);
                Ok::<(), Error>(())
            })
            .and_then(|_| self.db.upsert_certificate(record));

        match outcome {
            Ok(()) => {
                for file in files {
                    let _ = fs::remove_file(&file.backup);
                }
                Ok(())
            }
            Err(e) => {
                for file in moved.iter().rev() {
                    file.restore();
                }
                Self::discard(files);
                Err(e)
            }
        }
    }

    fn discard(files: &[PendingFile]) {
        for file in files {
            let _ = fs::remove_file(&file.staged);
        }
    }

    /// Sanitize domain name for filesystem
    fn sanitize_domain(domain: &str) -> String {
        domain.replace('*', "wildcard")
    }
}

/// A file about to replace `target`; `staged` holds the new contents and
/// `backup` the previous ones until the commit succeeds
struct PendingFile {
    target: PathBuf,
    staged: PathBuf,
    backup: PathBuf,
    contents: String,
}

impl PendingFile {
    fn new(target: PathBuf, contents: &str) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = target.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            staged: with_suffix(".tmp"),
            backup: with_suffix(".bak"),
            target,
            contents: contents.to_string(),
        }
    }

    /// Move the current file aside, then the staged one into place. On error
    /// the previous file is back where it was.
    fn swap_in(&self) -> Result<()> {
        let had_previous = self.target.exists();
        if had_previous {
            fs::rename(&self.target, &self.backup)?;
        }
        if let Err(e) = fs::rename(&self.staged, &self.target) {
            if had_previous {
                let _ = fs::rename(&self.backup, &self.target);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Undo a completed `swap_in`
    fn restore(&self) {
        let result = if self.backup.exists() {
            fs::rename(&self.backup, &self.target)
        } else {
            fs::remove_file(&self.target)
        };
        if let Err(e) = result {
            warn!("Could not restore {}: {}", self.target.display(), e);
        }
    }
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey> {
    let mut cert_reader = BufReader::new(fs::File::open(cert_path)?);
    let chain = rustls_pemfile::certs(&mut cert_reader).collect::<std::io::Result<Vec<CertificateDer<'static>>>>()?;
    if chain.is_empty() {
        return Err(Error::Ca(format!("no certificate in {}", cert_path.display())));
    }

    let mut key_reader = BufReader::new(fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| Error::Ca(format!("no private key in {}", key_path.display())))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| Error::Ca(format!("unsupported key in {}: {e}", key_path.display())))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{LocalAuthority, RootCertificate, SignedCertificate, CA_COMMON_NAME};
    use chrono::Duration;
    use parking_lot::Mutex;
    use tempfile::{tempdir, TempDir};

    /// Signs nothing real; expiry is controlled by the test
    struct FixedAuthority {
        lifetime: Duration,
        available: bool,
    }

    impl CertificateAuthority for FixedAuthority {
        fn name(&self) -> &str {
            "Test CA"
        }

        fn sign(&self, domain: &str) -> Result<SignedCertificate> {
            if !self.available {
                return Err(Error::Ca("authority offline".to_string()));
            }
            Ok(SignedCertificate {
                cert_pem: format!("cert for {domain}"),
                key_pem: format!("key for {domain}"),
                expires_at: Utc::now() + self.lifetime,
            })
        }

        fn root(&self) -> Option<RootCertificate> {
            None
        }
    }

    #[derive(Default)]
    struct RecordingTrust {
        installed: Mutex<Vec<String>>,
    }

    impl TrustStore for RecordingTrust {
        fn is_installed(&self, name: &str) -> bool {
            self.installed.lock().iter().any(|n| n == name)
        }

        fn install(&self, _cert_pem: &str, name: &str) -> Result<()> {
            self.installed.lock().push(name.to_string());
            Ok(())
        }
    }

    fn store_with(authority: Arc<dyn CertificateAuthority>, trust: Arc<RecordingTrust>) -> (TempDir, CertificateStore) {
        let dir = tempdir().unwrap();
        let db = Arc::new(DatabaseManager::new(dir.path().join("test.db")).unwrap());
        let store = CertificateStore::open(dir.path().join("certs"), db, authority, trust, EventBus::new()).unwrap();
        (dir, store)
    }

    fn fixed(lifetime: Duration) -> Arc<dyn CertificateAuthority> {
        Arc::new(FixedAuthority { lifetime, available: true })
    }

    #[test]
    fn test_sanitize_domain() {
        assert_eq!(CertificateStore::sanitize_domain("example.local"), "example.local");
        assert_eq!(CertificateStore::sanitize_domain("*.example.local"), "wildcard.example.local");
    }

    #[test]
    fn test_generate_replaces_previous() {
        let (_dir, store) = store_with(fixed(Duration::days(30)), Arc::default());

        let first = store.generate("myapp.local").unwrap();
        assert!(first.cert_path.exists());
        let second = store.generate("MyApp.local").unwrap();

        let certs = store.list_certificates();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].domain, "myapp.local");
        assert!(certs[0].is_valid);
        assert!(second.expires_at >= first.expires_at);
    }

    #[test]
    fn test_failed_regeneration_keeps_previous_certificate() {
        let (dir, store) = store_with(fixed(Duration::days(30)), Arc::default());
        let first = store.generate("myapp.local").unwrap();
        fs::write(&first.cert_path, "original cert").unwrap();
        fs::write(&first.key_path, "original key").unwrap();

        // The key cannot be moved aside onto a non-empty directory
        let blocked = dir.path().join("certs").join("myapp.local.key.bak");
        fs::create_dir_all(blocked.join("occupied")).unwrap();

        assert!(matches!(store.generate("myapp.local"), Err(Error::Io(_))));

        assert_eq!(fs::read_to_string(&first.cert_path).unwrap(), "original cert");
        assert_eq!(fs::read_to_string(&first.key_path).unwrap(), "original key");
        assert!(!dir.path().join("certs").join("myapp.local.crt.tmp").exists());
        assert!(!dir.path().join("certs").join("myapp.local.key.tmp").exists());
        assert!(!dir.path().join("certs").join("myapp.local.crt.bak").exists());
        assert_eq!(store.list_certificates()[0].expires_at, first.expires_at);

        let db = Arc::new(DatabaseManager::new(dir.path().join("test.db")).unwrap());
        let reopened = CertificateStore::open(
            dir.path().join("certs"),
            db,
            fixed(Duration::days(30)),
            Arc::new(RecordingTrust::default()),
            EventBus::new(),
        )
        .unwrap();
        assert_eq!(reopened.list_certificates()[0].expires_at, first.expires_at);
    }

    #[test]
    fn test_list_is_ordered_by_domain() {
        let (_dir, store) = store_with(fixed(Duration::days(30)), Arc::default());
        store.generate("zeta.local").unwrap();
        store.generate("alpha.local").unwrap();

        let domains: Vec<String> = store.list_certificates().into_iter().map(|c| c.domain).collect();
        assert_eq!(domains, vec!["alpha.local", "zeta.local"]);
    }

    #[test]
    fn test_validity_flips_with_time() {
        let (_dir, store) = store_with(fixed(Duration::hours(1)), Arc::default());
        store.generate("myapp.local").unwrap();

        let now = Utc::now();
        assert!(store.list_certificates_at(now)[0].is_valid);
        assert!(store.certified_domains(now).contains("myapp.local"));

        let later = now + Duration::hours(2);
        assert!(!store.list_certificates_at(later)[0].is_valid);
        assert!(store.certified_domains(later).is_empty());
    }

    #[test]
    fn test_expired_certificate_stays_listed() {
        let (_dir, store) = store_with(fixed(Duration::seconds(-5)), Arc::default());
        store.generate("old.local").unwrap();

        let certs = store.list_certificates();
        assert_eq!(certs.len(), 1);
        assert!(!certs[0].is_valid);
    }

    #[test]
    fn test_ca_failure_leaves_other_certificates() {
        let dir = tempdir().unwrap();
        let db = Arc::new(DatabaseManager::new(dir.path().join("test.db")).unwrap());
        let good = CertificateStore::open(
            dir.path().join("certs"),
            db.clone(),
            fixed(Duration::days(1)),
            Arc::new(RecordingTrust::default()),
            EventBus::new(),
        )
        .unwrap();
        good.generate("one.local").unwrap();

        let offline = CertificateStore::open(
            dir.path().join("certs"),
            db,
            Arc::new(FixedAuthority { lifetime: Duration::days(1), available: false }),
            Arc::new(RecordingTrust::default()),
            EventBus::new(),
        )
        .unwrap();
        assert!(matches!(offline.generate("two.local"), Err(Error::Ca(_))));
        assert!(matches!(offline.generate("not a domain"), Err(Error::Ca(_))));

        let domains: Vec<String> = offline.list_certificates().into_iter().map(|c| c.domain).collect();
        assert_eq!(domains, vec!["one.local"]);
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = store_with(fixed(Duration::days(1)), Arc::default());
        let cert = store.generate("myapp.local").unwrap();

        store.delete("myapp.local").unwrap();
        assert!(store.list_certificates().is_empty());
        assert!(!cert.cert_path.exists());
        assert!(matches!(store.delete("myapp.local"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_root_ca_is_tagged_and_protected() {
        let dir = tempdir().unwrap();
        let certs_dir = dir.path().join("certs");
        let authority = Arc::new(LocalAuthority::open(&certs_dir).unwrap());
        let db = Arc::new(DatabaseManager::new(dir.path().join("test.db")).unwrap());
        let store = CertificateStore::open(&certs_dir, db, authority, Arc::new(RecordingTrust::default()), EventBus::new()).unwrap();

        assert_eq!(store.root_ca_status(), RootCaStatus::Available);
        let certs = store.list_certificates();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].kind, CertificateKind::RootAuthority);
        assert_eq!(certs[0].domain, CA_COMMON_NAME);
        assert!(store.certified_domains(Utc::now()).is_empty());
        assert!(matches!(store.delete(CA_COMMON_NAME), Err(Error::Validation(_))));

        store.generate("myapp.local").unwrap();
        assert!(store.tls_material("myapp.local", Utc::now()).is_some());
        assert!(store.tls_material("other.local", Utc::now()).is_none());
    }

    #[test]
    fn test_install_root_ca_is_idempotent() {
        let dir = tempdir().unwrap();
        let certs_dir = dir.path().join("certs");
        let authority = Arc::new(LocalAuthority::open(&certs_dir).unwrap());
        let db = Arc::new(DatabaseManager::new(dir.path().join("test.db")).unwrap());
        let trust = Arc::new(RecordingTrust::default());
        let store = CertificateStore::open(&certs_dir, db, authority, trust.clone(), EventBus::new()).unwrap();

        store.install_root_ca().unwrap();
        store.install_root_ca().unwrap();
        assert_eq!(trust.installed.lock().len(), 1);
    }

    #[test]
    fn test_missing_root_reports_missing() {
        let (_dir, store) = store_with(fixed(Duration::days(1)), Arc::default());
        assert_eq!(store.root_ca_status(), RootCaStatus::Missing);
        assert!(matches!(store.install_root_ca(), Err(Error::Install(_))));
    }
}
