//! Certificate authority and trust store collaborators.
//!
//! The store never signs or installs anything itself: it goes through
//! [`CertificateAuthority`] for issuance and [`TrustStore`] for making the
//! root CA trusted by the OS.

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use rcgen::{
    BasicConstraints, Certificate as RcgenCertificate, CertificateParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

pub const CA_COMMON_NAME: &str = "LocalCan Development CA";
const CA_ORGANIZATION: &str = "LocalCan";
const CA_VALIDITY_DAYS: i64 = 3650;
/// Browsers reject leaf certificates valid for longer than this
const LEAF_VALIDITY_DAYS: i64 = 825;

/// PEM material returned by the authority
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub expires_at: DateTime<Utc>,
}

/// The trust anchor as seen by the store
#[derive(Debug, Clone)]
pub struct RootCertificate {
    pub pem: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub expires_at: DateTime<Utc>,
}

pub trait CertificateAuthority: Send + Sync {
    /// Common name of the authority, recorded as the issuer of every leaf
    fn name(&self) -> &str;

    fn sign(&self, domain: &str) -> Result<SignedCertificate>;

    /// Root certificate, or `None` when the CA material is gone
    fn root(&self) -> Option<RootCertificate>;
}

/// Self-managed CA kept as `rootCA.pem` / `rootCA-key.pem` in the certs directory
pub struct LocalAuthority {
    ca: RcgenCertificate,
    cert_path: PathBuf,
    key_path: PathBuf,
    expires_at: DateTime<Utc>,
}

impl LocalAuthority {
    /// Load the root CA from `certs_dir`, generating it on first use
    pub fn open<P: AsRef<Path>>(certs_dir: P) -> Result<Self> {
        let certs_dir = certs_dir.as_ref();
        fs::create_dir_all(certs_dir)?;

        let cert_path = certs_dir.join("rootCA.pem");
        let key_path = certs_dir.join("rootCA-key.pem");

        let cert_exists = cert_path.exists();
        let key_exists = key_path.exists();

        if cert_exists != key_exists {
            return Err(Error::Ca(format!(
                "root CA is partially configured in {}: remove rootCA.pem and rootCA-key.pem to regenerate",
                certs_dir.display()
            )));
        }

        let params = if cert_exists {
            let cert_pem = fs::read_to_string(&cert_path)?;
            let key_pem = fs::read_to_string(&key_path)?;
            let key_pair = KeyPair::from_pem(&key_pem)
                .map_err(|e| Error::Ca(format!("cannot parse {}: {e}", key_path.display())))?;
            CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)
                .map_err(|e| Error::Ca(format!("cannot parse {}: {e}", cert_path.display())))?
        } else {
            Self::ca_params()
        };

        let expires_at = Utc
            .timestamp_opt(params.not_after.unix_timestamp(), 0)
            .single()
            .ok_or_else(|| Error::Ca("root CA expiry out of range".to_string()))?;
        let ca = RcgenCertificate::from_params(params).map_err(ca_error)?;

        if !cert_exists {
            let cert_pem = ca.serialize_pem().map_err(ca_error)?;
            fs::write(&cert_path, cert_pem)?;
            fs::write(&key_path, ca.serialize_private_key_pem())?;
            info!("Generated root CA at {}", cert_path.display());
        }

        Ok(Self {
            ca,
            cert_path,
            key_path,
            expires_at,
        })
    }

    fn ca_params() -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        set_not_after(&mut params, Utc::now() + Duration::days(CA_VALIDITY_DAYS));
        params
    }
}

impl CertificateAuthority for LocalAuthority {
    fn name(&self) -> &str {
        CA_COMMON_NAME
    }

    fn sign(&self, domain: &str) -> Result<SignedCertificate> {
        let mut params = CertificateParams::new(vec![domain.to_string()]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        params.distinguished_name = dn;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let expires_at = set_not_after(&mut params, Utc::now() + Duration::days(LEAF_VALIDITY_DAYS));

        let leaf = RcgenCertificate::from_params(params).map_err(ca_error)?;
        let cert_pem = leaf.serialize_pem_with_signer(&self.ca).map_err(ca_error)?;
        let key_pem = leaf.serialize_private_key_pem();

        Ok(SignedCertificate {
            cert_pem,
            key_pem,
            expires_at,
        })
    }

    fn root(&self) -> Option<RootCertificate> {
        let pem = fs::read_to_string(&self.cert_path).ok()?;
        Some(RootCertificate {
            pem,
            cert_path: self.cert_path.clone(),
            key_path: self.key_path.clone(),
            expires_at: self.expires_at,
        })
    }
}

/// rcgen only takes calendar dates; returns the effective expiry, midnight UTC of that date
fn set_not_after(params: &mut CertificateParams, at: DateTime<Utc>) -> DateTime<Utc> {
    params.not_after = rcgen::date_time_ymd(at.year(), at.month() as u8, at.day() as u8);
    Utc.with_ymd_and_hms(at.year(), at.month(), at.day(), 0, 0, 0)
        .single()
        .unwrap_or(at)
}

fn ca_error(e: rcgen::RcgenError) -> Error {
    Error::Ca(e.to_string())
}

/// OS trust store collaborator
pub trait TrustStore: Send + Sync {
    fn is_installed(&self, name: &str) -> bool;

    /// Usually requires elevated privileges
    fn install(&self, cert_pem: &str, name: &str) -> Result<()>;
}

/// Trust store of the running operating system
#[derive(Debug, Default)]
pub struct SystemTrustStore;

#[cfg(target_os = "linux")]
const LINUX_CA_DIR: &str = "/usr/local/share/ca-certificates";

impl SystemTrustStore {
    #[cfg(any(target_os = "linux", target_os = "macos", windows))]
    fn file_stem(name: &str) -> String {
        name.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect()
    }

    #[cfg(any(target_os = "linux", target_os = "macos", windows))]
    fn run(program: &str, args: &[&str]) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::Install(format!("cannot run {program}: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(program, stderr = %stderr.trim(), "Trust store command failed");
            Err(Error::Install(format!(
                "{program} exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )))
        }
    }

    #[cfg(any(target_os = "macos", windows))]
    fn write_temp_pem(cert_pem: &str, name: &str) -> Result<PathBuf> {
        let path = std::env::temp_dir().join(format!("{}.crt", Self::file_stem(name)));
        fs::write(&path, cert_pem)?;
        Ok(path)
    }
}

impl TrustStore for SystemTrustStore {
    #[cfg(target_os = "linux")]
    fn is_installed(&self, name: &str) -> bool {
        Path::new(LINUX_CA_DIR)
            .join(format!("{}.crt", Self::file_stem(name)))
            .exists()
    }

    #[cfg(target_os = "macos")]
    fn is_installed(&self, name: &str) -> bool {
        Command::new("security")
            .args(["find-certificate", "-c", name, "/Library/Keychains/System.keychain"])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[cfg(windows)]
    fn is_installed(&self, name: &str) -> bool {
        Command::new("certutil")
            .args(["-verifystore", "Root", name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    fn is_installed(&self, _name: &str) -> bool {
        false
    }

    #[cfg(target_os = "linux")]
    fn install(&self, cert_pem: &str, name: &str) -> Result<()> {
        let cert_path = Path::new(LINUX_CA_DIR).join(format!("{}.crt", Self::file_stem(name)));
        fs::write(&cert_path, cert_pem)
            .map_err(|e| Error::Install(format!("cannot write {}: {e}", cert_path.display())))?;
        Self::run("update-ca-certificates", &[])?;
        info!(name, path = %cert_path.display(), "Root CA installed in system trust store");
        Ok(())
    }

    #[cfg(target_os = "macos")]
    fn install(&self, cert_pem: &str, name: &str) -> Result<()> {
        let path = Self::write_temp_pem(cert_pem, name)?;
        let path = path.to_string_lossy().to_string();
        Self::run(
            "security",
            &["add-trusted-cert", "-d", "-r", "trustRoot", "-k", "/Library/Keychains/System.keychain", &path],
        )?;
        info!(name, "Root CA installed in System keychain");
        Ok(())
    }

    #[cfg(windows)]
    fn install(&self, cert_pem: &str, name: &str) -> Result<()> {
        let path = Self::write_temp_pem(cert_pem, name)?;
        let path = path.to_string_lossy().to_string();
        Self::run("certutil", &["-addstore", "-f", "Root", &path])?;
        info!(name, "Root CA installed in Trusted Root Certification Authorities");
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    fn install(&self, _cert_pem: &str, _name: &str) -> Result<()> {
        Err(Error::Install("platform not supported".to_string()))
    }
}
