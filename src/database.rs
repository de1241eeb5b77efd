//! Database manager for SQLite operations
//! Persists custom domains, certificate metadata and service installation metadata

use crate::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifier of a user-declared domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(String);

impl DomainId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DomainId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A domain mapping declared by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomDomain {
    pub id: DomainId,
    pub domain: String,
    pub target: String,
    pub ssl: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a certificate is the trust anchor or a per-domain leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateKind {
    RootAuthority,
    Leaf,
}

impl CertificateKind {
    fn as_str(self) -> &'static str {
        match self {
            CertificateKind::RootAuthority => "root_authority",
            CertificateKind::Leaf => "leaf",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "root_authority" => Some(CertificateKind::RootAuthority),
            "leaf" => Some(CertificateKind::Leaf),
            _ => None,
        }
    }
}

/// An issued certificate; validity is derived from `expires_at` at read time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub domain: String,
    pub kind: CertificateKind,
    /// Common name of the authority that signed this certificate
    pub issuer: String,
    pub expires_at: DateTime<Utc>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Last known installation metadata for the background service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub install_dir: PathBuf,
    pub installed: bool,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Thread-safe database manager for SQLite operations
/// Uses a Mutex to ensure only one thread accesses the connection at a time
pub struct DatabaseManager {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl DatabaseManager {
    /// Open (or create) the database at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let manager = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        manager.initialize()?;

        Ok(manager)
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS custom_domains (
                id TEXT PRIMARY KEY,
                domain TEXT NOT NULL UNIQUE,
                target TEXT NOT NULL,
                ssl INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS certificates (
                domain TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                issuer TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                cert_path TEXT NOT NULL,
                key_path TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS service_installs (
                name TEXT PRIMARY KEY,
                install_dir TEXT NOT NULL,
                installed INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;

        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ── Custom domains ──────────────────────────────────────────────

    pub fn insert_domain(&self, domain: &CustomDomain) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO custom_domains (id, domain, target, ssl, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                domain.id.as_str(),
                domain.domain,
                domain.target,
                domain.ssl,
                domain.enabled,
                domain.created_at.to_rfc3339(),
                domain.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Overwrite the mutable flags of a domain. Returns false if the id is unknown.
    pub fn update_domain_flags(&self, domain: &CustomDomain) -> Result<bool> {
        let conn = self.conn.lock();

        let affected = conn.execute(
            "UPDATE custom_domains SET ssl = ?1, enabled = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                domain.ssl,
                domain.enabled,
                domain.updated_at.to_rfc3339(),
                domain.id.as_str(),
            ],
        )?;

        Ok(affected > 0)
    }

    pub fn delete_domain(&self, id: &DomainId) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM custom_domains WHERE id = ?1", params![id.as_str()])?;
        Ok(affected > 0)
    }

    /// List all custom domains ordered by domain name
    pub fn list_domains(&self) -> Result<Vec<CustomDomain>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, domain, target, ssl, enabled, created_at, updated_at
             FROM custom_domains ORDER BY domain",
        )?;

        let rows = stmt.query_map([], domain_from_row)?;
        let domains = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(domains)
    }

    // ── Certificates ────────────────────────────────────────────────

    /// Insert or replace the certificate for its domain
    pub fn upsert_certificate(&self, cert: &Certificate) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO certificates (domain, kind, issuer, expires_at, cert_path, key_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(domain) DO UPDATE SET
                kind = excluded.kind,
                issuer = excluded.issuer,
                expires_at = excluded.expires_at,
                cert_path = excluded.cert_path,
                key_path = excluded.key_path,
                created_at = excluded.created_at",
            params![
                cert.domain,
                cert.kind.as_str(),
                cert.issuer,
                cert.expires_at.to_rfc3339(),
                cert.cert_path.to_string_lossy(),
                cert.key_path.to_string_lossy(),
                cert.created_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    pub fn delete_certificate(&self, domain: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM certificates WHERE domain = ?1", params![domain])?;
        Ok(affected > 0)
    }

    pub fn list_certificates(&self) -> Result<Vec<Certificate>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT domain, kind, issuer, expires_at, cert_path, key_path, created_at
             FROM certificates ORDER BY domain",
        )?;

        let rows = stmt.query_map([], certificate_from_row)?;
        let certs = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(certs)
    }

    // ── Service metadata ────────────────────────────────────────────

    pub fn save_service(&self, record: &ServiceRecord) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO service_installs (name, install_dir, installed, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                install_dir = excluded.install_dir,
                installed = excluded.installed,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                record.name,
                record.install_dir.to_string_lossy(),
                record.installed,
                record.status,
                record.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    pub fn load_service(&self, name: &str) -> Result<Option<ServiceRecord>> {
        let conn = self.conn.lock();

        let record = conn
            .query_row(
                "SELECT name, install_dir, installed, status, updated_at
                 FROM service_installs WHERE name = ?1",
                params![name],
                |row| {
                    Ok(ServiceRecord {
                        name: row.get(0)?,
                        install_dir: PathBuf::from(row.get::<_, String>(1)?),
                        installed: row.get(2)?,
                        status: row.get(3)?,
                        updated_at: timestamp(row, 4)?,
                    })
                },
            )
            .optional()?;

        Ok(record)
    }
}

fn domain_from_row(row: &Row<'_>) -> rusqlite::Result<CustomDomain> {
    Ok(CustomDomain {
        id: DomainId(row.get(0)?),
        domain: row.get(1)?,
        target: row.get(2)?,
        ssl: row.get(3)?,
        enabled: row.get(4)?,
        created_at: timestamp(row, 5)?,
        updated_at: timestamp(row, 6)?,
    })
}

fn certificate_from_row(row: &Row<'_>) -> rusqlite::Result<Certificate> {
    let kind: String = row.get(1)?;
    let kind = CertificateKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown certificate kind: {kind}").into(),
        )
    })?;

    Ok(Certificate {
        domain: row.get(0)?,
        kind,
        issuer: row.get(2)?,
        expires_at: timestamp(row, 3)?,
        cert_path: PathBuf::from(row.get::<_, String>(4)?),
        key_path: PathBuf::from(row.get::<_, String>(5)?),
        created_at: timestamp(row, 6)?,
    })
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn sample_domain(name: &str) -> CustomDomain {
        let now = Utc::now();
        CustomDomain {
            id: DomainId::generate(),
            domain: name.to_string(),
            target: "http://localhost:3000".to_string(),
            ssl: false,
            enabled: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_create_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("test.db");
        let _db = DatabaseManager::new(&db_path).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_domain_lifecycle() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();

        let mut domain = sample_domain("myapp.local");
        db.insert_domain(&domain).unwrap();

        domain.enabled = true;
        assert!(db.update_domain_flags(&domain).unwrap());

        let listed = db.list_domains().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].enabled);
        assert_eq!(listed[0].domain, "myapp.local");

        assert!(db.delete_domain(&domain.id).unwrap());
        assert!(!db.delete_domain(&domain.id).unwrap());
        assert!(db.list_domains().unwrap().is_empty());
    }

    #[test]
    fn test_domain_name_is_unique() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();

        db.insert_domain(&sample_domain("myapp.local")).unwrap();
        assert!(db.insert_domain(&sample_domain("myapp.local")).is_err());
    }

    #[test]
    fn test_certificate_upsert_replaces() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();

        let now = Utc::now();
        let mut cert = Certificate {
            domain: "myapp.local".to_string(),
            kind: CertificateKind::Leaf,
            issuer: "LocalCan Development CA".to_string(),
            expires_at: now + Duration::days(1),
            cert_path: PathBuf::from("/tmp/myapp.local.crt"),
            key_path: PathBuf::from("/tmp/myapp.local.key"),
            created_at: now,
        };
        db.upsert_certificate(&cert).unwrap();

        cert.expires_at = now + Duration::days(30);
        db.upsert_certificate(&cert).unwrap();

        let certs = db.list_certificates().unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].expires_at.timestamp(), cert.expires_at.timestamp());
        assert_eq!(certs[0].kind, CertificateKind::Leaf);
    }

    #[test]
    fn test_service_record_roundtrip() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();

        assert!(db.load_service("LocalCanProxy").unwrap().is_none());

        let record = ServiceRecord {
            name: "LocalCanProxy".to_string(),
            install_dir: dir.path().join("service"),
            installed: true,
            status: "stopped".to_string(),
            updated_at: Utc::now(),
        };
        db.save_service(&record).unwrap();

        let loaded = db.load_service("LocalCanProxy").unwrap().unwrap();
        assert_eq!(loaded.install_dir, record.install_dir);
        assert!(loaded.installed);
        assert_eq!(loaded.status, "stopped");
    }
}
