//! Domain registry: the single source of truth for custom domains and the
//! live process snapshot.
//!
//! Mutations are serialized behind one write lock; readers clone a snapshot
//! under the read side of the same lock, so they never observe a half-applied
//! change.

use crate::database::{CustomDomain, DatabaseManager, DomainId};
use crate::entries::{self, DomainEntry};
use crate::error::{Error, Result};
use crate::events::{ChangeEvent, EventBus};
use crate::hosts::HostsEditor;
use crate::process::ProcessEntry;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

const MAX_DOMAIN_LEN: usize = 253;

/// What happened to the hosts-file mapping of a newly added domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum HostsOutcome {
    Mapped,
    /// The domain is registered but must be mapped by hand or after elevation
    PermissionDenied(String),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct AddedDomain {
    pub domain: CustomDomain,
    pub hosts: HostsOutcome,
}

#[derive(Debug, Default)]
struct RegistryState {
    custom: BTreeMap<DomainId, CustomDomain>,
    processes: Vec<ProcessEntry>,
}

/// Consistent copy of the registry inputs
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub custom: Vec<CustomDomain>,
    pub processes: Vec<ProcessEntry>,
}

impl RegistrySnapshot {
    pub fn entries(&self, certified: &BTreeSet<String>) -> Vec<DomainEntry> {
        entries::project(&self.custom, &self.processes, certified)
    }
}

pub struct DomainRegistry {
    db: Arc<DatabaseManager>,
    hosts: Arc<dyn HostsEditor>,
    events: EventBus,
    state: RwLock<RegistryState>,
}

impl DomainRegistry {
    /// Load persisted custom domains
    pub fn open(db: Arc<DatabaseManager>, hosts: Arc<dyn HostsEditor>, events: EventBus) -> Result<Self> {
        let custom = db
            .list_domains()?
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();

        Ok(Self {
            db,
            hosts,
            events,
            state: RwLock::new(RegistryState {
                custom,
                processes: Vec::new(),
            }),
        })
    }

    pub fn add_custom_domain(&self, domain: &str, target: &str, ssl: bool) -> Result<AddedDomain> {
        let domain = validate_domain(domain)?;
        let target = validate_target(target)?;

        let mut state = self.state.write();

        if state.custom.values().any(|c| c.domain == domain) {
            return Err(Error::Conflict(domain));
        }
        // Detected names as listed: custom names push processes onto their fallback names
        let reserved: BTreeSet<String> = state.custom.values().map(|c| c.domain.clone()).collect();
        if entries::detected_domains(&state.processes, &reserved)
            .iter()
            .any(|(detected, _)| *detected == domain)
        {
            return Err(Error::Conflict(domain));
        }

        let now = Utc::now();
        let record = CustomDomain {
            id: DomainId::generate(),
            domain,
            target,
            ssl,
            enabled: false,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_domain(&record)?;
        state.custom.insert(record.id.clone(), record.clone());

        let hosts = self.map_hosts(&record.domain);
        drop(state);

        info!("Added domain {} -> {}", record.domain, record.target);
        self.events.publish(ChangeEvent::DomainAdded {
            id: record.id.clone(),
            domain: record.domain.clone(),
        });

        Ok(AddedDomain { domain: record, hosts })
    }

    fn map_hosts(&self, domain: &str) -> HostsOutcome {
        if !self.hosts.has_permission() {
            warn!("No write access to the hosts file, {} must be mapped manually", domain);
            return HostsOutcome::PermissionDenied("hosts file is not writable".to_string());
        }

        match self.hosts.add_mapping(domain) {
            Ok(()) => HostsOutcome::Mapped,
            Err(Error::Permission(reason)) => {
                warn!("Hosts mapping for {} denied: {}", domain, reason);
                HostsOutcome::PermissionDenied(reason)
            }
            Err(e) => {
                warn!("Hosts mapping for {} failed: {}", domain, e);
                HostsOutcome::Failed(e.to_string())
            }
        }
    }

    /// Flip the `enabled` (published) flag
    pub fn toggle_domain(&self, id: &DomainId) -> Result<CustomDomain> {
        self.update(id, |d| d.enabled = !d.enabled)
    }

    pub fn set_domain_ssl(&self, id: &DomainId, ssl: bool) -> Result<CustomDomain> {
        self.update(id, |d| d.ssl = ssl)
    }

    fn update(&self, id: &DomainId, apply: impl FnOnce(&mut CustomDomain)) -> Result<CustomDomain> {
        let mut state = self.state.write();

        let mut updated = state
            .custom
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("domain {id}")))?;
        apply(&mut updated);
        updated.updated_at = Utc::now();

        if !self.db.update_domain_flags(&updated)? {
            return Err(Error::NotFound(format!("domain {id}")));
        }
        state.custom.insert(id.clone(), updated.clone());
        drop(state);

        self.events.publish(ChangeEvent::DomainUpdated {
            id: id.clone(),
            domain: updated.domain.clone(),
        });

        Ok(updated)
    }

    pub fn delete_domain(&self, id: &DomainId) -> Result<()> {
        let mut state = self.state.write();

        let Some(existing) = state.custom.get(id).cloned() else {
            return Err(Error::NotFound(format!("domain {id}")));
        };

        self.db.delete_domain(id)?;
        state.custom.remove(id);

        if let Err(e) = self.hosts.remove_mapping(&existing.domain) {
            warn!("Could not retract hosts mapping for {}: {}", existing.domain, e);
        }
        drop(state);

        info!("Deleted domain {}", existing.domain);
        self.events.publish(ChangeEvent::DomainRemoved {
            id: id.clone(),
            domain: existing.domain,
        });

        Ok(())
    }

    /// Replace the live process snapshot. Returns true if it changed.
    pub fn replace_processes(&self, processes: Vec<ProcessEntry>) -> bool {
        let mut state = self.state.write();
        if state.processes == processes {
            return false;
        }
        state.processes = processes;
        drop(state);

        self.events.publish(ChangeEvent::ProcessesRefreshed);
        true
    }

    pub fn processes(&self) -> Vec<ProcessEntry> {
        self.state.read().processes.clone()
    }

    pub fn custom_domains(&self) -> Vec<CustomDomain> {
        self.state.read().custom.values().cloned().collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read();
        let mut custom: Vec<CustomDomain> = state.custom.values().cloned().collect();
        custom.sort_by(|a, b| a.domain.cmp(&b.domain));
        RegistrySnapshot {
            custom,
            processes: state.processes.clone(),
        }
    }

    /// Current entries; `certified` holds domains with a valid leaf certificate
    pub fn list_entries(&self, certified: &BTreeSet<String>) -> Vec<DomainEntry> {
        self.snapshot().entries(certified)
    }

    pub fn has_hosts_permission(&self) -> bool {
        self.hosts.has_permission()
    }
}

/// Normalize and check a domain name: lower-case, at least two non-empty
/// labels of `[a-z0-9-]` that do not start or end with a dash.
pub fn validate_domain(domain: &str) -> Result<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();

    if domain.is_empty() {
        return Err(Error::Validation("domain is required".to_string()));
    }
    if !domain.contains('.') {
        return Err(Error::Validation("domain must include a TLD (e.g., .local)".to_string()));
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(Error::Validation(format!("domain is longer than {MAX_DOMAIN_LEN} characters")));
    }

    for label in domain.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(Error::Validation(format!("invalid domain: {domain}")));
        }
    }

    Ok(domain)
}

/// Targets must be absolute http(s) URLs with a host
pub fn validate_target(target: &str) -> Result<String> {
    let target = target.trim();

    if target.is_empty() {
        return Err(Error::Validation("target is required".to_string()));
    }
    if !target.starts_with("http://") && !target.starts_with("https://") {
        return Err(Error::Validation(
            "target must be a valid URL (http:// or https://)".to_string(),
        ));
    }

    let url = Url::parse(target).map_err(|e| Error::Validation(format!("invalid target URL: {e}")))?;
    if url.host_str().is_none() {
        return Err(Error::Validation("target URL has no host".to_string()));
    }

    Ok(target.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entries::Protocol;
    use crate::process::ProcessStatus;
    use parking_lot::Mutex;
    use tempfile::{tempdir, TempDir};

    /// Records mappings in memory; can be switched to refuse writes
    #[derive(Default)]
    struct MemoryHosts {
        mapped: Mutex<BTreeSet<String>>,
        denied: bool,
    }

    impl HostsEditor for MemoryHosts {
        fn add_mapping(&self, domain: &str) -> Result<()> {
            if self.denied {
                return Err(Error::Permission("read-only".to_string()));
            }
            self.mapped.lock().insert(domain.to_string());
            Ok(())
        }

        fn remove_mapping(&self, domain: &str) -> Result<()> {
            self.mapped.lock().remove(domain);
            Ok(())
        }

        fn has_permission(&self) -> bool {
            !self.denied
        }
    }

    fn registry_with(hosts: Arc<MemoryHosts>) -> (TempDir, DomainRegistry) {
        let dir = tempdir().unwrap();
        let db = Arc::new(DatabaseManager::new(dir.path().join("test.db")).unwrap());
        let registry = DomainRegistry::open(db, hosts, EventBus::new()).unwrap();
        (dir, registry)
    }

    fn vite_process() -> ProcessEntry {
        ProcessEntry {
            pid: Some(4242),
            framework: "Vite".to_string(),
            port: 5173,
            status: ProcessStatus::Running,
        }
    }

    #[test]
    fn test_validate_domain() {
        assert_eq!(validate_domain("  MyApp.Local ").unwrap(), "myapp.local");
        assert_eq!(validate_domain("api.myapp.test.").unwrap(), "api.myapp.test");
        assert!(matches!(validate_domain("myapp"), Err(Error::Validation(_))));
        assert!(matches!(validate_domain(""), Err(Error::Validation(_))));
        assert!(matches!(validate_domain("my..app"), Err(Error::Validation(_))));
        assert!(matches!(validate_domain("-bad.local"), Err(Error::Validation(_))));
        assert!(matches!(validate_domain("bad_name.local"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_target() {
        assert!(validate_target("http://localhost:3000").is_ok());
        assert!(validate_target("https://127.0.0.1:8443/app").is_ok());
        assert!(matches!(validate_target("localhost:3000"), Err(Error::Validation(_))));
        assert!(matches!(validate_target("ftp://localhost"), Err(Error::Validation(_))));
        assert!(matches!(validate_target("http://"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_add_domain_scenario() {
        let hosts = Arc::new(MemoryHosts::default());
        let (_dir, registry) = registry_with(hosts.clone());

        let added = registry
            .add_custom_domain("myapp.local", "http://localhost:3000", false)
            .unwrap();
        assert_eq!(added.hosts, HostsOutcome::Mapped);
        assert!(hosts.mapped.lock().contains("myapp.local"));

        let entries = registry.list_entries(&BTreeSet::new());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].domain, "myapp.local");
        assert_eq!(entries[0].protocol, Protocol::Http);
        assert_eq!(entries[0].local_target, "http://localhost:3000");
        assert!(!entries[0].published);

        registry.toggle_domain(&added.domain.id).unwrap();
        let entries = registry.list_entries(&BTreeSet::new());
        assert!(entries[0].published);
    }

    #[test]
    fn test_duplicate_domain_conflicts() {
        let (_dir, registry) = registry_with(Arc::new(MemoryHosts::default()));

        registry
            .add_custom_domain("myapp.local", "http://localhost:3000", false)
            .unwrap();
        let before = registry.custom_domains();

        let result = registry.add_custom_domain("MyApp.local", "http://localhost:4000", true);
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(registry.custom_domains(), before);
    }

    #[test]
    fn test_detected_domain_conflicts() {
        let (_dir, registry) = registry_with(Arc::new(MemoryHosts::default()));
        registry.replace_processes(vec![vite_process()]);

        let result = registry.add_custom_domain("vite.local", "http://localhost:9000", false);
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert!(registry.custom_domains().is_empty());
    }

    #[test]
    fn test_fallback_detected_domain_conflicts() {
        let (_dir, registry) = registry_with(Arc::new(MemoryHosts::default()));
        registry
            .add_custom_domain("vite.local", "http://localhost:9000", false)
            .unwrap();
        registry.replace_processes(vec![vite_process()]);

        let listed = |registry: &DomainRegistry| -> Vec<String> {
            registry
                .list_entries(&BTreeSet::new())
                .into_iter()
                .map(|e| e.domain)
                .collect()
        };
        let before = listed(&registry);
        assert_eq!(before, vec!["vite-5173.local", "vite.local"]);

        let result = registry.add_custom_domain("vite-5173.local", "http://localhost:9001", false);
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(listed(&registry), before);
        assert_eq!(registry.custom_domains().len(), 1);
    }

    #[test]
    fn test_permission_denied_keeps_domain() {
        let hosts = Arc::new(MemoryHosts {
            denied: true,
            ..Default::default()
        });
        let (_dir, registry) = registry_with(hosts);

        assert!(!registry.has_hosts_permission());
        let added = registry
            .add_custom_domain("myapp.local", "http://localhost:3000", false)
            .unwrap();
        assert!(matches!(added.hosts, HostsOutcome::PermissionDenied(_)));
        assert_eq!(registry.custom_domains().len(), 1);
    }

    #[test]
    fn test_add_then_delete_restores_state() {
        let hosts = Arc::new(MemoryHosts::default());
        let (_dir, registry) = registry_with(hosts.clone());
        registry
            .add_custom_domain("keep.local", "http://localhost:3001", false)
            .unwrap();
        let before = registry.custom_domains();
        let hosts_before = hosts.mapped.lock().clone();

        let added = registry
            .add_custom_domain("temp.local", "https://localhost:3443", true)
            .unwrap();
        registry.delete_domain(&added.domain.id).unwrap();

        assert_eq!(registry.custom_domains(), before);
        assert_eq!(*hosts.mapped.lock(), hosts_before);
    }

    #[test]
    fn test_toggle_twice_restores_enabled() {
        let (_dir, registry) = registry_with(Arc::new(MemoryHosts::default()));
        let added = registry
            .add_custom_domain("myapp.local", "http://localhost:3000", false)
            .unwrap();
        let id = added.domain.id;

        let first = registry.toggle_domain(&id).unwrap();
        assert!(first.enabled);
        assert!(registry.custom_domains()[0].enabled);
        let second = registry.toggle_domain(&id).unwrap();
        assert!(!second.enabled);
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let (_dir, registry) = registry_with(Arc::new(MemoryHosts::default()));
        let id = DomainId::from("missing");

        assert!(matches!(registry.toggle_domain(&id), Err(Error::NotFound(_))));
        assert!(matches!(registry.set_domain_ssl(&id, true), Err(Error::NotFound(_))));
        assert!(matches!(registry.delete_domain(&id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_reopen_reloads_domains() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let hosts = Arc::new(MemoryHosts::default());

        {
            let db = Arc::new(DatabaseManager::new(&db_path).unwrap());
            let registry = DomainRegistry::open(db, hosts.clone(), EventBus::new()).unwrap();
            let added = registry
                .add_custom_domain("myapp.local", "http://localhost:3000", true)
                .unwrap();
            registry.toggle_domain(&added.domain.id).unwrap();
        }

        let db = Arc::new(DatabaseManager::new(&db_path).unwrap());
        let registry = DomainRegistry::open(db, hosts, EventBus::new()).unwrap();
        let domains = registry.custom_domains();
        assert_eq!(domains.len(), 1);
        assert!(domains[0].enabled);
        assert!(domains[0].ssl);
    }

    #[test]
    fn test_process_refresh_publishes_only_on_change() {
        let dir = tempdir().unwrap();
        let db = Arc::new(DatabaseManager::new(dir.path().join("test.db")).unwrap());
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let registry = DomainRegistry::open(db, Arc::new(MemoryHosts::default()), events).unwrap();

        assert!(registry.replace_processes(vec![vite_process()]));
        assert!(!registry.replace_processes(vec![vite_process()]));

        assert_eq!(rx.try_recv().unwrap(), ChangeEvent::ProcessesRefreshed);
        assert!(rx.try_recv().is_err());
    }
}
