//! Orchestrator owning every component.
//!
//! Mutating operations rebuild the routing table before returning so a
//! caller that just added a domain can reach it through the proxy right away.
//! The event bus drives the same rebuild for changes that originate in the
//! background refresh.

use crate::authority::{CertificateAuthority, LocalAuthority, SystemTrustStore, TrustStore};
use crate::certificate::{CertificateInfo, CertificateStore, RootCaStatus};
use crate::config::Settings;
use crate::database::{CustomDomain, DatabaseManager, DomainId};
use crate::entries::DomainEntry;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::hosts::{HostsEditor, HostsFile};
use crate::platform::{self, ServiceManager, ServiceSpec};
use crate::process::{PortConnectObserver, ProcessEntry, ProcessObserver};
use crate::proxy::{ProxyConfig, ProxyController, ProxyStatus, RouteSource, RoutingTable};
use crate::registry::{AddedDomain, DomainRegistry};
use crate::service::{ServiceController, ServiceOutcome, ServiceState};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// OS-boundary collaborators
pub struct Collaborators {
    pub hosts: Arc<dyn HostsEditor>,
    pub authority: Arc<dyn CertificateAuthority>,
    pub trust: Arc<dyn TrustStore>,
    pub observer: Arc<dyn ProcessObserver>,
    pub services: Arc<dyn ServiceManager>,
}

impl Collaborators {
    /// The real OS: hosts file, local CA on disk, system trust store
    pub fn system(settings: &Settings) -> Result<Self> {
        let hosts = match &settings.hosts_path {
            Some(path) => HostsFile::with_path(path.clone()),
            None => HostsFile::new(),
        };

        Ok(Self {
            hosts: Arc::new(hosts),
            authority: Arc::new(LocalAuthority::open(settings.certs_dir())?),
            trust: Arc::new(SystemTrustStore),
            observer: Arc::new(PortConnectObserver::new(settings.watch.clone())),
            services: platform::default_manager(),
        })
    }
}

/// Routing tables from the registry and the certificate store
struct Inventory {
    registry: Arc<DomainRegistry>,
    certs: Arc<CertificateStore>,
}

impl RouteSource for Inventory {
    fn routing_table(&self) -> RoutingTable {
        let now = Utc::now();
        let entries = self.registry.list_entries(&self.certs.certified_domains(now));
        RoutingTable::build(&entries, |domain| self.certs.tls_material(domain, now))
    }
}

pub struct Core {
    registry: Arc<DomainRegistry>,
    certs: Arc<CertificateStore>,
    proxy: Arc<ProxyController>,
    service: Arc<ServiceController>,
    observer: Arc<dyn ProcessObserver>,
    events: EventBus,
    default_port: u16,
}

impl Core {
    pub fn open(settings: &Settings, parts: Collaborators) -> Result<Self> {
        let db = Arc::new(DatabaseManager::new(settings.db_path())?);
        info!("Database initialized at: {}", settings.db_path().display());

        let events = EventBus::new();
        let registry = Arc::new(DomainRegistry::open(Arc::clone(&db), parts.hosts, events.clone())?);
        let certs = Arc::new(CertificateStore::open(
            settings.certs_dir(),
            Arc::clone(&db),
            parts.authority,
            parts.trust,
            events.clone(),
        )?);
        info!("Certificate store initialized at: {}", settings.certs_dir().display());

        let proxy_config = ProxyConfig {
            https_port: settings.https_port,
            enable_https: settings.enable_https,
            connect_timeout: settings.connect_timeout,
            response_timeout: settings.upstream_timeout,
            upstream_root_pem: certs.root_ca_pem(),
            max_body_bytes: settings.max_body_bytes,
        };
        let inventory = Arc::new(Inventory {
            registry: Arc::clone(&registry),
            certs: Arc::clone(&certs),
        });
        let proxy = Arc::new(ProxyController::new(proxy_config, inventory));
        proxy.sync_routes();

        let spec = ServiceSpec::for_current_exe(settings.service_dir(), service_args(settings));
        let service = Arc::new(ServiceController::open(parts.services, spec, db)?);

        Ok(Self {
            registry,
            certs,
            proxy,
            service,
            observer: parts.observer,
            events,
            default_port: settings.http_port,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Route sync on change events plus the periodic process/service refresh
    pub fn spawn_background(self: &Arc<Self>, interval: Duration) -> Vec<JoinHandle<()>> {
        let sync = self.proxy.spawn_route_sync(self.events.subscribe());

        let this = Arc::clone(self);
        let refresh = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.refresh_processes().await;
                if let Err(e) = this.service.refresh().await {
                    debug!("Service refresh failed: {}", e);
                }
            }
        });

        vec![sync, refresh]
    }

    // ── processes ──────────────────────────────────────────────────

    pub fn list_processes(&self) -> Vec<ProcessEntry> {
        self.registry.processes()
    }

    /// Re-scan and publish the new snapshot if it changed
    pub async fn refresh_processes(&self) -> Vec<ProcessEntry> {
        let observer = Arc::clone(&self.observer);
        match tokio::task::spawn_blocking(move || observer.scan()).await {
            Ok(processes) => {
                if self.registry.replace_processes(processes) {
                    self.proxy.sync_routes();
                }
            }
            Err(e) => warn!("Process scan failed: {}", e),
        }
        self.registry.processes()
    }

    // ── domains ────────────────────────────────────────────────────

    pub fn list_domains(&self) -> Vec<DomainEntry> {
        self.registry.list_entries(&self.certs.certified_domains(Utc::now()))
    }

    pub fn add_domain(&self, domain: &str, target: &str, ssl: bool) -> Result<AddedDomain> {
        let added = self.registry.add_custom_domain(domain, target, ssl)?;
        self.proxy.sync_routes();
        Ok(added)
    }

    pub fn toggle_domain(&self, id: &DomainId) -> Result<CustomDomain> {
        let domain = self.registry.toggle_domain(id)?;
        self.proxy.sync_routes();
        Ok(domain)
    }

    pub fn set_domain_ssl(&self, id: &DomainId, ssl: bool) -> Result<CustomDomain> {
        let domain = self.registry.set_domain_ssl(id, ssl)?;
        self.proxy.sync_routes();
        Ok(domain)
    }

    pub fn delete_domain(&self, id: &DomainId) -> Result<()> {
        self.registry.delete_domain(id)?;
        self.proxy.sync_routes();
        Ok(())
    }

    pub fn has_hosts_permission(&self) -> bool {
        self.registry.has_hosts_permission()
    }

    // ── certificates ───────────────────────────────────────────────

    pub fn list_certificates(&self) -> Vec<CertificateInfo> {
        self.certs.list_certificates()
    }

    pub fn generate_certificate(&self, domain: &str) -> Result<CertificateInfo> {
        let cert = self.certs.generate(domain)?;
        self.proxy.sync_routes();
        Ok(CertificateInfo {
            is_valid: cert.is_valid_at(Utc::now()),
            domain: cert.domain,
            kind: cert.kind,
            issuer: cert.issuer,
            expires_at: cert.expires_at,
        })
    }

    pub fn delete_certificate(&self, domain: &str) -> Result<()> {
        self.certs.delete(domain)?;
        self.proxy.sync_routes();
        Ok(())
    }

    pub fn install_root_ca(&self) -> Result<()> {
        self.certs.install_root_ca()
    }

    pub fn root_ca_status(&self) -> RootCaStatus {
        self.certs.root_ca_status()
    }

    /// PEM of the local root CA, for clients that want to trust it
    pub fn root_ca_pem(&self) -> Option<String> {
        self.certs.root_ca_pem()
    }

    // ── proxy ──────────────────────────────────────────────────────

    pub async fn proxy_status(&self) -> ProxyStatus {
        self.proxy.status().await
    }

    /// Start on `port`, or the configured HTTP port
    pub async fn start_proxy(&self, port: Option<u16>) -> Result<ProxyStatus> {
        self.proxy.start(port.unwrap_or(self.default_port)).await
    }

    pub async fn stop_proxy(&self) -> Result<()> {
        self.proxy.stop().await
    }

    /// Published domains currently routed by the proxy
    pub fn routed_domains(&self) -> Vec<String> {
        self.proxy.routes().routes().into_iter().map(|r| r.domain.clone()).collect()
    }

    // ── service ────────────────────────────────────────────────────

    pub fn service_status(&self) -> ServiceState {
        self.service.status()
    }

    pub fn service_logs(&self) -> Vec<String> {
        self.service.recent_logs()
    }

    pub async fn refresh_service(&self) -> Result<ServiceState> {
        self.service.refresh().await
    }

    pub async fn install_service(&self) -> Result<ServiceOutcome> {
        self.service.install().await
    }

    pub async fn uninstall_service(&self) -> Result<ServiceOutcome> {
        self.service.uninstall().await
    }

    pub async fn start_service(&self) -> Result<ServiceOutcome> {
        self.service.start().await
    }

    pub async fn stop_service(&self) -> Result<ServiceOutcome> {
        self.service.stop().await
    }

    /// Dispatch a service action by name
    pub async fn service_action(&self, action: &str) -> Result<ServiceOutcome> {
        match action {
            "install" => self.install_service().await,
            "uninstall" => self.uninstall_service().await,
            "start" => self.start_service().await,
            "stop" => self.stop_service().await,
            other => Err(Error::NotFound(format!("service action {other}"))),
        }
    }
}

/// Arguments the installed service is started with
fn service_args(settings: &Settings) -> Vec<String> {
    let mut args = vec![
        "--data-dir".to_string(),
        settings.data_dir.to_string_lossy().to_string(),
        "--http-port".to_string(),
        settings.http_port.to_string(),
        "--control-port".to_string(),
        settings.control_port.to_string(),
    ];
    if settings.enable_https {
        args.push("--enable-https".to_string());
        args.push("--https-port".to_string());
        args.push(settings.https_port.to_string());
    }
    args
}
