//! LocalCan - local development domain manager
//!
//! Orchestration core providing:
//! - Custom domains reconciled with auto-detected dev servers
//! - Per-domain TLS certificates signed by a local CA
//! - A Host-routed reverse proxy whose routes follow the registry
//! - Background service management with elevation hand-off

pub mod api;
pub mod authority;
pub mod certificate;
pub mod config;
pub mod database;
pub mod entries;
pub mod error;
pub mod events;
pub mod hosts;
pub mod orchestrator;
pub mod platform;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod service;

pub use certificate::{CertificateInfo, CertificateStore, RootCaStatus};
pub use config::Settings;
pub use database::{CustomDomain, DatabaseManager, DomainId};
pub use entries::{DomainEntry, DomainSource, Protocol};
pub use error::{Error, Result};
pub use orchestrator::{Collaborators, Core};
pub use proxy::{ProxyConfig, ProxyController, ProxyStatus};
pub use registry::{AddedDomain, DomainRegistry, HostsOutcome};
pub use service::{ServiceController, ServiceOutcome, ServiceState};
