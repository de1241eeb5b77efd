//! Derived domain view.
//!
//! `DomainEntry` values are never stored: they are recomputed from the
//! custom domains, the live process snapshot and the set of domains holding a
//! valid leaf certificate every time someone asks.

use crate::database::{CustomDomain, DomainId};
use crate::process::{ProcessEntry, ProcessStatus};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

const DETECTED_TLD: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// Where an entry came from. Only custom entries carry an id, so only they
/// can be toggled or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainSource {
    AutoDetected {
        framework: String,
        pid: Option<u32>,
        port: u16,
        status: ProcessStatus,
    },
    Custom {
        id: DomainId,
        ssl: bool,
        enabled: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainEntry {
    pub domain: String,
    /// Scheme actually served, not the one requested
    pub protocol: Protocol,
    pub local_target: String,
    pub published: bool,
    pub has_certificate: bool,
    pub source: DomainSource,
}

impl DomainEntry {
    pub fn custom_id(&self) -> Option<&DomainId> {
        match &self.source {
            DomainSource::Custom { id, .. } => Some(id),
            DomainSource::AutoDetected { .. } => None,
        }
    }
}

/// Lower-case, dash-separated form of a framework name
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Assign a domain to every detected process.
///
/// Processes are visited by port; the first process of a framework gets
/// `<slug>.local`, later ones `<slug>-<port>.local`. Names in `reserved`
/// are never handed out.
pub fn detected_domains<'a>(
    processes: &'a [ProcessEntry],
    reserved: &BTreeSet<String>,
) -> Vec<(String, &'a ProcessEntry)> {
    let mut ordered: Vec<&ProcessEntry> = processes.iter().collect();
    ordered.sort_by_key(|p| p.port);

    let mut taken: BTreeSet<String> = BTreeSet::new();
    let mut assigned = Vec::with_capacity(ordered.len());

    for process in ordered {
        let base = match slug(&process.framework) {
            s if s.is_empty() => "app".to_string(),
            s => s,
        };
        let candidates = [
            format!("{base}.{DETECTED_TLD}"),
            format!("{base}-{}.{DETECTED_TLD}", process.port),
        ];

        let free = candidates
            .into_iter()
            .find(|name| !taken.contains(name) && !reserved.contains(name));

        match free {
            Some(name) => {
                taken.insert(name.clone());
                assigned.push((name, process));
            }
            None => debug!("No free domain for {} on port {}", process.framework, process.port),
        }
    }

    assigned
}

/// Combine detected processes and custom domains into entries.
/// `certified` holds the domains that currently have a valid leaf certificate.
pub fn project(
    custom: &[CustomDomain],
    processes: &[ProcessEntry],
    certified: &BTreeSet<String>,
) -> Vec<DomainEntry> {
    let reserved: BTreeSet<String> = custom.iter().map(|c| c.domain.clone()).collect();

    let detected = detected_domains(processes, &reserved)
        .into_iter()
        .map(|(domain, process)| {
            let has_certificate = certified.contains(&domain);
            DomainEntry {
                protocol: if has_certificate { Protocol::Https } else { Protocol::Http },
                local_target: format!("http://localhost:{}", process.port),
                published: false,
                has_certificate,
                source: DomainSource::AutoDetected {
                    framework: process.framework.clone(),
                    pid: process.pid,
                    port: process.port,
                    status: process.status,
                },
                domain,
            }
        });

    let declared = custom.iter().map(|c| {
        let has_certificate = certified.contains(&c.domain);
        DomainEntry {
            domain: c.domain.clone(),
            protocol: if c.ssl && has_certificate { Protocol::Https } else { Protocol::Http },
            local_target: c.target.clone(),
            published: c.enabled,
            has_certificate,
            source: DomainSource::Custom {
                id: c.id.clone(),
                ssl: c.ssl,
                enabled: c.enabled,
            },
        }
    });

    detected.chain(declared).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn process(framework: &str, port: u16) -> ProcessEntry {
        ProcessEntry {
            pid: Some(1000 + u32::from(port % 1000)),
            framework: framework.to_string(),
            port,
            status: ProcessStatus::Running,
        }
    }

    fn custom(domain: &str, ssl: bool, enabled: bool) -> CustomDomain {
        let now = Utc::now();
        CustomDomain {
            id: DomainId::generate(),
            domain: domain.to_string(),
            target: "http://localhost:3000".to_string(),
            ssl,
            enabled,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Next.js"), "next-js");
        assert_eq!(slug("  Vite  "), "vite");
        assert_eq!(slug("Ruby on Rails"), "ruby-on-rails");
        assert_eq!(slug("***"), "");
    }

    #[test]
    fn test_detected_domains_are_unique() {
        let processes = vec![process("Vite", 5174), process("Vite", 5173), process("Next.js", 3000)];
        let assigned = detected_domains(&processes, &BTreeSet::new());

        let names: Vec<&str> = assigned.iter().map(|(d, _)| d.as_str()).collect();
        assert_eq!(names, vec!["next-js.local", "vite.local", "vite-5174.local"]);
    }

    #[test]
    fn test_detected_domains_skip_reserved() {
        let processes = vec![process("Vite", 5173)];
        let reserved: BTreeSet<String> = ["vite.local".to_string()].into_iter().collect();

        let assigned = detected_domains(&processes, &reserved);
        assert_eq!(assigned[0].0, "vite-5173.local");
    }

    #[test]
    fn test_custom_entry_protocol_needs_certificate() {
        let domains = vec![custom("myapp.local", true, true)];

        let entries = project(&domains, &[], &BTreeSet::new());
        assert_eq!(entries[0].protocol, Protocol::Http);
        assert!(entries[0].published);

        let certified: BTreeSet<String> = ["myapp.local".to_string()].into_iter().collect();
        let entries = project(&domains, &[], &certified);
        assert_eq!(entries[0].protocol, Protocol::Https);
        assert!(entries[0].has_certificate);
    }

    #[test]
    fn test_detected_entry_shape() {
        let certified: BTreeSet<String> = ["vite.local".to_string()].into_iter().collect();
        let entries = project(&[], &[process("Vite", 5173)], &certified);

        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.domain, "vite.local");
        assert_eq!(entry.local_target, "http://localhost:5173");
        assert_eq!(entry.protocol, Protocol::Https);
        assert!(!entry.published);
        assert!(entry.custom_id().is_none());
    }
}
