//! Hosts-file editing for custom domains.
//!
//! Mappings live in a marker-delimited section so that entries written by
//! LocalCan never mix with lines the user maintains by hand.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const START_MARKER: &str = "# BEGIN localcan";
const END_MARKER: &str = "# END localcan";
const LOOPBACK: &str = "127.0.0.1";

/// OS hosts-file collaborator.
///
/// Applying the same mapping twice, or removing one that is absent, succeeds.
pub trait HostsEditor: Send + Sync {
    fn add_mapping(&self, domain: &str) -> Result<()>;
    fn remove_mapping(&self, domain: &str) -> Result<()>;
    /// Check write access without touching the file contents
    fn has_permission(&self) -> bool;
}

#[derive(Debug)]
pub struct HostsFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Default for HostsFile {
    fn default() -> Self {
        Self::new()
    }
}

impl HostsFile {
    pub fn new() -> Self {
        let path = if cfg!(windows) {
            PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
        } else {
            PathBuf::from("/etc/hosts")
        };
        Self::with_path(path)
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Domains currently listed in the managed section
    pub fn managed_domains(content: &str) -> BTreeSet<String> {
        let Some(start) = content.find(START_MARKER) else {
            return BTreeSet::new();
        };
        let section = &content[start + START_MARKER.len()..];
        let section = match section.find(END_MARKER) {
            Some(end) => &section[..end],
            None => section,
        };

        section
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some(LOOPBACK), Some(domain)) => Some(domain.to_string()),
                    _ => None,
                }
            })
            .collect()
    }

    /// Replace (or append) the managed section with `domains`
    pub fn update_content(current_content: &str, domains: &BTreeSet<String>) -> String {
        let mut new_section = String::new();
        new_section.push_str(START_MARKER);
        new_section.push('\n');
        for domain in domains {
            let _ = writeln!(new_section, "{LOOPBACK} {domain}");
        }
        new_section.push_str(END_MARKER);

        if let Some(start) = current_content.find(START_MARKER) {
            if let Some(end_idx) = current_content[start..].find(END_MARKER) {
                let end = start + end_idx;
                let mut output = String::from(&current_content[..start]);
                output.push_str(&new_section);
                output.push_str(&current_content[end + END_MARKER.len()..]);
                return output;
            }
        }

        let mut output = String::from(current_content);
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&new_section);
        output.push('\n');
        output
    }

    fn edit(&self, apply: impl FnOnce(&mut BTreeSet<String>) -> bool) -> Result<()> {
        let _guard = self.lock.lock();

        let current = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(self.map_io(e)),
        };

        let mut domains = Self::managed_domains(&current);
        if !apply(&mut domains) {
            return Ok(());
        }

        let updated = Self::update_content(&current, &domains);
        fs::write(&self.path, updated).map_err(|e| self.map_io(e))
    }

    fn map_io(&self, e: io::Error) -> Error {
        if e.kind() == io::ErrorKind::PermissionDenied {
            Error::Permission(format!("cannot write {}", self.path.display()))
        } else {
            Error::Io(e)
        }
    }
}

impl HostsEditor for HostsFile {
    fn add_mapping(&self, domain: &str) -> Result<()> {
        self.edit(|domains| domains.insert(domain.to_string()))?;
        info!("Hosts mapping {} -> {}", domain, LOOPBACK);
        Ok(())
    }

    fn remove_mapping(&self, domain: &str) -> Result<()> {
        self.edit(|domains| domains.remove(domain))?;
        debug!("Hosts mapping removed for {}", domain);
        Ok(())
    }

    fn has_permission(&self) -> bool {
        OpenOptions::new().append(true).open(&self.path).is_ok()
    }
}
