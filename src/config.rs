//! Runtime settings shared by the daemon and tests

use crate::error::{Error, Result};
use crate::process::WatchTarget;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Holds the database, certificates and service scripts
    pub data_dir: PathBuf,
    pub http_port: u16,
    pub https_port: u16,
    pub enable_https: bool,
    pub control_port: u16,
    /// Start the proxy listener at boot
    pub start_proxy: bool,
    pub watch: Vec<WatchTarget>,
    pub refresh_interval: Duration,
    pub connect_timeout: Duration,
    pub upstream_timeout: Duration,
    /// Request bodies larger than this are refused with 413
    pub max_body_bytes: usize,
    /// Override for the OS hosts file
    pub hosts_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            http_port: 80,
            https_port: 443,
            enable_https: false,
            control_port: 7878,
            start_proxy: true,
            watch: Vec::new(),
            refresh_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            upstream_timeout: Duration::from_secs(30),
            max_body_bytes: 64 * 1024 * 1024,
            hosts_path: None,
        }
    }
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("localcan.db")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    /// Where elevation scripts are written
    pub fn service_dir(&self) -> PathBuf {
        self.data_dir.join("service")
    }
}

/// `~/.localcan`, or `%ProgramData%\LocalCan` on Windows
pub fn default_data_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Some(dir) = std::env::var_os("ProgramData") {
            return PathBuf::from(dir).join("LocalCan");
        }
    }
    #[cfg(not(windows))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".localcan");
        }
    }
    PathBuf::from("./data")
}

/// Parse a comma-separated `framework:port` list
pub fn parse_watch_list(list: &str) -> Result<Vec<WatchTarget>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<WatchTarget>().map_err(Error::Validation))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        let settings = Settings {
            data_dir: PathBuf::from("/var/lib/localcan"),
            ..Settings::default()
        };
        assert_eq!(settings.db_path(), PathBuf::from("/var/lib/localcan/localcan.db"));
        assert_eq!(settings.certs_dir(), PathBuf::from("/var/lib/localcan/certs"));
    }

    #[test]
    fn test_parse_watch_list() {
        let targets = parse_watch_list("Next.js:3000, vite:5173,").unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].framework, "Next.js");
        assert_eq!(targets[1].port, 5173);

        assert!(parse_watch_list("").unwrap().is_empty());
        assert!(matches!(parse_watch_list("vite"), Err(Error::Validation(_))));
    }
}
