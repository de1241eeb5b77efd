//! Local development process snapshots.
//!
//! Detection heuristics live outside the core; the core only consumes
//! `ProcessEntry` snapshots through [`ProcessObserver`].

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopped,
}

/// A development server seen by the last scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: Option<u32>,
    pub framework: String,
    pub port: u16,
    pub status: ProcessStatus,
}

pub trait ProcessObserver: Send + Sync {
    fn scan(&self) -> Vec<ProcessEntry>;
}

/// A `framework:port` pair to watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub framework: String,
    pub port: u16,
}

impl std::str::FromStr for WatchTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (framework, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected framework:port, got {s:?}"))?;
        let framework = framework.trim();
        if framework.is_empty() {
            return Err(format!("missing framework name in {s:?}"));
        }
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("invalid port in {s:?}: {e}"))?;
        Ok(Self {
            framework: framework.to_string(),
            port,
        })
    }
}

/// Reports each configured target as running when its port accepts a TCP connection
#[derive(Debug, Default)]
pub struct PortConnectObserver {
    targets: Vec<WatchTarget>,
}

impl PortConnectObserver {
    pub fn new(targets: Vec<WatchTarget>) -> Self {
        Self { targets }
    }

    fn check(port: u16) -> ProcessStatus {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(_) => ProcessStatus::Running,
            Err(e) => {
                debug!("Connect check of port {} failed: {}", port, e);
                ProcessStatus::Stopped
            }
        }
    }
}

impl ProcessObserver for PortConnectObserver {
    fn scan(&self) -> Vec<ProcessEntry> {
        self.targets
            .iter()
            .map(|target| ProcessEntry {
                pid: None,
                framework: target.framework.clone(),
                port: target.port,
                status: Self::check(target.port),
            })
            .collect()
    }
}
