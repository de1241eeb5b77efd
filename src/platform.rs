//! OS service manager adapters.
//!
//! Every call here is blocking (systemd is driven through `systemctl` and
//! `journalctl`, Windows through the Service Control Manager); callers run
//! them on the blocking pool.

use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::ScmManager;

/// Name the daemon is registered under
pub const SERVICE_NAME: &str = "LocalCanProxy";

/// Log file the daemon writes into its install dir when run by the SCM
pub const SERVICE_LOG_FILE: &str = "localcan-service.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Install,
    Uninstall,
    Start,
    Stop,
}

impl ServiceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceAction::Install => "install",
            ServiceAction::Uninstall => "uninstall",
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
        }
    }
}

/// Lifecycle status as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    NotInstalled,
    Stopped,
    Pending,
    Running,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::NotInstalled => "not_installed",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Pending => "pending",
            ServiceStatus::Running => "running",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_installed" => Some(ServiceStatus::NotInstalled),
            "stopped" => Some(ServiceStatus::Stopped),
            "pending" => Some(ServiceStatus::Pending),
            "running" => Some(ServiceStatus::Running),
            _ => None,
        }
    }
}

/// What gets registered with the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub display_name: String,
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Where elevation scripts are written
    pub install_dir: PathBuf,
}

impl ServiceSpec {
    /// Register the running executable with the given daemon arguments
    pub fn for_current_exe(install_dir: PathBuf, args: Vec<String>) -> Self {
        let binary = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("localcan"));
        Self {
            name: SERVICE_NAME.to_string(),
            display_name: "LocalCan Proxy".to_string(),
            binary,
            args,
            install_dir,
        }
    }

    fn command_line(&self) -> String {
        let mut line = quote(&self.binary.to_string_lossy());
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote(arg));
        }
        line
    }
}

fn quote(s: &str) -> String {
    if s.contains(' ') {
        format!("\"{s}\"")
    } else {
        s.to_string()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceManagerError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Failed(String),

    #[error("no service manager available on this platform")]
    Unsupported,
}

/// Script the operator runs with elevated privilege
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElevationScript {
    pub file_name: String,
    pub contents: String,
}

impl ElevationScript {
    /// Write the script into `dir`, executable where that matters
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(&self.file_name);
        fs::write(&path, &self.contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }

        Ok(path)
    }
}

pub trait ServiceManager: Send + Sync {
    fn install(&self, spec: &ServiceSpec) -> Result<(), ServiceManagerError>;
    fn uninstall(&self, spec: &ServiceSpec) -> Result<(), ServiceManagerError>;
    fn start(&self, spec: &ServiceSpec) -> Result<(), ServiceManagerError>;
    fn stop(&self, spec: &ServiceSpec) -> Result<(), ServiceManagerError>;
    fn query(&self, spec: &ServiceSpec) -> Result<ServiceStatus, ServiceManagerError>;

    /// Last `limit` log lines, oldest first. Empty when unavailable.
    fn recent_logs(&self, spec: &ServiceSpec, limit: usize) -> Vec<String>;

    fn elevation_script(&self, action: ServiceAction, spec: &ServiceSpec) -> ElevationScript;

    fn apply(&self, action: ServiceAction, spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        match action {
            ServiceAction::Install => self.install(spec),
            ServiceAction::Uninstall => self.uninstall(spec),
            ServiceAction::Start => self.start(spec),
            ServiceAction::Stop => self.stop(spec),
        }
    }
}

/// Manager for the running platform
pub fn default_manager() -> Arc<dyn ServiceManager> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(SystemdManager::default())
    }
    #[cfg(windows)]
    {
        Arc::new(ScmManager)
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        Arc::new(UnsupportedManager)
    }
}

fn run(program: &str, args: &[&str]) -> Result<Output, ServiceManagerError> {
    debug!(program, ?args, "Running service command");
    Command::new(program)
        .args(args)
        .output()
        .map_err(|e| ServiceManagerError::Failed(format!("cannot run {program}: {e}")))
}

/// Map a failed command's output to an error, spotting privilege problems
fn classify_failure(program: &str, output: &Output) -> ServiceManagerError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let message = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };

    let lower = message.to_lowercase();
    let denied = lower.contains("access denied")
        || lower.contains("access is denied")
        || lower.contains("permission denied")
        || lower.contains("interactive authentication required")
        || lower.contains("authentication is required")
        || output.status.code() == Some(5);

    if denied {
        ServiceManagerError::PermissionDenied(format!("{program}: {message}"))
    } else {
        warn!(program, message, "Service command failed");
        ServiceManagerError::Failed(format!("{program}: {message}"))
    }
}

fn checked(program: &str, args: &[&str]) -> Result<Output, ServiceManagerError> {
    let output = run(program, args)?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(classify_failure(program, &output))
    }
}

// ── systemd ─────────────────────────────────────────────────────────

/// systemd units under `unit_dir`
#[derive(Debug, Clone)]
pub struct SystemdManager {
    unit_dir: PathBuf,
}

impl Default for SystemdManager {
    fn default() -> Self {
        Self {
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }
}

impl SystemdManager {
    pub fn with_unit_dir(unit_dir: PathBuf) -> Self {
        Self { unit_dir }
    }

    fn unit_name(spec: &ServiceSpec) -> String {
        format!("{}.service", spec.name)
    }

    fn unit_path(&self, spec: &ServiceSpec) -> PathBuf {
        self.unit_dir.join(Self::unit_name(spec))
    }

    pub fn unit_file(spec: &ServiceSpec) -> String {
        format!(
            "\
[Unit]
Description={}
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
ExecStart={}
Restart=on-failure
RestartSec=5s

[Install]
WantedBy=multi-user.target
",
            spec.display_name,
            spec.command_line()
        )
    }

    fn active_state(stdout: &str) -> ServiceStatus {
        match stdout.trim() {
            "active" => ServiceStatus::Running,
            "activating" | "deactivating" | "reloading" => ServiceStatus::Pending,
            _ => ServiceStatus::Stopped,
        }
    }
}

impl ServiceManager for SystemdManager {
    fn install(&self, spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        let unit_path = self.unit_path(spec);
        fs::write(&unit_path, Self::unit_file(spec)).map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => {
                ServiceManagerError::PermissionDenied(format!("cannot write {}", unit_path.display()))
            }
            _ => ServiceManagerError::Failed(format!("cannot write {}: {e}", unit_path.display())),
        })?;

        let unit = Self::unit_name(spec);
        checked("systemctl", &["daemon-reload"])?;
        checked("systemctl", &["enable", &unit])?;
        Ok(())
    }

    fn uninstall(&self, spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        let unit_path = self.unit_path(spec);
        if !unit_path.exists() {
            return Ok(());
        }

        let unit = Self::unit_name(spec);
        // Stop and disable are allowed to fail on a unit that never ran
        let _ = run("systemctl", &["stop", &unit]);
        let _ = run("systemctl", &["disable", &unit]);

        match fs::remove_file(&unit_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(ServiceManagerError::PermissionDenied(format!(
                    "cannot remove {}",
                    unit_path.display()
                )))
            }
            Err(e) => return Err(ServiceManagerError::Failed(e.to_string())),
        }

        checked("systemctl", &["daemon-reload"])?;
        Ok(())
    }

    fn start(&self, spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        checked("systemctl", &["start", &Self::unit_name(spec)]).map(|_| ())
    }

    fn stop(&self, spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        checked("systemctl", &["stop", &Self::unit_name(spec)]).map(|_| ())
    }

    fn query(&self, spec: &ServiceSpec) -> Result<ServiceStatus, ServiceManagerError> {
        if !self.unit_path(spec).exists() {
            return Ok(ServiceStatus::NotInstalled);
        }
        // is-active exits non-zero for inactive units; only stdout matters
        let output = run("systemctl", &["is-active", &Self::unit_name(spec)])?;
        Ok(Self::active_state(&String::from_utf8_lossy(&output.stdout)))
    }

    fn recent_logs(&self, spec: &ServiceSpec, limit: usize) -> Vec<String> {
        let limit = limit.to_string();
        match run(
            "journalctl",
            &["-u", &Self::unit_name(spec), "-n", &limit, "--no-pager", "-o", "short-iso"],
        ) {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|l| !l.trim().is_empty() && !l.starts_with("-- "))
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn elevation_script(&self, action: ServiceAction, spec: &ServiceSpec) -> ElevationScript {
        let unit = Self::unit_name(spec);
        let unit_path = self.unit_path(spec);

        let body = match action {
            ServiceAction::Install => format!(
                "cat > '{}' <<'UNIT'\n{}UNIT\nsystemctl daemon-reload\nsystemctl enable {unit}\n",
                unit_path.display(),
                Self::unit_file(spec)
            ),
            ServiceAction::Uninstall => format!(
                "systemctl stop {unit} || true\nsystemctl disable {unit} || true\nrm -f '{}'\nsystemctl daemon-reload\n",
                unit_path.display()
            ),
            ServiceAction::Start => format!("systemctl start {unit}\n"),
            ServiceAction::Stop => format!("systemctl stop {unit}\n"),
        };

        ElevationScript {
            file_name: format!("{}-service.sh", action.as_str()),
            contents: format!(
                "#!/bin/sh\n# Run as root: sudo sh {}-service.sh\nset -e\n{body}echo \"{} {} done\"\n",
                action.as_str(),
                spec.name,
                action.as_str()
            ),
        }
    }
}

// ── Windows SCM ─────────────────────────────────────────────────────

/// Hand-off script for Windows; the daemon itself talks to the SCM directly
pub fn batch_elevation_script(action: ServiceAction, spec: &ServiceSpec) -> ElevationScript {
    let name = &spec.name;
    let body = match action {
        ServiceAction::Install => format!(
            "sc.exe create \"{name}\" binPath= \"{}\" start= auto DisplayName= \"{}\"\r\nsc.exe start \"{name}\"\r\n",
            spec.command_line().replace('"', "\\\""),
            spec.display_name
        ),
        ServiceAction::Uninstall => format!("sc.exe stop \"{name}\"\r\nsc.exe delete \"{name}\"\r\n"),
        ServiceAction::Start => format!("sc.exe start \"{name}\"\r\n"),
        ServiceAction::Stop => format!("sc.exe stop \"{name}\"\r\n"),
    };

    ElevationScript {
        file_name: format!("{}-service.bat", action.as_str()),
        contents: format!("@echo off\r\nREM Run as Administrator\r\n{body}pause\r\n"),
    }
}

/// Last `limit` non-empty lines of a log file, oldest first
pub fn tail_lines(path: &Path, limit: usize) -> Vec<String> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                debug!("Cannot read {}: {}", path.display(), e);
            }
            return Vec::new();
        }
    };

    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(limit)..]
        .iter()
        .map(|l| l.to_string())
        .collect()
}

// ── Fallback ────────────────────────────────────────────────────────

/// For platforms without a supported service manager
#[derive(Debug, Clone, Default)]
pub struct UnsupportedManager;

impl ServiceManager for UnsupportedManager {
    fn install(&self, _spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        Err(ServiceManagerError::Unsupported)
    }

    fn uninstall(&self, _spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        Err(ServiceManagerError::Unsupported)
    }

    fn start(&self, _spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        Err(ServiceManagerError::Unsupported)
    }

    fn stop(&self, _spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        Err(ServiceManagerError::Unsupported)
    }

    fn query(&self, _spec: &ServiceSpec) -> Result<ServiceStatus, ServiceManagerError> {
        Ok(ServiceStatus::NotInstalled)
    }

    fn recent_logs(&self, _spec: &ServiceSpec, _limit: usize) -> Vec<String> {
        Vec::new()
    }

    fn elevation_script(&self, action: ServiceAction, spec: &ServiceSpec) -> ElevationScript {
        ElevationScript {
            file_name: format!("{}-service.sh", action.as_str()),
            contents: format!(
                "#!/bin/sh\necho \"Cannot {} {}: no supported service manager\" >&2\nexit 1\n",
                action.as_str(),
                spec.name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            name: SERVICE_NAME.to_string(),
            display_name: "LocalCan Proxy".to_string(),
            binary: PathBuf::from("/opt/local can/localcan"),
            args: vec!["--http-port".to_string(), "80".to_string()],
            install_dir: PathBuf::from("/tmp/localcan"),
        }
    }

    #[test]
    fn test_command_line_quotes_spaces() {
        assert_eq!(spec().command_line(), "\"/opt/local can/localcan\" --http-port 80");
    }

    #[test]
    fn test_unit_file() {
        let unit = SystemdManager::unit_file(&spec());
        assert!(unit.contains("Description=LocalCan Proxy"));
        assert!(unit.contains("ExecStart=\"/opt/local can/localcan\" --http-port 80"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn test_systemd_active_state() {
        assert_eq!(SystemdManager::active_state("active\n"), ServiceStatus::Running);
        assert_eq!(SystemdManager::active_state("activating"), ServiceStatus::Pending);
        assert_eq!(SystemdManager::active_state("inactive"), ServiceStatus::Stopped);
        assert_eq!(SystemdManager::active_state("failed"), ServiceStatus::Stopped);
    }

    #[test]
    fn test_systemd_query_without_unit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SystemdManager::with_unit_dir(dir.path().to_path_buf());
        assert_eq!(manager.query(&spec()), Ok(ServiceStatus::NotInstalled));
        assert_eq!(manager.uninstall(&spec()), Ok(()));
    }

    #[test]
    fn test_tail_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SERVICE_LOG_FILE);
        assert!(tail_lines(&path, 10).is_empty());

        let contents: String = (0..20).map(|i| format!("line {i}\n\n")).collect();
        fs::write(&path, contents).unwrap();

        let lines = tail_lines(&path, 5);
        assert_eq!(lines, vec!["line 15", "line 16", "line 17", "line 18", "line 19"]);
        assert_eq!(tail_lines(&path, 100).len(), 20);
    }

    #[test]
    fn test_elevation_scripts() {
        let spec = spec();

        let sh = SystemdManager::default().elevation_script(ServiceAction::Install, &spec);
        assert_eq!(sh.file_name, "install-service.sh");
        assert!(sh.contents.starts_with("#!/bin/sh"));
        assert!(sh.contents.contains("systemctl enable LocalCanProxy.service"));

        let bat = batch_elevation_script(ServiceAction::Stop, &spec);
        assert_eq!(bat.file_name, "stop-service.bat");
        assert!(bat.contents.contains("sc.exe stop \"LocalCanProxy\""));
    }

    #[test]
    fn test_script_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let script = batch_elevation_script(ServiceAction::Start, &spec());

        let path = script.write_to(&dir.path().join("scripts")).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), script.contents);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ServiceStatus::NotInstalled,
            ServiceStatus::Stopped,
            ServiceStatus::Pending,
            ServiceStatus::Running,
        ] {
            assert_eq!(ServiceStatus::parse(status.as_str()), Some(status));
        }
    }
}
