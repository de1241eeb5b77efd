//! Background service lifecycle
//!
//! Actions that the OS refuses for lack of privilege are handed back as an
//! elevation script instead of failing. The cached status reads `Pending`
//! while a start or stop is in flight; otherwise it only moves on
//! `refresh()`, which asks the OS.

use crate::database::{DatabaseManager, ServiceRecord};
use crate::error::{Error, Result};
use crate::platform::{ServiceAction, ServiceManager, ServiceManagerError, ServiceSpec, ServiceStatus};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// Lines kept in the log window
pub const LOG_WINDOW: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "script_path", rename_all = "snake_case")]
pub enum ServiceOutcome {
    Completed,
    PendingManualElevation(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceState {
    pub installed: bool,
    pub running: bool,
    pub status: ServiceStatus,
    pub name: String,
    pub install_dir: PathBuf,
    pub logs: Vec<String>,
}

struct Cached {
    status: ServiceStatus,
    logs: VecDeque<String>,
    /// Last OS log line already merged into `logs`
    last_os_line: Option<String>,
}

impl Cached {
    fn push(&mut self, line: String) {
        if self.logs.len() == LOG_WINDOW {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    /// Append the OS lines that came after the last one already seen
    fn merge_os_logs(&mut self, fetched: Vec<String>) {
        let start = self
            .last_os_line
            .as_ref()
            .and_then(|last| fetched.iter().rposition(|l| l == last))
            .map(|i| i + 1)
            .unwrap_or(0);

        if let Some(last) = fetched.last() {
            self.last_os_line = Some(last.clone());
        }
        for line in fetched.into_iter().skip(start) {
            self.push(line);
        }
    }
}

pub struct ServiceController {
    manager: Arc<dyn ServiceManager>,
    spec: ServiceSpec,
    db: Arc<DatabaseManager>,
    cached: RwLock<Cached>,
    actions: AsyncMutex<()>,
}

impl ServiceController {
    /// Restore the last persisted status; `refresh()` re-derives it from the OS
    pub fn open(manager: Arc<dyn ServiceManager>, mut spec: ServiceSpec, db: Arc<DatabaseManager>) -> Result<Self> {
        let status = match db.load_service(&spec.name)? {
            Some(record) => {
                spec.install_dir = record.install_dir;
                ServiceStatus::parse(&record.status).unwrap_or(ServiceStatus::NotInstalled)
            }
            None => ServiceStatus::NotInstalled,
        };

        Ok(Self {
            manager,
            spec,
            db,
            cached: RwLock::new(Cached {
                status,
                logs: VecDeque::with_capacity(LOG_WINDOW),
                last_os_line: None,
            }),
            actions: AsyncMutex::new(()),
        })
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn status(&self) -> ServiceState {
        let cached = self.cached.read();
        ServiceState {
            installed: cached.status != ServiceStatus::NotInstalled,
            running: cached.status == ServiceStatus::Running,
            status: cached.status,
            name: self.spec.name.clone(),
            install_dir: self.spec.install_dir.clone(),
            logs: cached.logs.iter().cloned().collect(),
        }
    }

    /// Most recent last
    pub fn recent_logs(&self) -> Vec<String> {
        self.cached.read().logs.iter().cloned().collect()
    }

    pub async fn install(&self) -> Result<ServiceOutcome> {
        self.perform(ServiceAction::Install).await
    }

    pub async fn uninstall(&self) -> Result<ServiceOutcome> {
        self.perform(ServiceAction::Uninstall).await
    }

    pub async fn start(&self) -> Result<ServiceOutcome> {
        self.perform(ServiceAction::Start).await
    }

    pub async fn stop(&self) -> Result<ServiceOutcome> {
        self.perform(ServiceAction::Stop).await
    }

    async fn perform(&self, action: ServiceAction) -> Result<ServiceOutcome> {
        let _guard = self.actions.lock().await;

        let previous = self.mark_pending(action);

        let manager = Arc::clone(&self.manager);
        let spec = self.spec.clone();
        let result = match tokio::task::spawn_blocking(move || manager.apply(action, &spec)).await {
            Ok(result) => result,
            Err(e) => {
                self.restore_status(previous);
                return Err(Error::Service(format!("{} task failed: {e}", action.as_str())));
            }
        };

        match result {
            Ok(()) => {
                info!("Service {} completed", action.as_str());
                self.log(format!("{} completed", action.as_str()));
                if let Err(e) = self.refresh_locked().await {
                    self.restore_status(previous);
                    return Err(e);
                }
                Ok(ServiceOutcome::Completed)
            }
            Err(ServiceManagerError::PermissionDenied(reason)) => {
                self.restore_status(previous);
                let script = self.manager.elevation_script(action, &self.spec);
                let path = script.write_to(&self.spec.install_dir)?;
                warn!(
                    "Service {} needs elevation ({}); script written to {}",
                    action.as_str(),
                    reason,
                    path.display()
                );
                self.log(format!(
                    "{} requires administrator privileges, run {}",
                    action.as_str(),
                    path.display()
                ));
                Ok(ServiceOutcome::PendingManualElevation(path))
            }
            Err(e) => {
                self.restore_status(previous);
                self.log(format!("{} failed: {e}", action.as_str()));
                Err(Error::Service(e.to_string()))
            }
        }
    }

    /// Show `Pending` while a start or stop of an installed service runs.
    /// Returns the status to put back if the action does not complete.
    fn mark_pending(&self, action: ServiceAction) -> Option<ServiceStatus> {
        if !matches!(action, ServiceAction::Start | ServiceAction::Stop) {
            return None;
        }
        let mut cached = self.cached.write();
        if cached.status == ServiceStatus::NotInstalled {
            return None;
        }
        Some(std::mem::replace(&mut cached.status, ServiceStatus::Pending))
    }

    fn restore_status(&self, previous: Option<ServiceStatus>) {
        if let Some(status) = previous {
            self.cached.write().status = status;
        }
    }

    /// Ask the OS for the real status and pull in new log lines
    pub async fn refresh(&self) -> Result<ServiceState> {
        let _guard = self.actions.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<ServiceState> {
        let manager = Arc::clone(&self.manager);
        let spec = self.spec.clone();
        let (query, logs) = tokio::task::spawn_blocking(move || {
            let query = manager.query(&spec);
            let logs = manager.recent_logs(&spec, LOG_WINDOW);
            (query, logs)
        })
        .await
        .map_err(|e| Error::Service(format!("status query failed: {e}")))?;

        let status = match query {
            Ok(status) => status,
            Err(e) => {
                warn!("Service status query failed: {}", e);
                return Err(Error::Service(e.to_string()));
            }
        };

        let changed = {
            let mut cached = self.cached.write();
            cached.merge_os_logs(logs);
            let changed = cached.status != status;
            cached.status = status;
            changed
        };

        if changed {
            info!("Service status is now {}", status.as_str());
            self.db.save_service(&ServiceRecord {
                name: self.spec.name.clone(),
                install_dir: self.spec.install_dir.clone(),
                installed: status != ServiceStatus::NotInstalled,
                status: status.as_str().to_string(),
                updated_at: Utc::now(),
            })?;
        }

        Ok(self.status())
    }

    fn log(&self, message: String) {
        let line = format!("{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%S"), message);
        self.cached.write().push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ElevationScript;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use tempfile::tempdir;

    /// Service manager fake; `status` is what the OS would report
    struct FakeManager {
        privileged: bool,
        status: Mutex<ServiceStatus>,
        os_logs: Mutex<Vec<String>>,
        /// When set, `start` signals the first channel and waits on the second
        start_gate: Option<(Mutex<mpsc::Sender<()>>, Mutex<mpsc::Receiver<()>>)>,
    }

    impl FakeManager {
        fn new(privileged: bool) -> Self {
            Self {
                privileged,
                status: Mutex::new(ServiceStatus::NotInstalled),
                os_logs: Mutex::new(Vec::new()),
                start_gate: None,
            }
        }

        fn set(&self, status: ServiceStatus) -> std::result::Result<(), ServiceManagerError> {
            if !self.privileged {
                return Err(ServiceManagerError::PermissionDenied("not root".to_string()));
            }
            *self.status.lock() = status;
            Ok(())
        }
    }

    impl ServiceManager for FakeManager {
        fn install(&self, _spec: &ServiceSpec) -> std::result::Result<(), ServiceManagerError> {
            self.set(ServiceStatus::Stopped)
        }

        fn uninstall(&self, _spec: &ServiceSpec) -> std::result::Result<(), ServiceManagerError> {
            self.set(ServiceStatus::NotInstalled)
        }

        fn start(&self, _spec: &ServiceSpec) -> std::result::Result<(), ServiceManagerError> {
            if *self.status.lock() == ServiceStatus::NotInstalled {
                return Err(ServiceManagerError::Failed("service not installed".to_string()));
            }
            if let Some((started, release)) = &self.start_gate {
                let _ = started.lock().send(());
                let _ = release.lock().recv();
            }
            self.set(ServiceStatus::Running)
        }

        fn stop(&self, _spec: &ServiceSpec) -> std::result::Result<(), ServiceManagerError> {
            self.set(ServiceStatus::Stopped)
        }

        fn query(&self, _spec: &ServiceSpec) -> std::result::Result<ServiceStatus, ServiceManagerError> {
            Ok(*self.status.lock())
        }

        fn recent_logs(&self, _spec: &ServiceSpec, limit: usize) -> Vec<String> {
            let logs = self.os_logs.lock();
            logs.iter().skip(logs.len().saturating_sub(limit)).cloned().collect()
        }

        fn elevation_script(&self, action: ServiceAction, _spec: &ServiceSpec) -> ElevationScript {
            ElevationScript {
                file_name: format!("{}-service.sh", action.as_str()),
                contents: "#!/bin/sh\n".to_string(),
            }
        }
    }

    fn controller(manager: Arc<FakeManager>, dir: &std::path::Path) -> ServiceController {
        let db = Arc::new(DatabaseManager::new(dir.join("localcan.db")).unwrap());
        let spec = ServiceSpec {
            name: "LocalCanProxy".to_string(),
            display_name: "LocalCan Proxy".to_string(),
            binary: PathBuf::from("/usr/local/bin/localcan"),
            args: Vec::new(),
            install_dir: dir.join("service"),
        };
        ServiceController::open(manager, spec, db).unwrap()
    }

    #[tokio::test]
    async fn test_unprivileged_install_hands_back_script() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(FakeManager::new(false));
        let service = controller(Arc::clone(&manager), dir.path());

        let outcome = service.install().await.unwrap();
        let path = match outcome {
            ServiceOutcome::PendingManualElevation(path) => path,
            other => panic!("expected elevation, got {:?}", other),
        };
        assert!(path.exists());
        assert_eq!(path, dir.path().join("service").join("install-service.sh"));
        assert_eq!(service.status().status, ServiceStatus::NotInstalled);

        // Status stays put until the script has run and refresh is called
        service.refresh().await.unwrap();
        assert!(!service.status().installed);

        *manager.status.lock() = ServiceStatus::Running;
        let state = service.refresh().await.unwrap();
        assert!(state.installed);
        assert!(state.running);
    }

    #[tokio::test]
    async fn test_privileged_lifecycle() {
        let dir = tempdir().unwrap();
        let service = controller(Arc::new(FakeManager::new(true)), dir.path());

        assert!(matches!(service.start().await, Err(Error::Service(_))));

        assert_eq!(service.install().await.unwrap(), ServiceOutcome::Completed);
        assert_eq!(service.status().status, ServiceStatus::Stopped);

        service.start().await.unwrap();
        assert!(service.status().running);

        service.stop().await.unwrap();
        service.uninstall().await.unwrap();
        assert_eq!(service.status().status, ServiceStatus::NotInstalled);
    }

    #[tokio::test]
    async fn test_status_persists_across_restart() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(FakeManager::new(true));

        {
            let service = controller(Arc::clone(&manager), dir.path());
            service.install().await.unwrap();
        }

        let reopened = controller(manager, dir.path());
        assert_eq!(reopened.status().status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_logs_are_bounded_and_not_duplicated() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(FakeManager::new(true));
        let service = controller(Arc::clone(&manager), dir.path());

        manager.os_logs.lock().extend((0..30).map(|i| format!("os line {i}")));
        service.refresh().await.unwrap();
        assert_eq!(service.recent_logs().len(), 30);

        // Same lines again plus new ones: only the new ones are appended
        manager.os_logs.lock().extend((30..80).map(|i| format!("os line {i}")));
        service.refresh().await.unwrap();

        let logs = service.recent_logs();
        assert_eq!(logs.len(), LOG_WINDOW);
        assert_eq!(logs.last().unwrap(), "os line 79");
        assert_eq!(logs.first().unwrap(), "os line 30");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_reports_pending_while_in_flight() {
        let dir = tempdir().unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let mut fake = FakeManager::new(true);
        fake.start_gate = Some((Mutex::new(started_tx), Mutex::new(release_rx)));
        *fake.status.lock() = ServiceStatus::Stopped;

        let service = Arc::new(controller(Arc::new(fake), dir.path()));
        service.refresh().await.unwrap();
        assert_eq!(service.status().status, ServiceStatus::Stopped);

        let starting = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.start().await })
        };
        tokio::task::spawn_blocking(move || started_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(service.status().status, ServiceStatus::Pending);

        release_tx.send(()).unwrap();
        assert_eq!(starting.await.unwrap().unwrap(), ServiceOutcome::Completed);
        assert_eq!(service.status().status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_refused_start_restores_status() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(FakeManager::new(false));
        *manager.status.lock() = ServiceStatus::Stopped;
        let service = controller(Arc::clone(&manager), dir.path());
        service.refresh().await.unwrap();

        let outcome = service.start().await.unwrap();
        assert!(matches!(outcome, ServiceOutcome::PendingManualElevation(_)));
        assert_eq!(service.status().status, ServiceStatus::Stopped);
    }
}
