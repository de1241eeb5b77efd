//! Windows services through the Service Control Manager

use super::{
    batch_elevation_script, tail_lines, ElevationScript, ServiceAction, ServiceManager, ServiceManagerError,
    ServiceSpec, ServiceStatus, SERVICE_LOG_FILE,
};
use std::ffi::OsString;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use windows_service::service::{
    Service, ServiceAccess, ServiceErrorControl, ServiceInfo, ServiceStartType, ServiceState, ServiceType,
};
use windows_service::service_manager::{ServiceManager as Scm, ServiceManagerAccess};

/// Win32 ERROR_ACCESS_DENIED
const ERROR_ACCESS_DENIED: i32 = 5;
/// Win32 ERROR_SERVICE_ALREADY_RUNNING
const ERROR_SERVICE_ALREADY_RUNNING: i32 = 1056;
/// Win32 ERROR_SERVICE_DOES_NOT_EXIST
const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;
/// Win32 ERROR_SERVICE_NOT_ACTIVE
const ERROR_SERVICE_NOT_ACTIVE: i32 = 1062;
/// Win32 ERROR_SERVICE_EXISTS
const ERROR_SERVICE_EXISTS: i32 = 1073;

const STOP_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_POLL: Duration = Duration::from_millis(500);

const SERVICE_DESCRIPTION: &str = "LocalCan reverse proxy for local development domains";

#[derive(Debug, Clone, Default)]
pub struct ScmManager;

fn os_error(e: &windows_service::Error) -> Option<i32> {
    match e {
        windows_service::Error::Winapi(io) => io.raw_os_error(),
        _ => None,
    }
}

fn classify(context: &str, e: windows_service::Error) -> ServiceManagerError {
    match os_error(&e) {
        Some(ERROR_ACCESS_DENIED) => ServiceManagerError::PermissionDenied(format!("{context}: {e}")),
        _ => {
            warn!("{} failed: {}", context, e);
            ServiceManagerError::Failed(format!("{context}: {e}"))
        }
    }
}

impl ScmManager {
    fn connect(access: ServiceManagerAccess) -> Result<Scm, ServiceManagerError> {
        Scm::local_computer(None::<&str>, access).map_err(|e| classify("connect to service manager", e))
    }

    /// `None` when the service is not registered
    fn open(spec: &ServiceSpec, access: ServiceAccess) -> Result<Option<Service>, ServiceManagerError> {
        let manager = Self::connect(ServiceManagerAccess::CONNECT)?;
        match manager.open_service(&spec.name, access) {
            Ok(service) => Ok(Some(service)),
            Err(e) if os_error(&e) == Some(ERROR_SERVICE_DOES_NOT_EXIST) => Ok(None),
            Err(e) => Err(classify("open service", e)),
        }
    }

    fn require(spec: &ServiceSpec, access: ServiceAccess) -> Result<Service, ServiceManagerError> {
        Self::open(spec, access)?.ok_or_else(|| ServiceManagerError::Failed(format!("{} is not installed", spec.name)))
    }

    fn service_info(spec: &ServiceSpec) -> ServiceInfo {
        ServiceInfo {
            name: OsString::from(&spec.name),
            display_name: OsString::from(&spec.display_name),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: spec.binary.clone(),
            launch_arguments: spec.args.iter().map(OsString::from).collect(),
            dependencies: vec![],
            account_name: None,
            account_password: None,
        }
    }

    fn wait_for_stop(service: &Service) -> Result<(), ServiceManagerError> {
        let deadline = Instant::now() + STOP_TIMEOUT;
        loop {
            std::thread::sleep(STOP_POLL);
            match service.query_status() {
                Ok(status) if status.current_state == ServiceState::Stopped => return Ok(()),
                Ok(_) if Instant::now() >= deadline => {
                    return Err(ServiceManagerError::Failed(format!(
                        "service did not stop within {STOP_TIMEOUT:?}"
                    )))
                }
                Ok(_) => continue,
                Err(e) => return Err(classify("query service", e)),
            }
        }
    }
}

fn status_of(state: ServiceState) -> ServiceStatus {
    match state {
        ServiceState::Running => ServiceStatus::Running,
        ServiceState::Stopped | ServiceState::Paused => ServiceStatus::Stopped,
        ServiceState::StartPending
        | ServiceState::StopPending
        | ServiceState::ContinuePending
        | ServiceState::PausePending => ServiceStatus::Pending,
    }
}

impl ServiceManager for ScmManager {
    fn install(&self, spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        let manager = Self::connect(ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE)?;
        let service = match manager.create_service(&Self::service_info(spec), ServiceAccess::CHANGE_CONFIG) {
            Ok(service) => service,
            Err(e) if os_error(&e) == Some(ERROR_SERVICE_EXISTS) => {
                info!("Service {} already registered", spec.name);
                return Ok(());
            }
            Err(e) => return Err(classify("create service", e)),
        };

        if let Err(e) = service.set_description(SERVICE_DESCRIPTION) {
            warn!("Could not set service description: {}", e);
        }
        Ok(())
    }

    fn uninstall(&self, spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        let access = ServiceAccess::QUERY_STATUS | ServiceAccess::STOP | ServiceAccess::DELETE;
        let Some(service) = Self::open(spec, access)? else {
            return Ok(());
        };

        if let Ok(status) = service.query_status() {
            if status.current_state != ServiceState::Stopped {
                let _ = service.stop();
                Self::wait_for_stop(&service)?;
            }
        }

        service.delete().map_err(|e| classify("delete service", e))
    }

    fn start(&self, spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        let service = Self::require(spec, ServiceAccess::START)?;
        match service.start::<OsString>(&[]) {
            Ok(()) => Ok(()),
            Err(e) if os_error(&e) == Some(ERROR_SERVICE_ALREADY_RUNNING) => Ok(()),
            Err(e) => Err(classify("start service", e)),
        }
    }

    fn stop(&self, spec: &ServiceSpec) -> Result<(), ServiceManagerError> {
        let service = Self::require(spec, ServiceAccess::STOP | ServiceAccess::QUERY_STATUS)?;
        match service.stop() {
            Ok(_) => Ok(()),
            Err(e) if os_error(&e) == Some(ERROR_SERVICE_NOT_ACTIVE) => Ok(()),
            Err(e) => Err(classify("stop service", e)),
        }
    }

    fn query(&self, spec: &ServiceSpec) -> Result<ServiceStatus, ServiceManagerError> {
        match Self::open(spec, ServiceAccess::QUERY_STATUS)? {
            Some(service) => service
                .query_status()
                .map(|status| status_of(status.current_state))
                .map_err(|e| classify("query service", e)),
            None => Ok(ServiceStatus::NotInstalled),
        }
    }

    fn recent_logs(&self, spec: &ServiceSpec, limit: usize) -> Vec<String> {
        tail_lines(&spec.install_dir.join(SERVICE_LOG_FILE), limit)
    }

    fn elevation_script(&self, action: ServiceAction, spec: &ServiceSpec) -> ElevationScript {
        batch_elevation_script(action, spec)
    }
}
