//! Service facade: named remote-callable operations over the guest manager.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use limiquantix_hypervisor::{
    Guest, GuestManager, GuestMetricsRequest, GuestRequest, GuestResponse, HypervisorError,
};

/// Operations exposed over RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Create,
    CreateGuest,
    Run,
    Reboot,
    Restart,
    Shutdown,
    Poweroff,
    Delete,
    Status,
    CpuMetrics,
    DiskMetrics,
    NicMetrics,
}

impl Method {
    pub const ALL: [Method; 12] = [
        Method::Create,
        Method::CreateGuest,
        Method::Run,
        Method::Reboot,
        Method::Restart,
        Method::Shutdown,
        Method::Poweroff,
        Method::Delete,
        Method::Status,
        Method::CpuMetrics,
        Method::DiskMetrics,
        Method::NicMetrics,
    ];

    /// Resolve a wire method name such as `Libvirt.Create` or `Status`.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name
            .strip_prefix("Libvirt.")
            .or_else(|| name.strip_prefix("Service."))
            .unwrap_or(name);

        match name {
            "CpuMetrics" => Some(Method::CpuMetrics),
            other => Self::ALL.into_iter().find(|m| m.as_str() == other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Create => "Create",
            Method::CreateGuest => "CreateGuest",
            Method::Run => "Run",
            Method::Reboot => "Reboot",
            Method::Restart => "Restart",
            Method::Shutdown => "Shutdown",
            Method::Poweroff => "Poweroff",
            Method::Delete => "Delete",
            Method::Status => "Status",
            Method::CpuMetrics => "CPUMetrics",
            Method::DiskMetrics => "DiskMetrics",
            Method::NicMetrics => "NicMetrics",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Libvirt.{}", self.as_str())
    }
}

/// Errors surfaced to RPC callers.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

impl ServiceError {
    /// Stable error code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::MethodNotFound(_) => "method_not_found",
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::Hypervisor(e) => e.kind().as_str(),
        }
    }
}

/// Dispatches decoded requests to the guest manager.
#[derive(Clone)]
pub struct LibvirtService {
    manager: GuestManager,
}

impl LibvirtService {
    pub fn new(manager: GuestManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &GuestManager {
        &self.manager
    }

    /// Look up `method` by wire name and call it.
    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        let method =
            Method::from_name(method).ok_or_else(|| ServiceError::MethodNotFound(method.to_string()))?;
        self.call(method, params).await
    }

    /// Call `method` with JSON params, returning the JSON response.
    #[instrument(skip(self, method, params), fields(method = %method))]
    pub async fn call(&self, method: Method, params: Value) -> Result<Value, ServiceError> {
        debug!("Dispatching request");

        match method {
            Method::CpuMetrics | Method::DiskMetrics | Method::NicMetrics => {
                let request: GuestMetricsRequest = decode_params(params)?;
                let guest = require_guest(request.guest)?;
                let response = match method {
                    Method::CpuMetrics => self.manager.cpu_metrics(&guest).await?,
                    Method::DiskMetrics => self.manager.disk_metrics(&guest).await?,
                    _ => self.manager.nic_metrics(&guest).await?,
                };
                encode(&response)
            }
            _ => {
                let request: GuestRequest = decode_params(params)?;
                let guest = require_guest(request.guest)?;
                let guest = match method {
                    Method::Create => self.manager.create(guest).await?,
                    Method::CreateGuest => self.manager.create_guest(guest).await?,
                    Method::Run => self.manager.run(guest).await?,
                    Method::Reboot => self.manager.reboot(guest).await?,
                    Method::Restart => self.manager.restart(guest).await?,
                    Method::Shutdown => self.manager.shutdown(guest).await?,
                    Method::Poweroff => self.manager.poweroff(guest).await?,
                    Method::Delete => self.manager.delete(guest).await?,
                    _ => self.manager.status(guest).await?,
                };
                encode(&GuestResponse { guest })
            }
        }
    }
}

/// JSON-RPC params arrive as a one-element array; a bare object is accepted too.
fn decode_params<T: DeserializeOwned + Default>(params: Value) -> Result<T, ServiceError> {
    let request = match params {
        Value::Null => return Ok(T::default()),
        Value::Array(mut items) => match items.len() {
            0 => return Ok(T::default()),
            1 => items.remove(0),
            n => {
                return Err(ServiceError::InvalidRequest(format!(
                    "expected one request object, got {}",
                    n
                )))
            }
        },
        other => other,
    };

    serde_json::from_value(request).map_err(|e| ServiceError::InvalidRequest(e.to_string()))
}

fn require_guest(guest: Option<Guest>) -> Result<Guest, ServiceError> {
    guest.ok_or_else(|| {
        HypervisorError::InvalidArgument("request carries no guest".to_string()).into()
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Value, ServiceError> {
    serde_json::to_value(value)
        .map_err(|e| HypervisorError::Internal(format!("failed to encode response: {}", e)).into())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use limiquantix_hypervisor::{ConnectionPool, ManagerOptions, MockBackend};

    fn service() -> LibvirtService {
        let pool = ConnectionPool::new(Arc::new(MockBackend::new()), 2).unwrap();
        LibvirtService::new(GuestManager::new(pool, ManagerOptions::default()))
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Method::from_name("Libvirt.Create"), Some(Method::Create));
        assert_eq!(Method::from_name("Service.Status"), Some(Method::Status));
        assert_eq!(Method::from_name("CPUMetrics"), Some(Method::CpuMetrics));
        assert_eq!(Method::from_name("Libvirt.CpuMetrics"), Some(Method::CpuMetrics));
        assert_eq!(Method::from_name("status"), None);
        assert_eq!(Method::from_name("Libvirt.Migrate"), None);

        for method in Method::ALL {
            assert_eq!(Method::from_name(&method.to_string()), Some(method));
        }
    }

    #[tokio::test]
    async fn test_dispatch_lifecycle() {
        let service = service();

        let created = service
            .dispatch("Libvirt.Create", json!([{ "guest": { "id": "vm-1", "memory": 256, "cpu": 1 } }]))
            .await
            .unwrap();
        assert_eq!(created["guest"]["state"], "running");
        assert_eq!(created["guest"]["type"], "kvm");

        let status = service
            .dispatch("Status", json!({ "guest": { "id": "vm-1" } }))
            .await
            .unwrap();
        assert_eq!(status["guest"]["state"], "running");
    }

    #[tokio::test]
    async fn test_dispatch_errors() {
        let service = service();

        let err = service.dispatch("Libvirt.Nope", Value::Null).await.unwrap_err();
        assert_eq!(err.code(), "method_not_found");

        let err = service.dispatch("Status", json!([])).await.unwrap_err();
        assert_eq!(err.code(), "invalid_argument");

        let err = service
            .dispatch("Status", json!([{ "guest": { "id": "" } }]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");

        let err = service
            .dispatch("Status", json!([{ "guest": { "id": "ghost" } }]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");

        let err = service
            .dispatch("Status", json!([{ "guest": 7 }]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let err = service.dispatch("Status", json!([{}, {}])).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn test_dispatch_metrics() {
        let service = service();
        service
            .dispatch(
                "CreateGuest",
                json!([{ "guest": { "id": "vm-2", "cpu": 1, "disks": [{ "source": "vm-2-root" }] } }]),
            )
            .await
            .unwrap();
        service
            .dispatch("Run", json!([{ "guest": { "id": "vm-2" } }]))
            .await
            .unwrap();

        let cpu = service
            .dispatch("CPUMetrics", json!([{ "guest": { "id": "vm-2" } }]))
            .await
            .unwrap();
        assert_eq!(cpu["type"], "cpu");
        assert_eq!(cpu["cpu"]["total"]["cpu_time"], 1.0);

        let disk = service
            .dispatch("DiskMetrics", json!([{ "guest": { "id": "vm-2", "disks": [{ "device": "vda" }] } }]))
            .await
            .unwrap();
        assert_eq!(disk["type"], "disk");
        assert_eq!(disk["disk"]["vda"]["read_ops"], 100);

        let err = service
            .dispatch("DiskMetrics", json!([{ "guest": { "id": "vm-2", "disks": [{ "device": "vdq" }] } }]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "incomplete_metrics");
    }
}
