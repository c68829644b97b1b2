//! Server setup: backend, connection pool, service and transport.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use limiquantix_hypervisor::{Backend, ConnectionPool, GuestManager, MockBackend};

use crate::config::{Config, HypervisorBackend};
use crate::http_server::run_http_server;
use crate::service::LibvirtService;

/// Build the configured hypervisor backend.
pub fn build_backend(config: &Config) -> Arc<dyn Backend> {
    match config.hypervisor.backend {
        HypervisorBackend::Mock => {
            info!("Using mock hypervisor backend");
            Arc::new(MockBackend::new())
        }
        HypervisorBackend::Libvirt => {
            #[cfg(feature = "libvirt")]
            {
                Arc::new(limiquantix_hypervisor::LibvirtBackend::new(&config.hypervisor.uri))
            }
            #[cfg(not(feature = "libvirt"))]
            {
                warn!("Libvirt backend requested but not compiled in, falling back to mock");
                Arc::new(MockBackend::new())
            }
        }
    }
}

/// Assemble the service from configuration.
pub fn build_service(config: &Config) -> Result<LibvirtService> {
    let backend = build_backend(config);
    let pool = ConnectionPool::new(backend, config.hypervisor.max_connections)?;

    info!(
        backend = %pool.backend_name(),
        max_connections = pool.capacity(),
        default_guest_type = %config.hypervisor.default_guest_type,
        "Connection pool ready"
    );

    Ok(LibvirtService::new(GuestManager::new(pool, config.manager_options())))
}

/// Run the JSON-RPC server until it fails.
pub async fn run(config: Config) -> Result<()> {
    let addr = config.listen_addr()?;
    let service = build_service(&config)?;

    let result = run_http_server(addr, service.clone()).await;
    service.manager().pool().close();
    result
}
