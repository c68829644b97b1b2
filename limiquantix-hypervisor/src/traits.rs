//! Backend client abstraction.
//!
//! The lifecycle manager only talks to the hypervisor through these traits.
//! Handles are owned values: dropping a [`DomainHandle`] or [`NetworkHandle`]
//! frees the backend reference, so every exit path of a handler releases it.

use crate::error::{HypervisorError, Result};
use crate::types::DomainState;

/// Factory for backend connections.
pub trait Backend: Send + Sync {
    /// Short backend name for logs (e.g. "libvirt", "mock").
    fn name(&self) -> &str;

    /// Open a new connection.
    fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// A live connection to the hypervisor.
pub trait Connection: Send {
    /// Look up a defined domain by name.
    fn lookup_domain(&self, name: &str) -> Result<Box<dyn DomainHandle>>;

    /// Define (persist) a domain from its descriptor.
    fn define_domain(&self, xml: &str) -> Result<Box<dyn DomainHandle>>;

    /// Look up a defined network by name.
    fn lookup_network(&self, name: &str) -> Result<Box<dyn NetworkHandle>>;

    /// Define (persist) a network from its descriptor.
    fn define_network(&self, xml: &str) -> Result<Box<dyn NetworkHandle>>;

    /// Close the connection. Called exactly once by the pool.
    fn close(&mut self) -> Result<()>;
}

/// Reference to one defined domain.
pub trait DomainHandle: Send {
    /// Current run-state.
    fn state(&self) -> Result<DomainState>;

    /// Boot a defined domain.
    fn create(&self) -> Result<()>;

    /// Power the domain off immediately.
    fn destroy(&self) -> Result<()>;

    /// Remove the persistent definition.
    fn undefine(&self) -> Result<()>;

    /// Ask the guest OS to shut down.
    fn shutdown(&self) -> Result<()>;

    /// Ask the guest OS to reboot.
    fn reboot(&self) -> Result<()>;

    /// Resume a paused or suspended domain.
    fn resume(&self) -> Result<()>;

    /// Live descriptor of the domain.
    fn xml_desc(&self) -> Result<String>;

    /// Per-CPU and aggregate CPU statistics.
    fn cpu_stats(&self) -> Result<CpuStats>;

    /// Typed block statistics for a disk target device.
    ///
    /// Fails with [`HypervisorError::DeviceNotFound`] if the domain has no
    /// such disk.
    fn block_stats(&self, device: &str) -> Result<TypedParams>;

    /// Interface counters for a host-side interface device.
    ///
    /// Fails with [`HypervisorError::DeviceNotFound`] if the domain has no
    /// such interface.
    fn interface_stats(&self, device: &str) -> Result<InterfaceStats>;
}

/// Reference to one defined network.
pub trait NetworkHandle: Send {
    fn is_active(&self) -> Result<bool>;
    fn set_autostart(&self, autostart: bool) -> Result<()>;
    fn create(&self) -> Result<()>;
    fn destroy(&self) -> Result<()>;
    fn undefine(&self) -> Result<()>;
}

// =============================================================================
// TYPED STATISTICS
// =============================================================================

/// Value of a backend typed parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Int(i32),
    UInt(u32),
    LLong(i64),
    ULLong(u64),
    Double(f64),
    Boolean(bool),
    String(String),
}

impl TypedValue {
    /// Integer view of any integral variant.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            TypedValue::Int(v) => Some(v as i64),
            TypedValue::UInt(v) => Some(v as i64),
            TypedValue::LLong(v) => Some(v),
            TypedValue::ULLong(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Unsigned view of any non-negative integral variant.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            TypedValue::Int(v) => u64::try_from(v).ok(),
            TypedValue::UInt(v) => Some(v as u64),
            TypedValue::LLong(v) => u64::try_from(v).ok(),
            TypedValue::ULLong(v) => Some(v),
            _ => None,
        }
    }
}

/// Named typed value reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedParam {
    pub name: String,
    pub value: TypedValue,
}

impl TypedParam {
    pub fn new(name: impl Into<String>, value: TypedValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A set of typed parameters.
pub type TypedParams = Vec<TypedParam>;

/// CPU statistics: one parameter set per host CPU, plus the domain total.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuStats {
    pub per_cpu: Vec<TypedParams>,
    pub total: TypedParams,
}

/// Interface counters as reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub rx_errs: i64,
    pub rx_drop: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
    pub tx_errs: i64,
    pub tx_drop: i64,
}

/// Treat "not found" from a lookup as absence rather than failure.
pub fn not_found_as_none<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(HypervisorError::DomainNotFound(_)) | Err(HypervisorError::NetworkNotFound(_)) => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_value_views() {
        assert_eq!(TypedValue::ULLong(2_000_000_000).as_u64(), Some(2_000_000_000));
        assert_eq!(TypedValue::LLong(-1).as_u64(), None);
        assert_eq!(TypedValue::LLong(-1).as_i64(), Some(-1));
        assert_eq!(TypedValue::ULLong(u64::MAX).as_i64(), None);
        assert_eq!(TypedValue::Double(1.0).as_i64(), None);
        assert_eq!(TypedValue::String("x".into()).as_u64(), None);
    }

    #[test]
    fn test_not_found_as_none() {
        let missing: Result<()> = Err(HypervisorError::NetworkNotFound("n".into()));
        assert!(not_found_as_none(missing).unwrap().is_none());

        let failed: Result<()> = Err(HypervisorError::backend("lookup", "boom"));
        assert!(not_found_as_none(failed).is_err());
    }
}
