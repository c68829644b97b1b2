//! Libvirt backend implementation.

use std::ffi::{CStr, CString};
use std::os::raw::c_int;
use std::ptr;

use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{Error as VirtError, ErrorNumber};
use virt::network::Network;
use virt::sys;

use crate::error::{HypervisorError, Result};
use crate::traits::*;
use crate::types::DomainState;

/// Libvirt/QEMU hypervisor backend.
///
/// Each [`connect`](Backend::connect) opens a fresh libvirt connection; the
/// pool closes it again on release.
pub struct LibvirtBackend {
    uri: String,
}

impl LibvirtBackend {
    /// Create a backend for the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu:///session` - User session QEMU
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub fn new(uri: &str) -> Self {
        // Errors surface through Result only, not libvirt's stderr printer.
        virt::error::clear_error_callback();

        info!(uri = %uri, "Using libvirt backend");
        Self {
            uri: uri.to_string(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Backend for LibvirtBackend {
    fn name(&self) -> &str {
        "libvirt"
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = Connect::open(Some(&self.uri))
            .map_err(|e| HypervisorError::ConnectionFailed(e.to_string()))?;
        debug!("Connected to libvirt");
        Ok(Box::new(LibvirtConnection { conn }))
    }
}

fn is_no_domain(e: &VirtError) -> bool {
    matches!(e.code(), ErrorNumber::NoDomain)
}

fn is_no_network(e: &VirtError) -> bool {
    matches!(e.code(), ErrorNumber::NoNetwork)
}

struct LibvirtConnection {
    conn: Connect,
}

impl Connection for LibvirtConnection {
    fn lookup_domain(&self, name: &str) -> Result<Box<dyn DomainHandle>> {
        let domain = Domain::lookup_by_name(&self.conn, name).map_err(|e| {
            if is_no_domain(&e) {
                HypervisorError::DomainNotFound(name.to_string())
            } else {
                HypervisorError::backend("lookup_domain", e)
            }
        })?;
        Ok(Box::new(LibvirtDomain { domain }))
    }

    fn define_domain(&self, xml: &str) -> Result<Box<dyn DomainHandle>> {
        let domain = Domain::define_xml(&self.conn, xml)
            .map_err(|e| HypervisorError::backend("define_domain", e))?;
        Ok(Box::new(LibvirtDomain { domain }))
    }

    fn lookup_network(&self, name: &str) -> Result<Box<dyn NetworkHandle>> {
        let network = Network::lookup_by_name(&self.conn, name).map_err(|e| {
            if is_no_network(&e) {
                HypervisorError::NetworkNotFound(name.to_string())
            } else {
                HypervisorError::backend("lookup_network", e)
            }
        })?;
        Ok(Box::new(LibvirtNetwork { network }))
    }

    fn define_network(&self, xml: &str) -> Result<Box<dyn NetworkHandle>> {
        let network = Network::define_xml(&self.conn, xml)
            .map_err(|e| HypervisorError::backend("define_network", e))?;
        Ok(Box::new(LibvirtNetwork { network }))
    }

    fn close(&mut self) -> Result<()> {
        self.conn
            .close()
            .map(|_| ())
            .map_err(|e| HypervisorError::backend("close", e))
    }
}

/// Domain reference; the underlying `virDomainPtr` is freed on drop.
struct LibvirtDomain {
    domain: Domain,
}

fn state_from_libvirt(state: sys::virDomainState) -> DomainState {
    match state {
        sys::VIR_DOMAIN_RUNNING => DomainState::Running,
        sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
        sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
        sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
        sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
        sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
        sys::VIR_DOMAIN_PMSUSPENDED => DomainState::Suspended,
        _ => DomainState::NoState,
    }
}

impl DomainHandle for LibvirtDomain {
    fn state(&self) -> Result<DomainState> {
        let (state, _reason) = self
            .domain
            .get_state()
            .map_err(|e| HypervisorError::backend("get_state", e))?;
        Ok(state_from_libvirt(state))
    }

    fn create(&self) -> Result<()> {
        self.domain
            .create()
            .map(|_| ())
            .map_err(|e| HypervisorError::backend("create", e))
    }

    fn destroy(&self) -> Result<()> {
        self.domain
            .destroy()
            .map(|_| ())
            .map_err(|e| HypervisorError::backend("destroy", e))
    }

    fn undefine(&self) -> Result<()> {
        self.domain
            .undefine()
            .map(|_| ())
            .map_err(|e| HypervisorError::backend("undefine", e))
    }

    fn shutdown(&self) -> Result<()> {
        self.domain
            .shutdown()
            .map(|_| ())
            .map_err(|e| HypervisorError::backend("shutdown", e))
    }

    fn reboot(&self) -> Result<()> {
        self.domain
            .reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT)
            .map(|_| ())
            .map_err(|e| HypervisorError::backend("reboot", e))
    }

    fn resume(&self) -> Result<()> {
        self.domain
            .resume()
            .map(|_| ())
            .map_err(|e| HypervisorError::backend("resume", e))
    }

    fn xml_desc(&self) -> Result<String> {
        self.domain
            .get_xml_desc(0)
            .map_err(|e| HypervisorError::backend("get_xml_desc", e))
    }

    fn cpu_stats(&self) -> Result<CpuStats> {
        let ptr = self.domain.as_ptr();

        // SAFETY: `ptr` is a live domain owned by `self`; every params buffer is
        // sized from libvirt's own count and cleared before it is dropped.
        unsafe {
            let ncpus = sys::virDomainGetCPUStats(ptr, ptr::null_mut(), 0, 0, 0, 0);
            if ncpus < 0 {
                return Err(last_error("get_cpu_stats"));
            }
            let nparams = sys::virDomainGetCPUStats(ptr, ptr::null_mut(), 0, 0, 1, 0);
            if nparams < 0 {
                return Err(last_error("get_cpu_stats"));
            }

            let mut per_cpu = Vec::with_capacity(ncpus as usize);
            for cpu in 0..ncpus {
                let mut buf = param_buffer(nparams);
                let got = sys::virDomainGetCPUStats(ptr, buf.as_mut_ptr(), nparams as u32, cpu, 1, 0);
                if got < 0 {
                    return Err(last_error("get_cpu_stats"));
                }
                per_cpu.push(decode_params(&mut buf, got));
            }

            let ntotal = sys::virDomainGetCPUStats(ptr, ptr::null_mut(), 0, -1, 1, 0);
            if ntotal < 0 {
                return Err(last_error("get_cpu_stats"));
            }
            let mut buf = param_buffer(ntotal);
            let got = sys::virDomainGetCPUStats(ptr, buf.as_mut_ptr(), ntotal as u32, -1, 1, 0);
            if got < 0 {
                return Err(last_error("get_cpu_stats"));
            }
            let total = decode_params(&mut buf, got);

            Ok(CpuStats { per_cpu, total })
        }
    }

    fn block_stats(&self, device: &str) -> Result<TypedParams> {
        let path = CString::new(device)
            .map_err(|_| HypervisorError::InvalidArgument(format!("bad disk device {:?}", device)))?;
        let ptr = self.domain.as_ptr();

        // SAFETY: as in `cpu_stats`.
        unsafe {
            let mut nparams: c_int = 0;
            if sys::virDomainBlockStatsFlags(ptr, path.as_ptr(), ptr::null_mut(), &mut nparams, 0) < 0 {
                return Err(device_error("block_stats", device));
            }

            let mut buf = param_buffer(nparams);
            if sys::virDomainBlockStatsFlags(ptr, path.as_ptr(), buf.as_mut_ptr(), &mut nparams, 0) < 0 {
                return Err(device_error("block_stats", device));
            }
            Ok(decode_params(&mut buf, nparams))
        }
    }

    fn interface_stats(&self, device: &str) -> Result<InterfaceStats> {
        let stats = self.domain.interface_stats(device).map_err(|e| {
            if matches!(e.code(), ErrorNumber::InvalidArg) {
                HypervisorError::DeviceNotFound(device.to_string())
            } else {
                HypervisorError::backend("interface_stats", e)
            }
        })?;

        Ok(InterfaceStats {
            rx_bytes: stats.rx_bytes,
            rx_packets: stats.rx_packets,
            rx_errs: stats.rx_errs,
            rx_drop: stats.rx_drop,
            tx_bytes: stats.tx_bytes,
            tx_packets: stats.tx_packets,
            tx_errs: stats.tx_errs,
            tx_drop: stats.tx_drop,
        })
    }
}

fn last_error(operation: &'static str) -> HypervisorError {
    HypervisorError::backend(operation, VirtError::last_error())
}

/// libvirt reports an unknown disk path as an invalid argument.
fn device_error(operation: &'static str, device: &str) -> HypervisorError {
    let e = VirtError::last_error();
    if matches!(e.code(), ErrorNumber::InvalidArg) {
        HypervisorError::DeviceNotFound(device.to_string())
    } else {
        HypervisorError::backend(operation, e)
    }
}

fn param_buffer(n: c_int) -> Vec<sys::virTypedParameter> {
    // SAFETY: virTypedParameter is plain C data; all-zero is its empty value.
    (0..n.max(0)).map(|_| unsafe { std::mem::zeroed() }).collect()
}

/// Decode the first `n` entries of `buf` and release any strings libvirt
/// allocated into it.
unsafe fn decode_params(buf: &mut [sys::virTypedParameter], n: c_int) -> TypedParams {
    let n = (n.max(0) as usize).min(buf.len());
    let mut params = Vec::with_capacity(n);

    for p in &buf[..n] {
        let name = CStr::from_ptr(p.field.as_ptr()).to_string_lossy().into_owned();
        let value = match p.type_ as u32 {
            t if t == sys::VIR_TYPED_PARAM_INT as u32 => TypedValue::Int(p.value.i),
            t if t == sys::VIR_TYPED_PARAM_UINT as u32 => TypedValue::UInt(p.value.ui),
            t if t == sys::VIR_TYPED_PARAM_LLONG as u32 => TypedValue::LLong(p.value.l),
            t if t == sys::VIR_TYPED_PARAM_ULLONG as u32 => TypedValue::ULLong(p.value.ul),
            t if t == sys::VIR_TYPED_PARAM_DOUBLE as u32 => TypedValue::Double(p.value.d),
            t if t == sys::VIR_TYPED_PARAM_BOOLEAN as u32 => TypedValue::Boolean(p.value.b != 0),
            t if t == sys::VIR_TYPED_PARAM_STRING as u32 => {
                let s = p.value.s;
                if s.is_null() {
                    TypedValue::String(String::new())
                } else {
                    TypedValue::String(CStr::from_ptr(s).to_string_lossy().into_owned())
                }
            }
            _ => continue,
        };
        params.push(TypedParam::new(name, value));
    }

    sys::virTypedParamsClear(buf.as_mut_ptr(), n as c_int);
    params
}

/// Network reference; freed on drop.
struct LibvirtNetwork {
    network: Network,
}

impl NetworkHandle for LibvirtNetwork {
    fn is_active(&self) -> Result<bool> {
        self.network
            .is_active()
            .map_err(|e| HypervisorError::backend("network_is_active", e))
    }

    fn set_autostart(&self, autostart: bool) -> Result<()> {
        self.network
            .set_autostart(autostart)
            .map(|_| ())
            .map_err(|e| HypervisorError::backend("network_set_autostart", e))
    }

    fn create(&self) -> Result<()> {
        self.network
            .create()
            .map(|_| ())
            .map_err(|e| HypervisorError::backend("network_create", e))
    }

    fn destroy(&self) -> Result<()> {
        self.network
            .destroy()
            .map(|_| ())
            .map_err(|e| HypervisorError::backend("network_destroy", e))
    }

    fn undefine(&self) -> Result<()> {
        self.network
            .undefine()
            .map(|_| ())
            .map_err(|e| HypervisorError::backend("network_undefine", e))
    }
}
