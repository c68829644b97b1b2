//! Type definitions for guests, lifecycle state and metrics.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HypervisorError, Result};

// =============================================================================
// GUEST DESCRIPTION
// =============================================================================

/// Abstract description of a virtual machine, owned by the caller.
///
/// Requests carry a `Guest` in and responses echo it back, with device names
/// and state filled in by the operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Guest {
    /// Domain name on the backend; unique within the backend namespace.
    pub id: String,
    /// Hypervisor flavor (`kvm`, `qemu`, `test`). Empty means the configured default.
    #[serde(rename = "type")]
    pub kind: String,
    /// Memory in MiB
    pub memory: u64,
    /// Number of vCPUs
    pub cpu: u32,
    /// Ordered disk list; order decides slot naming
    pub disks: Vec<Disk>,
    /// Ordered NIC list; order matches the domain's interface order
    pub nics: Vec<Nic>,
    /// Opaque key/value metadata
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Observed state, populated by every lifecycle response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<DomainState>,
}

impl Guest {
    /// Create a guest description with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Set the memory size in MiB.
    pub fn with_memory(mut self, memory_mib: u64) -> Self {
        self.memory = memory_mib;
        self
    }

    /// Set the vCPU count.
    pub fn with_cpu(mut self, vcpus: u32) -> Self {
        self.cpu = vcpus;
        self
    }

    /// Set the hypervisor flavor.
    pub fn with_type(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Add a disk.
    pub fn with_disk(mut self, disk: Disk) -> Self {
        self.disks.push(disk);
        self
    }

    /// Add a network interface.
    pub fn with_nic(mut self, nic: Nic) -> Self {
        self.nics.push(nic);
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Reject a guest without an identifier.
    pub fn validate_id(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(HypervisorError::InvalidArgument(
                "guest id is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Fill in the hypervisor flavor if the caller left it empty.
    pub fn apply_default_type(&mut self, default: &str) {
        if self.kind.is_empty() {
            self.kind = default.to_string();
        }
    }

    /// Name each disk by slot (`vda`, `vdb`, ...) and force the virtio bus.
    pub fn assign_disk_devices(&mut self) {
        for (index, disk) in self.disks.iter_mut().enumerate() {
            disk.bus = DiskBus::Virtio;
            disk.device = format!("{}{}", DiskBus::Virtio.device_prefix(), disk_slot(index));
        }
    }
}

/// Slot suffix for the disk at `index`: `a`..`z`, then `aa`, `ab`, ...
pub fn disk_slot(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        n -= 1;
        letters.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

/// Disk attached to a guest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Disk {
    /// Bus type
    pub bus: DiskBus,
    /// Target device name (`vda`); assigned by CreateGuest
    pub device: String,
    /// Size in MiB
    pub size: u64,
    /// Device path, image path or volume name
    pub source: String,
}

impl Disk {
    /// Create a disk backed by the given source.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    /// Set the target device and bus.
    pub fn with_target(mut self, device: impl Into<String>, bus: DiskBus) -> Self {
        self.device = device.into();
        self.bus = bus;
        self
    }
}

/// Disk bus type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    #[default]
    Virtio,
    Scsi,
    Sata,
    Ide,
}

impl DiskBus {
    /// Get the libvirt bus name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
            DiskBus::Ide => "ide",
        }
    }

    /// Get the device prefix.
    pub fn device_prefix(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "vd",
            DiskBus::Scsi | DiskBus::Sata => "sd",
            DiskBus::Ide => "hd",
        }
    }
}

/// Network interface attached to a guest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Nic {
    /// Interface alias; back-filled from the backend by Run
    pub name: String,
    /// MAC address; also names the NIC's backend network
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Bridge the interface (or its network) attaches to
    pub network: String,
    /// Host-side device (`vnet0`); back-filled from the backend by Run
    pub device: String,
    /// VLAN tags carried by the NIC's network portgroup
    #[serde(rename = "vlans")]
    pub vlans: Vec<u16>,
    /// Device model hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<NicModel>,
}

impl Nic {
    /// Create a NIC attached to the given bridge.
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            ..Default::default()
        }
    }

    /// Set the MAC address.
    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    /// Set the VLAN tags.
    pub fn with_vlans(mut self, vlans: impl Into<Vec<u16>>) -> Self {
        self.vlans = vlans.into();
        self
    }

    /// Set the device model.
    pub fn with_model(mut self, model: NicModel) -> Self {
        self.model = Some(model);
        self
    }

    /// MAC address, treating an empty string as absent.
    pub fn mac_address(&self) -> Option<&str> {
        self.mac.as_deref().filter(|mac| !mac.is_empty())
    }

    /// Whether the NIC attaches through its own VLAN-carrying backend network.
    pub fn is_network_backed(&self) -> bool {
        !self.vlans.is_empty()
    }
}

/// Network interface model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicModel {
    Virtio,
    E1000,
    E1000e,
    Rtl8139,
}

impl NicModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicModel::Virtio => "virtio",
            NicModel::E1000 => "e1000",
            NicModel::E1000e => "e1000e",
            NicModel::Rtl8139 => "rtl8139",
        }
    }
}

// =============================================================================
// DOMAIN STATE
// =============================================================================

/// Domain run-state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    #[default]
    #[serde(rename = "unknown")]
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Crashed,
    Suspended,
    Shutoff,
}

impl DomainState {
    /// Stable lowercase name, as reported in responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::NoState => "unknown",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Crashed => "crashed",
            DomainState::Suspended => "suspended",
            DomainState::Shutoff => "shutoff",
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// RPC CONTRACT
// =============================================================================

/// Request carrying a guest for lifecycle operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestRequest {
    pub guest: Option<Guest>,
}

/// Response echoing the (possibly updated) guest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuestResponse {
    pub guest: Guest,
}

/// Request carrying a guest for metrics operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestMetricsRequest {
    pub guest: Option<Guest>,
}

/// Which metric family a response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsType {
    Cpu,
    Disk,
    Nic,
}

/// Metrics response; exactly one family is populated, matching `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestMetricsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuMetricsReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<BTreeMap<String, DiskMetrics>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nic: Option<BTreeMap<String, NicMetrics>>,
    #[serde(rename = "type")]
    pub kind: MetricsType,
}

impl GuestMetricsResponse {
    pub fn cpu(report: CpuMetricsReport) -> Self {
        Self {
            cpu: Some(report),
            disk: None,
            nic: None,
            kind: MetricsType::Cpu,
        }
    }

    pub fn disk(metrics: BTreeMap<String, DiskMetrics>) -> Self {
        Self {
            cpu: None,
            disk: Some(metrics),
            nic: None,
            kind: MetricsType::Disk,
        }
    }

    pub fn nic(metrics: BTreeMap<String, NicMetrics>) -> Self {
        Self {
            cpu: None,
            disk: None,
            nic: Some(metrics),
            kind: MetricsType::Nic,
        }
    }
}

// =============================================================================
// METRICS
// =============================================================================

/// CPU time counters, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    /// Total CPU time consumed by the guest
    pub cpu_time: f64,
    /// Time spent running guest code
    pub vcpu_time: f64,
}

/// CPU metrics per host CPU plus the aggregate over all of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetricsReport {
    pub per_cpu: Vec<CpuMetrics>,
    pub total: CpuMetrics,
}

/// Block device counters. Times are in seconds, everything else raw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub disk: String,
    pub read_ops: i64,
    pub read_bytes: i64,
    pub read_time: f64,
    pub write_ops: i64,
    pub write_bytes: i64,
    pub write_time: f64,
    pub flush_ops: i64,
    pub flush_time: f64,
}

/// Interface counters, passed through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NicMetrics {
    pub name: String,
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub rx_errs: i64,
    pub rx_drop: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
    pub tx_errs: i64,
    pub tx_drop: i64,
}
