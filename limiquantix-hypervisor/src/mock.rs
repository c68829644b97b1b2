//! Mock hypervisor backend for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{HypervisorError, Result};
use crate::traits::*;
use crate::types::DomainState;
use crate::xml::{parse_domain, parse_network, DomainDescription};

/// Mock hypervisor backend for testing.
///
/// This backend simulates domains and networks in memory without requiring
/// an actual hypervisor. Every mutating call is recorded, connections and
/// handle frees are counted, and any primitive can be made to fail. Useful for:
/// - Unit and integration testing
/// - Development without libvirt installed (`--dev`)
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    domains: HashMap<String, MockDomain>,
    networks: HashMap<String, MockNetwork>,
    calls: Vec<MockCall>,
    failures: HashSet<String>,
    counters: MockCounters,
    next_vnet: usize,
    connect_latency: Option<Duration>,
}

struct MockDomain {
    description: DomainDescription,
    state: DomainState,
    /// Host-side interface devices, assigned while the domain is active.
    vnets: Vec<String>,
    cpu_stats: Option<CpuStats>,
    block_stats: HashMap<String, TypedParams>,
    interface_stats: HashMap<String, InterfaceStats>,
}

impl MockDomain {
    fn new(description: DomainDescription) -> Self {
        Self {
            description,
            state: DomainState::Shutoff,
            vnets: Vec::new(),
            cpu_stats: None,
            block_stats: HashMap::new(),
            interface_stats: HashMap::new(),
        }
    }

    fn is_active(&self) -> bool {
        !matches!(self.state, DomainState::Shutoff | DomainState::NoState)
    }

    fn has_disk(&self, device: &str) -> bool {
        self.description
            .devices
            .disks
            .iter()
            .any(|d| d.target_dev() == Some(device))
    }
}

struct MockNetwork {
    bridge: Option<String>,
    active: bool,
    autostart: bool,
}

/// One mutating backend call, as recorded by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub operation: String,
    pub target: String,
}

/// Connection and handle bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCounters {
    pub connections_opened: usize,
    pub connections_closed: usize,
    /// Highest number of simultaneously open connections seen.
    pub peak_open_connections: usize,
    pub domain_handles_issued: usize,
    pub domain_handles_freed: usize,
    pub network_handles_issued: usize,
    pub network_handles_freed: usize,
}

impl MockCounters {
    pub fn open_connections(&self) -> usize {
        self.connections_opened - self.connections_closed
    }
}

fn lock(state: &Mutex<MockState>) -> Result<MutexGuard<'_, MockState>> {
    state
        .lock()
        .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
}

impl MockState {
    fn check(&self, operation: &str) -> Result<()> {
        if self.failures.contains(operation) {
            return Err(HypervisorError::backend(
                "mock",
                format!("injected failure in {}", operation),
            ));
        }
        Ok(())
    }

    fn record(&mut self, operation: &str, target: &str) {
        self.calls.push(MockCall {
            operation: operation.to_string(),
            target: target.to_string(),
        });
    }

    fn domain(&self, name: &str) -> Result<&MockDomain> {
        self.domains
            .get(name)
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))
    }

    fn domain_mut(&mut self, name: &str) -> Result<&mut MockDomain> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))
    }

    fn network_mut(&mut self, name: &str) -> Result<&mut MockNetwork> {
        self.networks
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NetworkNotFound(name.to_string()))
    }

    fn assign_vnets(&mut self, name: &str) -> Result<()> {
        let count = self.domain(name)?.description.devices.interfaces.len();
        let first = self.next_vnet;
        self.next_vnet += count;
        self.domain_mut(name)?.vnets = (first..first + count).map(|n| format!("vnet{}", n)).collect();
        Ok(())
    }
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self::default()
    }

    /// Make every call to `operation` fail until [`clear_failures`](Self::clear_failures).
    ///
    /// Operation names match the trait methods (`connect`, `close`,
    /// `define_domain`, `create`, `network_create`, ...).
    pub fn fail_on(&self, operation: &str) {
        if let Ok(mut state) = lock(&self.state) {
            state.failures.insert(operation.to_string());
        }
    }

    /// Block the calling thread for `latency` on every connect, holding the
    /// new connection open meanwhile, like a slow libvirt daemon.
    pub fn set_connect_latency(&self, latency: Duration) {
        if let Ok(mut state) = lock(&self.state) {
            state.connect_latency = Some(latency);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = lock(&self.state) {
            state.failures.clear();
        }
    }

    /// Mutating calls recorded so far, oldest first.
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Operation names of the recorded calls, oldest first.
    pub fn call_names(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.operation).collect()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut state) = lock(&self.state) {
            state.calls.clear();
        }
    }

    pub fn counters(&self) -> MockCounters {
        lock(&self.state).map(|s| s.counters).unwrap_or_default()
    }

    pub fn has_domain(&self, name: &str) -> bool {
        lock(&self.state).map(|s| s.domains.contains_key(name)).unwrap_or(false)
    }

    pub fn domain_state(&self, name: &str) -> Option<DomainState> {
        lock(&self.state).ok()?.domains.get(name).map(|d| d.state)
    }

    /// Force a domain into a state, e.g. to simulate a guest pausing itself.
    pub fn set_domain_state(&self, name: &str, state: DomainState) -> Result<()> {
        let mut guard = lock(&self.state)?;
        let was_active = guard.domain(name)?.is_active();
        guard.domain_mut(name)?.state = state;
        let now_active = guard.domain(name)?.is_active();
        if now_active && !was_active {
            guard.assign_vnets(name)?;
        } else if !now_active {
            guard.domain_mut(name)?.vnets.clear();
        }
        Ok(())
    }

    pub fn has_network(&self, name: &str) -> bool {
        lock(&self.state).map(|s| s.networks.contains_key(name)).unwrap_or(false)
    }

    /// `(active, autostart)` of a defined network.
    pub fn network_status(&self, name: &str) -> Option<(bool, bool)> {
        lock(&self.state)
            .ok()?
            .networks
            .get(name)
            .map(|n| (n.active, n.autostart))
    }

    pub fn network_bridge(&self, name: &str) -> Option<String> {
        lock(&self.state).ok()?.networks.get(name)?.bridge.clone()
    }

    pub fn set_cpu_stats(&self, name: &str, stats: CpuStats) -> Result<()> {
        lock(&self.state)?.domain_mut(name)?.cpu_stats = Some(stats);
        Ok(())
    }

    pub fn set_block_stats(&self, name: &str, device: &str, params: TypedParams) -> Result<()> {
        lock(&self.state)?
            .domain_mut(name)?
            .block_stats
            .insert(device.to_string(), params);
        Ok(())
    }

    pub fn set_interface_stats(&self, name: &str, device: &str, stats: InterfaceStats) -> Result<()> {
        lock(&self.state)?
            .domain_mut(name)?
            .interface_stats
            .insert(device.to_string(), stats);
        Ok(())
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut state = lock(&self.state)?;
        state.check("connect")?;

        state.counters.connections_opened += 1;
        let open = state.counters.open_connections();
        state.counters.peak_open_connections = state.counters.peak_open_connections.max(open);
        debug!(open, "Mock connection opened");

        let latency = state.connect_latency;
        drop(state);
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }

        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

impl MockConnection {
    fn domain_handle(&self, state: &mut MockState, name: &str) -> Box<dyn DomainHandle> {
        state.counters.domain_handles_issued += 1;
        Box::new(MockDomainHandle {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        })
    }

    fn network_handle(&self, state: &mut MockState, name: &str) -> Box<dyn NetworkHandle> {
        state.counters.network_handles_issued += 1;
        Box::new(MockNetworkHandle {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

impl Connection for MockConnection {
    fn lookup_domain(&self, name: &str) -> Result<Box<dyn DomainHandle>> {
        let mut state = lock(&self.state)?;
        state.check("lookup_domain")?;
        state.domain(name)?;
        Ok(self.domain_handle(&mut state, name))
    }

    fn define_domain(&self, xml: &str) -> Result<Box<dyn DomainHandle>> {
        let description = parse_domain(xml)?;
        let name = description.name.clone();
        if name.is_empty() {
            return Err(HypervisorError::XmlError("domain has no name".to_string()));
        }

        let mut state = lock(&self.state)?;
        state.check("define_domain")?;
        state.record("define_domain", &name);

        match state.domains.get_mut(&name) {
            Some(existing) => existing.description = description,
            None => {
                state.domains.insert(name.clone(), MockDomain::new(description));
            }
        }

        info!(domain = %name, "Mock domain defined");
        Ok(self.domain_handle(&mut state, &name))
    }

    fn lookup_network(&self, name: &str) -> Result<Box<dyn NetworkHandle>> {
        let mut state = lock(&self.state)?;
        state.check("lookup_network")?;
        if !state.networks.contains_key(name) {
            return Err(HypervisorError::NetworkNotFound(name.to_string()));
        }
        Ok(self.network_handle(&mut state, name))
    }

    fn define_network(&self, xml: &str) -> Result<Box<dyn NetworkHandle>> {
        let description = parse_network(xml)?;
        let name = description.name.clone();

        let mut state = lock(&self.state)?;
        state.check("define_network")?;
        state.record("define_network", &name);

        let active = state.networks.get(&name).map(|n| n.active).unwrap_or(false);
        state.networks.insert(
            name.clone(),
            MockNetwork {
                bridge: description.bridge_name().map(str::to_string),
                active,
                autostart: false,
            },
        );

        Ok(self.network_handle(&mut state, &name))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut state = lock(&self.state)?;
        state.counters.connections_closed += 1;
        // The link is gone either way; report the failure after accounting for it.
        state.check("close")
    }
}

struct MockDomainHandle {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockDomainHandle {
    fn mutate<F>(&self, operation: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut MockState, &str) -> Result<()>,
    {
        let mut state = lock(&self.state)?;
        state.check(operation)?;
        state.domain(&self.name)?;
        f(&mut state, &self.name)?;
        state.record(operation, &self.name);
        Ok(())
    }
}

fn not_running(name: &str, operation: &'static str) -> HypervisorError {
    HypervisorError::backend(operation, format!("domain {} is not running", name))
}

impl DomainHandle for MockDomainHandle {
    fn state(&self) -> Result<DomainState> {
        let state = lock(&self.state)?;
        state.check("state")?;
        Ok(state.domain(&self.name)?.state)
    }

    fn create(&self) -> Result<()> {
        self.mutate("create", |state, name| {
            if state.domain(name)?.is_active() {
                return Err(HypervisorError::backend("create", format!("domain {} is already running", name)));
            }
            state.domain_mut(name)?.state = DomainState::Running;
            state.assign_vnets(name)
        })
    }

    fn destroy(&self) -> Result<()> {
        self.mutate("destroy", |state, name| {
            let domain = state.domain_mut(name)?;
            if !domain.is_active() {
                return Err(not_running(name, "destroy"));
            }
            domain.state = DomainState::Shutoff;
            domain.vnets.clear();
            Ok(())
        })
    }

    fn undefine(&self) -> Result<()> {
        self.mutate("undefine", |state, name| {
            state.domains.remove(name);
            Ok(())
        })
    }

    fn shutdown(&self) -> Result<()> {
        // The simulated guest OS honours the request immediately.
        self.mutate("shutdown", |state, name| {
            let domain = state.domain_mut(name)?;
            if !domain.is_active() {
                return Err(not_running(name, "shutdown"));
            }
            domain.state = DomainState::Shutoff;
            domain.vnets.clear();
            Ok(())
        })
    }

    fn reboot(&self) -> Result<()> {
        self.mutate("reboot", |state, name| {
            let domain = state.domain_mut(name)?;
            if !domain.is_active() {
                return Err(not_running(name, "reboot"));
            }
            domain.state = DomainState::Running;
            Ok(())
        })
    }

    fn resume(&self) -> Result<()> {
        self.mutate("resume", |state, name| {
            let domain = state.domain_mut(name)?;
            if !matches!(domain.state, DomainState::Paused | DomainState::Suspended) {
                return Err(HypervisorError::backend("resume", format!("domain {} is not paused", name)));
            }
            domain.state = DomainState::Running;
            Ok(())
        })
    }

    fn xml_desc(&self) -> Result<String> {
        let state = lock(&self.state)?;
        state.check("xml_desc")?;
        let domain = state.domain(&self.name)?;
        Ok(live_descriptor(&self.name, domain))
    }

    fn cpu_stats(&self) -> Result<CpuStats> {
        let state = lock(&self.state)?;
        state.check("cpu_stats")?;
        let domain = state.domain(&self.name)?;

        if let Some(stats) = &domain.cpu_stats {
            return Ok(stats.clone());
        }

        let per_cpu: Vec<TypedParams> = (1..=domain.description.vcpus() as u64)
            .map(|n| {
                vec![
                    TypedParam::new("cpu_time", TypedValue::ULLong(n * 1_000_000_000)),
                    TypedParam::new("vcpu_time", TypedValue::ULLong(n * 500_000_000)),
                ]
            })
            .collect();
        let total_ns: u64 = (1..=domain.description.vcpus() as u64).map(|n| n * 1_000_000_000).sum();

        Ok(CpuStats {
            per_cpu,
            total: vec![
                TypedParam::new("cpu_time", TypedValue::ULLong(total_ns)),
                TypedParam::new("user_time", TypedValue::ULLong(total_ns / 2)),
                TypedParam::new("system_time", TypedValue::ULLong(total_ns / 4)),
            ],
        })
    }

    fn block_stats(&self, device: &str) -> Result<TypedParams> {
        let state = lock(&self.state)?;
        state.check("block_stats")?;
        let domain = state.domain(&self.name)?;

        if !domain.has_disk(device) {
            return Err(HypervisorError::DeviceNotFound(format!("{}: no disk {}", self.name, device)));
        }

        Ok(domain.block_stats.get(device).cloned().unwrap_or_else(|| {
            vec![
                TypedParam::new("rd_operations", TypedValue::LLong(100)),
                TypedParam::new("rd_bytes", TypedValue::LLong(409_600)),
                TypedParam::new("rd_total_times", TypedValue::LLong(1_500_000_000)),
                TypedParam::new("wr_operations", TypedValue::LLong(50)),
                TypedParam::new("wr_bytes", TypedValue::LLong(204_800)),
                TypedParam::new("wr_total_times", TypedValue::LLong(250_000_000)),
                TypedParam::new("flush_operations", TypedValue::LLong(5)),
                TypedParam::new("flush_total_times", TypedValue::LLong(10_000_000)),
            ]
        }))
    }

    fn interface_stats(&self, device: &str) -> Result<InterfaceStats> {
        let state = lock(&self.state)?;
        state.check("interface_stats")?;
        let domain = state.domain(&self.name)?;

        if !domain.vnets.iter().any(|v| v == device) {
            return Err(HypervisorError::DeviceNotFound(format!(
                "{}: no interface {}",
                self.name, device
            )));
        }

        Ok(domain.interface_stats.get(device).copied().unwrap_or(InterfaceStats {
            rx_bytes: 2048,
            rx_packets: 16,
            rx_errs: 0,
            rx_drop: 1,
            tx_bytes: 1024,
            tx_packets: 8,
            tx_errs: 0,
            tx_drop: 0,
        }))
    }
}

impl Drop for MockDomainHandle {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.counters.domain_handles_freed += 1;
        }
    }
}

/// Descriptor as libvirt reports it for a defined domain: active domains carry
/// host-side target devices and aliases on every interface.
fn live_descriptor(name: &str, domain: &MockDomain) -> String {
    let description = &domain.description;
    let mut xml = format!(
        "<domain type='{}'>\n  <name>{}</name>\n  <vcpu>{}</vcpu>\n  <devices>\n",
        description.kind,
        name,
        description.vcpus()
    );

    for disk in &description.devices.disks {
        if let Some(dev) = disk.target_dev() {
            xml.push_str(&format!(
                "    <disk type='{}' device='disk'>\n      <target dev='{}'/>\n    </disk>\n",
                disk.kind, dev
            ));
        }
    }

    for (i, iface) in description.devices.interfaces.iter().enumerate() {
        xml.push_str(&format!("    <interface type='{}'>\n", iface.kind));
        if let Some(mac) = iface.mac_address() {
            xml.push_str(&format!("      <mac address='{}'/>\n", mac));
        }
        if let Some(vnet) = domain.vnets.get(i) {
            xml.push_str(&format!("      <target dev='{}'/>\n", vnet));
            xml.push_str(&format!("      <alias name='net{}'/>\n", i));
        }
        xml.push_str("    </interface>\n");
    }

    xml.push_str("  </devices>\n</domain>\n");
    xml
}

struct MockNetworkHandle {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockNetworkHandle {
    fn mutate<F>(&self, operation: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut MockNetwork, &str) -> Result<()>,
    {
        let mut state = lock(&self.state)?;
        state.check(operation)?;
        f(state.network_mut(&self.name)?, &self.name)?;
        state.record(operation, &self.name);
        Ok(())
    }
}

impl NetworkHandle for MockNetworkHandle {
    fn is_active(&self) -> Result<bool> {
        let mut state = lock(&self.state)?;
        Ok(state.network_mut(&self.name)?.active)
    }

    fn set_autostart(&self, autostart: bool) -> Result<()> {
        self.mutate("network_set_autostart", |network, _| {
            network.autostart = autostart;
            Ok(())
        })
    }

    fn create(&self) -> Result<()> {
        self.mutate("network_create", |network, name| {
            if network.active {
                return Err(HypervisorError::backend("network_create", format!("network {} is already active", name)));
            }
            network.active = true;
            Ok(())
        })
    }

    fn destroy(&self) -> Result<()> {
        self.mutate("network_destroy", |network, name| {
            if !network.active {
                return Err(HypervisorError::backend("network_destroy", format!("network {} is not active", name)));
            }
            network.active = false;
            Ok(())
        })
    }

    fn undefine(&self) -> Result<()> {
        let mut state = lock(&self.state)?;
        state.check("network_undefine")?;
        if state.networks.remove(&self.name).is_none() {
            return Err(HypervisorError::NetworkNotFound(self.name.clone()));
        }
        state.record("network_undefine", &self.name);
        Ok(())
    }
}

impl Drop for MockNetworkHandle {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.counters.network_handles_freed += 1;
        }
    }
}
