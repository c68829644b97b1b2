//! Guest metrics: backend typed statistics mapped to unit-consistent values.
//!
//! Time counters arrive in nanoseconds and are reported in seconds. Counts
//! and byte totals pass through unchanged. Every disk and NIC named in the
//! request must have statistics, or the whole call fails.

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use crate::error::{HypervisorError, Result};
use crate::lifecycle::GuestManager;
use crate::traits::{DomainHandle, InterfaceStats, TypedParam};
use crate::types::{
    CpuMetrics, CpuMetricsReport, DiskMetrics, Guest, GuestMetricsResponse, NicMetrics,
};

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Nanoseconds to seconds.
pub fn nanos_to_secs(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_SECOND
}

/// A time statistic in seconds, or `None` if the value is not a
/// non-negative integer.
fn param_secs(param: &TypedParam) -> Option<f64> {
    let secs = param.value.as_u64().map(nanos_to_secs);
    if secs.is_none() {
        debug!(stat = %param.name, value = ?param.value, "Skipping time statistic with unexpected value");
    }
    secs
}

fn param_count(param: &TypedParam) -> Option<i64> {
    let count = param.value.as_i64();
    if count.is_none() {
        debug!(stat = %param.name, value = ?param.value, "Skipping counter with unexpected value");
    }
    count
}

fn set<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

/// CPU time values from one typed parameter set.
///
/// Returns the metrics and whether a `vcpu_time` entry was present.
pub fn cpu_from_params(params: &[TypedParam]) -> (CpuMetrics, bool) {
    let mut metrics = CpuMetrics::default();
    let mut has_vcpu_time = false;
    for param in params {
        match param.name.as_str() {
            "cpu_time" => set(&mut metrics.cpu_time, param_secs(param)),
            "vcpu_time" => {
                if let Some(secs) = param_secs(param) {
                    metrics.vcpu_time = secs;
                    has_vcpu_time = true;
                }
            }
            _ => {}
        }
    }
    (metrics, has_vcpu_time)
}

/// Block statistics for one disk device.
pub fn disk_from_params(device: &str, params: &[TypedParam]) -> DiskMetrics {
    let mut metrics = DiskMetrics {
        disk: device.to_string(),
        ..Default::default()
    };
    for param in params {
        match param.name.as_str() {
            "rd_operations" => set(&mut metrics.read_ops, param_count(param)),
            "rd_bytes" => set(&mut metrics.read_bytes, param_count(param)),
            "rd_total_times" => set(&mut metrics.read_time, param_secs(param)),
            "wr_operations" => set(&mut metrics.write_ops, param_count(param)),
            "wr_bytes" => set(&mut metrics.write_bytes, param_count(param)),
            "wr_total_times" => set(&mut metrics.write_time, param_secs(param)),
            "flush_operations" => set(&mut metrics.flush_ops, param_count(param)),
            "flush_total_times" => set(&mut metrics.flush_time, param_secs(param)),
            _ => {}
        }
    }
    metrics
}

pub fn nic_from_stats(name: &str, stats: &InterfaceStats) -> NicMetrics {
    NicMetrics {
        name: name.to_string(),
        rx_bytes: stats.rx_bytes,
        rx_packets: stats.rx_packets,
        rx_errs: stats.rx_errs,
        rx_drop: stats.rx_drop,
        tx_bytes: stats.tx_bytes,
        tx_packets: stats.tx_packets,
        tx_errs: stats.tx_errs,
        tx_drop: stats.tx_drop,
    }
}

/// A missing device surfaces as incomplete metrics for the guest.
fn incomplete(guest: &str, device: &str, err: HypervisorError) -> HypervisorError {
    match err {
        HypervisorError::DeviceNotFound(_) => HypervisorError::IncompleteMetrics {
            guest: guest.to_string(),
            device: device.to_string(),
        },
        other => other,
    }
}

/// A disk or NIC without a device name cannot be matched to any backend
/// statistic, so it makes the metrics incomplete. NICs get their device
/// names from [`GuestManager::run`].
fn require_device<'a>(guest: &str, kind: &str, index: usize, device: &'a str) -> Result<&'a str> {
    if device.is_empty() {
        return Err(HypervisorError::IncompleteMetrics {
            guest: guest.to_string(),
            device: format!("<unnamed {} #{}>", kind, index),
        });
    }
    Ok(device)
}

impl GuestManager {
    /// Per-CPU and total CPU time of the guest, in seconds.
    #[instrument(skip(self, guest), fields(guest = %guest.id))]
    pub async fn cpu_metrics(&self, guest: &Guest) -> Result<GuestMetricsResponse> {
        let report = self
            .with_lookup("CPUMetrics", guest, |domain, _| {
                let stats = domain.cpu_stats()?;

                let per_cpu: Vec<CpuMetrics> =
                    stats.per_cpu.iter().map(|p| cpu_from_params(p).0).collect();

                let (mut total, has_vcpu_time) = cpu_from_params(&stats.total);
                if !has_vcpu_time {
                    total.vcpu_time = per_cpu.iter().map(|c| c.vcpu_time).sum();
                }

                Ok(CpuMetricsReport { per_cpu, total })
            })
            .await?;

        debug!(cpus = report.per_cpu.len(), "Collected CPU metrics");
        Ok(GuestMetricsResponse::cpu(report))
    }

    /// Block statistics for every disk of the guest, keyed by device name.
    #[instrument(skip(self, guest), fields(guest = %guest.id))]
    pub async fn disk_metrics(&self, guest: &Guest) -> Result<GuestMetricsResponse> {
        let metrics = self
            .with_lookup("DiskMetrics", guest, |domain, guest| {
                let mut metrics = BTreeMap::new();
                for (index, disk) in guest.disks.iter().enumerate() {
                    let device = require_device(&guest.id, "disk", index, &disk.device)?;
                    let params = domain
                        .block_stats(device)
                        .map_err(|e| incomplete(&guest.id, device, e))?;
                    if params.is_empty() {
                        return Err(incomplete(
                            &guest.id,
                            device,
                            HypervisorError::DeviceNotFound(device.to_string()),
                        ));
                    }
                    metrics.insert(device.to_string(), disk_from_params(device, &params));
                }
                Ok(metrics)
            })
            .await?;

        debug!(disks = metrics.len(), "Collected disk metrics");
        Ok(GuestMetricsResponse::disk(metrics))
    }

    /// Interface counters for every NIC of the guest, keyed by device name.
    ///
    /// NIC device names are learned from [`run`](Self::run).
    #[instrument(skip(self, guest), fields(guest = %guest.id))]
    pub async fn nic_metrics(&self, guest: &Guest) -> Result<GuestMetricsResponse> {
        let metrics = self
            .with_lookup("NicMetrics", guest, |domain, guest| {
                let mut metrics = BTreeMap::new();
                for (index, nic) in guest.nics.iter().enumerate() {
                    let device = require_device(&guest.id, "nic", index, &nic.device)?;
                    let stats = domain
                        .interface_stats(device)
                        .map_err(|e| incomplete(&guest.id, device, e))?;
                    metrics.insert(device.to_string(), nic_from_stats(&nic.name, &stats));
                }
                Ok(metrics)
            })
            .await?;

        debug!(nics = metrics.len(), "Collected NIC metrics");
        Ok(GuestMetricsResponse::nic(metrics))
    }

    async fn with_lookup<T, F>(&self, operation: &'static str, guest: &Guest, f: F) -> Result<T>
    where
        F: FnOnce(&dyn DomainHandle, &Guest) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        guest.validate_id().map_err(|e| e.during(operation, &guest.id))?;

        let target = guest.clone();
        self.with_connection(operation, &guest.id, move |conn| {
            let domain = conn.lookup_domain(&target.id)?;
            f(domain.as_ref(), &target)
        })
        .await
    }
}
