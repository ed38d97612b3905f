//! Host resource snapshot reported by `GET /status/{job_id}`.
//!
//! GPU figures come from NVML, which is optional: on a host without NVIDIA
//! drivers the monitor logs a warning once and reports an empty GPU list.

use std::sync::Mutex;

use nvml_wrapper::Nvml;
use serde::Serialize;
use sysinfo::System;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One GPU as seen by NVML.
#[derive(Debug, Clone, Serialize)]
pub struct GpuMetrics {
    pub index: u32,
    pub name: String,
    pub gpu_util: u32,
    pub vram_used_gb: f64,
    pub vram_total_gb: f64,
    pub vram_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub ram_used_gb: f64,
    pub ram_total_gb: f64,
    pub ram_percent: f64,
    pub gpu_info: Vec<GpuMetrics>,
}

/// Samples CPU, RAM and GPU usage on demand.
pub struct SystemMonitor {
    system: Mutex<System>,
    /// `None` when NVML could not be initialised (no drivers / no GPU).
    nvml: Option<Nvml>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                tracing::info!("NVML initialised, GPU metrics enabled");
                Some(nvml)
            }
            Err(e) => {
                tracing::warn!(error = %e, "NVML unavailable, GPU metrics will not be reported");
                None
            }
        };
        Self::with_nvml(nvml)
    }

    /// A monitor that never queries GPUs.
    pub fn without_gpu() -> Self {
        Self::with_nvml(None)
    }

    fn with_nvml(nvml: Option<Nvml>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            nvml,
        }
    }

    /// Take a snapshot.
    ///
    /// CPU usage is measured against the previous call, so the very first
    /// snapshot reports 0.
    pub fn collect(&self) -> SystemMetrics {
        let (cpu_percent, used, total) = {
            let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                f64::from(system.global_cpu_usage()),
                system.used_memory(),
                system.total_memory(),
            )
        };

        SystemMetrics {
            cpu_percent: round_to(cpu_percent, 1),
            ram_used_gb: gigabytes(used),
            ram_total_gb: gigabytes(total),
            ram_percent: percent(used, total),
            gpu_info: self.collect_gpus(),
        }
    }

    fn collect_gpus(&self) -> Vec<GpuMetrics> {
        let Some(nvml) = self.nvml.as_ref() else {
            return Vec::new();
        };
        let count = match nvml.device_count() {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Failed to query GPU device count");
                return Vec::new();
            }
        };

        (0..count)
            .filter_map(|index| match collect_device(nvml, index) {
                Ok(gpu) => Some(gpu),
                Err(e) => {
                    tracing::warn!(gpu_index = index, error = %e, "Skipping GPU, metrics collection failed");
                    None
                }
            })
            .collect()
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_device(nvml: &Nvml, index: u32) -> Result<GpuMetrics, nvml_wrapper::error::NvmlError> {
    let device = nvml.device_by_index(index)?;
    let memory = device.memory_info()?;
    let utilization = device.utilization_rates()?;

    Ok(GpuMetrics {
        index,
        name: device.name()?,
        gpu_util: utilization.gpu,
        vram_used_gb: gigabytes(memory.used),
        vram_total_gb: gigabytes(memory.total),
        vram_percent: percent(memory.used, memory.total),
    })
}

fn gigabytes(bytes: u64) -> f64 {
    round_to(bytes as f64 / BYTES_PER_GB, 2)
}

/// `used / total` as a percentage with one decimal, 0 when `total` is 0.
fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round_to(used as f64 / total as f64 * 100.0, 1)
}

fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_empty_totals() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(1, 3), 33.3);
        assert_eq!(percent(8, 8), 100.0);
    }

    #[test]
    fn gigabytes_are_rounded_to_hundredths() {
        assert_eq!(gigabytes(0), 0.0);
        assert_eq!(gigabytes(3 * 1024 * 1024 * 1024 / 2), 1.5);
        assert_eq!(gigabytes(1_000_000_000), 0.93);
    }

    #[test]
    fn snapshot_without_gpu_reports_host_memory() {
        let monitor = SystemMonitor::without_gpu();
        let metrics = monitor.collect();

        assert!(metrics.gpu_info.is_empty());
        assert!(metrics.ram_total_gb >= metrics.ram_used_gb);
        assert!((0.0..=100.0).contains(&metrics.ram_percent));
        assert!(metrics.cpu_percent >= 0.0);
    }
}
