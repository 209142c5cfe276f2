//! Benchmark report and human-readable formatting.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::{DeviceCatalog, DeviceDescriptor};
use crate::metrics::BenchmarkResult;

/// Outcome of one complete benchmark run.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub backend: String,
    pub device: DeviceDescriptor,
    pub elements: usize,
    pub work_group_size: usize,
    pub global_work_size: usize,
    /// Elementwise kernel, three arrays per element.
    pub kernel: BenchmarkResult,
    /// Device-to-host copy of the output, one array per element.
    pub transfer: BenchmarkResult,
    /// Same computation on the host.
    pub host: BenchmarkResult,
    pub verification: Verification,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub build_log: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub elements_compared: usize,
    pub mismatches: usize,
}

fn format_result(label: &str, result: &BenchmarkResult) -> String {
    format!(
        "{:<10} {:.6}s +- {:.6}s ({}/{} samples), {:.3} G elements/s, {:.3} GiB/s",
        label,
        result.time.mean,
        result.time.stddev,
        result.time.used,
        result.time.total,
        result.throughput_gops,
        result.bandwidth_gib_s,
    )
}

/// Multi-line summary of a run.
pub fn format_summary(report: &BenchReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Device: {} ({}, {}) on {} [{} backend]",
        report.device.name,
        report.device.kind,
        report.device.driver_version,
        report.device.platform_name,
        report.backend,
    );
    let _ = writeln!(
        out,
        "Grid:   {} elements, work-group {}, global size {}",
        report.elements, report.work_group_size, report.global_work_size
    );
    let _ = writeln!(out, "{}", format_result("Kernel:", &report.kernel));
    let _ = writeln!(out, "{}", format_result("Transfer:", &report.transfer));
    let _ = writeln!(out, "{}", format_result("Host:", &report.host));
    let _ = write!(
        out,
        "Verify: {}/{} elements match host reference",
        report.verification.elements_compared - report.verification.mismatches,
        report.verification.elements_compared
    );
    out
}

/// Platform and device listing in the classic enumeration layout.
pub fn format_catalog(catalog: &DeviceCatalog) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Number of OpenCL platforms: {}", catalog.platforms.len());

    let mut devices = catalog.devices.iter();
    let platform_count = catalog.platforms.len();
    for (p, platform) in catalog.platforms.iter().enumerate() {
        let _ = writeln!(out, "Platform #{}/{}", p + 1, platform_count);
        let _ = writeln!(out, "    Platform name: {}", platform.name);
        let _ = writeln!(out, "    Platform vendor: {}", platform.vendor);
        let _ = writeln!(out, "Number of devices for the platform: {}", platform.device_count);
        for (d, device) in devices.by_ref().take(platform.device_count).enumerate() {
            let _ = writeln!(out, "  Device #{}/{}", d + 1, platform.device_count);
            let _ = writeln!(out, "      Device name: {}", device.name);
            let _ = writeln!(out, "      Device type: {}", device.kind);
            let _ = writeln!(out, "      Device vendor: {}", device.vendor);
            let _ = writeln!(
                out,
                "      Global memory size: {}Mb",
                device.global_mem_bytes / (1024 * 1024)
            );
            let _ = writeln!(out, "      Driver version: {}", device.driver_version);
            let _ = writeln!(
                out,
                "      Global memory cache size: {}Kb",
                device.global_mem_cache_bytes / 1024
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::enumerate;
    use crate::metrics::{FilteredStatistic, KERNEL_ARRAYS};
    use crate::runtime::host::{HostDevice, HostPlatform, HostRuntime};

    fn sample_report() -> BenchReport {
        let rt = HostRuntime::new();
        let device = enumerate(&rt).unwrap().devices.remove(0);
        let kernel = BenchmarkResult::from_laps(&[0.01; 5], 1_000_000, KERNEL_ARRAYS).unwrap();
        BenchReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            backend: "host".to_string(),
            device,
            elements: 1_000_000,
            work_group_size: 128,
            global_work_size: 1_000_064,
            kernel,
            transfer: kernel,
            host: kernel,
            verification: Verification {
                elements_compared: 1_000_000,
                mismatches: 0,
            },
            build_log: String::new(),
        }
    }

    #[test]
    fn test_format_summary() {
        let summary = format_summary(&sample_report());
        assert!(summary.contains("Host Reference Device (cpu"));
        assert!(summary.contains("global size 1000064"));
        assert!(summary.contains("0.100 G elements/s"));
        assert!(summary.contains(" GiB/s"));
        assert!(!summary.contains(" GB/s"));
        assert!(summary.contains("(5/5 samples)"));
        assert!(summary.contains("1000000/1000000 elements match"));
    }

    #[test]
    fn test_report_serializes_without_empty_log() {
        let json = serde_json::to_value(sample_report()).unwrap();
        assert_eq!(json["global_work_size"], 1_000_064);
        assert_eq!(json["device"]["kind"], "cpu");
        assert!(json.get("build_log").is_none());
        assert!(json["kernel"]["time"]["mean"].is_number());
    }

    #[test]
    fn test_format_catalog_groups_devices_by_platform() {
        let rt = HostRuntime::with_platforms(vec![
            HostPlatform::new("P1", "V1", vec![HostDevice::cpu("c0")]),
            HostPlatform::new("P2", "V2", vec![HostDevice::gpu("g0"), HostDevice::gpu("g1")]),
        ]);
        let text = format_catalog(&enumerate(&rt).unwrap());
        assert!(text.starts_with("Number of OpenCL platforms: 2\n"));
        assert!(text.contains("Platform #2/2\n    Platform name: P2\n    Platform vendor: V2\n"));
        assert!(text.contains("  Device #2/2\n      Device name: g1\n      Device type: gpu\n"));
        assert!(text.contains("      Device vendor: gpubench\n"));
        assert!(text.contains("Global memory size: 8192Mb"));
        assert!(text.contains("Global memory cache size: 256Kb"));
    }

    #[test]
    fn test_statistic_fields_in_summary() {
        let mut report = sample_report();
        report.kernel.time = FilteredStatistic {
            mean: 0.5,
            stddev: 0.25,
            used: 12,
            total: 20,
        };
        assert!(format_summary(&report).contains("0.500000s +- 0.250000s (12/20 samples)"));
    }
}
