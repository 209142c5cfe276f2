//! Device selection policy.
//!
//! Strict priority, first match in catalog order wins:
//! 1. the first GPU-kind device
//! 2. otherwise the first CPU-kind device
//! 3. otherwise `NoDeviceAvailable`
//!
//! An explicit catalog index bypasses the policy.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::catalog::{DeviceCatalog, DeviceDescriptor, DeviceKind};
use crate::error::{BenchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DevicePreference {
    #[default]
    Auto,
    Index(usize),
}

impl From<Option<usize>> for DevicePreference {
    fn from(index: Option<usize>) -> Self {
        index.map_or(DevicePreference::Auto, DevicePreference::Index)
    }
}

/// Pick a device with the GPU-then-CPU policy.
pub fn select(catalog: &DeviceCatalog) -> Result<&DeviceDescriptor> {
    if catalog.is_empty() {
        return Err(BenchError::NoDeviceAvailable {
            reason: "the runtime reported no devices".to_string(),
        });
    }

    let chosen = [DeviceKind::Gpu, DeviceKind::Cpu]
        .iter()
        .find_map(|kind| catalog.iter().find(|d| d.kind == *kind))
        .ok_or_else(|| BenchError::NoDeviceAvailable {
            reason: format!(
                "none of the {} enumerated device(s) is a GPU or CPU",
                catalog.len()
            ),
        })?;

    info!(name = %chosen.name, kind = %chosen.kind, platform = %chosen.platform_name, "selected device");
    Ok(chosen)
}

/// Apply an explicit preference, falling back to [`select`] for `Auto`.
pub fn select_with(catalog: &DeviceCatalog, preference: DevicePreference) -> Result<&DeviceDescriptor> {
    match preference {
        DevicePreference::Auto => select(catalog),
        DevicePreference::Index(index) => {
            let chosen = catalog
                .devices
                .get(index)
                .ok_or_else(|| BenchError::NoDeviceAvailable {
                    reason: format!(
                        "device index {index} out of range ({} device(s) enumerated)",
                        catalog.len()
                    ),
                })?;
            info!(index, name = %chosen.name, kind = %chosen.kind, "selected device by index");
            Ok(chosen)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{DeviceId, PlatformId};

    fn device(name: &str, kind: DeviceKind) -> DeviceDescriptor {
        DeviceDescriptor {
            device: DeviceId(0),
            platform: PlatformId(0),
            kind,
            name: name.to_string(),
            vendor: "v".to_string(),
            platform_name: "p".to_string(),
            platform_vendor: "pv".to_string(),
            driver_version: "1".to_string(),
            global_mem_bytes: 0,
            global_mem_cache_bytes: 0,
        }
    }

    fn catalog(devices: Vec<DeviceDescriptor>) -> DeviceCatalog {
        DeviceCatalog {
            platforms: Vec::new(),
            devices,
        }
    }

    #[test]
    fn test_gpu_wins_regardless_of_position() {
        let c = catalog(vec![
            device("cpu0", DeviceKind::Cpu),
            device("acc0", DeviceKind::Accelerator),
            device("gpu0", DeviceKind::Gpu),
            device("gpu1", DeviceKind::Gpu),
        ]);
        assert_eq!(select(&c).unwrap().name, "gpu0");
    }

    #[test]
    fn test_first_cpu_without_gpu() {
        let c = catalog(vec![
            device("acc0", DeviceKind::Accelerator),
            device("cpu0", DeviceKind::Cpu),
            device("cpu1", DeviceKind::Cpu),
        ]);
        assert_eq!(select(&c).unwrap().name, "cpu0");
    }

    #[test]
    fn test_empty_catalog_fails() {
        let err = select(&catalog(Vec::new())).unwrap_err();
        assert!(matches!(err, BenchError::NoDeviceAvailable { .. }));
    }

    #[test]
    fn test_only_unsupported_kinds_fails() {
        let c = catalog(vec![
            device("acc0", DeviceKind::Accelerator),
            device("custom", DeviceKind::Other),
        ]);
        let err = select(&c).unwrap_err();
        assert!(err.to_string().contains("GPU or CPU"));
    }

    #[test]
    fn test_explicit_index_overrides_policy() {
        let c = catalog(vec![
            device("cpu0", DeviceKind::Cpu),
            device("gpu0", DeviceKind::Gpu),
        ]);
        assert_eq!(
            select_with(&c, DevicePreference::Index(0)).unwrap().name,
            "cpu0"
        );
        assert_eq!(select_with(&c, DevicePreference::Auto).unwrap().name, "gpu0");
        assert!(select_with(&c, DevicePreference::Index(5)).is_err());
    }
}
