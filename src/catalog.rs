//! Device catalog: flattened platform-major, device-minor enumeration.

use serde::Serialize;
use tracing::{debug, info};

use crate::cl_check;
use crate::error::Result;
use crate::runtime::{
    device_type, query_list, query_string, query_u64, AcceleratorRuntime, DeviceId, DeviceParam,
    PlatformId, PlatformParam,
};

/// Device classification as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Accelerator,
    Other,
}

impl DeviceKind {
    /// Classify a runtime device-type bitfield. GPU wins over CPU when a
    /// device reports both.
    pub fn from_type_bits(bits: u64) -> Self {
        if bits & device_type::GPU != 0 {
            DeviceKind::Gpu
        } else if bits & device_type::CPU != 0 {
            DeviceKind::Cpu
        } else if bits & device_type::ACCELERATOR != 0 {
            DeviceKind::Accelerator
        } else {
            DeviceKind::Other
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Gpu => write!(f, "gpu"),
            DeviceKind::Accelerator => write!(f, "accelerator"),
            DeviceKind::Other => write!(f, "something other than cpu, gpu or accelerator"),
        }
    }
}

/// One enumerated device. Handles stay valid while the runtime lives.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDescriptor {
    #[serde(skip)]
    pub device: DeviceId,
    #[serde(skip)]
    pub platform: PlatformId,
    pub kind: DeviceKind,
    pub name: String,
    pub vendor: String,
    pub platform_name: String,
    pub platform_vendor: String,
    pub driver_version: String,
    pub global_mem_bytes: u64,
    pub global_mem_cache_bytes: u64,
}

/// Ordered device list; order follows platform then device enumeration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceCatalog {
    pub platforms: Vec<PlatformSummary>,
    pub devices: Vec<DeviceDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformSummary {
    pub name: String,
    pub vendor: String,
    pub device_count: usize,
}

impl DeviceCatalog {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter()
    }
}

/// Enumerate every platform and device. Any failed query fails the whole
/// enumeration; no partial catalog is returned.
pub fn enumerate(rt: &dyn AcceleratorRuntime) -> Result<DeviceCatalog> {
    let platform_ids = cl_check!(query_list(|out| rt.platform_ids(out)))?;
    info!(count = platform_ids.len(), backend = rt.backend_name(), "enumerating platforms");

    let mut catalog = DeviceCatalog::default();
    for platform in platform_ids {
        let platform_name =
            cl_check!(query_string(|out| rt.platform_info(platform, PlatformParam::Name, out)))?;
        let vendor =
            cl_check!(query_string(|out| rt.platform_info(platform, PlatformParam::Vendor, out)))?;
        let device_ids = cl_check!(query_list(|out| rt.device_ids(platform, out)))?;
        debug!(%platform_name, %vendor, devices = device_ids.len(), "platform");

        catalog.platforms.push(PlatformSummary {
            name: platform_name.clone(),
            vendor: vendor.clone(),
            device_count: device_ids.len(),
        });

        for device in device_ids {
            let descriptor = describe(rt, platform, device, &platform_name, &vendor)?;
            debug!(name = %descriptor.name, kind = %descriptor.kind, "device");
            catalog.devices.push(descriptor);
        }
    }
    Ok(catalog)
}

fn describe(
    rt: &dyn AcceleratorRuntime,
    platform: PlatformId,
    device: DeviceId,
    platform_name: &str,
    platform_vendor: &str,
) -> Result<DeviceDescriptor> {
    let name = cl_check!(query_string(|out| rt.device_info(device, DeviceParam::Name, out)))?;
    let vendor = cl_check!(query_string(|out| rt.device_info(device, DeviceParam::Vendor, out)))?;
    let type_bits = cl_check!(query_u64(|out| rt.device_info(device, DeviceParam::Type, out)))?;
    let global_mem_bytes =
        cl_check!(query_u64(|out| rt.device_info(device, DeviceParam::GlobalMemSize, out)))?;
    let driver_version =
        cl_check!(query_string(|out| rt.device_info(device, DeviceParam::DriverVersion, out)))?;
    let global_mem_cache_bytes =
        cl_check!(query_u64(|out| rt.device_info(device, DeviceParam::GlobalMemCacheSize, out)))?;

    Ok(DeviceDescriptor {
        device,
        platform,
        kind: DeviceKind::from_type_bits(type_bits),
        name,
        vendor,
        platform_name: platform_name.to_string(),
        platform_vendor: platform_vendor.to_string(),
        driver_version,
        global_mem_bytes,
        global_mem_cache_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BenchError;
    use crate::runtime::host::{Call, HostDevice, HostPlatform, HostRuntime};
    use crate::runtime::status;

    fn two_platforms() -> HostRuntime {
        HostRuntime::with_platforms(vec![
            HostPlatform::new(
                "Portable CPU",
                "Vendor A",
                vec![HostDevice::cpu("cpu0")],
            ),
            HostPlatform::new(
                "Discrete",
                "Vendor B",
                vec![HostDevice::gpu("gpu0"), HostDevice::gpu("gpu1")],
            ),
        ])
    }

    #[test]
    fn test_kind_from_type_bits() {
        assert_eq!(DeviceKind::from_type_bits(device_type::GPU), DeviceKind::Gpu);
        assert_eq!(
            DeviceKind::from_type_bits(device_type::GPU | device_type::DEFAULT),
            DeviceKind::Gpu
        );
        assert_eq!(DeviceKind::from_type_bits(device_type::CPU), DeviceKind::Cpu);
        assert_eq!(
            DeviceKind::from_type_bits(device_type::ACCELERATOR),
            DeviceKind::Accelerator
        );
        assert_eq!(DeviceKind::from_type_bits(device_type::CUSTOM), DeviceKind::Other);
    }

    #[test]
    fn test_enumeration_order_is_platform_major() {
        let rt = two_platforms();
        let catalog = enumerate(&rt).unwrap();
        let names: Vec<_> = catalog.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["cpu0", "gpu0", "gpu1"]);
        assert_eq!(catalog.devices[1].platform_name, "Discrete");
        assert_eq!(catalog.devices[1].platform_vendor, "Vendor B");
        assert_eq!(catalog.devices[1].vendor, "gpubench");
        assert_eq!(catalog.devices[0].kind, DeviceKind::Cpu);
        assert_eq!(catalog.platforms.len(), 2);
        assert_eq!(catalog.platforms[1].device_count, 2);
    }

    #[test]
    fn test_device_vendor_is_queried_per_device() {
        let rt = HostRuntime::with_platforms(vec![HostPlatform::new(
            "Shared ICD",
            "Loader Inc",
            vec![
                HostDevice {
                    vendor: "Acme".to_string(),
                    ..HostDevice::gpu("gpu0")
                },
                HostDevice::cpu("cpu0"),
            ],
        )]);
        let catalog = enumerate(&rt).unwrap();
        assert_eq!(catalog.devices[0].vendor, "Acme");
        assert_eq!(catalog.devices[1].vendor, "gpubench");
        assert!(catalog.iter().all(|d| d.platform_vendor == "Loader Inc"));
        assert_eq!(catalog.platforms[0].vendor, "Loader Inc");
    }

    #[test]
    fn test_scalar_properties_round_trip() {
        let rt = HostRuntime::new();
        let catalog = enumerate(&rt).unwrap();
        let device = &catalog.devices[0];
        assert_eq!(device.global_mem_bytes, 8 << 30);
        assert_eq!(device.global_mem_cache_bytes, 256 << 10);
        assert!(device.driver_version.starts_with("gpubench-host"));
    }

    #[test]
    fn test_enumeration_is_all_or_nothing() {
        let rt = two_platforms();
        rt.inject_fault_after(Call::DeviceInfo, 6, status::OUT_OF_RESOURCES);
        let err = enumerate(&rt).unwrap_err();
        assert!(matches!(
            err,
            BenchError::Accelerator {
                code: status::OUT_OF_RESOURCES,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_runtime_gives_empty_catalog() {
        let rt = HostRuntime::with_platforms(Vec::new());
        let catalog = enumerate(&rt).unwrap();
        assert!(catalog.is_empty());
    }
}
