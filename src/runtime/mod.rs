//! Accelerator runtime boundary.
//!
//! The harness never talks to a driver directly. Everything it needs
//! (enumeration, object creation/release, program build, dispatch, event
//! waits, buffer reads) goes through [`AcceleratorRuntime`]. Calls return
//! `Err(status)` with the raw non-zero status code on failure; callers wrap
//! them with [`cl_check!`](crate::cl_check).
//!
//! Backends:
//! - [`host::HostRuntime`]: emulated host-reference platform, always built
//! - `opencl::OpenClRuntime`: real driver via the OpenCL ICD loader
//!   (`opencl` feature)

pub mod host;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod status;

use serde::{Deserialize, Serialize};

/// Raw runtime status code. Zero is success and never appears in an `Err`.
pub type Status = i32;

pub type RtResult<T> = std::result::Result<T, Status>;

macro_rules! opaque_handle {
    ($($(#[$doc:meta])* $name:ident;)*) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub usize);
        )*
    };
}

opaque_handle! {
    /// Platform handle, valid while the runtime is initialized.
    PlatformId;
    /// Device handle, valid while the runtime is initialized.
    DeviceId;
    ContextId;
    QueueId;
    MemId;
    ProgramId;
    KernelId;
    EventId;
}

/// Variable-length platform properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformParam {
    Name,
    Vendor,
}

/// Device properties. String-valued ones are NUL-terminated byte strings,
/// scalar ones are native-endian `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceParam {
    Name,
    Vendor,
    Type,
    GlobalMemSize,
    GlobalMemCacheSize,
    DriverVersion,
}

/// Device type bits as classified by the runtime.
pub mod device_type {
    pub const DEFAULT: u64 = 1 << 0;
    pub const CPU: u64 = 1 << 1;
    pub const GPU: u64 = 1 << 2;
    pub const ACCELERATOR: u64 = 1 << 3;
    pub const CUSTOM: u64 = 1 << 4;
}

/// Access direction of a device buffer. Host data is always copied in at
/// creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    ReadOnlyCopy,
    WriteOnlyCopy,
}

/// Program build state reported by the runtime after the completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    None,
    InProgress,
    Success,
    Error,
}

/// A kernel argument value.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    Buffer(MemId),
    Bytes(&'a [u8]),
}

/// Invoked exactly once by the runtime when a program build finishes,
/// possibly on a runtime-managed thread.
pub type BuildNotify = Box<dyn FnOnce() + Send + 'static>;

/// Which runtime implementation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Emulated host-reference device.
    #[default]
    Host,
    /// OpenCL ICD loader.
    OpenCl,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Host => write!(f, "host"),
            Backend::OpenCl => write!(f, "opencl"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(Backend::Host),
            "opencl" => Ok(Backend::OpenCl),
            other => Err(format!("unknown backend '{other}' (expected host or opencl)")),
        }
    }
}

/// The external driver surface used by the harness.
pub trait AcceleratorRuntime {
    /// Human-readable backend name for logs.
    fn backend_name(&self) -> &str;

    /// Write up to `out.len()` platform ids into `out`; returns the total count.
    fn platform_ids(&self, out: &mut [PlatformId]) -> RtResult<usize>;

    /// Two-step property query: returns the required length in bytes and
    /// fills `out` when it is large enough.
    fn platform_info(&self, platform: PlatformId, param: PlatformParam, out: &mut [u8])
        -> RtResult<usize>;

    /// Write up to `out.len()` device ids of any type into `out`; returns the total count.
    fn device_ids(&self, platform: PlatformId, out: &mut [DeviceId]) -> RtResult<usize>;

    fn device_info(&self, device: DeviceId, param: DeviceParam, out: &mut [u8]) -> RtResult<usize>;

    fn create_context(&self, device: DeviceId) -> RtResult<ContextId>;

    /// In-order command queue bound to `device`.
    fn create_queue(&self, context: ContextId, device: DeviceId) -> RtResult<QueueId>;

    fn create_buffer(
        &self,
        context: ContextId,
        mode: BufferMode,
        size_bytes: usize,
        host_data: &[u8],
    ) -> RtResult<MemId>;

    fn create_program(&self, context: ContextId, source: &str) -> RtResult<ProgramId>;

    /// Start compiling `program` for `device`. `notify` fires once the build
    /// has finished, successfully or not.
    fn build_program(
        &self,
        program: ProgramId,
        device: DeviceId,
        options: &str,
        notify: BuildNotify,
    ) -> RtResult<()>;

    fn build_status(&self, program: ProgramId, device: DeviceId) -> RtResult<BuildStatus>;

    /// Two-step build log query, same convention as [`Self::platform_info`].
    fn build_log(&self, program: ProgramId, device: DeviceId, out: &mut [u8]) -> RtResult<usize>;

    fn create_kernel(&self, program: ProgramId, entry_point: &str) -> RtResult<KernelId>;

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, value: KernelArg<'_>) -> RtResult<()>;

    /// One-dimensional dispatch; `global_size` must be a multiple of `local_size`.
    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global_size: usize,
        local_size: usize,
    ) -> RtResult<EventId>;

    fn wait_event(&self, event: EventId) -> RtResult<()>;

    /// Blocking device-to-host copy starting at byte `offset`.
    fn read_buffer(&self, queue: QueueId, mem: MemId, offset: usize, out: &mut [u8]) -> RtResult<()>;

    fn release_event(&self, event: EventId) -> RtResult<()>;
    fn release_kernel(&self, kernel: KernelId) -> RtResult<()>;
    fn release_program(&self, program: ProgramId) -> RtResult<()>;
    fn release_mem(&self, mem: MemId) -> RtResult<()>;
    fn release_queue(&self, queue: QueueId) -> RtResult<()>;
    fn release_context(&self, context: ContextId) -> RtResult<()>;
}

/// Initialize the requested backend once for this process run.
pub fn init(backend: Backend) -> crate::error::Result<Box<dyn AcceleratorRuntime>> {
    match backend {
        Backend::Host => Ok(Box::new(host::HostRuntime::new())),
        #[cfg(feature = "opencl")]
        Backend::OpenCl => Ok(Box::new(opencl::OpenClRuntime::init()?)),
        #[cfg(not(feature = "opencl"))]
        Backend::OpenCl => Err(crate::error::BenchError::BackendUnavailable {
            backend: backend.to_string(),
        }),
    }
}

/// Run a length-then-fetch query and return the owned bytes.
///
/// The first call asks for the required size with an empty buffer, the
/// second fills a buffer of exactly that size.
pub fn query_bytes<F>(mut query: F) -> RtResult<Vec<u8>>
where
    F: FnMut(&mut [u8]) -> RtResult<usize>,
{
    let len = query(&mut [])?;
    let mut buf = vec![0u8; len];
    if len > 0 {
        query(&mut buf)?;
    }
    Ok(buf)
}

/// [`query_bytes`] decoded as a string, trailing NULs stripped.
pub fn query_string<F>(query: F) -> RtResult<String>
where
    F: FnMut(&mut [u8]) -> RtResult<usize>,
{
    let bytes = query_bytes(query)?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(text.trim_end_matches('\0').to_string())
}

/// Fixed-size scalar query.
pub fn query_u64<F>(mut query: F) -> RtResult<u64>
where
    F: FnMut(&mut [u8]) -> RtResult<usize>,
{
    let mut buf = [0u8; 8];
    let len = query(&mut buf)?;
    if len != buf.len() {
        return Err(status::INVALID_VALUE);
    }
    Ok(u64::from_ne_bytes(buf))
}

/// Count-then-fetch listing of handles.
pub fn query_list<T, F>(mut query: F) -> RtResult<Vec<T>>
where
    T: Copy + Default,
    F: FnMut(&mut [T]) -> RtResult<usize>,
{
    let count = query(&mut [])?;
    let mut ids = vec![T::default(); count];
    if count > 0 {
        let filled = query(&mut ids)?;
        ids.truncate(filled.min(count));
    }
    Ok(ids)
}

/// Copy `value` into a caller buffer following the two-step convention.
pub(crate) fn fill_bytes(value: &[u8], out: &mut [u8]) -> RtResult<usize> {
    if out.is_empty() {
        return Ok(value.len());
    }
    if out.len() < value.len() {
        return Err(status::INVALID_VALUE);
    }
    out[..value.len()].copy_from_slice(value);
    Ok(value.len())
}

/// NUL-terminated string payload.
pub(crate) fn c_string_bytes(value: &str) -> Vec<u8> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.push(0);
    bytes
}
