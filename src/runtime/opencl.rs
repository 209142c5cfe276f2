//! OpenCL driver backend via the `opencl3` crate.
//!
//! Driver objects are owned by this runtime and addressed by opaque ids;
//! releasing an id drops the owning `opencl3` wrapper, which performs the
//! matching `clRelease*` call.

use std::collections::HashMap;
use std::ptr;
use std::sync::{Mutex, MutexGuard, OnceLock};

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_ALL};
use opencl3::error_codes::ClError;
use opencl3::event::Event;
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, CL_MEM_COPY_HOST_PTR, CL_MEM_READ_ONLY, CL_MEM_WRITE_ONLY};
use opencl3::platform::{get_platforms, Platform};
use opencl3::program::{Program, CL_BUILD_ERROR, CL_BUILD_IN_PROGRESS, CL_BUILD_SUCCESS};
use opencl3::types::{cl_device_id, cl_platform_id, CL_BLOCKING};
use tracing::{debug, info};

use super::{
    c_string_bytes, fill_bytes, status, AcceleratorRuntime, BufferMode, BuildNotify, BuildStatus,
    ContextId, DeviceId, DeviceParam, EventId, KernelArg, KernelId, MemId, PlatformId,
    PlatformParam, ProgramId, QueueId, RtResult,
};
use crate::cl_check;
use crate::error::Result;

/// Driver linkage is checked once per process.
static DRIVER: OnceLock<RtResult<usize>> = OnceLock::new();

fn code(e: ClError) -> i32 {
    e.0
}

#[derive(Default)]
struct ClObjects {
    next_id: usize,
    contexts: HashMap<usize, Context>,
    queues: HashMap<usize, CommandQueue>,
    mems: HashMap<usize, Buffer<u8>>,
    programs: HashMap<usize, Program>,
    kernels: HashMap<usize, Kernel>,
    events: HashMap<usize, Event>,
    failed_builds: HashMap<usize, i32>,
}

impl ClObjects {
    fn next(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }
}

/// Real accelerator runtime backed by the OpenCL ICD loader.
pub struct OpenClRuntime {
    objects: Mutex<ClObjects>,
}

impl std::fmt::Debug for OpenClRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClRuntime").finish_non_exhaustive()
    }
}

impl OpenClRuntime {
    /// Link to the driver. The platform probe runs only on the first call.
    pub fn init() -> Result<Self> {
        let probed = DRIVER.get_or_init(|| get_platforms().map(|p| p.len()).map_err(code));
        let platforms = cl_check!(*probed)?;
        info!(platforms, "OpenCL driver initialized");
        Ok(Self {
            objects: Mutex::new(ClObjects::default()),
        })
    }

    fn objects(&self) -> MutexGuard<'_, ClObjects> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn platform(id: PlatformId) -> Platform {
    Platform::new(id.0 as cl_platform_id)
}

fn device(id: DeviceId) -> Device {
    Device::new(id.0 as cl_device_id)
}

fn build_status_from(raw: i32) -> BuildStatus {
    match raw {
        CL_BUILD_SUCCESS => BuildStatus::Success,
        CL_BUILD_ERROR => BuildStatus::Error,
        CL_BUILD_IN_PROGRESS => BuildStatus::InProgress,
        _ => BuildStatus::None,
    }
}

impl AcceleratorRuntime for OpenClRuntime {
    fn backend_name(&self) -> &str {
        "opencl"
    }

    fn platform_ids(&self, out: &mut [PlatformId]) -> RtResult<usize> {
        let platforms = get_platforms().map_err(code)?;
        for (slot, p) in out.iter_mut().zip(&platforms) {
            *slot = PlatformId(p.id() as usize);
        }
        Ok(platforms.len())
    }

    fn platform_info(
        &self,
        id: PlatformId,
        param: PlatformParam,
        out: &mut [u8],
    ) -> RtResult<usize> {
        let p = platform(id);
        let value = match param {
            PlatformParam::Name => p.name(),
            PlatformParam::Vendor => p.vendor(),
        }
        .map_err(code)?;
        fill_bytes(&c_string_bytes(&value), out)
    }

    fn device_ids(&self, id: PlatformId, out: &mut [DeviceId]) -> RtResult<usize> {
        let ids = match platform(id).get_devices(CL_DEVICE_TYPE_ALL) {
            Ok(ids) => ids,
            Err(e) if e.0 == status::DEVICE_NOT_FOUND => Vec::new(),
            Err(e) => return Err(e.0),
        };
        for (slot, d) in out.iter_mut().zip(&ids) {
            *slot = DeviceId(*d as usize);
        }
        Ok(ids.len())
    }

    fn device_info(&self, id: DeviceId, param: DeviceParam, out: &mut [u8]) -> RtResult<usize> {
        let d = device(id);
        let value = match param {
            DeviceParam::Name => c_string_bytes(&d.name().map_err(code)?),
            DeviceParam::Vendor => c_string_bytes(&d.vendor().map_err(code)?),
            DeviceParam::DriverVersion => c_string_bytes(&d.driver_version().map_err(code)?),
            DeviceParam::Type => (d.dev_type().map_err(code)? as u64).to_ne_bytes().to_vec(),
            DeviceParam::GlobalMemSize => d.global_mem_size().map_err(code)?.to_ne_bytes().to_vec(),
            DeviceParam::GlobalMemCacheSize => {
                d.global_mem_cache_size().map_err(code)?.to_ne_bytes().to_vec()
            }
        };
        fill_bytes(&value, out)
    }

    fn create_context(&self, id: DeviceId) -> RtResult<ContextId> {
        let context = Context::from_device(&device(id)).map_err(code)?;
        let mut objects = self.objects();
        let handle = objects.next();
        objects.contexts.insert(handle, context);
        Ok(ContextId(handle))
    }

    fn create_queue(&self, context: ContextId, _device: DeviceId) -> RtResult<QueueId> {
        let mut objects = self.objects();
        let ctx = objects
            .contexts
            .get(&context.0)
            .ok_or(status::INVALID_CONTEXT)?;
        // No out-of-order flag: commands execute in enqueue order.
        let queue = CommandQueue::create_default_with_properties(ctx, 0, 0).map_err(code)?;
        let handle = objects.next();
        objects.queues.insert(handle, queue);
        Ok(QueueId(handle))
    }

    fn create_buffer(
        &self,
        context: ContextId,
        mode: BufferMode,
        size_bytes: usize,
        host_data: &[u8],
    ) -> RtResult<MemId> {
        if host_data.len() != size_bytes {
            return Err(status::INVALID_HOST_PTR);
        }
        let flags = match mode {
            BufferMode::ReadOnlyCopy => CL_MEM_READ_ONLY | CL_MEM_COPY_HOST_PTR,
            BufferMode::WriteOnlyCopy => CL_MEM_WRITE_ONLY | CL_MEM_COPY_HOST_PTR,
        };
        let mut objects = self.objects();
        let ctx = objects
            .contexts
            .get(&context.0)
            .ok_or(status::INVALID_CONTEXT)?;
        // SAFETY: COPY_HOST_PTR makes the driver copy `size_bytes` bytes out of
        // `host_data` before returning; the pointer is not retained.
        let buffer = unsafe {
            Buffer::<u8>::create(ctx, flags, size_bytes, host_data.as_ptr() as *mut _)
        }
        .map_err(code)?;
        let handle = objects.next();
        objects.mems.insert(handle, buffer);
        Ok(MemId(handle))
    }

    fn create_program(&self, context: ContextId, source: &str) -> RtResult<ProgramId> {
        let mut objects = self.objects();
        let ctx = objects
            .contexts
            .get(&context.0)
            .ok_or(status::INVALID_CONTEXT)?;
        let program = Program::create_from_source(ctx, source).map_err(code)?;
        let handle = objects.next();
        objects.programs.insert(handle, program);
        Ok(ProgramId(handle))
    }

    fn build_program(
        &self,
        program: ProgramId,
        id: DeviceId,
        options: &str,
        notify: BuildNotify,
    ) -> RtResult<()> {
        let outcome = {
            let mut objects = self.objects();
            let prog = objects
                .programs
                .get_mut(&program.0)
                .ok_or(status::INVALID_PROGRAM)?;
            prog.build(&[id.0 as cl_device_id], options)
        };
        // Synchronous: `Program::build` blocks until the driver finishes, so
        // `notify` fires after the build returns and the session's wait sees
        // an already-signalled channel. A failed compile is still reported
        // through the build status.
        match outcome {
            Ok(()) => {}
            Err(e) if e.0 == status::BUILD_PROGRAM_FAILURE => {
                debug!(program = program.0, "OpenCL build reported failure");
                self.objects().failed_builds.insert(program.0, e.0);
            }
            Err(e) => return Err(e.0),
        }
        notify();
        Ok(())
    }

    fn build_status(&self, program: ProgramId, id: DeviceId) -> RtResult<BuildStatus> {
        let objects = self.objects();
        let prog = objects
            .programs
            .get(&program.0)
            .ok_or(status::INVALID_PROGRAM)?;
        if objects.failed_builds.contains_key(&program.0) {
            return Ok(BuildStatus::Error);
        }
        let raw = prog.get_build_status(id.0 as cl_device_id).map_err(code)?;
        Ok(build_status_from(raw))
    }

    fn build_log(&self, program: ProgramId, id: DeviceId, out: &mut [u8]) -> RtResult<usize> {
        let objects = self.objects();
        let prog = objects
            .programs
            .get(&program.0)
            .ok_or(status::INVALID_PROGRAM)?;
        let log = prog.get_build_log(id.0 as cl_device_id).map_err(code)?;
        fill_bytes(&c_string_bytes(&log), out)
    }

    fn create_kernel(&self, program: ProgramId, entry_point: &str) -> RtResult<KernelId> {
        let mut objects = self.objects();
        let prog = objects
            .programs
            .get(&program.0)
            .ok_or(status::INVALID_PROGRAM)?;
        let kernel = Kernel::create(prog, entry_point).map_err(code)?;
        let handle = objects.next();
        objects.kernels.insert(handle, kernel);
        Ok(KernelId(handle))
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, value: KernelArg<'_>) -> RtResult<()> {
        let objects = self.objects();
        let k = objects.kernels.get(&kernel.0).ok_or(status::INVALID_KERNEL)?;
        // SAFETY: each argument is passed by reference with its exact size;
        // the driver copies the value during the call.
        unsafe {
            match value {
                KernelArg::Buffer(mem) => {
                    let buffer = objects.mems.get(&mem.0).ok_or(status::INVALID_MEM_OBJECT)?;
                    k.set_arg(index, &buffer.get())
                }
                KernelArg::Bytes(bytes) => match bytes.len() {
                    4 => {
                        let v = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                        k.set_arg(index, &v)
                    }
                    8 => {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(bytes);
                        k.set_arg(index, &u64::from_ne_bytes(raw))
                    }
                    _ => return Err(status::INVALID_ARG_SIZE),
                },
            }
        }
        .map_err(code)
    }

    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global_size: usize,
        local_size: usize,
    ) -> RtResult<EventId> {
        let mut objects = self.objects();
        let q = objects.queues.get(&queue.0).ok_or(status::INVALID_COMMAND_QUEUE)?;
        let k = objects.kernels.get(&kernel.0).ok_or(status::INVALID_KERNEL)?;
        let global = [global_size];
        let local = [local_size];
        // SAFETY: the work-size arrays outlive the call and all kernel
        // arguments were bound through `set_kernel_arg`.
        let event = unsafe {
            q.enqueue_nd_range_kernel(
                k.get(),
                1,
                ptr::null(),
                global.as_ptr(),
                local.as_ptr(),
                &[],
            )
        }
        .map_err(code)?;
        let handle = objects.next();
        objects.events.insert(handle, event);
        Ok(EventId(handle))
    }

    fn wait_event(&self, event: EventId) -> RtResult<()> {
        let objects = self.objects();
        let e = objects.events.get(&event.0).ok_or(status::INVALID_EVENT)?;
        e.wait().map_err(code)
    }

    fn read_buffer(&self, queue: QueueId, mem: MemId, offset: usize, out: &mut [u8]) -> RtResult<()> {
        let objects = self.objects();
        let q = objects.queues.get(&queue.0).ok_or(status::INVALID_COMMAND_QUEUE)?;
        let buffer = objects.mems.get(&mem.0).ok_or(status::INVALID_MEM_OBJECT)?;
        // SAFETY: blocking read; `out` is valid for its whole length until
        // the call returns.
        unsafe { q.enqueue_read_buffer(buffer, CL_BLOCKING, offset, out, &[]) }
            .map(|_| ())
            .map_err(code)
    }

    fn release_event(&self, event: EventId) -> RtResult<()> {
        self.objects()
            .events
            .remove(&event.0)
            .map(drop)
            .ok_or(status::INVALID_EVENT)
    }

    fn release_kernel(&self, kernel: KernelId) -> RtResult<()> {
        self.objects()
            .kernels
            .remove(&kernel.0)
            .map(drop)
            .ok_or(status::INVALID_KERNEL)
    }

    fn release_program(&self, program: ProgramId) -> RtResult<()> {
        let mut objects = self.objects();
        objects.failed_builds.remove(&program.0);
        objects
            .programs
            .remove(&program.0)
            .map(drop)
            .ok_or(status::INVALID_PROGRAM)
    }

    fn release_mem(&self, mem: MemId) -> RtResult<()> {
        self.objects()
            .mems
            .remove(&mem.0)
            .map(drop)
            .ok_or(status::INVALID_MEM_OBJECT)
    }

    fn release_queue(&self, queue: QueueId) -> RtResult<()> {
        self.objects()
            .queues
            .remove(&queue.0)
            .map(drop)
            .ok_or(status::INVALID_COMMAND_QUEUE)
    }

    fn release_context(&self, context: ContextId) -> RtResult<()> {
        self.objects()
            .contexts
            .remove(&context.0)
            .map(drop)
            .ok_or(status::INVALID_CONTEXT)
    }
}
