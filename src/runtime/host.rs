//! Emulated host-reference accelerator.
//!
//! Presents one or more platforms with configurable devices, validates kernel
//! sources on a background build thread, and executes the built-in
//! elementwise entry points on the host. Every object it hands out is
//! tracked so callers can check that each one is released exactly once.
//! Failures can be injected per call for exercising error paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace};

use super::{
    c_string_bytes, device_type, fill_bytes, status, AcceleratorRuntime, BufferMode, BuildNotify,
    BuildStatus, ContextId, DeviceId, DeviceParam, EventId, KernelArg, KernelId, MemId,
    PlatformId, PlatformParam, ProgramId, QueueId, RtResult, Status,
};

/// An emulated device description.
#[derive(Debug, Clone)]
pub struct HostDevice {
    pub name: String,
    pub vendor: String,
    pub type_bits: u64,
    pub global_mem_bytes: u64,
    pub global_mem_cache_bytes: u64,
    pub driver_version: String,
}

impl HostDevice {
    pub fn new(name: &str, type_bits: u64) -> Self {
        Self {
            name: name.to_string(),
            vendor: "gpubench".to_string(),
            type_bits,
            global_mem_bytes: 8 << 30,
            global_mem_cache_bytes: 256 << 10,
            driver_version: format!("gpubench-host {}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn cpu(name: &str) -> Self {
        Self::new(name, device_type::CPU)
    }

    pub fn gpu(name: &str) -> Self {
        Self::new(name, device_type::GPU)
    }
}

/// An emulated platform grouping devices.
#[derive(Debug, Clone)]
pub struct HostPlatform {
    pub name: String,
    pub vendor: String,
    pub devices: Vec<HostDevice>,
}

impl HostPlatform {
    pub fn new(name: &str, vendor: &str, devices: Vec<HostDevice>) -> Self {
        Self {
            name: name.to_string(),
            vendor: vendor.to_string(),
            devices,
        }
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new(
            "Host Reference Platform",
            "gpubench",
            vec![HostDevice::cpu("Host Reference Device")],
        )
    }
}

/// Runtime entry points, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    PlatformIds,
    PlatformInfo,
    DeviceIds,
    DeviceInfo,
    CreateContext,
    CreateQueue,
    CreateBuffer,
    CreateProgram,
    BuildProgram,
    BuildStatus,
    BuildLog,
    CreateKernel,
    SetKernelArg,
    EnqueueKernel,
    WaitEvent,
    ReadBuffer,
    ReleaseEvent,
    ReleaseKernel,
    ReleaseProgram,
    ReleaseMem,
    ReleaseQueue,
    ReleaseContext,
}

/// Kind of a runtime-owned object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Context,
    Queue,
    Mem,
    Program,
    Kernel,
    Event,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    skip: usize,
    status: Status,
}

#[derive(Debug, Clone)]
enum ArgValue {
    Buffer(MemId),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Buffer,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(BinOp::Add),
            '-' => Some(BinOp::Sub),
            '*' => Some(BinOp::Mul),
            '/' => Some(BinOp::Div),
            _ => None,
        }
    }

    fn apply(self, x: f32, y: f32) -> f32 {
        match self {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
        }
    }
}

/// A compiled entry point: `out[i] = lhs[i] op rhs[i]` for `i < count`.
/// Operands are parameter positions.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KernelDef {
    name: String,
    params: Vec<ParamKind>,
    out: usize,
    lhs: usize,
    rhs: usize,
    count: usize,
    op: BinOp,
}

#[derive(Debug)]
enum Object {
    Context {
        device: DeviceId,
    },
    Queue {
        context: ContextId,
    },
    Mem {
        context: ContextId,
        data: Vec<u8>,
    },
    Program {
        context: ContextId,
        device: DeviceId,
        source: Arc<str>,
        status: BuildStatus,
        log: String,
        kernels: Vec<KernelDef>,
    },
    Kernel {
        program: ProgramId,
        def: KernelDef,
        args: Vec<Option<ArgValue>>,
    },
    Event,
}

impl Object {
    fn kind(&self) -> ObjectKind {
        match self {
            Object::Context { .. } => ObjectKind::Context,
            Object::Queue { .. } => ObjectKind::Queue,
            Object::Mem { .. } => ObjectKind::Mem,
            Object::Program { .. } => ObjectKind::Program,
            Object::Kernel { .. } => ObjectKind::Kernel,
            Object::Event => ObjectKind::Event,
        }
    }

    /// The object this one depends on and which must outlive it.
    fn parent(&self) -> Option<usize> {
        match self {
            Object::Queue { context } | Object::Mem { context, .. } => Some(context.0),
            Object::Program { context, .. } => Some(context.0),
            Object::Kernel { program, .. } => Some(program.0),
            Object::Context { .. } | Object::Event => None,
        }
    }
}

#[derive(Debug, Default)]
struct HostState {
    next_id: usize,
    objects: HashMap<usize, Object>,
    released: Vec<(ObjectKind, usize)>,
    double_releases: usize,
    faults: HashMap<Call, Fault>,
    latencies: HashMap<Call, Duration>,
}

impl HostState {
    fn insert(&mut self, object: Object) -> usize {
        self.next_id += 1;
        let id = 0x1000 + self.next_id;
        trace!(id, kind = ?object.kind(), "host runtime: object created");
        self.objects.insert(id, object);
        id
    }

    fn release(&mut self, id: usize, kind: ObjectKind, invalid: Status) -> RtResult<()> {
        match self.objects.get(&id) {
            Some(object) if object.kind() == kind => {}
            _ => {
                if self.released.contains(&(kind, id)) {
                    self.double_releases += 1;
                }
                return Err(invalid);
            }
        }
        if self.objects.values().any(|o| o.parent() == Some(id)) {
            return Err(status::INVALID_OPERATION);
        }
        self.objects.remove(&id);
        self.released.push((kind, id));
        trace!(id, ?kind, "host runtime: object released");
        Ok(())
    }
}

/// Emulated accelerator runtime executing on the host CPU.
#[derive(Debug)]
pub struct HostRuntime {
    platforms: Vec<HostPlatform>,
    /// Flattened (platform index, device) table; `DeviceId` is index + 1.
    devices: Vec<(usize, HostDevice)>,
    build_delay: Duration,
    state: Arc<Mutex<HostState>>,
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRuntime {
    /// One platform with a single CPU-kind reference device.
    pub fn new() -> Self {
        Self::with_platforms(vec![HostPlatform::default()])
    }

    pub fn with_platforms(platforms: Vec<HostPlatform>) -> Self {
        let devices = platforms
            .iter()
            .enumerate()
            .flat_map(|(p, platform)| platform.devices.iter().cloned().map(move |d| (p, d)))
            .collect();
        Self {
            platforms,
            devices,
            build_delay: Duration::ZERO,
            state: Arc::new(Mutex::new(HostState::default())),
        }
    }

    /// Delay every program build by `delay` before signalling completion.
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    /// Make every subsequent `call` fail with `status`.
    pub fn inject_fault(&self, call: Call, status: Status) {
        self.inject_fault_after(call, 0, status);
    }

    /// Let `skip` calls of `call` succeed, then fail every later one with `status`.
    pub fn inject_fault_after(&self, call: Call, skip: usize, status: Status) {
        self.state().faults.insert(call, Fault { skip, status });
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Make every subsequent `call` block for `latency` before doing its work.
    pub fn inject_latency(&self, call: Call, latency: Duration) {
        self.state().latencies.insert(call, latency);
    }

    /// Number of objects created and not yet released.
    pub fn live_objects(&self) -> usize {
        self.state().objects.len()
    }

    pub fn live_objects_of(&self, kind: ObjectKind) -> usize {
        self.state()
            .objects
            .values()
            .filter(|o| o.kind() == kind)
            .count()
    }

    /// Objects released so far, in release order.
    pub fn released(&self) -> Vec<(ObjectKind, usize)> {
        self.state().released.clone()
    }

    /// Releases that targeted an already-released object.
    pub fn double_releases(&self) -> usize {
        self.state().double_releases
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        lock(&self.state)
    }

    fn fault(&self, call: Call) -> RtResult<()> {
        let latency = {
            let mut state = self.state();
            if let Some(fault) = state.faults.get_mut(&call) {
                if fault.skip == 0 {
                    debug!(?call, status = fault.status, "host runtime: injected fault");
                    return Err(fault.status);
                }
                fault.skip -= 1;
            }
            state.latencies.get(&call).copied()
        };
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
        Ok(())
    }

    fn platform(&self, platform: PlatformId) -> RtResult<&HostPlatform> {
        platform
            .0
            .checked_sub(1)
            .and_then(|i| self.platforms.get(i))
            .ok_or(status::INVALID_PLATFORM)
    }

    fn device(&self, device: DeviceId) -> RtResult<&HostDevice> {
        device
            .0
            .checked_sub(1)
            .and_then(|i| self.devices.get(i))
            .map(|(_, d)| d)
            .ok_or(status::INVALID_DEVICE)
    }
}

fn lock(state: &Mutex<HostState>) -> MutexGuard<'_, HostState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AcceleratorRuntime for HostRuntime {
    fn backend_name(&self) -> &str {
        "host"
    }

    fn platform_ids(&self, out: &mut [PlatformId]) -> RtResult<usize> {
        self.fault(Call::PlatformIds)?;
        for (i, slot) in out.iter_mut().take(self.platforms.len()).enumerate() {
            *slot = PlatformId(i + 1);
        }
        Ok(self.platforms.len())
    }

    fn platform_info(
        &self,
        platform: PlatformId,
        param: PlatformParam,
        out: &mut [u8],
    ) -> RtResult<usize> {
        self.fault(Call::PlatformInfo)?;
        let platform = self.platform(platform)?;
        let value = match param {
            PlatformParam::Name => c_string_bytes(&platform.name),
            PlatformParam::Vendor => c_string_bytes(&platform.vendor),
        };
        fill_bytes(&value, out)
    }

    fn device_ids(&self, platform: PlatformId, out: &mut [DeviceId]) -> RtResult<usize> {
        self.fault(Call::DeviceIds)?;
        self.platform(platform)?;
        let owned: Vec<DeviceId> = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, (p, _))| *p + 1 == platform.0)
            .map(|(i, _)| DeviceId(i + 1))
            .collect();
        for (slot, id) in out.iter_mut().zip(&owned) {
            *slot = *id;
        }
        Ok(owned.len())
    }

    fn device_info(&self, device: DeviceId, param: DeviceParam, out: &mut [u8]) -> RtResult<usize> {
        self.fault(Call::DeviceInfo)?;
        let device = self.device(device)?;
        let value = match param {
            DeviceParam::Name => c_string_bytes(&device.name),
            DeviceParam::Vendor => c_string_bytes(&device.vendor),
            DeviceParam::DriverVersion => c_string_bytes(&device.driver_version),
            DeviceParam::Type => device.type_bits.to_ne_bytes().to_vec(),
            DeviceParam::GlobalMemSize => device.global_mem_bytes.to_ne_bytes().to_vec(),
            DeviceParam::GlobalMemCacheSize => {
                device.global_mem_cache_bytes.to_ne_bytes().to_vec()
            }
        };
        fill_bytes(&value, out)
    }

    fn create_context(&self, device: DeviceId) -> RtResult<ContextId> {
        self.fault(Call::CreateContext)?;
        self.device(device)?;
        Ok(ContextId(self.state().insert(Object::Context { device })))
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> RtResult<QueueId> {
        self.fault(Call::CreateQueue)?;
        let mut state = self.state();
        match state.objects.get(&context.0) {
            Some(Object::Context { device: bound }) if *bound == device => {}
            Some(Object::Context { .. }) => return Err(status::INVALID_DEVICE),
            _ => return Err(status::INVALID_CONTEXT),
        }
        Ok(QueueId(state.insert(Object::Queue { context })))
    }

    fn create_buffer(
        &self,
        context: ContextId,
        mode: BufferMode,
        size_bytes: usize,
        host_data: &[u8],
    ) -> RtResult<MemId> {
        self.fault(Call::CreateBuffer)?;
        if size_bytes == 0 {
            return Err(status::INVALID_BUFFER_SIZE);
        }
        if host_data.len() != size_bytes {
            return Err(status::INVALID_HOST_PTR);
        }
        let mut state = self.state();
        if !matches!(state.objects.get(&context.0), Some(Object::Context { .. })) {
            return Err(status::INVALID_CONTEXT);
        }
        trace!(?mode, size_bytes, "host runtime: buffer copy-in");
        Ok(MemId(state.insert(Object::Mem {
            context,
            data: host_data.to_vec(),
        })))
    }

    fn create_program(&self, context: ContextId, source: &str) -> RtResult<ProgramId> {
        self.fault(Call::CreateProgram)?;
        if source.is_empty() {
            return Err(status::INVALID_VALUE);
        }
        let mut state = self.state();
        let device = match state.objects.get(&context.0) {
            Some(Object::Context { device }) => *device,
            _ => return Err(status::INVALID_CONTEXT),
        };
        Ok(ProgramId(state.insert(Object::Program {
            context,
            device,
            source: Arc::from(source),
            status: BuildStatus::None,
            log: String::new(),
            kernels: Vec::new(),
        })))
    }

    fn build_program(
        &self,
        program: ProgramId,
        device: DeviceId,
        options: &str,
        notify: BuildNotify,
    ) -> RtResult<()> {
        self.fault(Call::BuildProgram)?;
        let source = {
            let mut state = self.state();
            match state.objects.get_mut(&program.0) {
                Some(Object::Program {
                    device: bound,
                    source,
                    status: build_status,
                    ..
                }) => {
                    if *bound != device {
                        return Err(status::INVALID_DEVICE);
                    }
                    if *build_status == BuildStatus::InProgress {
                        return Err(status::INVALID_OPERATION);
                    }
                    *build_status = BuildStatus::InProgress;
                    Arc::clone(source)
                }
                _ => return Err(status::INVALID_PROGRAM),
            }
        };

        debug!(program = program.0, %options, "host runtime: build started");
        let shared = Arc::clone(&self.state);
        let delay = self.build_delay;
        std::thread::spawn(move || {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            let outcome = compile(&source);
            {
                let mut state = lock(&shared);
                if let Some(Object::Program {
                    status: build_status,
                    log,
                    kernels,
                    ..
                }) = state.objects.get_mut(&program.0)
                {
                    match outcome {
                        Ok(defs) => {
                            *build_status = BuildStatus::Success;
                            log.clear();
                            *kernels = defs;
                        }
                        Err(diagnostics) => {
                            *build_status = BuildStatus::Error;
                            *log = diagnostics;
                            kernels.clear();
                        }
                    }
                }
            }
            notify();
        });
        Ok(())
    }

    fn build_status(&self, program: ProgramId, device: DeviceId) -> RtResult<BuildStatus> {
        self.fault(Call::BuildStatus)?;
        match self.state().objects.get(&program.0) {
            Some(Object::Program { device: bound, .. }) if *bound != device => {
                Err(status::INVALID_DEVICE)
            }
            Some(Object::Program { status, .. }) => Ok(*status),
            _ => Err(status::INVALID_PROGRAM),
        }
    }

    fn build_log(&self, program: ProgramId, device: DeviceId, out: &mut [u8]) -> RtResult<usize> {
        self.fault(Call::BuildLog)?;
        match self.state().objects.get(&program.0) {
            Some(Object::Program { device: bound, .. }) if *bound != device => {
                Err(status::INVALID_DEVICE)
            }
            Some(Object::Program { log, .. }) => fill_bytes(&c_string_bytes(log), out),
            _ => Err(status::INVALID_PROGRAM),
        }
    }

    fn create_kernel(&self, program: ProgramId, entry_point: &str) -> RtResult<KernelId> {
        self.fault(Call::CreateKernel)?;
        let mut state = self.state();
        let def = match state.objects.get(&program.0) {
            Some(Object::Program {
                status: BuildStatus::Success,
                kernels,
                ..
            }) => kernels
                .iter()
                .find(|k| k.name == entry_point)
                .cloned()
                .ok_or(status::INVALID_KERNEL_NAME)?,
            Some(Object::Program { .. }) => return Err(status::INVALID_PROGRAM_EXECUTABLE),
            _ => return Err(status::INVALID_PROGRAM),
        };
        let args = vec![None; def.params.len()];
        Ok(KernelId(state.insert(Object::Kernel { program, def, args })))
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, value: KernelArg<'_>) -> RtResult<()> {
        self.fault(Call::SetKernelArg)?;
        let mut state = self.state();
        if let KernelArg::Buffer(mem) = value {
            if !matches!(state.objects.get(&mem.0), Some(Object::Mem { .. })) {
                return Err(status::INVALID_MEM_OBJECT);
            }
        }
        let Some(Object::Kernel { def, args, .. }) = state.objects.get_mut(&kernel.0) else {
            return Err(status::INVALID_KERNEL);
        };
        let index = index as usize;
        let kind = *def.params.get(index).ok_or(status::INVALID_ARG_INDEX)?;
        let stored = match (kind, value) {
            (ParamKind::Buffer, KernelArg::Buffer(mem)) => ArgValue::Buffer(mem),
            (ParamKind::U32, KernelArg::Bytes(bytes)) if bytes.len() == 4 => {
                ArgValue::Bytes(bytes.to_vec())
            }
            (ParamKind::U32, KernelArg::Bytes(_)) => return Err(status::INVALID_ARG_SIZE),
            _ => return Err(status::INVALID_ARG_VALUE),
        };
        args[index] = Some(stored);
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global_size: usize,
        local_size: usize,
    ) -> RtResult<EventId> {
        self.fault(Call::EnqueueKernel)?;
        if local_size == 0 || global_size == 0 {
            return Err(status::INVALID_GLOBAL_WORK_SIZE);
        }
        if global_size % local_size != 0 {
            return Err(status::INVALID_WORK_GROUP_SIZE);
        }
        let mut state = self.state();
        if !matches!(state.objects.get(&queue.0), Some(Object::Queue { .. })) {
            return Err(status::INVALID_COMMAND_QUEUE);
        }
        let (def, args) = match state.objects.get(&kernel.0) {
            Some(Object::Kernel { def, args, .. }) => (
                def.clone(),
                args.iter()
                    .cloned()
                    .collect::<Option<Vec<_>>>()
                    .ok_or(status::INVALID_KERNEL_ARGS)?,
            ),
            _ => return Err(status::INVALID_KERNEL),
        };
        run_elementwise(&mut state, &def, &args, global_size)?;
        Ok(EventId(state.insert(Object::Event)))
    }

    fn wait_event(&self, event: EventId) -> RtResult<()> {
        self.fault(Call::WaitEvent)?;
        match self.state().objects.get(&event.0) {
            Some(Object::Event) => Ok(()),
            _ => Err(status::INVALID_EVENT),
        }
    }

    fn read_buffer(&self, queue: QueueId, mem: MemId, offset: usize, out: &mut [u8]) -> RtResult<()> {
        self.fault(Call::ReadBuffer)?;
        let state = self.state();
        if !matches!(state.objects.get(&queue.0), Some(Object::Queue { .. })) {
            return Err(status::INVALID_COMMAND_QUEUE);
        }
        let Some(Object::Mem { data, .. }) = state.objects.get(&mem.0) else {
            return Err(status::INVALID_MEM_OBJECT);
        };
        let end = offset.checked_add(out.len()).ok_or(status::INVALID_VALUE)?;
        let src = data.get(offset..end).ok_or(status::INVALID_VALUE)?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn release_event(&self, event: EventId) -> RtResult<()> {
        self.fault(Call::ReleaseEvent)?;
        self.state()
            .release(event.0, ObjectKind::Event, status::INVALID_EVENT)
    }

    fn release_kernel(&self, kernel: KernelId) -> RtResult<()> {
        self.fault(Call::ReleaseKernel)?;
        self.state()
            .release(kernel.0, ObjectKind::Kernel, status::INVALID_KERNEL)
    }

    fn release_program(&self, program: ProgramId) -> RtResult<()> {
        self.fault(Call::ReleaseProgram)?;
        self.state()
            .release(program.0, ObjectKind::Program, status::INVALID_PROGRAM)
    }

    fn release_mem(&self, mem: MemId) -> RtResult<()> {
        self.fault(Call::ReleaseMem)?;
        self.state()
            .release(mem.0, ObjectKind::Mem, status::INVALID_MEM_OBJECT)
    }

    fn release_queue(&self, queue: QueueId) -> RtResult<()> {
        self.fault(Call::ReleaseQueue)?;
        self.state()
            .release(queue.0, ObjectKind::Queue, status::INVALID_COMMAND_QUEUE)
    }

    fn release_context(&self, context: ContextId) -> RtResult<()> {
        self.fault(Call::ReleaseContext)?;
        self.state()
            .release(context.0, ObjectKind::Context, status::INVALID_CONTEXT)
    }
}

/// Run `def` for `i < min(count, global_size)`; padding items do nothing.
fn run_elementwise(
    state: &mut HostState,
    def: &KernelDef,
    args: &[ArgValue],
    global_size: usize,
) -> RtResult<()> {
    let buffer = |index: usize| match args.get(index) {
        Some(ArgValue::Buffer(mem)) => Ok(*mem),
        _ => Err(status::INVALID_KERNEL_ARGS),
    };
    let (a, b, c) = (buffer(def.lhs)?, buffer(def.rhs)?, buffer(def.out)?);
    if c == a || c == b {
        return Err(status::INVALID_KERNEL_ARGS);
    }
    let n = match args.get(def.count) {
        Some(ArgValue::Bytes(n)) => {
            u32::from_ne_bytes(n.as_slice().try_into().map_err(|_| status::INVALID_ARG_SIZE)?) as usize
        }
        _ => return Err(status::INVALID_KERNEL_ARGS),
    };
    let active = n.min(global_size);
    let bytes = active.checked_mul(4).ok_or(status::OUT_OF_RESOURCES)?;

    let mut out = match state.objects.get_mut(&c.0) {
        Some(Object::Mem { data, .. }) => std::mem::take(data),
        _ => return Err(status::INVALID_MEM_OBJECT),
    };
    let result = (|| {
        let lhs = mem_bytes(state, a)?;
        let rhs = mem_bytes(state, b)?;
        if lhs.len() < bytes || rhs.len() < bytes || out.len() < bytes {
            return Err(status::OUT_OF_RESOURCES);
        }
        for ((dst, x), y) in out[..bytes]
            .chunks_exact_mut(4)
            .zip(lhs[..bytes].chunks_exact(4))
            .zip(rhs[..bytes].chunks_exact(4))
        {
            let x = f32::from_ne_bytes([x[0], x[1], x[2], x[3]]);
            let y = f32::from_ne_bytes([y[0], y[1], y[2], y[3]]);
            dst.copy_from_slice(&def.op.apply(x, y).to_ne_bytes());
        }
        Ok(())
    })();
    if let Some(Object::Mem { data, .. }) = state.objects.get_mut(&c.0) {
        *data = out;
    }
    result
}

fn mem_bytes(state: &HostState, mem: MemId) -> RtResult<&[u8]> {
    match state.objects.get(&mem.0) {
        Some(Object::Mem { data, .. }) => Ok(data),
        _ => Err(status::INVALID_MEM_OBJECT),
    }
}

/// Validate a kernel source and compile its entry points, or return a
/// compiler-style diagnostic log.
///
/// The host device executes one statement form per kernel:
/// `out[i] = lhs[i] <op> rhs[i]` over `__global` pointer parameters, bounded
/// by the single scalar parameter. Any other kernel body fails the build.
fn compile(source: &str) -> Result<Vec<KernelDef>, String> {
    let mut diagnostics = Vec::new();
    check_delimiters(source, &mut diagnostics);
    check_dangling_operators(source, &mut diagnostics);

    let code = strip_comments(source);
    let names = entry_points(&code);
    if names.is_empty() {
        diagnostics.push("<source>: error: no __kernel entry points found".to_string());
    }

    let mut kernels = Vec::new();
    if diagnostics.is_empty() {
        for name in names {
            match parse_kernel(&code, &name) {
                Ok(def) => kernels.push(def),
                Err(msg) => diagnostics.push(format!("<source>: error: kernel '{name}': {msg}")),
            }
        }
    }

    if diagnostics.is_empty() {
        Ok(kernels)
    } else {
        diagnostics.push(format!("{} error(s) generated.", diagnostics.len()));
        Err(diagnostics.join("\n"))
    }
}

/// Source with comments and string literals blanked out, line structure kept.
fn strip_comments(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;
    while i < chars.len() {
        match (chars[i], chars.get(i + 1)) {
            ('/', Some('/')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ('/', Some('*')) => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    if chars[i] == '\n' {
                        out.push('\n');
                    }
                    i += 1;
                }
                i += 2;
            }
            ('"', _) => {
                out.push(' ');
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            (c, _) => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn check_delimiters(source: &str, diagnostics: &mut Vec<String>) {
    let code = strip_comments(source);
    let mut stack: Vec<(char, usize, usize)> = Vec::new();
    for (line_no, line) in code.lines().enumerate() {
        for (col, c) in line.chars().enumerate() {
            let pos = (line_no + 1, col + 1);
            match c {
                '(' | '{' | '[' => stack.push((c, pos.0, pos.1)),
                ')' | '}' | ']' => {
                    let expected = match c {
                        ')' => '(',
                        '}' => '{',
                        _ => '[',
                    };
                    match stack.pop() {
                        Some((open, _, _)) if open == expected => {}
                        Some((open, l, cl)) => diagnostics.push(format!(
                            "<source>:{}:{}: error: unmatched '{}' (opened as '{}' at {}:{})",
                            pos.0, pos.1, c, open, l, cl
                        )),
                        None => diagnostics.push(format!(
                            "<source>:{}:{}: error: extraneous closing '{}'",
                            pos.0, pos.1, c
                        )),
                    }
                }
                _ => {}
            }
        }
    }
    for (open, line, col) in stack {
        diagnostics.push(format!(
            "<source>:{line}:{col}: error: expected closing delimiter for '{open}'"
        ));
    }
}

fn check_dangling_operators(source: &str, diagnostics: &mut Vec<String>) {
    const OPERATORS: &[char] = &['+', '-', '*', '/', '%', '=', '<', '>', '&', '|', '^', '!', '~', ','];
    let code = strip_comments(source);
    for (line_no, line) in code.lines().enumerate() {
        let chars: Vec<char> = line.chars().collect();
        for (col, &c) in chars.iter().enumerate() {
            if c != ';' && c != ')' {
                continue;
            }
            let before: Vec<char> = chars[..col]
                .iter()
                .rev()
                .copied()
                .filter(|ch| !ch.is_whitespace())
                .take(2)
                .collect();
            let Some(&prev) = before.first() else {
                continue;
            };
            let increment = (prev == '+' || prev == '-') && before.get(1) == Some(&prev);
            if OPERATORS.contains(&prev) && !increment {
                diagnostics.push(format!(
                    "<source>:{}:{}: error: expected expression before '{}'",
                    line_no + 1,
                    col + 1,
                    c
                ));
            }
        }
    }
}

fn entry_points(code: &str) -> Vec<String> {
    let tokens: Vec<&str> = code
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .collect();
    tokens
        .windows(3)
        .filter(|w| (w[0] == "__kernel" || w[0] == "kernel") && w[1] == "void")
        .map(|w| w[2].to_string())
        .collect()
}

/// Text strictly inside the delimiter pair opened at byte `open`, and the
/// byte index of the closing delimiter.
fn enclosed(code: &str, open: usize, open_c: char, close_c: char) -> Option<(&str, usize)> {
    let mut depth = 0usize;
    for (i, c) in code.get(open..)?.char_indices() {
        if c == open_c {
            depth += 1;
        } else if c == close_c {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some((&code[open + 1..open + i], open + i));
            }
        }
    }
    None
}

fn is_ident(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// `name[index]` with plain identifiers.
fn indexed(text: &str) -> Option<(&str, &str)> {
    let (name, rest) = text.split_once('[')?;
    let index = rest.strip_suffix(']')?;
    (is_ident(name) && is_ident(index)).then_some((name, index))
}

/// Match `out[i]=lhs[i]<op>rhs[i]` in a whitespace-free statement, allowing a
/// leading `if(...)` guard.
fn parse_elementwise(stmt: &str) -> Option<(&str, &str, BinOp, &str)> {
    let mut stmt = stmt.trim_start_matches(|c: char| c == '{' || c == '}');
    if stmt.starts_with("if(") {
        let (_, close) = enclosed(stmt, 2, '(', ')')?;
        stmt = &stmt[close + 1..];
    }
    let (target, expr) = stmt.split_once('=')?;
    if expr.starts_with('=') || target.ends_with(|c: char| "<>!+-*/%&|^".contains(c)) {
        return None;
    }
    let (out, index) = indexed(target)?;
    let (lhs, rest) = expr.split_at(expr.find(']')? + 1);
    let mut chars = rest.chars();
    let op = BinOp::from_char(chars.next()?)?;
    let (lhs, lhs_index) = indexed(lhs)?;
    let (rhs, rhs_index) = indexed(chars.as_str())?;
    (lhs_index == index && rhs_index == index).then_some((out, lhs, op, rhs))
}

fn parse_kernel(code: &str, name: &str) -> Result<KernelDef, String> {
    let open = code
        .match_indices(name)
        .map(|(at, _)| at)
        .find_map(|at| {
            let before = code[..at].trim_end();
            let after = &code[at + name.len()..];
            let paren = at + name.len() + (after.len() - after.trim_start().len());
            (before.ends_with("void") && code[paren..].starts_with('(')).then_some(paren)
        })
        .ok_or("declaration not found")?;
    let (param_text, close) =
        enclosed(code, open, '(', ')').ok_or("unterminated parameter list")?;

    let mut params = Vec::new();
    let mut names = Vec::new();
    for decl in param_text.split(',').map(str::trim) {
        if decl.is_empty() || decl == "void" {
            continue;
        }
        let ident = decl
            .rsplit(|c: char| !(c.is_alphanumeric() || c == '_'))
            .find(|t| !t.is_empty())
            .ok_or_else(|| format!("unnamed parameter '{decl}'"))?;
        params.push(if decl.contains('*') {
            ParamKind::Buffer
        } else {
            ParamKind::U32
        });
        names.push(ident);
    }

    let scalars: Vec<usize> = (0..params.len())
        .filter(|&i| params[i] == ParamKind::U32)
        .collect();
    let &[count] = scalars.as_slice() else {
        return Err("expected exactly one element-count parameter".to_string());
    };

    let body_open = close + code[close..].find('{').ok_or("missing kernel body")?;
    let (body, _) = enclosed(code, body_open, '{', '}').ok_or("unterminated kernel body")?;
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let (out, lhs, op, rhs) = compact
        .split(';')
        .find_map(parse_elementwise)
        .ok_or("body has no supported elementwise statement `out[i] = a[i] <op> b[i]`")?;

    let buffer_param = |ident: &str| {
        names
            .iter()
            .position(|n| *n == ident)
            .filter(|&i| params[i] == ParamKind::Buffer)
            .ok_or_else(|| format!("'{ident}' is not a pointer parameter"))
    };
    let (out, lhs, rhs) = (buffer_param(out)?, buffer_param(lhs)?, buffer_param(rhs)?);
    if out == lhs || out == rhs {
        return Err("output parameter must not alias an input".to_string());
    }

    Ok(KernelDef {
        name: name.to_string(),
        params,
        out,
        lhs,
        rhs,
        count,
        op,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{query_list, query_string};
    use std::sync::mpsc;

    const APLUSB: &str = "__kernel void aplusb(__global const float* a,\n\
                          __global const float* b, __global float* c, unsigned int n)\n\
                          {\n    const unsigned int i = get_global_id(0);\n\
                          if (i >= n) return;\n    c[i] = a[i] + b[i];\n}\n";

    fn build(rt: &HostRuntime, ctx: ContextId, dev: DeviceId, src: &str) -> ProgramId {
        let program = rt.create_program(ctx, src).unwrap();
        let (tx, rx) = mpsc::channel();
        rt.build_program(program, dev, "", Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        program
    }

    fn floats(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn test_enumerates_default_platform() {
        let rt = HostRuntime::new();
        let platforms = query_list(|out| rt.platform_ids(out)).unwrap();
        assert_eq!(platforms.len(), 1);
        let name = query_string(|out| rt.platform_info(platforms[0], PlatformParam::Name, out))
            .unwrap();
        assert_eq!(name, "Host Reference Platform");
        let devices = query_list(|out| rt.device_ids(platforms[0], out)).unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[test]
    fn test_compile_accepts_reference_kernel() {
        let kernels = compile(APLUSB).unwrap();
        assert_eq!(kernels.len(), 1);
        let def = &kernels[0];
        assert_eq!(def.name, "aplusb");
        assert_eq!((def.lhs, def.rhs, def.out, def.count), (0, 1, 2, 3));
        assert_eq!(def.op, BinOp::Add);
    }

    #[test]
    fn test_compile_follows_kernel_body() {
        let sub = APLUSB.replace("a[i] + b[i]", "a[i] - b[i]");
        assert_eq!(compile(&sub).unwrap()[0].op, BinOp::Sub);

        let swapped = APLUSB.replace("c[i] = a[i] + b[i]", "c[i] = b[i] * a[i]");
        let def = &compile(&swapped).unwrap()[0];
        assert_eq!((def.lhs, def.rhs, def.op), (1, 0, BinOp::Mul));
    }

    #[test]
    fn test_compile_rejects_unsupported_body() {
        let scaled = APLUSB.replace("c[i] = a[i] + b[i];", "c[i] = 2.0f * a[i];");
        let log = compile(&scaled).unwrap_err();
        assert!(log.contains("no supported elementwise statement"), "{log}");

        let aliased = APLUSB.replace("c[i] = a[i] + b[i];", "a[i] = a[i] + b[i];");
        assert!(compile(&aliased).unwrap_err().contains("alias"));

        let by_count = APLUSB.replace("c[i] = a[i] + b[i];", "c[i] = a[i] + n[i];");
        assert!(compile(&by_count).unwrap_err().contains("not a pointer parameter"));
    }

    #[test]
    fn test_compile_reports_missing_brace() {
        let broken = APLUSB.trim_end().trim_end_matches('}');
        let log = compile(broken).unwrap_err();
        assert!(log.contains("expected closing delimiter for '{'"), "{log}");
    }

    #[test]
    fn test_compile_reports_dangling_operator() {
        let broken = APLUSB.replace("a[i] + b[i];", "a[i] + ;");
        let log = compile(&broken).unwrap_err();
        assert!(log.contains("expected expression before ';'"), "{log}");
    }

    #[test]
    fn test_compile_ignores_increment_and_comments() {
        let src = "// (unbalanced in comment\n__kernel void aplusb(__global float* x, \
                   __global float* y, __global float* z, uint n)\n\
                   { int i = get_global_id(0); i++; if (i < n) z[i] = x[i] + y[i]; }";
        assert_eq!(compile(src).unwrap()[0].out, 2);
    }

    #[test]
    fn test_kernel_respects_count_on_padded_grid() {
        let rt = HostRuntime::new();
        let dev = DeviceId(1);
        let ctx = rt.create_context(dev).unwrap();
        let queue = rt.create_queue(ctx, dev).unwrap();
        let a = rt
            .create_buffer(ctx, BufferMode::ReadOnlyCopy, 12, &floats(&[1.0, 2.0, 3.0]))
            .unwrap();
        let b = rt
            .create_buffer(ctx, BufferMode::ReadOnlyCopy, 12, &floats(&[3.0, 4.0, 5.0]))
            .unwrap();
        let c = rt
            .create_buffer(ctx, BufferMode::WriteOnlyCopy, 12, &floats(&[0.0; 3]))
            .unwrap();
        let program = build(&rt, ctx, dev, APLUSB);
        let kernel = rt.create_kernel(program, "aplusb").unwrap();
        rt.set_kernel_arg(kernel, 0, KernelArg::Buffer(a)).unwrap();
        rt.set_kernel_arg(kernel, 1, KernelArg::Buffer(b)).unwrap();
        rt.set_kernel_arg(kernel, 2, KernelArg::Buffer(c)).unwrap();
        rt.set_kernel_arg(kernel, 3, KernelArg::Bytes(&2u32.to_ne_bytes()))
            .unwrap();

        let event = rt.enqueue_kernel(queue, kernel, 8, 4).unwrap();
        rt.wait_event(event).unwrap();

        let mut out = vec![0u8; 12];
        rt.read_buffer(queue, c, 0, &mut out).unwrap();
        assert_eq!(out, floats(&[4.0, 6.0, 0.0]));
    }

    #[test]
    fn test_kernel_executes_compiled_operation() {
        let rt = HostRuntime::new();
        let dev = DeviceId(1);
        let ctx = rt.create_context(dev).unwrap();
        let queue = rt.create_queue(ctx, dev).unwrap();
        let a = rt
            .create_buffer(ctx, BufferMode::ReadOnlyCopy, 8, &floats(&[10.0, 20.0]))
            .unwrap();
        let b = rt
            .create_buffer(ctx, BufferMode::ReadOnlyCopy, 8, &floats(&[1.0, 2.0]))
            .unwrap();
        let c = rt
            .create_buffer(ctx, BufferMode::WriteOnlyCopy, 8, &floats(&[0.0; 2]))
            .unwrap();
        let program = build(&rt, ctx, dev, &APLUSB.replace("a[i] + b[i]", "a[i] - b[i]"));
        let kernel = rt.create_kernel(program, "aplusb").unwrap();
        rt.set_kernel_arg(kernel, 0, KernelArg::Buffer(a)).unwrap();
        rt.set_kernel_arg(kernel, 1, KernelArg::Buffer(b)).unwrap();
        rt.set_kernel_arg(kernel, 2, KernelArg::Buffer(c)).unwrap();
        rt.set_kernel_arg(kernel, 3, KernelArg::Bytes(&2u32.to_ne_bytes()))
            .unwrap();

        let event = rt.enqueue_kernel(queue, kernel, 2, 2).unwrap();
        rt.wait_event(event).unwrap();

        let mut out = vec![0u8; 8];
        rt.read_buffer(queue, c, 0, &mut out).unwrap();
        assert_eq!(out, floats(&[9.0, 18.0]));
    }

    #[test]
    fn test_unsupported_body_fails_build() {
        let rt = HostRuntime::new();
        let dev = DeviceId(1);
        let ctx = rt.create_context(dev).unwrap();
        let src = APLUSB.replace("c[i] = a[i] + b[i];", "c[i] = a[i];");
        let program = build(&rt, ctx, dev, &src);
        assert_eq!(rt.build_status(program, dev).unwrap(), BuildStatus::Error);
        assert_eq!(
            rt.create_kernel(program, "aplusb"),
            Err(status::INVALID_PROGRAM_EXECUTABLE)
        );
    }

    #[test]
    fn test_enqueue_rejects_unaligned_grid() {
        let rt = HostRuntime::new();
        let err = rt
            .enqueue_kernel(QueueId(1), KernelId(2), 10, 4)
            .unwrap_err();
        assert_eq!(err, status::INVALID_WORK_GROUP_SIZE);
    }

    #[test]
    fn test_double_release_is_detected() {
        let rt = HostRuntime::new();
        let ctx = rt.create_context(DeviceId(1)).unwrap();
        rt.release_context(ctx).unwrap();
        assert_eq!(rt.release_context(ctx), Err(status::INVALID_CONTEXT));
        assert_eq!(rt.double_releases(), 1);
        assert_eq!(rt.live_objects(), 0);
    }

    #[test]
    fn test_context_cannot_outlive_dependents() {
        let rt = HostRuntime::new();
        let dev = DeviceId(1);
        let ctx = rt.create_context(dev).unwrap();
        let queue = rt.create_queue(ctx, dev).unwrap();
        assert_eq!(rt.release_context(ctx), Err(status::INVALID_OPERATION));
        rt.release_queue(queue).unwrap();
        rt.release_context(ctx).unwrap();
    }

    #[test]
    fn test_injected_fault_after_skip() {
        let rt = HostRuntime::new();
        rt.inject_fault_after(Call::CreateContext, 1, status::OUT_OF_HOST_MEMORY);
        assert!(rt.create_context(DeviceId(1)).is_ok());
        assert_eq!(
            rt.create_context(DeviceId(1)),
            Err(status::OUT_OF_HOST_MEMORY)
        );
    }
}
