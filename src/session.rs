//! Resource session: context, queue, buffers, program and kernel for one
//! computation.
//!
//! Each runtime object is held by an [`Owned`] guard that releases it exactly
//! once, either explicitly through [`ResourceSession::close`] or on drop. A
//! failure halfway through [`ResourceSession::create`] drops the guards
//! acquired so far in reverse order, so the context is always released after
//! everything that depends on it.

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::catalog::DeviceDescriptor;
use crate::cl_check;
use crate::error::{BenchError, Result};
use crate::runtime::{
    query_string, status, AcceleratorRuntime, BufferMode, BuildNotify, BuildStatus, ContextId,
    DeviceId, EventId, KernelArg, KernelId, MemId, ProgramId, QueueId, RtResult,
};
use crate::source::KernelSource;

/// A runtime handle type with a matching release call.
pub trait Releasable: Copy + fmt::Debug {
    const KIND: &'static str;

    fn release(self, rt: &dyn AcceleratorRuntime) -> RtResult<()>;
}

macro_rules! releasable {
    ($($id:ty => $kind:literal, $method:ident;)*) => {
        $(
            impl Releasable for $id {
                const KIND: &'static str = $kind;

                fn release(self, rt: &dyn AcceleratorRuntime) -> RtResult<()> {
                    rt.$method(self)
                }
            }
        )*
    };
}

releasable! {
    ContextId => "context", release_context;
    QueueId => "queue", release_queue;
    MemId => "buffer", release_mem;
    ProgramId => "program", release_program;
    KernelId => "kernel", release_kernel;
    EventId => "event", release_event;
}

/// Scoped ownership of one runtime object.
pub struct Owned<'rt, H: Releasable> {
    rt: &'rt dyn AcceleratorRuntime,
    handle: H,
    released: bool,
}

impl<'rt, H: Releasable> Owned<'rt, H> {
    pub fn new(rt: &'rt dyn AcceleratorRuntime, handle: H) -> Self {
        Self {
            rt,
            handle,
            released: false,
        }
    }

    pub fn get(&self) -> H {
        self.handle
    }

    /// Release now and report the runtime's verdict.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        debug!(kind = H::KIND, handle = ?self.handle, "releasing");
        cl_check!(self.handle.release(self.rt))
    }
}

impl<H: Releasable> Drop for Owned<'_, H> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(code) = self.handle.release(self.rt) {
            warn!(
                kind = H::KIND,
                handle = ?self.handle,
                code,
                status = status::name(code),
                "release failed during unwind"
            );
        }
    }
}

impl<H: Releasable> fmt::Debug for Owned<'_, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owned")
            .field("kind", &H::KIND)
            .field("handle", &self.handle)
            .field("released", &self.released)
            .finish()
    }
}

/// Wait handle for an asynchronous program build.
#[derive(Debug)]
pub struct BuildSignal {
    rx: Receiver<()>,
}

impl BuildSignal {
    /// A callback for the runtime and the signal it completes.
    pub fn channel() -> (BuildNotify, Self) {
        let (tx, rx) = mpsc::sync_channel(1);
        let notify: BuildNotify = Box::new(move || {
            // The waiter may already have timed out and gone away.
            let _ = tx.send(());
        });
        (notify, Self { rx })
    }

    /// Block until the callback fires or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            // Callback dropped without firing; the build status query decides.
            Err(RecvTimeoutError::Disconnected) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(BenchError::BuildTimeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

/// How to build and bind the kernel.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub entry_point: String,
    pub build_options: String,
    pub build_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            entry_point: "aplusb".to_string(),
            build_options: String::new(),
            build_timeout: Duration::from_secs(30),
        }
    }
}

/// Bind exactly one device to a new context.
pub fn create_context<'rt>(rt: &'rt dyn AcceleratorRuntime, device: DeviceId) -> Result<Owned<'rt, ContextId>> {
    let context = cl_check!(rt.create_context(device))?;
    Ok(Owned::new(rt, context))
}

/// In-order command queue on `device`.
pub fn create_queue<'rt>(
    rt: &'rt dyn AcceleratorRuntime,
    context: &Owned<'rt, ContextId>,
    device: DeviceId,
) -> Result<Owned<'rt, QueueId>> {
    let queue = cl_check!(rt.create_queue(context.get(), device))?;
    Ok(Owned::new(rt, queue))
}

/// Device buffer initialized with a copy of `host_data`.
pub fn create_buffer<'rt>(
    rt: &'rt dyn AcceleratorRuntime,
    context: &Owned<'rt, ContextId>,
    mode: BufferMode,
    host_data: &[u8],
) -> Result<Owned<'rt, MemId>> {
    let mem = cl_check!(rt.create_buffer(context.get(), mode, host_data.len(), host_data))?;
    Ok(Owned::new(rt, mem))
}

/// Compile `source` for `device` and wait for the build to finish.
///
/// The build log is always fetched and logged. A failed compile is
/// `BuildFailed` carrying the log; a build that never signals completion
/// within `timeout` is `BuildTimeout`.
pub fn build_program<'rt>(
    rt: &'rt dyn AcceleratorRuntime,
    context: &Owned<'rt, ContextId>,
    device: DeviceId,
    source: &KernelSource,
    build_options: &str,
    timeout: Duration,
) -> Result<(Owned<'rt, ProgramId>, String)> {
    let program = Owned::new(rt, cl_check!(rt.create_program(context.get(), source.text()))?);

    let (notify, signal) = BuildSignal::channel();
    let started = rt.build_program(program.get(), device, build_options, notify);
    // Some drivers report a failed compile directly instead of through the
    // build status; the status query below still classifies it.
    if started != Err(status::BUILD_PROGRAM_FAILURE) {
        cl_check!(started)?;
        signal.wait(timeout)?;
    }

    let log = cl_check!(query_string(|out| rt.build_log(program.get(), device, out)))?;
    let log = log.trim().to_string();
    if log.is_empty() {
        debug!(source = source.origin(), "build log is empty");
    } else {
        info!(source = source.origin(), "build log:\n{}", log);
    }

    match cl_check!(rt.build_status(program.get(), device))? {
        BuildStatus::Success => Ok((program, log)),
        other => {
            let log = if log.is_empty() {
                format!("build of {} ended with status {:?} and no log", source.origin(), other)
            } else {
                log
            };
            Err(BenchError::BuildFailed { log })
        }
    }
}

pub fn create_kernel<'rt>(
    rt: &'rt dyn AcceleratorRuntime,
    program: &Owned<'rt, ProgramId>,
    entry_point: &str,
) -> Result<Owned<'rt, KernelId>> {
    let kernel = cl_check!(rt.create_kernel(program.get(), entry_point))?;
    Ok(Owned::new(rt, kernel))
}

pub fn set_argument(
    rt: &dyn AcceleratorRuntime,
    kernel: &Owned<'_, KernelId>,
    index: u32,
    value: KernelArg<'_>,
) -> Result<()> {
    cl_check!(rt.set_kernel_arg(kernel.get(), index, value))
}

pub(crate) fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub(crate) fn bytes_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// All runtime objects for one elementwise computation.
// Field order is drop order: dependents first, the context last.
pub struct ResourceSession<'rt> {
    kernel: Owned<'rt, KernelId>,
    input_a: Owned<'rt, MemId>,
    input_b: Owned<'rt, MemId>,
    output: Owned<'rt, MemId>,
    program: Owned<'rt, ProgramId>,
    queue: Owned<'rt, QueueId>,
    context: Owned<'rt, ContextId>,
    rt: &'rt dyn AcceleratorRuntime,
    device: DeviceId,
    elements: usize,
    build_log: String,
}

impl<'rt> ResourceSession<'rt> {
    /// Acquire every object and bind the kernel arguments
    /// (input A, input B, output, count).
    pub fn create(
        rt: &'rt dyn AcceleratorRuntime,
        device: &DeviceDescriptor,
        source: &KernelSource,
        a: &[f32],
        b: &[f32],
        options: &SessionOptions,
    ) -> Result<Self> {
        if a.len() != b.len() {
            return Err(BenchError::InvalidConfig(format!(
                "input lengths differ: {} vs {}",
                a.len(),
                b.len()
            )));
        }
        let elements = a.len();
        let count = u32::try_from(elements)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                BenchError::InvalidConfig(format!(
                    "element count {elements} must be in 1..={}",
                    u32::MAX
                ))
            })?;
        let dev = device.device;

        let context = create_context(rt, dev)?;
        let queue = create_queue(rt, &context, dev)?;
        let input_a = create_buffer(rt, &context, BufferMode::ReadOnlyCopy, &f32_bytes(a))?;
        let input_b = create_buffer(rt, &context, BufferMode::ReadOnlyCopy, &f32_bytes(b))?;
        let output = create_buffer(
            rt,
            &context,
            BufferMode::WriteOnlyCopy,
            &vec![0u8; elements * std::mem::size_of::<f32>()],
        )?;
        let (program, build_log) = build_program(
            rt,
            &context,
            dev,
            source,
            &options.build_options,
            options.build_timeout,
        )?;
        let kernel = create_kernel(rt, &program, &options.entry_point)?;

        set_argument(rt, &kernel, 0, KernelArg::Buffer(input_a.get()))?;
        set_argument(rt, &kernel, 1, KernelArg::Buffer(input_b.get()))?;
        set_argument(rt, &kernel, 2, KernelArg::Buffer(output.get()))?;
        set_argument(rt, &kernel, 3, KernelArg::Bytes(&count.to_ne_bytes()))?;

        info!(device = %device.name, elements, entry_point = %options.entry_point, "resource session ready");
        Ok(Self {
            kernel,
            input_a,
            input_b,
            output,
            program,
            queue,
            context,
            rt,
            device: dev,
            elements,
            build_log,
        })
    }

    pub fn runtime(&self) -> &'rt dyn AcceleratorRuntime {
        self.rt
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn queue(&self) -> QueueId {
        self.queue.get()
    }

    pub fn kernel(&self) -> KernelId {
        self.kernel.get()
    }

    pub fn output(&self) -> MemId {
        self.output.get()
    }

    pub fn elements(&self) -> usize {
        self.elements
    }

    pub fn build_log(&self) -> &str {
        &self.build_log
    }

    /// Blocking copy of the output buffer to the host.
    pub fn read_output(&self) -> Result<Vec<f32>> {
        let mut bytes = vec![0u8; self.output_bytes()];
        self.read_output_into(&mut bytes)?;
        Ok(bytes_f32(&bytes))
    }

    /// Blocking copy of the output buffer into `out`, which must hold exactly
    /// the output buffer's bytes.
    pub fn read_output_into(&self, out: &mut [u8]) -> Result<()> {
        if out.len() != self.output_bytes() {
            return Err(BenchError::InvalidConfig(format!(
                "output copy needs {} bytes, got {}",
                self.output_bytes(),
                out.len()
            )));
        }
        cl_check!(self.rt.read_buffer(self.queue(), self.output(), 0, out))
    }

    pub fn output_bytes(&self) -> usize {
        self.elements * std::mem::size_of::<f32>()
    }

    /// Release every object (kernel, buffers, program, queue, context) and
    /// return the first release failure, if any. Every object gets exactly
    /// one release attempt.
    pub fn close(self) -> Result<()> {
        let Self {
            kernel,
            input_a,
            input_b,
            output,
            program,
            queue,
            context,
            ..
        } = self;
        let outcomes = [
            kernel.release(),
            input_a.release(),
            input_b.release(),
            output.release(),
            program.release(),
            queue.release(),
            context.release(),
        ];
        debug!("resource session closed");
        outcomes.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }
}

impl fmt::Debug for ResourceSession<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSession")
            .field("backend", &self.rt.backend_name())
            .field("device", &self.device)
            .field("elements", &self.elements)
            .field("context", &self.context)
            .field("queue", &self.queue)
            .field("program", &self.program)
            .field("kernel", &self.kernel)
            .finish_non_exhaustive()
    }
}
