// gpu/backend.rs -- Compute backend contract.
//
// The dispatch pipeline, buffer manager and program cache are written
// against this trait, not against wgpu. Two implementations exist:
//
//   WgpuBackend (gpu/device.rs) -- the real device.
//   NullBackend (gpu/null.rs)   -- host-memory no-op used by the CPU-only
//                                  encoder configuration and by tests.
//
// The surface mirrors a classic command-queue compute API: buffers and
// sub-buffers, kernels with positional arguments, asynchronous enqueue on
// one in-order queue, flush-with-marker producing a completion token, and
// a blocking wait on that token. Handles are opaque ids; the backend owns
// the underlying objects until the matching release_* call.
//
// Enqueue-order is execution-order: kernels submitted on the queue run in
// submission order, which the dispatch pipeline relies on instead of
// per-kernel dependencies.

use std::fmt;
use std::ptr::NonNull;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Completion token for work submitted up to one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u32);

// ---------------------------------------------------------------------------
// Buffer access and mapping
// ---------------------------------------------------------------------------

/// How the host will touch a buffer over its lifetime. Decided at
/// creation; the backend picks matching usage flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    /// Never host-mapped (working/scratch buffers).
    DeviceOnly,
    /// Host maps it to write inputs (grid input, parameters, frame planes).
    HostWrite,
    /// Host maps it to read results (output buffers and their regions).
    HostRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
}

/// A host-visible view of a mapped buffer.
///
/// Valid from the `map_buffer` that produced it until the matching
/// `unmap_buffer`; the caller must not touch it after release. This is
/// the raw-pointer edge of the crate: the encoder views it as a slice of
/// one of the `#[repr(C)]` record types.
#[derive(Debug, Clone, Copy)]
pub struct HostPtr {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostPtr {
    pub fn new(ptr: NonNull<u8>, len: usize) -> Self {
        HostPtr { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the mapped range as bytes.
    ///
    /// # Safety
    /// The mapping must still be live (no unmap since `map_buffer`) and
    /// no kernel touching the buffer may be in flight.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Mutable byte view of the mapped range.
    ///
    /// # Safety
    /// As `as_slice`, plus exclusivity: no other live view of the same
    /// mapping.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

// ---------------------------------------------------------------------------
// Kernel arguments and work sizes
// ---------------------------------------------------------------------------

/// One positional kernel argument.
///
/// Buffers bind at their argument index; scalar arguments are packed by
/// the backend (the wgpu backend packs them, in index order, into a
/// word buffer the kernel reads). 64-bit scalars occupy two words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    Buffer(BufferId),
    /// A buffer slot that may be absent this frame (the golden reference).
    OptBuffer(Option<BufferId>),
    I32(i32),
    I64(i64),
}

/// A 2-D work size: global offset, global size, optional local size.
///
/// Global sizes are in work-items and are multiples of the local size
/// when one is given. `local_size: None` lets the device pick (used by
/// the one-work-item-per-block kernels).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub global_offset: [u32; 2],
    pub global_size: [u32; 2],
    pub local_size: Option<[u32; 2]>,
}

impl NdRange {
    pub fn with_local(offset: [u32; 2], global: [u32; 2], local: [u32; 2]) -> Self {
        NdRange { global_offset: offset, global_size: global, local_size: Some(local) }
    }

    pub fn without_local(offset: [u32; 2], global: [u32; 2]) -> Self {
        NdRange { global_offset: offset, global_size: global, local_size: None }
    }

    /// Work-groups per dimension (global / local, 1-sized groups when no
    /// local size was requested).
    pub fn workgroups(&self) -> [u32; 2] {
        let l = self.local_size.unwrap_or([1, 1]);
        [self.global_size[0] / l[0], self.global_size[1] / l[1]]
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

pub trait ComputeBackend {
    /// Compile one program from (already macro-substituted) source.
    fn build_program(&self, label: &str, source: &str) -> Result<ProgramId, GpuError>;

    /// Create a kernel for one entry point of a built program.
    fn create_kernel(&self, program: ProgramId, entry: &str) -> Result<KernelId, GpuError>;

    fn release_program(&self, program: ProgramId);

    fn release_kernel(&self, kernel: KernelId);

    fn create_buffer(&self, label: &str, size: u64, access: BufferAccess)
        -> Result<BufferId, GpuError>;

    /// Create a view of a contiguous sub-range of `parent`. The view maps
    /// independently of its parent; releasing it does not release the
    /// parent.
    fn create_sub_buffer(&self, parent: BufferId, offset: u64, size: u64)
        -> Result<BufferId, GpuError>;

    fn release_buffer(&self, buffer: BufferId);

    /// Map a buffer (or sub-buffer) for host access. The buffer must be
    /// device-owned: no kernel touching it in flight, not already mapped.
    fn map_buffer(&self, buffer: BufferId, mode: MapMode) -> Result<HostPtr, GpuError>;

    /// Return a mapped buffer to the device. `blocking` waits for the
    /// transfer (teardown path); the steady-state path is non-blocking.
    fn unmap_buffer(&self, buffer: BufferId, blocking: bool) -> Result<(), GpuError>;

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg)
        -> Result<(), GpuError>;

    /// Record one kernel launch on the queue. Returns once recorded;
    /// device execution happens after a flush, in submission order.
    fn enqueue_kernel(&self, kernel: KernelId, range: &NdRange) -> Result<(), GpuError>;

    /// Submit everything recorded since the last flush and return a
    /// completion token covering it.
    fn flush_marker(&self) -> Result<EventId, GpuError>;

    /// Block until the token's work has completed on the device.
    fn wait_event(&self, event: EventId) -> Result<(), GpuError>;

    fn release_event(&self, event: EventId);
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Everything that can go wrong between the encoder and the device.
///
/// None of these are recoverable inside this layer: the session aborts on
/// the first failure. The variants exist so the abort message names the
/// failing stage.
#[derive(Debug)]
pub enum GpuError {
    /// No usable adapter (only CPU/software renderers visible).
    NoSuitableAdapter,
    /// Device request failed (driver issue, unsupported limits).
    DeviceRequest(wgpu::RequestDeviceError),
    /// Kernel source failed to compile; `log` carries the backend's
    /// diagnostic output.
    Compile { unit: String, log: String },
    /// Device buffer or sub-buffer creation failed.
    Allocation { what: String, size: u64 },
    /// Host map failed.
    Map { what: String },
    /// Map requested while the buffer is already host-mapped.
    AlreadyMapped { what: String },
    /// Unmap (host -> device handoff) failed.
    Unmap { what: String },
    /// Kernel enqueue or queue flush failed.
    Dispatch { kernel: String },
    /// Waiting on a completion token failed, or no token exists for the
    /// requested slot.
    Wait { what: String },
    /// A handle was used after release or belongs to another backend.
    InvalidHandle { what: &'static str },
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::NoSuitableAdapter => write!(
                f,
                "no suitable Vulkan adapter found (only CPU/software renderers visible)"
            ),
            GpuError::DeviceRequest(e) => write!(f, "device request failed: {e}"),
            GpuError::Compile { unit, log } => {
                write!(f, "kernel unit '{unit}' failed to compile:\n{log}")
            }
            GpuError::Allocation { what, size } => {
                write!(f, "failed to allocate {what} ({size} bytes)")
            }
            GpuError::Map { what } => write!(f, "failed to map {what} for host access"),
            GpuError::AlreadyMapped { what } => {
                write!(f, "{what} is already host-mapped (double acquire)")
            }
            GpuError::Unmap { what } => write!(f, "failed to release {what} to the device"),
            GpuError::Dispatch { kernel } => write!(f, "failed to enqueue kernel '{kernel}'"),
            GpuError::Wait { what } => write!(f, "wait failed: {what}"),
            GpuError::InvalidHandle { what } => write!(f, "invalid {what} handle"),
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuError::DeviceRequest(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
