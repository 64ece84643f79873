// gpu/null.rs -- Host-memory no-op backend.
//
// The second implementation of `ComputeBackend`, used two ways:
//
//   1. CPU-only encoder configuration: the frame loop keeps its
//      acquire/dispatch/wait structure, buffers live in host memory, and
//      "kernels" are free. The host-side search then reads/writes the
//      same record layouts it would with a real device.
//   2. Tests: every backend call is recorded in an operation log, buffer
//      creation failures can be injected at a chosen call index, and live
//      handle counts expose leaks.
//
// Maps return pointers into heap allocations owned by this backend, so
// acquire/release round-trips hand out real writable memory. Allocations
// are never moved or freed before release_buffer, which keeps outstanding
// `HostPtr`s valid for exactly the mapped window the contract promises.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::gpu::backend::{
    BufferAccess, BufferId, ComputeBackend, EventId, GpuError, HostPtr, KernelArg, KernelId,
    MapMode, NdRange, ProgramId,
};

// ---------------------------------------------------------------------------
// Operation log
// ---------------------------------------------------------------------------

/// One recorded backend call. The integration tests compare whole logs
/// (determinism) and scan for ordering properties (release-before-enqueue,
/// release-before-overwrite).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOp {
    BuildProgram { label: String },
    CreateKernel { entry: String },
    CreateBuffer { label: String, size: u64 },
    CreateSubBuffer { parent: BufferId, offset: u64, size: u64 },
    ReleaseProgram { program: ProgramId },
    ReleaseKernel { kernel: KernelId },
    ReleaseBuffer { buffer: BufferId },
    Map { buffer: BufferId, mode: MapMode },
    Unmap { buffer: BufferId, blocking: bool },
    SetArg { kernel: KernelId, index: u32, arg: KernelArg },
    Enqueue { entry: String, range: NdRange },
    FlushMarker { event: EventId },
    Wait { event: EventId },
    ReleaseEvent { event: EventId },
}

// ---------------------------------------------------------------------------
// Backing storage
// ---------------------------------------------------------------------------

enum Backing {
    /// Owns the bytes, stored as u64 words so mapped pointers are
    /// 8-aligned (hosts cast them to the #[repr(C)] record types). The
    /// heap allocation is stable for the buffer's lifetime, so mapped
    /// pointers stay valid even if the bookkeeping tables reallocate.
    Root(Box<[u64]>),
    /// Window into a root buffer.
    View { parent: u32, offset: usize },
}

impl Backing {
    fn root_ptr(&self) -> Option<*mut u8> {
        match self {
            Backing::Root(words) => Some(words.as_ptr() as *mut u8),
            Backing::View { .. } => None,
        }
    }
}

struct NullBuffer {
    backing: Backing,
    len: usize,
    mapped: bool,
    label: String,
}

#[derive(Default)]
struct State {
    buffers: HashMap<u32, NullBuffer>,
    kernels: HashMap<u32, String>,
    programs: HashMap<u32, String>,
    events: HashMap<u32, ()>,
    ops: Vec<BackendOp>,
    next_id: u32,
    buffer_creates: u32,
}

/// Recording, host-memory implementation of [`ComputeBackend`].
pub struct NullBackend {
    state: RefCell<State>,
    /// When set, buffer creation call number N (1-based) and every later
    /// one fail with `Allocation`.
    fail_buffer_create_at: Cell<Option<u32>>,
}

impl NullBackend {
    pub fn new() -> Self {
        NullBackend { state: RefCell::new(State::default()), fail_buffer_create_at: Cell::new(None) }
    }

    /// Make the `n`th buffer-creation call (1-based, counting both
    /// buffers and sub-buffers) and all later ones fail.
    pub fn fail_buffer_create_at(&self, n: u32) {
        self.fail_buffer_create_at.set(Some(n));
    }

    pub fn ops(&self) -> Vec<BackendOp> {
        self.state.borrow().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.borrow_mut().ops.clear();
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_kernels(&self) -> usize {
        self.state.borrow().kernels.len()
    }

    pub fn live_programs(&self) -> usize {
        self.state.borrow().programs.len()
    }

    pub fn live_events(&self) -> usize {
        self.state.borrow().events.len()
    }

    /// Entry-point name of a kernel handle (test convenience).
    pub fn kernel_entry(&self, kernel: KernelId) -> Option<String> {
        self.state.borrow().kernels.get(&kernel.0).cloned()
    }

    /// Live buffer with the given label (test convenience).
    pub fn find_buffer(&self, label: &str) -> Option<BufferId> {
        let state = self.state.borrow();
        let mut ids: Vec<u32> = state
            .buffers
            .iter()
            .filter(|(_, b)| b.label == label)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.first().map(|&id| BufferId(id))
    }

    /// Snapshot of a buffer's current bytes.
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        let buf = state.buffers.get(&buffer.0)?;
        let (ptr, len) = match &buf.backing {
            Backing::Root(_) => (buf.backing.root_ptr()?, buf.len),
            Backing::View { parent, offset } => {
                let root = state.buffers.get(parent)?;
                (unsafe { root.backing.root_ptr()?.add(*offset) }, buf.len)
            }
        };
        Some(unsafe { std::slice::from_raw_parts(ptr as *const u8, len) }.to_vec())
    }

    fn alloc_id(state: &mut State) -> u32 {
        state.next_id += 1;
        state.next_id
    }

    /// Host pointer and length backing a buffer or view.
    fn resolve(state: &State, id: u32) -> Result<(*mut u8, usize), GpuError> {
        let buf = state.buffers.get(&id).ok_or(GpuError::InvalidHandle { what: "buffer" })?;
        match &buf.backing {
            Backing::Root(_) => {
                let ptr = buf.backing.root_ptr().ok_or(GpuError::InvalidHandle { what: "buffer" })?;
                Ok((ptr, buf.len))
            }
            Backing::View { parent, offset } => {
                let root = state
                    .buffers
                    .get(parent)
                    .ok_or(GpuError::InvalidHandle { what: "buffer" })?;
                let ptr = root
                    .backing
                    .root_ptr()
                    .ok_or(GpuError::InvalidHandle { what: "buffer" })?;
                Ok((unsafe { ptr.add(*offset) }, buf.len))
            }
        }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for NullBackend {
    fn build_program(&self, label: &str, _source: &str) -> Result<ProgramId, GpuError> {
        let mut state = self.state.borrow_mut();
        let id = Self::alloc_id(&mut state);
        state.programs.insert(id, label.to_string());
        state.ops.push(BackendOp::BuildProgram { label: label.to_string() });
        Ok(ProgramId(id))
    }

    fn create_kernel(&self, program: ProgramId, entry: &str) -> Result<KernelId, GpuError> {
        let mut state = self.state.borrow_mut();
        if !state.programs.contains_key(&program.0) {
            return Err(GpuError::InvalidHandle { what: "program" });
        }
        let id = Self::alloc_id(&mut state);
        state.kernels.insert(id, entry.to_string());
        state.ops.push(BackendOp::CreateKernel { entry: entry.to_string() });
        Ok(KernelId(id))
    }

    fn release_program(&self, program: ProgramId) {
        let mut state = self.state.borrow_mut();
        let removed = state.programs.remove(&program.0).is_some();
        debug_assert!(removed, "release of unknown program {program:?}");
        state.ops.push(BackendOp::ReleaseProgram { program });
    }

    fn release_kernel(&self, kernel: KernelId) {
        let mut state = self.state.borrow_mut();
        let removed = state.kernels.remove(&kernel.0).is_some();
        debug_assert!(removed, "release of unknown kernel {kernel:?}");
        state.ops.push(BackendOp::ReleaseKernel { kernel });
    }

    fn create_buffer(
        &self,
        label: &str,
        size: u64,
        _access: BufferAccess,
    ) -> Result<BufferId, GpuError> {
        let mut state = self.state.borrow_mut();
        state.buffer_creates += 1;
        if let Some(n) = self.fail_buffer_create_at.get() {
            if state.buffer_creates >= n {
                return Err(GpuError::Allocation { what: label.to_string(), size });
            }
        }
        let id = Self::alloc_id(&mut state);
        let words = (size as usize + 7) / 8;
        state.buffers.insert(
            id,
            NullBuffer {
                backing: Backing::Root(vec![0u64; words].into_boxed_slice()),
                len: size as usize,
                mapped: false,
                label: label.to_string(),
            },
        );
        state.ops.push(BackendOp::CreateBuffer { label: label.to_string(), size });
        Ok(BufferId(id))
    }

    fn create_sub_buffer(
        &self,
        parent: BufferId,
        offset: u64,
        size: u64,
    ) -> Result<BufferId, GpuError> {
        let mut state = self.state.borrow_mut();
        state.buffer_creates += 1;
        if let Some(n) = self.fail_buffer_create_at.get() {
            if state.buffer_creates >= n {
                return Err(GpuError::Allocation { what: "sub-buffer".to_string(), size });
            }
        }
        let (label, parent_len) = {
            let root =
                state.buffers.get(&parent.0).ok_or(GpuError::InvalidHandle { what: "buffer" })?;
            if !matches!(root.backing, Backing::Root(_)) {
                return Err(GpuError::InvalidHandle { what: "buffer" });
            }
            (root.label.clone(), root.len)
        };
        if (offset + size) as usize > parent_len {
            return Err(GpuError::Allocation { what: format!("{label} region"), size });
        }
        let id = Self::alloc_id(&mut state);
        state.buffers.insert(
            id,
            NullBuffer {
                backing: Backing::View { parent: parent.0, offset: offset as usize },
                len: size as usize,
                mapped: false,
                label: format!("{label} region"),
            },
        );
        state.ops.push(BackendOp::CreateSubBuffer { parent, offset, size });
        Ok(BufferId(id))
    }

    fn release_buffer(&self, buffer: BufferId) {
        let mut state = self.state.borrow_mut();
        let removed = state.buffers.remove(&buffer.0).is_some();
        debug_assert!(removed, "release of unknown buffer {buffer:?}");
        state.ops.push(BackendOp::ReleaseBuffer { buffer });
    }

    fn map_buffer(&self, buffer: BufferId, mode: MapMode) -> Result<HostPtr, GpuError> {
        let mut state = self.state.borrow_mut();
        let (ptr, len) = Self::resolve(&*state, buffer.0)?;
        let buf = state.buffers.get_mut(&buffer.0).expect("resolved above");
        if buf.mapped {
            return Err(GpuError::AlreadyMapped { what: buf.label.clone() });
        }
        buf.mapped = true;
        state.ops.push(BackendOp::Map { buffer, mode });
        let nn = std::ptr::NonNull::new(ptr).ok_or_else(|| GpuError::Map {
            what: "null backing".to_string(),
        })?;
        Ok(HostPtr::new(nn, len))
    }

    fn unmap_buffer(&self, buffer: BufferId, blocking: bool) -> Result<(), GpuError> {
        let mut state = self.state.borrow_mut();
        let buf =
            state.buffers.get_mut(&buffer.0).ok_or(GpuError::InvalidHandle { what: "buffer" })?;
        if !buf.mapped {
            return Err(GpuError::Unmap { what: buf.label.clone() });
        }
        buf.mapped = false;
        state.ops.push(BackendOp::Unmap { buffer, blocking });
        Ok(())
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg)
        -> Result<(), GpuError> {
        let mut state = self.state.borrow_mut();
        if !state.kernels.contains_key(&kernel.0) {
            return Err(GpuError::InvalidHandle { what: "kernel" });
        }
        state.ops.push(BackendOp::SetArg { kernel, index, arg });
        Ok(())
    }

    fn enqueue_kernel(&self, kernel: KernelId, range: &NdRange) -> Result<(), GpuError> {
        let mut state = self.state.borrow_mut();
        let entry = state
            .kernels
            .get(&kernel.0)
            .cloned()
            .ok_or(GpuError::InvalidHandle { what: "kernel" })?;
        state.ops.push(BackendOp::Enqueue { entry, range: *range });
        Ok(())
    }

    fn flush_marker(&self) -> Result<EventId, GpuError> {
        let mut state = self.state.borrow_mut();
        let id = Self::alloc_id(&mut state);
        state.events.insert(id, ());
        state.ops.push(BackendOp::FlushMarker { event: EventId(id) });
        Ok(EventId(id))
    }

    fn wait_event(&self, event: EventId) -> Result<(), GpuError> {
        let mut state = self.state.borrow_mut();
        if !state.events.contains_key(&event.0) {
            return Err(GpuError::Wait { what: format!("unknown event {}", event.0) });
        }
        state.ops.push(BackendOp::Wait { event });
        Ok(())
    }

    fn release_event(&self, event: EventId) {
        let mut state = self.state.borrow_mut();
        let removed = state.events.remove(&event.0).is_some();
        debug_assert!(removed, "release of unknown event {event:?}");
        state.ops.push(BackendOp::ReleaseEvent { event });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_hands_out_writable_memory() {
        let be = NullBackend::new();
        let buf = be.create_buffer("grid", 64, BufferAccess::HostWrite).unwrap();
        let ptr = be.map_buffer(buf, MapMode::Write).unwrap();
        unsafe { ptr.as_mut_slice()[0..4].copy_from_slice(&[1, 2, 3, 4]) };
        be.unmap_buffer(buf, false).unwrap();
        assert_eq!(&be.buffer_contents(buf).unwrap()[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn sub_buffer_windows_its_parent() {
        let be = NullBackend::new();
        let parent = be.create_buffer("out", 64, BufferAccess::HostRead).unwrap();
        let region = be.create_sub_buffer(parent, 16, 16).unwrap();
        let ptr = be.map_buffer(region, MapMode::Write).unwrap();
        assert_eq!(ptr.len(), 16);
        unsafe { ptr.as_mut_slice().fill(7) };
        be.unmap_buffer(region, false).unwrap();
        let parent_bytes = be.buffer_contents(parent).unwrap();
        assert!(parent_bytes[16..32].iter().all(|&b| b == 7));
        assert!(parent_bytes[0..16].iter().all(|&b| b == 0));
    }

    #[test]
    fn double_map_is_rejected() {
        let be = NullBackend::new();
        let buf = be.create_buffer("params", 16, BufferAccess::HostWrite).unwrap();
        be.map_buffer(buf, MapMode::Write).unwrap();
        assert!(matches!(
            be.map_buffer(buf, MapMode::Write),
            Err(GpuError::AlreadyMapped { .. })
        ));
    }

    #[test]
    fn injected_allocation_failure() {
        let be = NullBackend::new();
        be.fail_buffer_create_at(2);
        be.create_buffer("a", 16, BufferAccess::DeviceOnly).unwrap();
        assert!(matches!(
            be.create_buffer("b", 16, BufferAccess::DeviceOnly),
            Err(GpuError::Allocation { .. })
        ));
    }

    #[test]
    fn live_handle_accounting() {
        let be = NullBackend::new();
        let p = be.build_program("unit", "src").unwrap();
        let k = be.create_kernel(p, "entry").unwrap();
        let b = be.create_buffer("buf", 8, BufferAccess::DeviceOnly).unwrap();
        let e = be.flush_marker().unwrap();
        assert_eq!(
            (be.live_programs(), be.live_kernels(), be.live_buffers(), be.live_events()),
            (1, 1, 1, 1)
        );
        be.release_kernel(k);
        be.release_program(p);
        be.release_buffer(b);
        be.release_event(e);
        assert_eq!(
            (be.live_programs(), be.live_kernels(), be.live_buffers(), be.live_events()),
            (0, 0, 0, 0)
        );
    }
}
