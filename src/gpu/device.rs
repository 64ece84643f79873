// gpu/device.rs -- wgpu implementation of the compute backend.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` power heuristics may grab llvmpipe on
// headless boxes where the software renderer appears as a valid Vulkan
// device. We enumerate explicitly and prefer real hardware:
//   1. DiscreteGpu / IntegratedGpu
//   2. VirtualGpu / Other (VM pass-through, D3D12-to-Vulkan layers)
//   3. anything at all (name is logged so you know what you got)
//
// MAPPED BUFFERS:
// The ownership-handoff model needs storage buffers the host can map in
// place, which plain wgpu usage validation forbids (MAP_* combines only
// with COPY_*). `Features::MAPPABLE_PRIMARY_BUFFERS` lifts that, so
// host-writable buffers are STORAGE | MAP_WRITE and host-readable ones
// STORAGE | MAP_READ, no staging copies. Map pointers stay valid until
// the buffer's unmap; unmapping a buffer drops every mapped range on it,
// including sub-buffer views of the same root.
//
// ARGUMENT BINDING CONTRACT (shared with the WGSL sources):
//   buffer argument at index i     -> @binding(i)
//   all scalar arguments, packed   -> @binding(24), array<u32> storage
//     (in argument-index order; 64-bit scalars take two words, lo first)
//   dispatch params                -> @binding(25), uniform vec4<u32>
//     (global offset x/y, global size x/y)
// A kernel argument slot that is optional and absent this frame binds a
// small dummy buffer instead, matching the kernels' unused declaration.
//
// QUEUE MODEL:
// enqueue_kernel records into a lazily created command encoder;
// flush_marker submits it and the returned SubmissionIndex is the
// completion token. wait_event polls the device until that submission
// completes, which is the only blocking call.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::ptr::NonNull;
use std::rc::Rc;

use wgpu::util::DeviceExt;

use crate::gpu::backend::{
    BufferAccess, BufferId, ComputeBackend, EventId, GpuError, HostPtr, KernelArg, KernelId,
    MapMode, NdRange, ProgramId,
};

/// Binding index for the packed scalar-argument words.
pub const SCALAR_ARGS_BINDING: u32 = 24;
/// Binding index for the per-dispatch offset/size uniform.
pub const DISPATCH_PARAMS_BINDING: u32 = 25;

// ---------------------------------------------------------------------------
// Adapter info
// ---------------------------------------------------------------------------

/// Cached adapter information for logging and diagnostics.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

// ---------------------------------------------------------------------------
// Backend state
// ---------------------------------------------------------------------------

struct KernelEntry {
    entry: String,
    pipeline: wgpu::ComputePipeline,
    args: Vec<Option<KernelArg>>,
}

enum Backing {
    Root(wgpu::Buffer),
    View { parent: u32, offset: u64 },
}

struct BufferEntry {
    backing: Backing,
    size: u64,
    mapped: bool,
}

#[derive(Default)]
struct State {
    next_id: u32,
    programs: HashMap<u32, wgpu::ShaderModule>,
    kernels: HashMap<u32, KernelEntry>,
    buffers: HashMap<u32, BufferEntry>,
    events: HashMap<u32, wgpu::SubmissionIndex>,
    pending: Option<wgpu::CommandEncoder>,
}

/// The real compute backend.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    state: RefCell<State>,
    /// Bound in place of absent optional buffer arguments.
    dummy: wgpu::Buffer,
    /// Keeps the `wgpu::Instance` alive until `device` and `queue` are
    /// dropped (fields drop in declaration order).
    _instance: wgpu::Instance,
}

impl WgpuBackend {
    /// Initialize on the best available Vulkan adapter.
    pub fn new() -> Result<Rc<Self>, GpuError> {
        pollster::block_on(Self::init_async())
    }

    async fn init_async() -> Result<Rc<Self>, GpuError> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let all_adapters: Vec<wgpu::Adapter> =
            instance.enumerate_adapters(wgpu::Backends::VULKAN).into_iter().collect();
        if all_adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }
        for a in &all_adapters {
            let info = a.get_info();
            eprintln!(
                "[dasher-v] Vulkan adapter: {} ({:?}, {:?})",
                info.name, info.backend, info.device_type
            );
        }

        let adapter = all_adapters
            .into_iter()
            .find(|a| {
                matches!(
                    a.get_info().device_type,
                    wgpu::DeviceType::DiscreteGpu
                        | wgpu::DeviceType::IntegratedGpu
                        | wgpu::DeviceType::VirtualGpu
                        | wgpu::DeviceType::Other
                )
            })
            .or_else(|| instance.enumerate_adapters(wgpu::Backends::VULKAN).into_iter().next())
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw.name.clone(),
            vendor: raw.vendor,
            device: raw.device,
            device_type: raw.device_type,
            backend: raw.backend,
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("dasher-v"),
                    required_features: wgpu::Features::MAPPABLE_PRIMARY_BUFFERS,
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        eprintln!("[dasher-v] using adapter: {adapter_info}");

        let dummy = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("dasher-v dummy arg"),
            size: 16,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        Ok(Rc::new(WgpuBackend {
            device,
            queue,
            adapter_info,
            state: RefCell::new(State::default()),
            dummy,
            _instance: instance,
        }))
    }

    fn alloc_id(state: &mut State) -> u32 {
        state.next_id += 1;
        state.next_id
    }

    /// Root buffer id, absolute byte offset and length of a buffer or
    /// view.
    fn resolve(state: &State, id: u32) -> Result<(u32, u64, u64), GpuError> {
        let entry = state.buffers.get(&id).ok_or(GpuError::InvalidHandle { what: "buffer" })?;
        match entry.backing {
            Backing::Root(_) => Ok((id, 0, entry.size)),
            Backing::View { parent, offset } => {
                if !state.buffers.contains_key(&parent) {
                    return Err(GpuError::InvalidHandle { what: "buffer" });
                }
                Ok((parent, offset, entry.size))
            }
        }
    }

    fn root_buffer<'a>(state: &'a State, root: u32) -> &'a wgpu::Buffer {
        match &state.buffers[&root].backing {
            Backing::Root(buf) => buf,
            Backing::View { .. } => unreachable!("resolve() returns roots"),
        }
    }

    /// Pack the scalar arguments of one kernel, in index order, into
    /// 32-bit words (64-bit values lo word first).
    fn pack_scalars(args: &[Option<KernelArg>]) -> Vec<u32> {
        let mut words = Vec::new();
        for arg in args.iter().flatten() {
            match *arg {
                KernelArg::I32(v) => words.push(v as u32),
                KernelArg::I64(v) => {
                    words.push(v as u64 as u32);
                    words.push((v as u64 >> 32) as u32);
                }
                KernelArg::Buffer(_) | KernelArg::OptBuffer(_) => {}
            }
        }
        words
    }
}

impl ComputeBackend for WgpuBackend {
    fn build_program(&self, label: &str, source: &str) -> Result<ProgramId, GpuError> {
        // Validation errors (including WGSL front-end errors) surface
        // through the error scope; the scope is what turns a bad kernel
        // into a CompileError instead of a later panic.
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::Compile { unit: label.to_string(), log: err.to_string() });
        }

        let mut state = self.state.borrow_mut();
        let id = Self::alloc_id(&mut state);
        state.programs.insert(id, module);
        Ok(ProgramId(id))
    }

    fn create_kernel(&self, program: ProgramId, entry: &str) -> Result<KernelId, GpuError> {
        let mut state = self.state.borrow_mut();
        let module = state
            .programs
            .get(&program.0)
            .ok_or(GpuError::InvalidHandle { what: "program" })?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry),
            layout: None,
            module,
            entry_point: entry,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::Compile { unit: entry.to_string(), log: err.to_string() });
        }

        let id = Self::alloc_id(&mut state);
        state.kernels.insert(
            id,
            KernelEntry { entry: entry.to_string(), pipeline, args: Vec::new() },
        );
        Ok(KernelId(id))
    }

    fn release_program(&self, program: ProgramId) {
        self.state.borrow_mut().programs.remove(&program.0);
    }

    fn release_kernel(&self, kernel: KernelId) {
        self.state.borrow_mut().kernels.remove(&kernel.0);
    }

    fn create_buffer(
        &self,
        label: &str,
        size: u64,
        access: BufferAccess,
    ) -> Result<BufferId, GpuError> {
        let usage = match access {
            BufferAccess::DeviceOnly => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
            BufferAccess::HostWrite => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::MAP_WRITE
                    | wgpu::BufferUsages::COPY_SRC
            }
            BufferAccess::HostRead => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::MAP_READ
                    | wgpu::BufferUsages::COPY_DST
            }
        };

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let raw = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(GpuError::Allocation { what: label.to_string(), size });
        }

        let mut state = self.state.borrow_mut();
        let id = Self::alloc_id(&mut state);
        state.buffers.insert(id, BufferEntry { backing: Backing::Root(raw), size, mapped: false });
        Ok(BufferId(id))
    }

    fn create_sub_buffer(
        &self,
        parent: BufferId,
        offset: u64,
        size: u64,
    ) -> Result<BufferId, GpuError> {
        let mut state = self.state.borrow_mut();
        let root =
            state.buffers.get(&parent.0).ok_or(GpuError::InvalidHandle { what: "buffer" })?;
        if !matches!(root.backing, Backing::Root(_)) || offset + size > root.size {
            return Err(GpuError::Allocation { what: "sub-buffer".to_string(), size });
        }
        let id = Self::alloc_id(&mut state);
        state.buffers.insert(
            id,
            BufferEntry { backing: Backing::View { parent: parent.0, offset }, size, mapped: false },
        );
        Ok(BufferId(id))
    }

    fn release_buffer(&self, buffer: BufferId) {
        self.state.borrow_mut().buffers.remove(&buffer.0);
    }

    fn map_buffer(&self, buffer: BufferId, mode: MapMode) -> Result<HostPtr, GpuError> {
        let mut state = self.state.borrow_mut();
        let (root, offset, size) = Self::resolve(&*state, buffer.0)?;
        if state.buffers[&buffer.0].mapped {
            return Err(GpuError::AlreadyMapped { what: format!("buffer #{}", buffer.0) });
        }

        let wmode = match mode {
            MapMode::Read => wgpu::MapMode::Read,
            MapMode::Write => wgpu::MapMode::Write,
        };
        let ptr = {
            let raw = Self::root_buffer(&state, root);
            let slice = raw.slice(offset..offset + size);
            let (tx, rx) = std::sync::mpsc::channel();
            slice.map_async(wmode, move |r| {
                let _ = tx.send(r);
            });
            self.device.poll(wgpu::Maintain::Wait);
            match rx.recv() {
                Ok(Ok(())) => {}
                _ => return Err(GpuError::Map { what: format!("buffer #{}", buffer.0) }),
            }
            // The mapping outlives the view object: wgpu keeps the range
            // mapped until unmap(), so the raw pointer taken here stays
            // valid for exactly the acquire/release window.
            match mode {
                MapMode::Write => slice.get_mapped_range_mut().as_mut_ptr(),
                MapMode::Read => slice.get_mapped_range().as_ptr() as *mut u8,
            }
        };

        state.buffers.get_mut(&buffer.0).expect("resolved above").mapped = true;
        let nn = NonNull::new(ptr)
            .ok_or_else(|| GpuError::Map { what: format!("buffer #{}", buffer.0) })?;
        Ok(HostPtr::new(nn, size as usize))
    }

    fn unmap_buffer(&self, buffer: BufferId, _blocking: bool) -> Result<(), GpuError> {
        // wgpu's unmap is synchronous either way; `blocking` exists for
        // backends where the handoff is a queued operation.
        let mut state = self.state.borrow_mut();
        let (root, _, _) = Self::resolve(&*state, buffer.0)?;
        if !state.buffers[&buffer.0].mapped {
            return Err(GpuError::Unmap { what: format!("buffer #{}", buffer.0) });
        }
        Self::root_buffer(&state, root).unmap();
        // Unmap drops every mapped range on the root, views included.
        let affected: Vec<u32> = state
            .buffers
            .iter()
            .filter(|(id, e)| {
                **id == root
                    || matches!(e.backing, Backing::View { parent, .. } if parent == root)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in affected {
            state.buffers.get_mut(&id).expect("listed above").mapped = false;
        }
        Ok(())
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg)
        -> Result<(), GpuError> {
        let mut state = self.state.borrow_mut();
        let entry =
            state.kernels.get_mut(&kernel.0).ok_or(GpuError::InvalidHandle { what: "kernel" })?;
        if entry.args.len() <= index as usize {
            entry.args.resize(index as usize + 1, None);
        }
        entry.args[index as usize] = Some(arg);
        Ok(())
    }

    fn enqueue_kernel(&self, kernel: KernelId, range: &NdRange) -> Result<(), GpuError> {
        let mut state = self.state.borrow_mut();
        let entry =
            state.kernels.get(&kernel.0).ok_or(GpuError::InvalidHandle { what: "kernel" })?;
        let entry_name = entry.entry.clone();
        let args = entry.args.clone();

        // Buffer bindings at their argument indices; a zero-sized slot
        // marks an absent optional argument (bound to the dummy buffer).
        let mut bindings: Vec<(u32, u32, u64, u64)> = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            let id = match arg {
                Some(KernelArg::Buffer(b)) => Some(b.0),
                Some(KernelArg::OptBuffer(Some(b))) => Some(b.0),
                Some(KernelArg::OptBuffer(None)) => None,
                _ => continue,
            };
            match id {
                Some(id) => {
                    let (root, offset, size) = Self::resolve(&*state, id)
                        .map_err(|_| GpuError::Dispatch { kernel: entry_name.clone() })?;
                    bindings.push((i as u32, root, offset, size));
                }
                None => bindings.push((i as u32, 0, 0, 0)),
            }
        }

        let scalars = Self::pack_scalars(&args);
        let scalar_buf = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("scalar args"),
            contents: bytemuck::cast_slice(&scalars),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let dispatch_params = [
            range.global_offset[0],
            range.global_offset[1],
            range.global_size[0],
            range.global_size[1],
        ];
        let params_buf = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("dispatch params"),
            contents: bytemuck::cast_slice(&dispatch_params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = {
            let pipeline = &state.kernels[&kernel.0].pipeline;
            let layout = pipeline.get_bind_group_layout(0);
            let mut entries: Vec<wgpu::BindGroupEntry> = Vec::new();
            for &(binding, root, offset, size) in &bindings {
                let resource = if size == 0 {
                    self.dummy.as_entire_binding()
                } else {
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: Self::root_buffer(&state, root),
                        offset,
                        size: NonZeroU64::new(size),
                    })
                };
                entries.push(wgpu::BindGroupEntry { binding, resource });
            }
            entries.push(wgpu::BindGroupEntry {
                binding: SCALAR_ARGS_BINDING,
                resource: scalar_buf.as_entire_binding(),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: DISPATCH_PARAMS_BINDING,
                resource: params_buf.as_entire_binding(),
            });
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&entry_name),
                layout: &layout,
                entries: &entries,
            })
        };

        let groups = range.workgroups();
        let mut encoder = state.pending.take().unwrap_or_else(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("dasher-v") })
        });
        {
            let pipeline = &state.kernels[&kernel.0].pipeline;
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&entry_name),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], 1);
        }
        state.pending = Some(encoder);
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(GpuError::Dispatch { kernel: entry_name });
        }
        Ok(())
    }

    fn flush_marker(&self) -> Result<EventId, GpuError> {
        let mut state = self.state.borrow_mut();
        let encoder = state.pending.take().unwrap_or_else(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("dasher-v") })
        });
        let index = self.queue.submit(Some(encoder.finish()));
        let id = Self::alloc_id(&mut state);
        state.events.insert(id, index);
        Ok(EventId(id))
    }

    fn wait_event(&self, event: EventId) -> Result<(), GpuError> {
        let index = {
            let state = self.state.borrow();
            state
                .events
                .get(&event.0)
                .cloned()
                .ok_or(GpuError::Wait { what: format!("unknown event {}", event.0) })?
        };
        self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        Ok(())
    }

    fn release_event(&self, event: EventId) {
        self.state.borrow_mut().events.remove(&event.0);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // The packing test has no device dependency; the device tests are
    // ignored so `cargo test` passes in CI without Vulkan. Run them with
    //   cargo test -- --include-ignored

    #[test]
    fn scalar_packing_orders_and_splits_words() {
        let args = vec![
            Some(KernelArg::Buffer(BufferId(1))),
            Some(KernelArg::I32(-3)),
            Some(KernelArg::OptBuffer(None)),
            Some(KernelArg::I64(0x0001_0002_0003_0004)),
            Some(KernelArg::I32(7)),
        ];
        let words = WgpuBackend::pack_scalars(&args);
        assert_eq!(words, vec![-3i32 as u32, 0x0003_0004, 0x0001_0002, 7]);
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn device_init_and_buffer_round_trip() {
        let be = WgpuBackend::new().expect("should initialise a Vulkan device");
        eprintln!("[test] adapter: {}", be.adapter_info);
        let buf = be.create_buffer("t", 256, BufferAccess::HostWrite).unwrap();
        let ptr = be.map_buffer(buf, MapMode::Write).unwrap();
        unsafe { ptr.as_mut_slice().fill(0xAB) };
        be.unmap_buffer(buf, true).unwrap();
        be.release_buffer(buf);
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn flush_and_wait_on_empty_submission() {
        let be = WgpuBackend::new().expect("should initialise a Vulkan device");
        let ev = be.flush_marker().unwrap();
        be.wait_event(ev).unwrap();
        be.release_event(ev);
    }
}
