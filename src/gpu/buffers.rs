// gpu/buffers.rs -- Device buffers, ownership handoff, session buffer set.
//
// Every buffer is owned by exactly one side at any instant:
//
//   DeviceOwned --acquire(map)--> HostMapped(read|write)
//   HostMapped  --release(unmap)--> DeviceOwned
//
// acquire on a mapped buffer is an error (double map); release on a
// device-owned buffer is a no-op, so dispatch paths release everything
// they are about to touch unconditionally. Drop force-releases a still-
// mapped buffer and then frees the device handle, which is both the
// shutdown path and the abort path: a failed allocation mid-`allocate`
// unwinds through the already-created buffers' Drops, leaving nothing
// reachable and nothing leaked.
//
// Sizing: the 1-D projection buffers cover the frame's whole-superblock
// grid with 64 elements per superblock plus a 64-element edge pad on the
// prediction side (the coarse search reads up to a superblock outside
// either end). Grid input/output/scratch are sized for the finest block
// class: it has the most blocks, so the coarser class fits in the same
// allocation. Output buffers are split into per-tile regions along tile
// bounds so the host can map one tile's results while the device writes
// another's.

use std::rc::Rc;

use bytemuck::{Pod, Zeroable};

use crate::block::BlockClass;
use crate::geometry::{FrameGeometry, SB_SIZE};
use crate::tile::TilePlan;
use crate::gpu::backend::{
    BufferAccess, BufferId, ComputeBackend, GpuError, HostPtr, MapMode,
};

// ---------------------------------------------------------------------------
// Host-visible records (layouts shared with the kernels)
// ---------------------------------------------------------------------------

/// Per-superblock result of the coarse stage.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CoarseOutput {
    /// Coarse motion vector against the last reference (1/8-pel units).
    pub mv: [i16; 2],
    /// Coarse motion vector against the golden reference; valid only
    /// when the frame was dispatched with a distinct golden.
    pub mv_golden: [i16; 2],
    /// Bit 0: U plane is color-sensitive; bit 1: V plane.
    pub color_sensitivity: u32,
    /// Packed 2-bit partition choice per 32x32 quadrant.
    pub partition_hint: u32,
}

/// Per-block control word the host writes before the execute stage.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GridInput {
    /// Nonzero: run the new-MV search for this block.
    pub do_newmv: u32,
    /// Prediction-mode context from the host-side analysis.
    pub mode_context: u32,
}

/// Per-block result of the execute stage.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FineOutput {
    /// Refined motion vector (1/8-pel units).
    pub mv: [i16; 2],
    /// Rate estimate for the chosen vector.
    pub rate: i32,
    /// Best rate-distortion cost.
    pub best_rd: i64,
    /// Distortion term.
    pub dist: i64,
    /// Sum of squared error of the final prediction.
    pub sse: u32,
    /// Bit 0: zero-MV won; bit 1: skip eligible.
    pub flags: u32,
}

/// Per-block device-only intermediate shared between the sub-pel and
/// merged kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ScratchRecord {
    pub sum: [i32; 8],
    pub sse: [u32; 8],
}

/// Rate-distortion parameters, one record per session, rewritten by the
/// host each frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RdParams {
    pub rd_mult: i32,
    pub rd_div: i32,
    pub sad_per_bit: i32,
    pub error_per_bit: i32,
    pub inter_mode_cost: [i32; 4],
    pub switchable_interp_cost: [i32; 3],
    pub tx_mode: i32,
    pub dc_quant: i32,
    pub ac_quant: i32,
}

// ---------------------------------------------------------------------------
// Ownership state machine
// ---------------------------------------------------------------------------

/// Who may touch the bytes right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    DeviceOwned,
    HostMapped(MapMode),
}

/// A device buffer plus its ownership state.
pub struct DeviceBuffer {
    backend: Rc<dyn ComputeBackend>,
    id: BufferId,
    size: u64,
    label: String,
    state: BufferState,
}

impl DeviceBuffer {
    pub fn create(
        backend: &Rc<dyn ComputeBackend>,
        label: &str,
        size: u64,
        access: BufferAccess,
    ) -> Result<Self, GpuError> {
        let id = backend.create_buffer(label, size, access)?;
        Ok(DeviceBuffer {
            backend: Rc::clone(backend),
            id,
            size,
            label: label.to_string(),
            state: BufferState::DeviceOwned,
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Map for host access. The buffer must currently be device-owned.
    pub fn acquire(&mut self, mode: MapMode) -> Result<HostPtr, GpuError> {
        if let BufferState::HostMapped(_) = self.state {
            return Err(GpuError::AlreadyMapped { what: self.label.clone() });
        }
        let ptr = self.backend.map_buffer(self.id, mode)?;
        self.state = BufferState::HostMapped(mode);
        Ok(ptr)
    }

    /// Hand the buffer back to the device. No-op when already
    /// device-owned, so callers release unconditionally before dispatch.
    pub fn release(&mut self, blocking: bool) -> Result<(), GpuError> {
        match self.state {
            BufferState::DeviceOwned => Ok(()),
            BufferState::HostMapped(_) => {
                self.backend.unmap_buffer(self.id, blocking)?;
                self.state = BufferState::DeviceOwned;
                Ok(())
            }
        }
    }

    /// Split off a region view of `[offset, offset + size)`.
    pub fn split_region(&self, offset: u64, size: u64) -> Result<BufferRegion, GpuError> {
        let id = self.backend.create_sub_buffer(self.id, offset, size)?;
        Ok(BufferRegion {
            backend: Rc::clone(&self.backend),
            id,
            offset,
            size,
            label: format!("{} region @{offset}", self.label),
            state: BufferState::DeviceOwned,
        })
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        // Shutdown/abort path: force-release a still-mapped buffer, then
        // free the handle. Unmap failure here has nowhere to go.
        if let BufferState::HostMapped(_) = self.state {
            let _ = self.backend.unmap_buffer(self.id, true);
        }
        self.backend.release_buffer(self.id);
    }
}

/// One tile's window into a parent output buffer. Carries its own
/// ownership state once split; the parent's state is not consulted.
pub struct BufferRegion {
    backend: Rc<dyn ComputeBackend>,
    id: BufferId,
    offset: u64,
    size: u64,
    label: String,
    state: BufferState,
}

impl BufferRegion {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn acquire(&mut self, mode: MapMode) -> Result<HostPtr, GpuError> {
        if let BufferState::HostMapped(_) = self.state {
            return Err(GpuError::AlreadyMapped { what: self.label.clone() });
        }
        let ptr = self.backend.map_buffer(self.id, mode)?;
        self.state = BufferState::HostMapped(mode);
        Ok(ptr)
    }

    pub fn release(&mut self, blocking: bool) -> Result<(), GpuError> {
        match self.state {
            BufferState::DeviceOwned => Ok(()),
            BufferState::HostMapped(_) => {
                self.backend.unmap_buffer(self.id, blocking)?;
                self.state = BufferState::DeviceOwned;
                Ok(())
            }
        }
    }
}

impl Drop for BufferRegion {
    fn drop(&mut self) {
        if let BufferState::HostMapped(_) = self.state {
            let _ = self.backend.unmap_buffer(self.id, true);
        }
        self.backend.release_buffer(self.id);
    }
}

// ---------------------------------------------------------------------------
// Grid sizing helpers
// ---------------------------------------------------------------------------

/// (columns, rows) of the coarse per-superblock grid the projection and
/// coarse-output buffers cover (whole superblocks only).
pub fn coarse_grid(geom: &FrameGeometry) -> (u32, u32) {
    (geom.full_sb_cols(), geom.full_sb_rows())
}

/// (columns, rows) of the worst-case fine grid: the finest class over the
/// rounded-up superblock grid.
pub fn fine_grid(geom: &FrameGeometry) -> (u32, u32) {
    let per_sb = BlockClass::Size32.blocks_per_sb();
    (geom.sb_cols * per_sb, geom.sb_rows * per_sb)
}

// ---------------------------------------------------------------------------
// Session buffer set
// ---------------------------------------------------------------------------

/// Every device allocation of one encoding session.
///
/// Regions are declared before their parents: struct fields drop in
/// declaration order, and a region's handle must be released before the
/// buffer it windows.
pub struct SessionBuffers {
    /// Per-GPU-tile windows of `coarse_out`, indexed `tile - cpu_tiles`.
    pub coarse_regions: Vec<BufferRegion>,
    /// Per-GPU-tile windows of `fine_out`, indexed `tile - cpu_tiles`.
    pub fine_regions: Vec<BufferRegion>,

    /// 1-D row projections: per-superblock source rows collapsed to a
    /// horizontal plane, and the padded prediction counterpart.
    pub src_rows_1d: DeviceBuffer,
    pub pred_rows_1d: DeviceBuffer,
    /// Column counterparts (vertical plane).
    pub src_cols_1d: DeviceBuffer,
    pub pred_cols_1d: DeviceBuffer,

    /// Coarse-stage per-superblock output.
    pub coarse_out: DeviceBuffer,
    /// Rate-distortion parameter record.
    pub rd_params: DeviceBuffer,
    /// Per-block control words written by the host.
    pub grid_in: DeviceBuffer,
    /// Fine-stage per-block output.
    pub fine_out: DeviceBuffer,
    /// Device-only per-block scratch.
    pub scratch: DeviceBuffer,

    /// Frame planes (luma + chroma, border included), host-filled.
    pub source: DeviceBuffer,
    pub last_ref: DeviceBuffer,
    pub golden_ref: DeviceBuffer,
}

impl std::fmt::Debug for SessionBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuffers")
            .field("coarse_regions", &self.coarse_regions.len())
            .field("fine_regions", &self.fine_regions.len())
            .finish_non_exhaustive()
    }
}

impl SessionBuffers {
    /// Allocate the whole set, sized from `geom`, with output regions
    /// split along `plan`'s tile bounds. Fatal on the first failure; the
    /// unwind releases everything created so far.
    pub fn allocate(
        backend: &Rc<dyn ComputeBackend>,
        geom: &FrameGeometry,
        plan: &TilePlan,
    ) -> Result<Self, GpuError> {
        let (sb_cols, sb_rows) = coarse_grid(geom);
        let elems_row = (sb_cols * SB_SIZE) as u64 * sb_rows as u64;
        let pad_row = SB_SIZE as u64 * sb_rows as u64;
        let elems_col = (sb_rows * SB_SIZE) as u64 * sb_cols as u64;
        let pad_col = SB_SIZE as u64 * sb_cols as u64;

        let pred_rows_1d = DeviceBuffer::create(
            backend,
            "pred rows 1d",
            (elems_row + pad_row) * 2,
            BufferAccess::DeviceOnly,
        )?;
        let src_rows_1d =
            DeviceBuffer::create(backend, "src rows 1d", elems_row * 2, BufferAccess::DeviceOnly)?;
        let pred_cols_1d = DeviceBuffer::create(
            backend,
            "pred cols 1d",
            (elems_col + pad_col) * 2,
            BufferAccess::DeviceOnly,
        )?;
        let src_cols_1d =
            DeviceBuffer::create(backend, "src cols 1d", elems_col * 2, BufferAccess::DeviceOnly)?;

        // Coarse output over whole superblocks, windowed per GPU tile.
        let rec = std::mem::size_of::<CoarseOutput>() as u64;
        let coarse_out = DeviceBuffer::create(
            backend,
            "coarse output",
            sb_cols as u64 * sb_rows as u64 * rec,
            BufferAccess::HostRead,
        )?;
        let mut coarse_regions = Vec::new();
        for tile in plan.gpu_tiles() {
            let row_off = plan.sb_row_offset(tile) as u64;
            let rows = plan.sb_rows(tile) as u64;
            coarse_regions.push(coarse_out.split_region(
                row_off * sb_cols as u64 * rec,
                rows * sb_cols as u64 * rec,
            )?);
        }

        let rd_params = DeviceBuffer::create(
            backend,
            "rd params",
            std::mem::size_of::<RdParams>() as u64,
            BufferAccess::HostWrite,
        )?;

        // Worst-case fine grid (finest class covers the coarser one).
        let (grid_cols, grid_rows) = fine_grid(geom);
        let blocks = grid_cols as u64 * grid_rows as u64;
        let grid_in = DeviceBuffer::create(
            backend,
            "grid input",
            blocks * std::mem::size_of::<GridInput>() as u64,
            BufferAccess::HostWrite,
        )?;
        let fine_out = DeviceBuffer::create(
            backend,
            "fine output",
            blocks * std::mem::size_of::<FineOutput>() as u64,
            BufferAccess::HostRead,
        )?;
        let scratch = DeviceBuffer::create(
            backend,
            "scratch",
            blocks * std::mem::size_of::<ScratchRecord>() as u64,
            BufferAccess::DeviceOnly,
        )?;

        // Fine regions: block rows of the finest class, tile end aligned
        // up to a superblock so the last tile's partial row is covered.
        let rec = std::mem::size_of::<FineOutput>() as u64;
        let shift = BlockClass::Size32.mi_height_log2();
        let mut fine_regions = Vec::new();
        for tile in plan.gpu_tiles() {
            let (mi_start, mi_end) = plan.mi_bounds(tile);
            let row_off = (mi_start >> shift) as u64;
            let rows = ((FrameGeometry::mi_aligned_to_sb(mi_end) - mi_start) >> shift) as u64;
            fine_regions.push(fine_out.split_region(
                row_off * grid_cols as u64 * rec,
                rows * grid_cols as u64 * rec,
            )?);
        }

        let plane = geom.plane_buffer_size();
        let source = DeviceBuffer::create(backend, "source plane", plane, BufferAccess::HostWrite)?;
        let last_ref =
            DeviceBuffer::create(backend, "last reference plane", plane, BufferAccess::HostWrite)?;
        let golden_ref = DeviceBuffer::create(
            backend,
            "golden reference plane",
            plane,
            BufferAccess::HostWrite,
        )?;

        Ok(SessionBuffers {
            coarse_regions,
            fine_regions,
            src_rows_1d,
            pred_rows_1d,
            src_cols_1d,
            pred_cols_1d,
            coarse_out,
            rd_params,
            grid_in,
            fine_out,
            scratch,
            source,
            last_ref,
            golden_ref,
        })
    }

    /// Region index for a GPU tile.
    fn region_index(plan: &TilePlan, tile: u32) -> usize {
        assert!(plan.is_gpu_tile(tile), "tile {tile} is host-only");
        (tile - plan.cpu_tiles) as usize
    }

    pub fn coarse_region_mut(&mut self, plan: &TilePlan, tile: u32) -> &mut BufferRegion {
        &mut self.coarse_regions[Self::region_index(plan, tile)]
    }

    pub fn fine_region_mut(&mut self, plan: &TilePlan, tile: u32) -> &mut BufferRegion {
        &mut self.fine_regions[Self::region_index(plan, tile)]
    }

    /// Release everything. Still-mapped buffers are force-released first
    /// (this is the shutdown path).
    pub fn free(self) {
        // Drop order does the work: regions, then parents.
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::{BackendOp, NullBackend};

    fn backend() -> (Rc<NullBackend>, Rc<dyn ComputeBackend>) {
        let be = Rc::new(NullBackend::new());
        let dy: Rc<dyn ComputeBackend> = be.clone();
        (be, dy)
    }

    #[test]
    fn record_sizes_are_stable() {
        // The kernels index these buffers by record stride; a layout
        // change must be deliberate.
        assert_eq!(std::mem::size_of::<CoarseOutput>(), 16);
        assert_eq!(std::mem::size_of::<GridInput>(), 8);
        assert_eq!(std::mem::size_of::<FineOutput>(), 32);
        assert_eq!(std::mem::size_of::<ScratchRecord>(), 64);
        assert_eq!(std::mem::size_of::<RdParams>() % 4, 0);
    }

    #[test]
    fn ownership_round_trip() {
        let (_be, dy) = backend();
        let mut buf = DeviceBuffer::create(&dy, "t", 64, BufferAccess::HostWrite).unwrap();
        assert_eq!(buf.state(), BufferState::DeviceOwned);

        let ptr = buf.acquire(MapMode::Write).unwrap();
        assert_eq!(ptr.len(), 64);
        assert_eq!(buf.state(), BufferState::HostMapped(MapMode::Write));

        // Double acquire is a caller bug, detected.
        assert!(matches!(buf.acquire(MapMode::Write), Err(GpuError::AlreadyMapped { .. })));

        buf.release(false).unwrap();
        assert_eq!(buf.state(), BufferState::DeviceOwned);
        // Idempotent release.
        buf.release(false).unwrap();

        // Acquire immediately after release works again.
        buf.acquire(MapMode::Read).unwrap();
        buf.release(false).unwrap();
    }

    #[test]
    fn drop_force_releases_mapped_buffer() {
        let (be, dy) = backend();
        {
            let mut buf = DeviceBuffer::create(&dy, "t", 32, BufferAccess::HostWrite).unwrap();
            buf.acquire(MapMode::Write).unwrap();
            // Dropped while mapped.
        }
        let ops = be.ops();
        let unmap = ops.iter().position(|op| matches!(op, BackendOp::Unmap { blocking: true, .. }));
        let release = ops.iter().position(|op| matches!(op, BackendOp::ReleaseBuffer { .. }));
        assert!(unmap.unwrap() < release.unwrap());
        assert_eq!(be.live_buffers(), 0);
    }

    #[test]
    fn allocate_sizes_match_grid() {
        let (be, dy) = backend();
        let geom = FrameGeometry::new(1920, 1080);
        let plan = TilePlan::new(&geom, 4, 1);
        let bufs = SessionBuffers::allocate(&dy, &geom, &plan).unwrap();

        let (sb_cols, sb_rows) = coarse_grid(&geom); // 30 x 16
        assert_eq!(bufs.src_rows_1d.size(), (sb_cols * 64) as u64 * sb_rows as u64 * 2);
        assert_eq!(bufs.pred_rows_1d.size(), ((sb_cols * 64) + 64) as u64 * sb_rows as u64 * 2);
        assert_eq!(bufs.coarse_out.size(), sb_cols as u64 * sb_rows as u64 * 16);

        let (gc, gr) = fine_grid(&geom); // 60 x 34
        assert_eq!(bufs.grid_in.size(), gc as u64 * gr as u64 * 8);
        assert_eq!(bufs.fine_out.size(), gc as u64 * gr as u64 * 32);
        assert_eq!(bufs.scratch.size(), gc as u64 * gr as u64 * 64);

        assert_eq!(bufs.coarse_regions.len(), 3);
        assert_eq!(bufs.fine_regions.len(), 3);

        bufs.free();
        assert_eq!(be.live_buffers(), 0);
    }

    #[test]
    fn coarse_regions_align_with_tile_bounds() {
        let (_be, dy) = backend();
        // 1024 pixel rows -> 128 mi rows -> 16 superblock rows.
        let geom = FrameGeometry::new(512, 1024);
        let plan = TilePlan::new(&geom, 4, 1);
        let bufs = SessionBuffers::allocate(&dy, &geom, &plan).unwrap();
        let (sb_cols, _) = coarse_grid(&geom);
        let rec = 16u64;
        for (i, tile) in plan.gpu_tiles().enumerate() {
            let r = &bufs.coarse_regions[i];
            assert_eq!(r.offset(), plan.sb_row_offset(tile) as u64 * sb_cols as u64 * rec);
            assert_eq!(r.size(), plan.sb_rows(tile) as u64 * sb_cols as u64 * rec);
        }
    }

    #[test]
    fn failed_allocation_releases_everything_created() {
        let (be, dy) = backend();
        let geom = FrameGeometry::new(512, 512);
        let plan = TilePlan::new(&geom, 4, 1);
        be.fail_buffer_create_at(3);
        let err = SessionBuffers::allocate(&dy, &geom, &plan).unwrap_err();
        assert!(matches!(err, GpuError::Allocation { .. }));

        // The two successful creations were both released on the unwind,
        // and nothing stayed mapped.
        let ops = be.ops();
        let created =
            ops.iter().filter(|op| matches!(op, BackendOp::CreateBuffer { .. })).count();
        let released =
            ops.iter().filter(|op| matches!(op, BackendOp::ReleaseBuffer { .. })).count();
        assert_eq!(created, 2);
        assert_eq!(released, 2);
        assert!(!ops.iter().any(|op| matches!(op, BackendOp::Map { .. })));
        assert_eq!(be.live_buffers(), 0);
    }
}
