// gpu/dispatch.rs -- Two-stage per-tile kernel dispatch.
//
// One in-order queue carries everything. For a tile, the prologue stage
// enqueues the six coarse kernels and the execute stage enqueues, per
// block-size class, the four refinement kernels plus the merged
// inter-prediction/RD pair at the designated class. Enqueue order is
// execution order; nothing here waits. After each stage the queue is
// flushed and a completion token is recorded in the (stage, tile) slot,
// releasing whatever token occupied the slot before.
//
// Before any enqueue, every buffer the stage touches is released
// (unmapped) if the host still holds it; this is the subsystem's half of
// the ownership contract. The other half (not re-acquiring until the
// matching wait) belongs to the caller.
//
// Work-size arithmetic lives in pure functions so the exact geometry is
// testable without a device. All sizes are 2-D (x, y); the global y
// offset positions the tile inside the frame-wide output grid.

use std::rc::Rc;

use crate::block::{BlockClass, COARSE_ROWS_PER_WORKITEM_LOG2, MERGED_STAGE_CLASS,
                   PIXELS_PER_WORKITEM};
use crate::geometry::{FrameGeometry, MI_SIZE_LOG2, SB_SIZE};
use crate::offload::FrameRefs;
use crate::tile::TilePlan;
use crate::gpu::backend::{ComputeBackend, EventId, GpuError, KernelArg, NdRange};
use crate::gpu::buffers::SessionBuffers;
use crate::gpu::programs::KernelCache;

// ---------------------------------------------------------------------------
// Stages and the completion-token table
// ---------------------------------------------------------------------------

/// The two dispatch stages of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Coarse search: projections, 1-D match, coarse MV, color
    /// sensitivity, partition choice.
    Prologue,
    /// Fine search: per-class zero-MV/full-pel/half-pel/quarter-pel plus
    /// the merged inter-prediction and RD kernels.
    Execute,
}

impl Stage {
    fn index(self) -> usize {
        match self {
            Stage::Prologue => 0,
            Stage::Execute => 1,
        }
    }
}

/// Completion tokens, one slot per (stage, tile).
///
/// Installing into an occupied slot releases the old token first: a token
/// is never overwritten while still held by the backend.
pub struct EventTable {
    backend: Rc<dyn ComputeBackend>,
    slots: Vec<Option<EventId>>,
    tiles: usize,
}

impl EventTable {
    pub fn new(backend: Rc<dyn ComputeBackend>, tile_count: u32) -> Self {
        EventTable {
            backend,
            slots: vec![None; 2 * tile_count as usize],
            tiles: tile_count as usize,
        }
    }

    fn slot(&self, stage: Stage, tile: u32) -> usize {
        assert!((tile as usize) < self.tiles, "tile {tile} out of range");
        stage.index() * self.tiles + tile as usize
    }

    pub fn install(&mut self, stage: Stage, tile: u32, event: EventId) {
        let slot = self.slot(stage, tile);
        if let Some(old) = self.slots[slot].take() {
            self.backend.release_event(old);
        }
        self.slots[slot] = Some(event);
    }

    pub fn get(&self, stage: Stage, tile: u32) -> Option<EventId> {
        self.slots[self.slot(stage, tile)]
    }

    pub fn release_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(ev) = slot.take() {
                self.backend.release_event(ev);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Work-size planning (pure)
// ---------------------------------------------------------------------------

/// Superblock-granularity dimensions of one tile, as the coarse kernels
/// see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoarseTileDims {
    /// Whole superblocks per frame row.
    pub sb_cols: u32,
    /// Whole superblock rows in this tile.
    pub sb_rows: u32,
    /// Superblock-row offset of this tile in the frame.
    pub sb_row_offset: u32,
}

pub fn coarse_tile_dims(geom: &FrameGeometry, plan: &TilePlan, tile: u32) -> CoarseTileDims {
    CoarseTileDims {
        sb_cols: geom.full_sb_cols(),
        sb_rows: plan.sb_rows(tile),
        sb_row_offset: plan.sb_row_offset(tile),
    }
}

/// Row projection: one work-group per superblock column plus one for the
/// prediction edge pad, one row of work-items per superblock row.
pub fn row_projection_range(d: &CoarseTileDims) -> NdRange {
    let local = [8, 1];
    NdRange::with_local(
        [0, d.sb_row_offset * local[1]],
        [(d.sb_cols + 1) * local[0], d.sb_rows * local[1]],
        local,
    )
}

/// Column projection: transposed shape, one extra row-group for the pad.
pub fn col_projection_range(d: &CoarseTileDims) -> NdRange {
    let local = [1, SB_SIZE];
    NdRange::with_local(
        [0, d.sb_row_offset * local[1]],
        [d.sb_cols * local[0], (d.sb_rows + 1) * local[1]],
        local,
    )
}

/// 1-D vector match over both projection planes.
pub fn vector_match_range(d: &CoarseTileDims) -> NdRange {
    let local = [8, 1];
    NdRange::with_local(
        [0, d.sb_row_offset * local[1]],
        [d.sb_cols * local[0], d.sb_rows * local[1]],
        local,
    )
}

/// Coarse motion estimation: each work-item covers 2^4 pixel rows of its
/// superblock.
pub fn coarse_me_range(d: &CoarseTileDims) -> NdRange {
    let local = [8, SB_SIZE >> COARSE_ROWS_PER_WORKITEM_LOG2];
    NdRange::with_local(
        [0, d.sb_row_offset * local[1]],
        [d.sb_cols * local[0], d.sb_rows * local[1]],
        local,
    )
}

/// Color sensitivity runs on the half-resolution chroma planes.
pub fn color_sensitivity_range(d: &CoarseTileDims) -> NdRange {
    let local = [4, (SB_SIZE / 2) >> COARSE_ROWS_PER_WORKITEM_LOG2];
    NdRange::with_local(
        [0, d.sb_row_offset * local[1]],
        [d.sb_cols * local[0], d.sb_rows * local[1]],
        local,
    )
}

/// Partition choice: one 8x8 work-group per superblock.
pub fn choose_partitions_range(d: &CoarseTileDims) -> NdRange {
    let local = [8, 8];
    NdRange::with_local(
        [0, d.sb_row_offset * local[1]],
        [d.sb_cols * local[0], d.sb_rows * local[1]],
        local,
    )
}

/// Block-granularity dimensions of one tile for one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FineTileDims {
    /// Blocks of the class per frame row.
    pub blocks_per_row: u32,
    /// Block rows of the class in this tile (0 skips the class).
    pub block_rows: u32,
    /// Block-row offset of this tile in the frame grid.
    pub block_row_offset: u32,
}

/// Fine dimensions, with the last-tile remainder rule: the final tile
/// gains one block row when the frame's leftover pixel rows exceed the
/// class's search span. Only the final tile absorbs the remainder.
pub fn fine_tile_dims(
    geom: &FrameGeometry,
    plan: &TilePlan,
    tile: u32,
    class: BlockClass,
) -> FineTileDims {
    let (mi_start, mi_end) = plan.mi_bounds(tile);
    let tile_pixels = (mi_end - mi_start) << MI_SIZE_LOG2;
    let mut block_rows = tile_pixels >> class.pixels_log2();
    if tile == plan.last_tile()
        && (geom.height & (class.pixels() - 1)) > class.search_span_pixels()
    {
        block_rows += 1;
    }
    FineTileDims {
        blocks_per_row: class.blocks_per_frame_row(geom),
        block_rows,
        block_row_offset: mi_start >> class.mi_height_log2(),
    }
}

/// Zero-MV cost: one work-item per block, device-chosen grouping.
pub fn zero_mv_range(d: &FineTileDims) -> NdRange {
    NdRange::without_local([0, d.block_row_offset], [d.blocks_per_row, d.block_rows])
}

/// Full-pel search: a work-group spans one block, each item covering
/// 8 pixels across and 2^3 rows down.
pub fn full_pixel_range(d: &FineTileDims, class: BlockClass) -> NdRange {
    let b = class.pixels();
    let local = [b / PIXELS_PER_WORKITEM, b >> class.rows_per_workitem_log2_full_pixel()];
    NdRange::with_local(
        [0, d.block_row_offset * local[1]],
        [d.blocks_per_row * local[0], d.block_rows * local[1]],
        local,
    )
}

/// Sub-pel refinement (half- and quarter-pel share the shape): eight
/// candidate positions widen the x dimension, and each item amortizes
/// more rows than at full-pel.
pub fn sub_pixel_range(d: &FineTileDims, class: BlockClass) -> NdRange {
    let b = class.pixels();
    let local =
        [(b / PIXELS_PER_WORKITEM) * 8, b >> class.rows_per_workitem_log2_sub_pixel()];
    NdRange::with_local(
        [0, d.block_row_offset * local[1]],
        [d.blocks_per_row * local[0], d.block_rows * local[1]],
        local,
    )
}

/// Merged inter-prediction + SSE: full-pel-like shape with the x
/// dimension doubled (both references predicted in one pass).
pub fn inter_pred_range(d: &FineTileDims, class: BlockClass) -> NdRange {
    let b = class.pixels();
    let local = [b / PIXELS_PER_WORKITEM, b >> class.rows_per_workitem_log2_inter_pred()];
    NdRange::with_local(
        [0, d.block_row_offset * local[1]],
        [d.blocks_per_row * local[0] * 2, d.block_rows * local[1]],
        local,
    )
}

/// Final RD cost: one work-item per block.
pub fn rd_cost_range(d: &FineTileDims) -> NdRange {
    NdRange::without_local([0, d.block_row_offset], [d.blocks_per_row, d.block_rows])
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Owns the compiled kernels and the completion-token table; enqueues
/// stages for the controller.
pub struct Pipeline {
    backend: Rc<dyn ComputeBackend>,
    cache: KernelCache,
    events: EventTable,
}

impl Pipeline {
    pub fn new(backend: Rc<dyn ComputeBackend>, cache: KernelCache, tile_count: u32) -> Self {
        let events = EventTable::new(Rc::clone(&backend), tile_count);
        Pipeline { backend, cache, events }
    }

    /// Bind the arguments that never change after allocation: strides,
    /// working buffers, output strides, plane sizes.
    pub fn bind_static_args(
        &self,
        bufs: &SessionBuffers,
        geom: &FrameGeometry,
    ) -> Result<(), GpuError> {
        let be = &self.backend;
        let stride = KernelArg::I32(geom.stride as i32);
        let yplane = KernelArg::I64(geom.yplane_size() as i64);
        let uvplane = KernelArg::I64(geom.uvplane_size() as i64);
        let c = &self.cache.coarse;

        be.set_kernel_arg(c.row_projection, 2, stride)?;
        be.set_kernel_arg(c.row_projection, 3, KernelArg::Buffer(bufs.src_rows_1d.id()))?;
        be.set_kernel_arg(c.row_projection, 4, KernelArg::Buffer(bufs.pred_rows_1d.id()))?;

        be.set_kernel_arg(c.col_projection, 2, stride)?;
        be.set_kernel_arg(c.col_projection, 3, KernelArg::Buffer(bufs.src_cols_1d.id()))?;
        be.set_kernel_arg(c.col_projection, 4, KernelArg::Buffer(bufs.pred_cols_1d.id()))?;
        // Column plane stride includes the edge pad.
        let col_stride = (geom.full_sb_rows() + 1) * SB_SIZE;
        be.set_kernel_arg(c.col_projection, 5, KernelArg::I32(col_stride as i32))?;

        be.set_kernel_arg(c.vector_match, 0, KernelArg::Buffer(bufs.src_rows_1d.id()))?;
        be.set_kernel_arg(c.vector_match, 1, KernelArg::Buffer(bufs.pred_rows_1d.id()))?;
        be.set_kernel_arg(c.vector_match, 2, KernelArg::Buffer(bufs.src_cols_1d.id()))?;
        be.set_kernel_arg(c.vector_match, 3, KernelArg::Buffer(bufs.pred_cols_1d.id()))?;
        be.set_kernel_arg(c.vector_match, 4, KernelArg::Buffer(bufs.coarse_out.id()))?;
        let match_stride = geom.full_sb_rows() * SB_SIZE;
        be.set_kernel_arg(c.vector_match, 5, KernelArg::I32(match_stride as i32))?;

        be.set_kernel_arg(c.coarse_me, 4, stride)?;
        be.set_kernel_arg(c.coarse_me, 5, KernelArg::Buffer(bufs.coarse_out.id()))?;

        be.set_kernel_arg(c.color_sensitivity, 3, stride)?;
        be.set_kernel_arg(c.color_sensitivity, 4, KernelArg::Buffer(bufs.coarse_out.id()))?;
        be.set_kernel_arg(c.color_sensitivity, 5, yplane)?;
        be.set_kernel_arg(c.color_sensitivity, 6, uvplane)?;

        be.set_kernel_arg(c.choose_partitions, 3, stride)?;
        be.set_kernel_arg(c.choose_partitions, 4, KernelArg::Buffer(bufs.coarse_out.id()))?;
        be.set_kernel_arg(c.choose_partitions, 5, KernelArg::Buffer(bufs.rd_params.id()))?;
        be.set_kernel_arg(c.choose_partitions, 6, KernelArg::Buffer(bufs.grid_in.id()))?;
        let part_stride = MERGED_STAGE_CLASS.blocks_per_frame_row(geom);
        be.set_kernel_arg(c.choose_partitions, 7, KernelArg::I32(part_stride as i32))?;

        for class in crate::block::BLOCK_CLASSES {
            let k = self.cache.fine(class);
            let grid_in = KernelArg::Buffer(bufs.grid_in.id());
            let fine_out = KernelArg::Buffer(bufs.fine_out.id());
            let rd = KernelArg::Buffer(bufs.rd_params.id());
            let scratch = KernelArg::Buffer(bufs.scratch.id());

            be.set_kernel_arg(k.zero_mv_rd, 2, stride)?;
            be.set_kernel_arg(k.zero_mv_rd, 3, grid_in)?;
            be.set_kernel_arg(k.zero_mv_rd, 4, fine_out)?;
            be.set_kernel_arg(k.zero_mv_rd, 5, rd)?;
            be.set_kernel_arg(k.zero_mv_rd, 6, yplane)?;
            be.set_kernel_arg(k.zero_mv_rd, 7, uvplane)?;

            be.set_kernel_arg(k.full_pixel_search, 2, stride)?;
            be.set_kernel_arg(k.full_pixel_search, 3, grid_in)?;
            be.set_kernel_arg(k.full_pixel_search, 4, fine_out)?;
            be.set_kernel_arg(k.full_pixel_search, 5, rd)?;
            be.set_kernel_arg(k.full_pixel_search, 6, KernelArg::I32(geom.mi_rows as i32))?;
            be.set_kernel_arg(k.full_pixel_search, 7, KernelArg::I32(geom.mi_cols as i32))?;

            be.set_kernel_arg(k.half_pel_refine, 2, stride)?;
            be.set_kernel_arg(k.half_pel_refine, 3, grid_in)?;
            be.set_kernel_arg(k.half_pel_refine, 4, fine_out)?;
            be.set_kernel_arg(k.half_pel_refine, 5, scratch)?;

            be.set_kernel_arg(k.quarter_pel_refine, 2, stride)?;
            be.set_kernel_arg(k.quarter_pel_refine, 3, grid_in)?;
            be.set_kernel_arg(k.quarter_pel_refine, 4, fine_out)?;
            be.set_kernel_arg(k.quarter_pel_refine, 5, scratch)?;

            be.set_kernel_arg(k.inter_pred_sse, 2, stride)?;
            be.set_kernel_arg(k.inter_pred_sse, 3, grid_in)?;
            be.set_kernel_arg(k.inter_pred_sse, 4, fine_out)?;
            be.set_kernel_arg(k.inter_pred_sse, 5, rd)?;
            be.set_kernel_arg(k.inter_pred_sse, 6, scratch)?;

            be.set_kernel_arg(k.rd_cost, 2, stride)?;
            be.set_kernel_arg(k.rd_cost, 3, grid_in)?;
            be.set_kernel_arg(k.rd_cost, 4, fine_out)?;
            be.set_kernel_arg(k.rd_cost, 5, rd)?;
            be.set_kernel_arg(k.rd_cost, 6, scratch)?;
        }
        Ok(())
    }

    /// Rebind the coarse kernels' per-frame arguments: plane handles and
    /// the analyse-golden flag.
    fn bind_dynamic_coarse(
        &self,
        bufs: &SessionBuffers,
        refs: &FrameRefs,
    ) -> Result<(), GpuError> {
        let be = &self.backend;
        let c = &self.cache.coarse;
        let src = KernelArg::Buffer(bufs.source.id());
        let last = KernelArg::Buffer(bufs.last_ref.id());
        let golden = KernelArg::OptBuffer(
            refs.golden_distinct.then(|| bufs.golden_ref.id()),
        );
        let analyse = KernelArg::I32(refs.golden_distinct as i32);

        be.set_kernel_arg(c.row_projection, 0, src)?;
        be.set_kernel_arg(c.row_projection, 1, last)?;

        be.set_kernel_arg(c.col_projection, 0, src)?;
        be.set_kernel_arg(c.col_projection, 1, last)?;

        be.set_kernel_arg(c.coarse_me, 0, src)?;
        be.set_kernel_arg(c.coarse_me, 1, last)?;
        be.set_kernel_arg(c.coarse_me, 2, golden)?;
        be.set_kernel_arg(c.coarse_me, 3, analyse)?;

        be.set_kernel_arg(c.color_sensitivity, 0, src)?;
        be.set_kernel_arg(c.color_sensitivity, 1, last)?;
        be.set_kernel_arg(c.color_sensitivity, 2, golden)?;

        be.set_kernel_arg(c.choose_partitions, 0, src)?;
        be.set_kernel_arg(c.choose_partitions, 1, last)?;
        be.set_kernel_arg(c.choose_partitions, 2, golden)?;
        Ok(())
    }

    /// Rebind one class's fine kernels' per-frame arguments. Argument
    /// order differs from the coarse stage: reference first, source
    /// second.
    fn bind_dynamic_fine(&self, bufs: &SessionBuffers, class: BlockClass)
        -> Result<(), GpuError> {
        let be = &self.backend;
        let k = self.cache.fine(class);
        let last = KernelArg::Buffer(bufs.last_ref.id());
        let src = KernelArg::Buffer(bufs.source.id());
        for kernel in [
            k.zero_mv_rd,
            k.full_pixel_search,
            k.half_pel_refine,
            k.quarter_pel_refine,
            k.inter_pred_sse,
            k.rd_cost,
        ] {
            be.set_kernel_arg(kernel, 0, last)?;
            be.set_kernel_arg(kernel, 1, src)?;
        }
        Ok(())
    }

    /// Enqueue the coarse stage for one GPU tile, flush, and record the
    /// (Prologue, tile) completion token.
    pub fn dispatch_prologue(
        &mut self,
        tile: u32,
        bufs: &mut SessionBuffers,
        geom: &FrameGeometry,
        plan: &TilePlan,
        refs: &FrameRefs,
    ) -> Result<(), GpuError> {
        self.bind_dynamic_coarse(bufs, refs)?;

        // Everything the coarse kernels read or write goes back to the
        // device before the first enqueue.
        bufs.source.release(false)?;
        bufs.last_ref.release(false)?;
        bufs.golden_ref.release(false)?;
        bufs.coarse_region_mut(plan, tile).release(false)?;
        bufs.rd_params.release(false)?;
        bufs.grid_in.release(false)?;

        let d = coarse_tile_dims(geom, plan, tile);
        let c = &self.cache.coarse;
        self.backend.enqueue_kernel(c.row_projection, &row_projection_range(&d))?;
        self.backend.enqueue_kernel(c.col_projection, &col_projection_range(&d))?;
        self.backend.enqueue_kernel(c.vector_match, &vector_match_range(&d))?;
        self.backend.enqueue_kernel(c.coarse_me, &coarse_me_range(&d))?;
        self.backend.enqueue_kernel(c.color_sensitivity, &color_sensitivity_range(&d))?;
        self.backend.enqueue_kernel(c.choose_partitions, &choose_partitions_range(&d))?;

        let event = self.backend.flush_marker()?;
        self.events.install(Stage::Prologue, tile, event);
        Ok(())
    }

    /// Enqueue the fine stage for one GPU tile, flush, and record the
    /// (Execute, tile) completion token. A class whose tile rows resolve
    /// to zero is skipped outright.
    pub fn dispatch_execute(
        &mut self,
        tile: u32,
        classes: &[BlockClass],
        bufs: &mut SessionBuffers,
        geom: &FrameGeometry,
        plan: &TilePlan,
    ) -> Result<(), GpuError> {
        bufs.rd_params.release(false)?;
        bufs.grid_in.release(false)?;
        bufs.fine_region_mut(plan, tile).release(false)?;

        for &class in classes {
            // Per-frame arguments are rebound once per frame, on the
            // first GPU tile.
            if tile == plan.first_gpu_tile() {
                self.bind_dynamic_fine(bufs, class)?;
            }

            let d = fine_tile_dims(geom, plan, tile, class);
            if d.block_rows == 0 {
                // Small frames: the last tiles may hold no whole block of
                // this class.
                continue;
            }

            let k = self.cache.fine(class);
            self.backend.enqueue_kernel(k.zero_mv_rd, &zero_mv_range(&d))?;
            self.backend.enqueue_kernel(k.full_pixel_search, &full_pixel_range(&d, class))?;
            self.backend.enqueue_kernel(k.half_pel_refine, &sub_pixel_range(&d, class))?;
            self.backend.enqueue_kernel(k.quarter_pel_refine, &sub_pixel_range(&d, class))?;
        }

        // One inter-prediction + RD pass at the designated class covers
        // the whole stage.
        if !classes.is_empty() {
            let class = MERGED_STAGE_CLASS;
            let d = fine_tile_dims(geom, plan, tile, class);
            if d.block_rows > 0 {
                let k = self.cache.fine(class);
                self.backend.enqueue_kernel(k.inter_pred_sse, &inter_pred_range(&d, class))?;
                self.backend.enqueue_kernel(k.rd_cost, &rd_cost_range(&d))?;
            }
        }

        let event = self.backend.flush_marker()?;
        self.events.install(Stage::Execute, tile, event);
        Ok(())
    }

    /// Block until the (stage, tile) token signals. The token stays in
    /// its slot; re-dispatching the slot releases it.
    pub fn wait(&self, stage: Stage, tile: u32) -> Result<(), GpuError> {
        let event = self.events.get(stage, tile).ok_or_else(|| GpuError::Wait {
            what: format!("no pending {stage:?} work for tile {tile}"),
        })?;
        self.backend.wait_event(event)
    }

    /// Release tokens and kernels. Consumes the pipeline; teardown runs
    /// exactly once.
    pub fn shutdown(mut self) {
        self.events.release_all();
        self.cache.release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::{BackendOp, NullBackend};

    // 1080p, 4 tiles, tile 0 host-only: the interior-tile shapes below
    // are checked against hand-computed numbers.
    fn setup() -> (FrameGeometry, TilePlan) {
        let geom = FrameGeometry::new(1920, 1080);
        let plan = TilePlan::new(&geom, 4, 1);
        (geom, plan)
    }

    #[test]
    fn coarse_ranges_for_interior_tile() {
        let (geom, plan) = setup();
        // 135 mi rows / 4 tiles -> nominal 34 mi rows; tile 1 = [34, 68).
        let d = coarse_tile_dims(&geom, &plan, 1);
        assert_eq!(d, CoarseTileDims { sb_cols: 30, sb_rows: 4, sb_row_offset: 4 });

        assert_eq!(
            row_projection_range(&d),
            NdRange::with_local([0, 4], [31 * 8, 4], [8, 1])
        );
        assert_eq!(
            col_projection_range(&d),
            NdRange::with_local([0, 256], [30, 5 * 64], [1, 64])
        );
        assert_eq!(
            vector_match_range(&d),
            NdRange::with_local([0, 4], [240, 4], [8, 1])
        );
        assert_eq!(coarse_me_range(&d), NdRange::with_local([0, 16], [240, 16], [8, 4]));
        assert_eq!(
            color_sensitivity_range(&d),
            NdRange::with_local([0, 8], [120, 8], [4, 2])
        );
        assert_eq!(
            choose_partitions_range(&d),
            NdRange::with_local([0, 32], [240, 32], [8, 8])
        );
    }

    #[test]
    fn fine_ranges_for_both_classes() {
        let (geom, plan) = setup();
        // Tile 1 = mi [34, 68): 272 pixel rows.
        let d32 = fine_tile_dims(&geom, &plan, 1, BlockClass::Size32);
        assert_eq!(
            d32,
            FineTileDims { blocks_per_row: 60, block_rows: 8, block_row_offset: 8 }
        );
        assert_eq!(zero_mv_range(&d32), NdRange::without_local([0, 8], [60, 8]));
        assert_eq!(
            full_pixel_range(&d32, BlockClass::Size32),
            NdRange::with_local([0, 32], [240, 32], [4, 4])
        );
        assert_eq!(
            sub_pixel_range(&d32, BlockClass::Size32),
            NdRange::with_local([0, 16], [1920, 16], [32, 2])
        );
        assert_eq!(
            inter_pred_range(&d32, BlockClass::Size32),
            NdRange::with_local([0, 32], [480, 32], [4, 4])
        );

        let d64 = fine_tile_dims(&geom, &plan, 1, BlockClass::Size64);
        assert_eq!(
            d64,
            FineTileDims { blocks_per_row: 30, block_rows: 4, block_row_offset: 4 }
        );
        assert_eq!(
            full_pixel_range(&d64, BlockClass::Size64),
            NdRange::with_local([0, 32], [240, 32], [8, 8])
        );
        assert_eq!(
            sub_pixel_range(&d64, BlockClass::Size64),
            NdRange::with_local([0, 8], [1920, 8], [64, 2])
        );
    }

    #[test]
    fn last_tile_remainder_rule() {
        let (geom, plan) = setup();
        // Tile 3 = mi [102, 135): 264 pixel rows. 1080 % 32 = 24 > 16, so
        // the 32-class gains a row; 1080 % 64 = 56 > 32, so the 64-class
        // does too. Interior tiles never do.
        let d32 = fine_tile_dims(&geom, &plan, 3, BlockClass::Size32);
        assert_eq!(d32.block_rows, 264 / 32 + 1);
        let d64 = fine_tile_dims(&geom, &plan, 3, BlockClass::Size64);
        assert_eq!(d64.block_rows, 264 / 64 + 1);
        let d_interior = fine_tile_dims(&geom, &plan, 2, BlockClass::Size32);
        assert_eq!(d_interior.block_rows, (34 * 8) / 32);
    }

    #[test]
    fn remainder_below_search_span_is_not_extended() {
        // 1032 = 16 * 64 + 8: 1032 % 64 = 8 <= 32 and 1032 % 32 = 8 <= 16,
        // so neither class extends the last tile.
        let geom = FrameGeometry::new(512, 1032);
        let plan = TilePlan::new(&geom, 4, 1);
        let d32 = fine_tile_dims(&geom, &plan, 3, BlockClass::Size32);
        let d64 = fine_tile_dims(&geom, &plan, 3, BlockClass::Size64);
        // 129 mi rows -> nominal 33 -> tile 3 = [99, 129): 240 px.
        assert_eq!(d32.block_rows, 240 / 32);
        assert_eq!(d64.block_rows, 240 / 64);
    }

    #[test]
    fn event_slot_reuse_releases_before_overwrite() {
        let be = Rc::new(NullBackend::new());
        let mut table = EventTable::new(be.clone() as Rc<dyn ComputeBackend>, 4);

        let e1 = be.flush_marker().unwrap();
        table.install(Stage::Prologue, 2, e1);
        let e2 = be.flush_marker().unwrap();
        table.install(Stage::Prologue, 2, e2);

        let ops = be.ops();
        // e1 was released when e2 took the slot.
        assert!(ops.contains(&BackendOp::ReleaseEvent { event: e1 }));
        assert_eq!(table.get(Stage::Prologue, 2), Some(e2));
        assert_eq!(be.live_events(), 1);

        // Distinct slots do not interfere.
        let e3 = be.flush_marker().unwrap();
        table.install(Stage::Execute, 2, e3);
        assert_eq!(table.get(Stage::Prologue, 2), Some(e2));
        assert_eq!(be.live_events(), 2);

        table.release_all();
        assert_eq!(be.live_events(), 0);
    }

    #[test]
    fn wait_without_dispatch_is_an_error() {
        let be = Rc::new(NullBackend::new());
        let cache =
            KernelCache::build(be.clone() as Rc<dyn ComputeBackend>).unwrap();
        let pipeline = Pipeline::new(be.clone() as Rc<dyn ComputeBackend>, cache, 4);
        assert!(matches!(pipeline.wait(Stage::Prologue, 1), Err(GpuError::Wait { .. })));
        pipeline.shutdown();
    }
}
