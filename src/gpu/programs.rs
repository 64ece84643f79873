// gpu/programs.rs -- Kernel program cache.
//
// Four source units cover the twelve kernel entry points:
//
//   partition.wgsl  row_projection, col_projection, vector_match,
//                   coarse_me, color_sensitivity, choose_partitions
//                   (compiled once, superblock granularity)
//   rd.wgsl         zero_mv_rd, inter_pred_sse, rd_cost   (per class)
//   fullpel.wgsl    full_pixel_search                     (per class)
//   subpel.wgsl     half_pel_refine, quarter_pel_refine   (per class)
//
// Each unit is compiled with the block pixel size and the rows-per-
// workitem count baked in by string substitution before the backend sees
// the source, so every block-size class gets its own specialized program
// and the kernels never branch on block size at runtime. Compilation is
// synchronous, happens once per session before the first frame, and a
// failure is fatal (no partial kernel set is ever exposed).
//
// SHADER PARAMETERS BAKED AT COMPILE TIME
//   {{BLOCK_SIZE_IN_PIXELS}}     block edge (64 for the partition unit)
//   {{PIXEL_ROWS_PER_WORKITEM}}  rows amortized per work-item
//
// `release(self)` consumes the cache: handles are released exactly once
// and a second release does not typecheck.

use std::rc::Rc;

use crate::block::{BlockClass, BLOCK_CLASSES, COARSE_ROWS_PER_WORKITEM_LOG2};
use crate::geometry::SB_SIZE;
use crate::gpu::backend::{ComputeBackend, GpuError, KernelId, ProgramId};

/// Kernel entry-point names, shared with the WGSL sources.
pub mod entry {
    pub const ROW_PROJECTION: &str = "row_projection";
    pub const COL_PROJECTION: &str = "col_projection";
    pub const VECTOR_MATCH: &str = "vector_match";
    pub const COARSE_ME: &str = "coarse_me";
    pub const COLOR_SENSITIVITY: &str = "color_sensitivity";
    pub const CHOOSE_PARTITIONS: &str = "choose_partitions";
    pub const ZERO_MV_RD: &str = "zero_mv_rd";
    pub const FULL_PIXEL_SEARCH: &str = "full_pixel_search";
    pub const HALF_PEL_REFINE: &str = "half_pel_refine";
    pub const QUARTER_PEL_REFINE: &str = "quarter_pel_refine";
    pub const INTER_PRED_SSE: &str = "inter_pred_sse";
    pub const RD_COST: &str = "rd_cost";
}

const PARTITION_SRC: &str = include_str!("../shaders/partition.wgsl");
const RD_SRC: &str = include_str!("../shaders/rd.wgsl");
const FULLPEL_SRC: &str = include_str!("../shaders/fullpel.wgsl");
const SUBPEL_SRC: &str = include_str!("../shaders/subpel.wgsl");

/// The six coarse-stage kernels (one variant total).
pub struct CoarseKernels {
    pub row_projection: KernelId,
    pub col_projection: KernelId,
    pub vector_match: KernelId,
    pub coarse_me: KernelId,
    pub color_sensitivity: KernelId,
    pub choose_partitions: KernelId,
}

/// The six fine-stage kernels of one block-size class.
pub struct FineKernels {
    pub zero_mv_rd: KernelId,
    pub full_pixel_search: KernelId,
    pub half_pel_refine: KernelId,
    pub quarter_pel_refine: KernelId,
    pub inter_pred_sse: KernelId,
    pub rd_cost: KernelId,
}

/// Compiled kernel handles for one session.
pub struct KernelCache {
    backend: Rc<dyn ComputeBackend>,
    pub coarse: CoarseKernels,
    fine: [FineKernels; 2],
    programs: Vec<ProgramId>,
    kernels: Vec<KernelId>,
}

/// Bake the build-time macros into a source unit.
fn substitute(template: &str, block_pixels: u32, rows_per_workitem: u32) -> String {
    template
        .replace("{{BLOCK_SIZE_IN_PIXELS}}", &block_pixels.to_string())
        .replace("{{PIXEL_ROWS_PER_WORKITEM}}", &rows_per_workitem.to_string())
}

/// Tracks handles during a build so a mid-build failure releases
/// everything acquired so far before propagating.
struct BuildTracker {
    backend: Rc<dyn ComputeBackend>,
    programs: Vec<ProgramId>,
    kernels: Vec<KernelId>,
}

impl BuildTracker {
    fn program(&mut self, label: &str, source: &str) -> Result<ProgramId, GpuError> {
        let id = self.backend.build_program(label, source)?;
        self.programs.push(id);
        Ok(id)
    }

    fn kernel(&mut self, program: ProgramId, entry: &str) -> Result<KernelId, GpuError> {
        let id = self.backend.create_kernel(program, entry)?;
        self.kernels.push(id);
        Ok(id)
    }

    fn abort(self) {
        for &k in &self.kernels {
            self.backend.release_kernel(k);
        }
        for &p in &self.programs {
            self.backend.release_program(p);
        }
    }
}

impl KernelCache {
    /// Compile every kernel variant. Fatal on the first failure; nothing
    /// stays allocated on the error path.
    pub fn build(backend: Rc<dyn ComputeBackend>) -> Result<Self, GpuError> {
        let mut t = BuildTracker { backend: Rc::clone(&backend), programs: Vec::new(), kernels: Vec::new() };
        match Self::build_inner(&mut t) {
            Ok((coarse, fine)) => Ok(KernelCache {
                backend,
                coarse,
                fine,
                programs: std::mem::take(&mut t.programs),
                kernels: std::mem::take(&mut t.kernels),
            }),
            Err(e) => {
                t.abort();
                Err(e)
            }
        }
    }

    fn build_inner(
        t: &mut BuildTracker,
    ) -> Result<(CoarseKernels, [FineKernels; 2]), GpuError> {
        // Partition unit: one variant at superblock granularity.
        let src = substitute(PARTITION_SRC, SB_SIZE, 1 << COARSE_ROWS_PER_WORKITEM_LOG2);
        let p = t.program("partition", &src)?;
        let coarse = CoarseKernels {
            row_projection: t.kernel(p, entry::ROW_PROJECTION)?,
            col_projection: t.kernel(p, entry::COL_PROJECTION)?,
            vector_match: t.kernel(p, entry::VECTOR_MATCH)?,
            coarse_me: t.kernel(p, entry::COARSE_ME)?,
            color_sensitivity: t.kernel(p, entry::COLOR_SENSITIVITY)?,
            choose_partitions: t.kernel(p, entry::CHOOSE_PARTITIONS)?,
        };

        let mut fine = Vec::with_capacity(BLOCK_CLASSES.len());
        for class in BLOCK_CLASSES {
            fine.push(Self::build_class(t, class)?);
        }
        let fine: [FineKernels; 2] =
            fine.try_into().unwrap_or_else(|_| unreachable!("two classes"));
        Ok((coarse, fine))
    }

    fn build_class(t: &mut BuildTracker, class: BlockClass) -> Result<FineKernels, GpuError> {
        let pixels = class.pixels();

        let src = substitute(RD_SRC, pixels, 1 << class.rows_per_workitem_log2_inter_pred());
        let rd = t.program(&format!("rd{pixels}"), &src)?;

        let src =
            substitute(FULLPEL_SRC, pixels, 1 << class.rows_per_workitem_log2_full_pixel());
        let fullpel = t.program(&format!("fullpel{pixels}"), &src)?;

        let src = substitute(SUBPEL_SRC, pixels, 1 << class.rows_per_workitem_log2_sub_pixel());
        let subpel = t.program(&format!("subpel{pixels}"), &src)?;

        Ok(FineKernels {
            zero_mv_rd: t.kernel(rd, entry::ZERO_MV_RD)?,
            inter_pred_sse: t.kernel(rd, entry::INTER_PRED_SSE)?,
            rd_cost: t.kernel(rd, entry::RD_COST)?,
            full_pixel_search: t.kernel(fullpel, entry::FULL_PIXEL_SEARCH)?,
            half_pel_refine: t.kernel(subpel, entry::HALF_PEL_REFINE)?,
            quarter_pel_refine: t.kernel(subpel, entry::QUARTER_PEL_REFINE)?,
        })
    }

    /// Fine-stage kernels of one class.
    pub fn fine(&self, class: BlockClass) -> &FineKernels {
        &self.fine[class.index()]
    }

    /// Release every kernel and program. Consuming `self` makes a double
    /// release unrepresentable.
    pub fn release(self) {
        for &k in &self.kernels {
            self.backend.release_kernel(k);
        }
        for &p in &self.programs {
            self.backend.release_program(p);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::{BackendOp, NullBackend};

    #[test]
    fn substitution_leaves_no_placeholders() {
        for (unit, rows) in [(PARTITION_SRC, 16u32), (RD_SRC, 8), (FULLPEL_SRC, 8), (SUBPEL_SRC, 16)]
        {
            let s = substitute(unit, 32, rows);
            assert!(!s.contains("{{"), "unsubstituted macro left in source");
        }
    }

    #[test]
    fn builds_one_partition_unit_and_three_units_per_class() {
        let be = Rc::new(NullBackend::new());
        let cache = KernelCache::build(be.clone() as Rc<dyn ComputeBackend>).unwrap();
        let ops = be.ops();
        let programs =
            ops.iter().filter(|op| matches!(op, BackendOp::BuildProgram { .. })).count();
        let kernels = ops.iter().filter(|op| matches!(op, BackendOp::CreateKernel { .. })).count();
        assert_eq!(programs, 1 + 3 * BLOCK_CLASSES.len());
        assert_eq!(kernels, 6 + 6 * BLOCK_CLASSES.len());
        assert_eq!(be.live_programs(), 7);
        assert_eq!(be.live_kernels(), 18);
        cache.release();
        assert_eq!(be.live_programs(), 0);
        assert_eq!(be.live_kernels(), 0);
    }

    #[test]
    fn class_kernels_are_distinct_variants() {
        let be = Rc::new(NullBackend::new());
        let cache = KernelCache::build(be.clone() as Rc<dyn ComputeBackend>).unwrap();
        let k32 = cache.fine(BlockClass::Size32).full_pixel_search;
        let k64 = cache.fine(BlockClass::Size64).full_pixel_search;
        assert_ne!(k32, k64);
        assert_eq!(be.kernel_entry(k32).as_deref(), Some(entry::FULL_PIXEL_SEARCH));
        assert_eq!(be.kernel_entry(k64).as_deref(), Some(entry::FULL_PIXEL_SEARCH));
        cache.release();
    }
}
