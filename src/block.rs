// block.rs -- GPU block-size classes and per-kernel work-item granularity.
//
// The fine-search kernels are compiled once per block-size class with the
// class's pixel size and rows-per-workitem baked in as build-time macros.
// Two classes are offloaded: 32x32 and 64x64. The finest class (32x32)
// has the most blocks per frame, so worst-case grid buffers are sized for
// it and cover the coarser class too.
//
// Rows-per-workitem shrink as the search refines: a sub-pel work-item
// amortizes more output rows than a full-pel one, keeping the per-
// invocation footprint bounded across classes.

use crate::geometry::{FrameGeometry, MI_SIZE_LOG2, SB_SIZE};

/// Pixels covered per work-item in the x dimension, all fine-search
/// kernels.
pub const PIXELS_PER_WORKITEM: u32 = 8;

/// log2 of rows handled per work-item by the coarse-search kernels
/// (single variant, not per class).
pub const COARSE_ROWS_PER_WORKITEM_LOG2: u32 = 4;

// Per-class rows-per-workitem (log2), indexed by BlockClass::index().
const ROWS_LOG2_INTER_PRED: [u32; 2] = [3, 3];
const ROWS_LOG2_FULL_PIXEL: [u32; 2] = [3, 3];
const ROWS_LOG2_SUB_PIXEL: [u32; 2] = [4, 5];

/// A block-size class with its own compiled kernel variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockClass {
    /// 32x32 blocks: finest offloaded class, most blocks per frame.
    Size32,
    /// 64x64 blocks: one block per superblock.
    Size64,
}

/// All classes, finest first (the execute stage walks them in
/// increasing-refinement order).
pub const BLOCK_CLASSES: [BlockClass; 2] = [BlockClass::Size32, BlockClass::Size64];

/// Class used for the merged inter-prediction + RD stage (the lowest
/// offloaded class; one prediction pass at this granularity is amortized
/// across the whole class).
pub const MERGED_STAGE_CLASS: BlockClass = BlockClass::Size32;

impl BlockClass {
    pub fn index(self) -> usize {
        match self {
            BlockClass::Size32 => 0,
            BlockClass::Size64 => 1,
        }
    }

    /// Block edge in pixels.
    pub fn pixels(self) -> u32 {
        match self {
            BlockClass::Size32 => 32,
            BlockClass::Size64 => 64,
        }
    }

    pub fn pixels_log2(self) -> u32 {
        match self {
            BlockClass::Size32 => 5,
            BlockClass::Size64 => 6,
        }
    }

    /// Blocks of this class along one superblock edge.
    pub fn blocks_per_sb(self) -> u32 {
        SB_SIZE / self.pixels()
    }

    /// log2 of the block height in mi units.
    pub fn mi_height_log2(self) -> u32 {
        self.pixels_log2() - MI_SIZE_LOG2
    }

    /// Motion-search span in pixels; a partial bottom row of blocks is
    /// only worth dispatching when more than this many of its pixel rows
    /// are inside the frame.
    pub fn search_span_pixels(self) -> u32 {
        self.pixels() / 2
    }

    pub fn rows_per_workitem_log2_full_pixel(self) -> u32 {
        ROWS_LOG2_FULL_PIXEL[self.index()]
    }

    pub fn rows_per_workitem_log2_sub_pixel(self) -> u32 {
        ROWS_LOG2_SUB_PIXEL[self.index()]
    }

    pub fn rows_per_workitem_log2_inter_pred(self) -> u32 {
        ROWS_LOG2_INTER_PRED[self.index()]
    }

    /// Blocks of this class per frame row (frame-wide, all tiles).
    pub fn blocks_per_frame_row(self, geom: &FrameGeometry) -> u32 {
        geom.sb_cols * self.blocks_per_sb()
    }

    /// Blocks of this class per frame column.
    pub fn blocks_per_frame_col(self, geom: &FrameGeometry) -> u32 {
        geom.sb_rows * self.blocks_per_sb()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_grid_arithmetic() {
        assert_eq!(BlockClass::Size32.pixels(), 32);
        assert_eq!(BlockClass::Size32.blocks_per_sb(), 2);
        assert_eq!(BlockClass::Size32.mi_height_log2(), 2);
        assert_eq!(BlockClass::Size64.pixels(), 64);
        assert_eq!(BlockClass::Size64.blocks_per_sb(), 1);
        assert_eq!(BlockClass::Size64.mi_height_log2(), 3);
    }

    #[test]
    fn workitem_granularity_tables() {
        // Full-pel and inter-pred amortize 8 rows per work-item for both
        // classes; sub-pel amortizes 16 for 32x32 and 32 for 64x64.
        assert_eq!(BlockClass::Size32.rows_per_workitem_log2_full_pixel(), 3);
        assert_eq!(BlockClass::Size64.rows_per_workitem_log2_full_pixel(), 3);
        assert_eq!(BlockClass::Size32.rows_per_workitem_log2_sub_pixel(), 4);
        assert_eq!(BlockClass::Size64.rows_per_workitem_log2_sub_pixel(), 5);
        assert_eq!(BlockClass::Size32.rows_per_workitem_log2_inter_pred(), 3);
        assert_eq!(BlockClass::Size64.rows_per_workitem_log2_inter_pred(), 3);
        assert_eq!(COARSE_ROWS_PER_WORKITEM_LOG2, 4);
    }

    #[test]
    fn search_span_is_half_block() {
        assert_eq!(BlockClass::Size32.search_span_pixels(), 16);
        assert_eq!(BlockClass::Size64.search_span_pixels(), 32);
    }

    #[test]
    fn worst_case_grid_is_the_finest_class() {
        let geom = FrameGeometry::new(1920, 1080);
        let fine = BlockClass::Size32;
        let coarse = BlockClass::Size64;
        let fine_count = fine.blocks_per_frame_row(&geom) * fine.blocks_per_frame_col(&geom);
        let coarse_count =
            coarse.blocks_per_frame_row(&geom) * coarse.blocks_per_frame_col(&geom);
        assert!(fine_count >= coarse_count);
        assert_eq!(fine_count, 60 * 34);
    }
}
