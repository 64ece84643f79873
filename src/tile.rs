// tile.rs -- Horizontal tile partition of the coding-unit grid.
//
// A frame is split into T horizontal tiles of mi rows. The first C tiles
// are processed on the CPU only; tiles C..T-1 are dispatched to the GPU,
// one prologue + one execute stage each, so host work on one tile can
// overlap device work on another.
//
// The partition is exact: tiles are contiguous, cover [0, rows) with no
// gap or overlap, and only the last tile's height may differ from the
// nominal ceil(rows / tiles).

use crate::geometry::{FrameGeometry, MI_BLOCK_SIZE_LOG2};

/// Row bounds `[start, end)` of tile `index` when `rows` total rows are
/// split into `tiles` tiles.
///
/// `rows >= tiles > 0` and `index < tiles`. The last tile absorbs the
/// remainder when `rows` is not divisible by `tiles`.
pub fn tile_bounds(rows: u32, tiles: u32, index: u32) -> (u32, u32) {
    assert!(tiles > 0 && rows >= tiles, "need rows >= tiles > 0 (rows={rows}, tiles={tiles})");
    assert!(index < tiles, "tile index {index} out of range 0..{tiles}");
    let nominal = (rows + tiles - 1) / tiles;
    let start = (index * nominal).min(rows);
    let end = if index == tiles - 1 { rows } else { ((index + 1) * nominal).min(rows) };
    (start, end)
}

/// The fixed tile layout of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    /// Total mi rows being partitioned.
    pub mi_rows: u32,
    /// Total tile count T.
    pub count: u32,
    /// Reserved host-only tiles C (< T); tiles 0..C never receive GPU work.
    pub cpu_tiles: u32,
}

impl TilePlan {
    pub fn new(geom: &FrameGeometry, count: u32, cpu_tiles: u32) -> Self {
        assert!(cpu_tiles < count, "need at least one GPU tile (C={cpu_tiles}, T={count})");
        TilePlan { mi_rows: geom.mi_rows, count, cpu_tiles }
    }

    /// mi-row bounds `[start, end)` of a tile.
    pub fn mi_bounds(&self, tile: u32) -> (u32, u32) {
        tile_bounds(self.mi_rows, self.count, tile)
    }

    /// Superblock-row count of a tile (truncating, as the coarse kernels
    /// count whole superblocks).
    pub fn sb_rows(&self, tile: u32) -> u32 {
        let (start, end) = self.mi_bounds(tile);
        (end - start) >> MI_BLOCK_SIZE_LOG2
    }

    /// Superblock-row offset of a tile within the frame grid.
    pub fn sb_row_offset(&self, tile: u32) -> u32 {
        self.mi_bounds(tile).0 >> MI_BLOCK_SIZE_LOG2
    }

    pub fn is_gpu_tile(&self, tile: u32) -> bool {
        tile >= self.cpu_tiles && tile < self.count
    }

    /// First tile that receives GPU dispatch.
    pub fn first_gpu_tile(&self) -> u32 {
        self.cpu_tiles
    }

    pub fn last_tile(&self) -> u32 {
        self.count - 1
    }

    /// GPU tile indices, in frame order.
    pub fn gpu_tiles(&self) -> impl Iterator<Item = u32> {
        self.cpu_tiles..self.count
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_exactly() {
        // No gap, no overlap, ordered, for a spread of (rows, tiles) pairs.
        for rows in [4u32, 7, 16, 33, 128, 130, 135, 1077] {
            for tiles in 1..=4u32.min(rows) {
                let mut expect_start = 0;
                let mut total = 0;
                for i in 0..tiles {
                    let (s, e) = tile_bounds(rows, tiles, i);
                    assert_eq!(s, expect_start, "gap/overlap at tile {i} ({rows}/{tiles})");
                    assert!(e > s, "empty tile {i} ({rows}/{tiles})");
                    total += e - s;
                    expect_start = e;
                }
                assert_eq!(expect_start, rows);
                assert_eq!(total, rows);
            }
        }
    }

    #[test]
    fn remainder_goes_to_last_tile_only() {
        // rows not divisible by tiles: every tile but the last has the
        // nominal height.
        let rows = 130;
        let tiles = 4;
        let nominal = (rows + tiles - 1) / tiles;
        for i in 0..tiles - 1 {
            let (s, e) = tile_bounds(rows, tiles, i);
            assert_eq!(e - s, nominal);
        }
        let (s, e) = tile_bounds(rows, tiles, tiles - 1);
        assert_eq!((s, e), (99, 130));
        assert_eq!(e - s, 31);
    }

    #[test]
    fn even_split_128_rows_4_tiles() {
        // 128 rows over 4 tiles: 32 each, with tile 0 reserved for the CPU.
        let geom = FrameGeometry::new(512, 128 * 8);
        let plan = TilePlan::new(&geom, 4, 1);
        assert!(!plan.is_gpu_tile(0));
        assert_eq!(plan.gpu_tiles().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(plan.mi_bounds(1), (32, 64));
        assert_eq!(plan.mi_bounds(2), (64, 96));
        assert_eq!(plan.mi_bounds(3), (96, 128));
    }

    #[test]
    fn sb_rows_and_offsets() {
        let geom = FrameGeometry::new(512, 128 * 8);
        let plan = TilePlan::new(&geom, 4, 1);
        for t in 0..4 {
            assert_eq!(plan.sb_rows(t), 4); // 32 mi rows = 4 superblock rows
            assert_eq!(plan.sb_row_offset(t), t * 4);
        }
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn tile_index_out_of_range_panics() {
        tile_bounds(64, 4, 4);
    }
}
