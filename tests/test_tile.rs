// tests/test_tile.rs -- Tile partition properties and fixed scenarios.

use dasher_v::geometry::FrameGeometry;
use dasher_v::tile::{tile_bounds, TilePlan};

// ===== Partition properties =====

#[test]
fn partition_covers_disjoint_ordered() {
    for rows in [4u32, 5, 63, 64, 128, 130, 135, 270, 1077] {
        for tiles in [1u32, 2, 3, 4] {
            if rows < tiles {
                continue;
            }
            let mut covered = 0;
            for i in 0..tiles {
                let (s, e) = tile_bounds(rows, tiles, i);
                assert_eq!(s, covered, "tiles must be contiguous ({rows}/{tiles})");
                assert!(e > s, "tiles must be non-empty ({rows}/{tiles})");
                covered = e;
            }
            assert_eq!(covered, rows, "tiles must cover the grid ({rows}/{tiles})");
        }
    }
}

#[test]
fn only_the_last_tile_deviates_from_nominal() {
    for rows in [130u32, 135, 1077] {
        let tiles = 4;
        let nominal = (rows + tiles - 1) / tiles;
        let mut total = 0;
        for i in 0..tiles - 1 {
            let (s, e) = tile_bounds(rows, tiles, i);
            assert_eq!(e - s, nominal, "interior tile height ({rows})");
            total += e - s;
        }
        let (s, e) = tile_bounds(rows, tiles, tiles - 1);
        total += e - s;
        assert_eq!(total, rows, "heights must sum to the grid ({rows})");
    }
}

// ===== Fixed scenarios =====

#[test]
fn grid_128_rows_4_tiles_1_reserved() {
    // 128 rows, 4 tiles, 1 host-only tile: tiles 1..3 offloaded, each 32
    // rows, bounds [32,64) [64,96) [96,128).
    let geom = FrameGeometry::new(512, 128 * 8);
    let plan = TilePlan::new(&geom, 4, 1);
    assert_eq!(plan.gpu_tiles().collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(plan.mi_bounds(1), (32, 64));
    assert_eq!(plan.mi_bounds(2), (64, 96));
    assert_eq!(plan.mi_bounds(3), (96, 128));
    for t in plan.gpu_tiles() {
        let (s, e) = plan.mi_bounds(t);
        assert_eq!(e - s, 32);
    }
}

#[test]
fn grid_130_rows_4_tiles_remainder() {
    // 130 rows, nominal ceil(130/4) = 33: tiles 0..2 get 33 rows, the
    // last absorbs the remainder and gets [99, 130) = 31 rows.
    assert_eq!(tile_bounds(130, 4, 0), (0, 33));
    assert_eq!(tile_bounds(130, 4, 1), (33, 66));
    assert_eq!(tile_bounds(130, 4, 2), (66, 99));
    assert_eq!(tile_bounds(130, 4, 3), (99, 130));
}
