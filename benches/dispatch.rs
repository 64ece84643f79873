// benches/dispatch.rs -- Host-side dispatch overhead.
//
// Everything here runs on the null backend: the numbers measure the
// crate's own bookkeeping (planning arithmetic, argument binding,
// release/enqueue sequencing), not device time.
//
//   cargo bench

use std::rc::Rc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use dasher_v::block::{BlockClass, BLOCK_CLASSES};
use dasher_v::geometry::FrameGeometry;
use dasher_v::gpu::backend::ComputeBackend;
use dasher_v::gpu::controller::{GpuMotionSearch, OffloadConfig};
use dasher_v::gpu::dispatch::{fine_tile_dims, full_pixel_range, Stage};
use dasher_v::gpu::null::NullBackend;
use dasher_v::offload::MotionSearchOffload;
use dasher_v::tile::TilePlan;

fn bench_planning(c: &mut Criterion) {
    let geom = FrameGeometry::new(1920, 1080);
    let plan = TilePlan::new(&geom, 4, 1);
    c.bench_function("plan_fine_ranges_1080p", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for tile in plan.gpu_tiles() {
                for class in BLOCK_CLASSES {
                    let d = fine_tile_dims(&geom, &plan, tile, class);
                    acc = acc.wrapping_add(full_pixel_range(&d, class).global_size[1]);
                }
            }
            acc
        })
    });
}

fn bench_frame_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_dispatch");
    for (label, w, h) in [("720p", 1280u32, 720u32), ("1080p", 1920, 1080)] {
        group.bench_with_input(BenchmarkId::from_parameter(label), &(w, h), |b, &(w, h)| {
            let be = Rc::new(NullBackend::new());
            let mut ctl =
                GpuMotionSearch::new(be.clone() as Rc<dyn ComputeBackend>, OffloadConfig::default())
                    .unwrap();
            ctl.allocate(FrameGeometry::new(w, h)).unwrap();

            b.iter(|| {
                for tile in 1..4 {
                    ctl.dispatch_prologue(tile).unwrap();
                }
                for tile in 1..4 {
                    ctl.wait_for_tile(Stage::Prologue, tile).unwrap();
                    ctl.dispatch_execute(tile, &[BlockClass::Size32, BlockClass::Size64])
                        .unwrap();
                }
                for tile in 1..4 {
                    ctl.wait_for_tile(Stage::Execute, tile).unwrap();
                }
                // The log is a test aid; keep it from growing across
                // iterations.
                be.clear_ops();
            });

            ctl.shutdown().unwrap();
        });
    }
    group.finish();
}

criterion_group!(benches, bench_planning, bench_frame_dispatch);
criterion_main!(benches);
