// gpu/controller.rs -- The GPU offload controller.
//
// Glue between the encoder frame loop (offload.rs contract) and the
// pipeline/buffer/program modules. Lifecycle:
//
//   new()        compile every kernel variant (fatal on failure)
//   allocate()   size and create the session buffers, bind static args
//   per frame:   set_frame_refs, acquire/fill inputs, dispatch, wait,
//                read outputs
//   free()       drop session buffers (resolution change or teardown)
//   shutdown()   release tokens, kernels, programs
//
// allocate() must precede any acquire or dispatch; that ordering is a
// caller contract and violations panic rather than limp.

use std::rc::Rc;
use std::time::Instant;

use crate::block::BlockClass;
use crate::geometry::FrameGeometry;
use crate::offload::{DispatchObserver, FrameRefs, MotionSearchOffload, NoopObserver};
use crate::tile::TilePlan;
use crate::gpu::backend::{ComputeBackend, GpuError, HostPtr, MapMode};
use crate::gpu::buffers::SessionBuffers;
use crate::gpu::dispatch::{Pipeline, Stage};
use crate::gpu::programs::KernelCache;

/// Session-wide offload configuration.
#[derive(Debug, Clone, Copy)]
pub struct OffloadConfig {
    /// Total tile count T.
    pub tile_count: u32,
    /// Leading tiles reserved for host-only processing (C < T).
    pub cpu_tiles: u32,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        OffloadConfig { tile_count: 4, cpu_tiles: 1 }
    }
}

/// The real motion-search offload.
pub struct GpuMotionSearch {
    backend: Rc<dyn ComputeBackend>,
    config: OffloadConfig,
    pipeline: Option<Pipeline>,
    buffers: Option<SessionBuffers>,
    geom: Option<FrameGeometry>,
    plan: Option<TilePlan>,
    refs: FrameRefs,
    observer: Box<dyn DispatchObserver>,
}

impl GpuMotionSearch {
    /// Compile all kernel variants and prepare the pipeline. Compilation
    /// failure is fatal to the session.
    pub fn new(backend: Rc<dyn ComputeBackend>, config: OffloadConfig)
        -> Result<Self, GpuError> {
        assert!(
            config.cpu_tiles < config.tile_count,
            "need at least one GPU tile (C={}, T={})",
            config.cpu_tiles,
            config.tile_count
        );
        let cache = KernelCache::build(Rc::clone(&backend))?;
        let pipeline = Pipeline::new(Rc::clone(&backend), cache, config.tile_count);
        eprintln!(
            "[dasher-v] offload ready: {} tiles ({} host-only)",
            config.tile_count, config.cpu_tiles
        );
        Ok(GpuMotionSearch {
            backend,
            config,
            pipeline: Some(pipeline),
            buffers: None,
            geom: None,
            plan: None,
            refs: FrameRefs::default(),
            observer: Box::new(NoopObserver),
        })
    }

    /// Swap in an instrumentation hook.
    pub fn with_observer(mut self, observer: Box<dyn DispatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    fn buffers_mut(&mut self) -> &mut SessionBuffers {
        self.buffers.as_mut().expect("allocate() before acquiring or dispatching")
    }

    fn pipeline_mut(&mut self) -> &mut Pipeline {
        self.pipeline.as_mut().expect("controller already shut down")
    }
}

impl MotionSearchOffload for GpuMotionSearch {
    fn is_enabled(&self) -> bool {
        true
    }

    fn allocate(&mut self, geom: FrameGeometry) -> Result<(), GpuError> {
        // Resolution change: the old set goes first.
        self.buffers = None;
        let plan = TilePlan::new(&geom, self.config.tile_count, self.config.cpu_tiles);
        let buffers = SessionBuffers::allocate(&self.backend, &geom, &plan)?;
        self.pipeline_mut().bind_static_args(&buffers, &geom)?;
        eprintln!(
            "[dasher-v] session buffers: {}x{} ({} mi rows, {} GPU tiles)",
            geom.width,
            geom.height,
            geom.mi_rows,
            plan.count - plan.cpu_tiles
        );
        self.buffers = Some(buffers);
        self.geom = Some(geom);
        self.plan = Some(plan);
        Ok(())
    }

    fn set_frame_refs(&mut self, refs: FrameRefs) {
        self.refs = refs;
    }

    fn acquire_input_grid(&mut self) -> Result<HostPtr, GpuError> {
        self.buffers_mut().grid_in.acquire(MapMode::Write)
    }

    fn acquire_rd_params(&mut self) -> Result<HostPtr, GpuError> {
        self.buffers_mut().rd_params.acquire(MapMode::Write)
    }

    fn acquire_source_plane(&mut self) -> Result<HostPtr, GpuError> {
        self.buffers_mut().source.acquire(MapMode::Write)
    }

    fn acquire_reference_plane(&mut self) -> Result<HostPtr, GpuError> {
        self.buffers_mut().last_ref.acquire(MapMode::Write)
    }

    fn acquire_golden_plane(&mut self) -> Result<HostPtr, GpuError> {
        self.buffers_mut().golden_ref.acquire(MapMode::Write)
    }

    fn acquire_coarse_output(&mut self, tile: u32) -> Result<HostPtr, GpuError> {
        let plan = self.plan.expect("allocate() before acquiring");
        self.buffers_mut().coarse_region_mut(&plan, tile).acquire(MapMode::Read)
    }

    fn acquire_fine_output(&mut self, tile: u32) -> Result<HostPtr, GpuError> {
        let plan = self.plan.expect("allocate() before acquiring");
        self.buffers_mut().fine_region_mut(&plan, tile).acquire(MapMode::Read)
    }

    fn dispatch_prologue(&mut self, tile: u32) -> Result<(), GpuError> {
        let geom = self.geom.expect("allocate() before dispatching");
        let plan = self.plan.expect("allocate() before dispatching");
        let refs = self.refs;
        let buffers = self.buffers.as_mut().expect("allocate() before dispatching");
        self.pipeline
            .as_mut()
            .expect("controller already shut down")
            .dispatch_prologue(tile, buffers, &geom, &plan, &refs)?;
        self.observer.stage_dispatched(Stage::Prologue, tile);
        Ok(())
    }

    fn dispatch_execute(&mut self, tile: u32, classes: &[BlockClass]) -> Result<(), GpuError> {
        let geom = self.geom.expect("allocate() before dispatching");
        let plan = self.plan.expect("allocate() before dispatching");
        let buffers = self.buffers.as_mut().expect("allocate() before dispatching");
        self.pipeline
            .as_mut()
            .expect("controller already shut down")
            .dispatch_execute(tile, classes, buffers, &geom, &plan)?;
        self.observer.stage_dispatched(Stage::Execute, tile);
        Ok(())
    }

    fn wait_for_tile(&mut self, stage: Stage, tile: u32) -> Result<(), GpuError> {
        let start = Instant::now();
        self.pipeline_mut().wait(stage, tile)?;
        self.observer.stage_waited(stage, tile, start.elapsed());
        Ok(())
    }

    fn free(&mut self) -> Result<(), GpuError> {
        if let Some(buffers) = self.buffers.take() {
            buffers.free();
        }
        self.geom = None;
        self.plan = None;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), GpuError> {
        self.free()?;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests (full pipeline flows live in tests/test_pipeline.rs)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullBackend;

    fn controller() -> (Rc<NullBackend>, GpuMotionSearch) {
        let be = Rc::new(NullBackend::new());
        let ctl = GpuMotionSearch::new(be.clone() as Rc<dyn ComputeBackend>,
                                       OffloadConfig::default())
            .unwrap();
        (be, ctl)
    }

    #[test]
    fn allocate_then_acquire_round_trip() {
        let (_be, mut ctl) = controller();
        ctl.allocate(FrameGeometry::new(640, 480)).unwrap();
        let grid = ctl.acquire_input_grid().unwrap();
        assert!(grid.len() > 0);
        // Double acquire of the same resource is detected.
        assert!(ctl.acquire_input_grid().is_err());
        ctl.shutdown().unwrap();
    }

    #[test]
    fn shutdown_releases_every_handle() {
        let (be, mut ctl) = controller();
        ctl.allocate(FrameGeometry::new(640, 480)).unwrap();
        ctl.shutdown().unwrap();
        assert_eq!(be.live_buffers(), 0);
        assert_eq!(be.live_kernels(), 0);
        assert_eq!(be.live_programs(), 0);
        assert_eq!(be.live_events(), 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (_be, mut ctl) = controller();
        ctl.shutdown().unwrap();
        ctl.shutdown().unwrap();
    }

    #[test]
    #[should_panic(expected = "allocate() before")]
    fn dispatch_without_allocate_panics() {
        let (_be, mut ctl) = controller();
        let _ = ctl.dispatch_prologue(1);
    }

    #[test]
    fn reallocate_replaces_the_session_buffers() {
        let (be, mut ctl) = controller();
        ctl.allocate(FrameGeometry::new(640, 480)).unwrap();
        let first = be.live_buffers();
        ctl.allocate(FrameGeometry::new(1280, 720)).unwrap();
        // The old set was released before the new one was created.
        assert_eq!(be.live_buffers(), first);
        ctl.shutdown().unwrap();
    }
}
