// offload.rs -- The contract between the encoder frame loop and the
// motion-search offload.
//
// The frame loop depends on this trait, not on a concrete device layer:
//
//   GpuMotionSearch (gpu/controller.rs) -- the real offload.
//   NoopOffload (below)                 -- disabled variant; the loop
//                                          checks `is_enabled()` and runs
//                                          its host-only search instead.
//
// Call-sequence contract per GPU tile and frame (upheld by the caller,
// not re-validated here): fill inputs (acquire/write), dispatch_prologue,
// wait Prologue, consume coarse results, fill per-block inputs,
// dispatch_execute, wait Execute, consume fine results. Buffers handed
// out by acquire_* are taken back automatically by the next dispatch
// that touches them.

use std::time::Duration;

use crate::block::BlockClass;
use crate::geometry::FrameGeometry;
use crate::gpu::backend::{GpuError, HostPtr};
use crate::gpu::dispatch::Stage;

/// Per-frame reference selection.
///
/// The golden reference participates in the coarse analysis only when it
/// is a different frame from the last reference; the flag is forwarded to
/// the coarse kernels as their analyse-golden argument.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameRefs {
    pub golden_distinct: bool,
}

/// Injectable instrumentation hook. The default is a no-op; swap in a
/// recorder to collect per-stage timings.
pub trait DispatchObserver {
    fn stage_dispatched(&mut self, _stage: Stage, _tile: u32) {}
    fn stage_waited(&mut self, _stage: Stage, _tile: u32, _elapsed: Duration) {}
}

/// The default observer.
pub struct NoopObserver;

impl DispatchObserver for NoopObserver {}

/// Motion-search offload as seen by the encoder frame loop.
pub trait MotionSearchOffload {
    /// False for the disabled variant; callers must not invoke anything
    /// below when this is false.
    fn is_enabled(&self) -> bool;

    /// Allocate session buffers for a frame geometry. Called once per
    /// resolution, before any dispatch.
    fn allocate(&mut self, geom: FrameGeometry) -> Result<(), GpuError>;

    /// Select this frame's references; applies to subsequent dispatches.
    fn set_frame_refs(&mut self, refs: FrameRefs);

    // Host write access to inputs. Each pointer stays valid until the
    // next dispatch touching the resource releases it back to the device.
    fn acquire_input_grid(&mut self) -> Result<HostPtr, GpuError>;
    fn acquire_rd_params(&mut self) -> Result<HostPtr, GpuError>;
    fn acquire_source_plane(&mut self) -> Result<HostPtr, GpuError>;
    fn acquire_reference_plane(&mut self) -> Result<HostPtr, GpuError>;
    fn acquire_golden_plane(&mut self) -> Result<HostPtr, GpuError>;

    // Host read access to one tile's results; valid until the next
    // dispatch for that tile.
    fn acquire_coarse_output(&mut self, tile: u32) -> Result<HostPtr, GpuError>;
    fn acquire_fine_output(&mut self, tile: u32) -> Result<HostPtr, GpuError>;

    /// Enqueue the coarse stage for one tile and return immediately.
    fn dispatch_prologue(&mut self, tile: u32) -> Result<(), GpuError>;

    /// Enqueue the fine stage for one tile and return immediately.
    fn dispatch_execute(&mut self, tile: u32, classes: &[BlockClass]) -> Result<(), GpuError>;

    /// Block until a tile's stage has completed on the device. The only
    /// blocking operation in this layer.
    fn wait_for_tile(&mut self, stage: Stage, tile: u32) -> Result<(), GpuError>;

    /// Release session buffers (resolution change or teardown).
    fn free(&mut self) -> Result<(), GpuError>;

    /// Release kernels, programs and completion tokens. Terminal.
    fn shutdown(&mut self) -> Result<(), GpuError>;
}

/// Disabled offload: the frame loop sees `is_enabled() == false` and
/// keeps every search on the host. All other operations are misuse.
pub struct NoopOffload;

impl MotionSearchOffload for NoopOffload {
    fn is_enabled(&self) -> bool {
        false
    }

    fn allocate(&mut self, _geom: FrameGeometry) -> Result<(), GpuError> {
        Ok(())
    }

    fn set_frame_refs(&mut self, _refs: FrameRefs) {}

    fn acquire_input_grid(&mut self) -> Result<HostPtr, GpuError> {
        Err(disabled())
    }

    fn acquire_rd_params(&mut self) -> Result<HostPtr, GpuError> {
        Err(disabled())
    }

    fn acquire_source_plane(&mut self) -> Result<HostPtr, GpuError> {
        Err(disabled())
    }

    fn acquire_reference_plane(&mut self) -> Result<HostPtr, GpuError> {
        Err(disabled())
    }

    fn acquire_golden_plane(&mut self) -> Result<HostPtr, GpuError> {
        Err(disabled())
    }

    fn acquire_coarse_output(&mut self, _tile: u32) -> Result<HostPtr, GpuError> {
        Err(disabled())
    }

    fn acquire_fine_output(&mut self, _tile: u32) -> Result<HostPtr, GpuError> {
        Err(disabled())
    }

    fn dispatch_prologue(&mut self, _tile: u32) -> Result<(), GpuError> {
        Err(disabled())
    }

    fn dispatch_execute(&mut self, _tile: u32, _classes: &[BlockClass]) -> Result<(), GpuError> {
        Err(disabled())
    }

    fn wait_for_tile(&mut self, _stage: Stage, _tile: u32) -> Result<(), GpuError> {
        Err(disabled())
    }

    fn free(&mut self) -> Result<(), GpuError> {
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), GpuError> {
        Ok(())
    }
}

fn disabled() -> GpuError {
    GpuError::Wait { what: "offload is disabled".to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_offload_is_disabled() {
        let mut off = NoopOffload;
        assert!(!off.is_enabled());
        assert!(off.allocate(FrameGeometry::new(64, 64)).is_ok());
        assert!(off.dispatch_prologue(1).is_err());
        assert!(off.shutdown().is_ok());
    }
}
