// gpu/mod.rs -- Device layer.
//
// Layering, bottom up:
//
//   backend    the compute backend contract (trait + handles + errors)
//   device     WgpuBackend, the real implementation
//   null       NullBackend, host-memory no-op (CPU-only mode and tests)
//   programs   per-class kernel compilation and caching
//   buffers    device buffers, host/device ownership, session buffer set
//   dispatch   per-tile two-stage enqueue, work sizes, completion tokens
//   controller the offload object the encoder frame loop drives
//
// Everything above `device`/`null` is backend-agnostic: the pipeline and
// the tests run unchanged on either implementation.

pub mod backend;
pub mod buffers;
pub mod controller;
pub mod device;
pub mod dispatch;
pub mod null;
pub mod programs;
