// DASHER-V: Device-Accelerated Search for Hybrid Encoder in Rust -- Video
//
// GPU offload layer for a video encoder's motion-estimation search. The
// encoder's frame loop hands tiles of a frame to the device and keeps
// working on other tiles while the GPU searches: per-tile dispatch is
// asynchronous, buffers alternate between host and device ownership with
// explicit acquire/release handoffs, and the only blocking point is the
// wait on one tile's completion token.
//
// Host-side layout (pure, device-free):
//   geometry  mi / superblock grids and plane sizes
//   tile      horizontal tile partition of the frame
//   block     block-size classes and kernel work-item granularity
//   offload   the contract the encoder frame loop consumes
//
// Device side under gpu:: (see gpu/mod.rs).

pub mod block;
pub mod geometry;
pub mod gpu;
pub mod offload;
pub mod tile;
