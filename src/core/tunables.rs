//! Compile-time tunables shared by every module. Kept as plain `const`s
//! rather than a runtime config file — these are the spec's "compile-time
//! constants," not values a host can sanely change without recompiling.

/// Edge length of one chunk segment, in voxels.
pub const CHUNK_SIZE: u32 = 32;

/// Vertical segments stacked per chunk.
pub const CHUNK_SEGMENTS: u32 = 16;

/// World Y of segment 0's bottom.
pub const MIN_HEIGHT: i32 = -128;

/// Sliding-window half-extent, in chunks.
pub const RENDER_RADIUS: i32 = 16;

/// Leaf edge length at `scale_log2 == 0`.
pub const BASE_SIZE: u32 = 1;

/// Vertex ring size the render producer pre-reserves.
pub const MAX_VERTICES_BUFFER: usize = 327_680;

/// Arena block size.
pub const HUGE_PAGE: usize = 2 * 1024 * 1024;

/// Bump-page reclamation hysteresis, in reset cycles.
pub const DECAY: u32 = 1024;

/// `log2(CHUNK_SIZE)`, the root `scale_log2` of a fresh chunk segment.
pub const CHUNK_SCALE_LOG2: u8 = 5;

/// Default SPMC queue capacity per worker.
pub const TASK_QUEUE_CAPACITY: usize = 512;

/// World Y at and below which a freshly generated column is filled
/// with water rather than left as air.
pub const WATER_LEVEL: i32 = 0;

/// Ring side length in chunks, `2 * RENDER_RADIUS`.
pub const RING_DIAMETER: i32 = RENDER_RADIUS * 2;

/// Number of ring slots, `(2 * RENDER_RADIUS)^2`.
pub const RING_SLOTS: usize = (RING_DIAMETER * RING_DIAMETER) as usize;

/// Sliding-window reload threshold: the platform reloads once the
/// camera has crossed at least this far from `current_root`.
pub const LOAD_THRESHOLD: f32 = CHUNK_SIZE as f32 * 2.0;

/// Furthest a ray pick is allowed to travel before reporting a miss.
pub const MAX_INTERACTION_RANGE: f32 = 64.0;
