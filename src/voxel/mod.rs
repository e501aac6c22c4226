//! Voxel data structures: the packed SVO and the chunk/segment stack
//! built on top of it.

pub mod chunk;
pub mod svo;

pub use chunk::{Chunk, ChunkCoord, Side};
