//! Sparse Voxel Octree implementation

pub mod node;
pub mod octree;

pub use node::{Face, Node, PackedWord, ALL_FACES_MASK, FACE_EMIT_MASK, OCTANT_SIGN};
pub use octree::{CountingSink, Octree, PickHit, VertexSink};
