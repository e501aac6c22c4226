//! Tile registry boundary. The core stores only a `voxel_id` in every
//! leaf node; translating that id into textures, collision behavior,
//! and per-face cull rules is the end-user tile registry's job and
//! stays out of scope (`spec.md` §1, §6). This module is the seam a
//! real registry plugs into, not a registry itself.

use crate::voxel::svo::Face;

/// What the core needs from a tile registry to texture and cull a
/// voxel face. A real implementation (texture atlas lookup, per-tile
/// collision flags) lives outside this crate.
pub trait TileTable: Send + Sync {
    /// Texture indices for the four cardinal faces of `voxel_id`, in
    /// `(top, bottom, side, side)` order. Content is opaque to the
    /// core — it is read back out of the vertex's `voxel_id` lane by
    /// the rasterizer, not interpreted here.
    fn textures(&self, voxel_id: u8) -> [u32; 4];

    /// Whether `voxel_id` participates in AABB/ray collision.
    fn collision(&self, voxel_id: u8) -> bool;

    /// Whether `face` of `voxel_id` should ever be considered for
    /// visibility (a tile can opt a face out entirely, e.g. water's
    /// underside).
    fn cull_rule(&self, voxel_id: u8, face: Face) -> bool;
}

/// A trivial table used by tests and as a placeholder until a real
/// registry is wired in: every non-air voxel collides, every face of
/// every tile is a cull candidate, and texture indices are just the
/// voxel id repeated across all four slots.
pub struct NullTileTable;

impl TileTable for NullTileTable {
    fn textures(&self, voxel_id: u8) -> [u32; 4] {
        [voxel_id as u32; 4]
    }

    fn collision(&self, voxel_id: u8) -> bool {
        voxel_id != 0
    }

    fn cull_rule(&self, _voxel_id: u8, _face: Face) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_table_treats_air_as_non_colliding() {
        let table = NullTileTable;
        assert!(!table.collision(0));
        assert!(table.collision(1));
    }

    #[test]
    fn null_table_allows_every_face() {
        let table = NullTileTable;
        for face in Face::ALL {
            assert!(table.cull_rule(1, face));
        }
    }
}
