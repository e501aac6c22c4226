//! Chunk: 16 vertically stacked octree segments, neighbor bookkeeping,
//! and per-column procedural generation.
//!
//! Grounded in the original's `core/level/chunk/chunk.cpp` (segment
//! stack, occlusion map, neighbor side table) and `generation/` (two
//! fractal-noise fields picking a biome and a height per column).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use glam::Vec3;
use noise::{Fbm, NoiseFn, Perlin};
use parking_lot::Mutex;

use crate::core::camera::Camera;
use crate::core::tunables::{CHUNK_SCALE_LOG2, CHUNK_SEGMENTS, CHUNK_SIZE, MIN_HEIGHT, WATER_LEVEL};
use crate::math::frustum::{Collision, Frustum};
use crate::math::Ray;
use crate::render::RenderProducer;
use crate::voxel::svo::{Face, Octree, PackedWord, PickHit};

pub const VOXEL_AIR: u8 = 0;
pub const VOXEL_STONE: u8 = 1;
pub const VOXEL_DIRT: u8 = 2;
pub const VOXEL_SAND: u8 = 3;
pub const VOXEL_WATER: u8 = 4;

/// A chunk's position in the ring, in chunk units (world position
/// divided by `CHUNK_SIZE`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkCoord {
    pub x: i32,
    pub z: i32,
}

impl ChunkCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn world_origin(self) -> (i32, i32) {
        (self.x * CHUNK_SIZE as i32, self.z * CHUNK_SIZE as i32)
    }
}

/// Horizontal neighbor slot. Vertical neighbors don't exist at the
/// chunk level — they're just the segment above/below in the same
/// stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Side {
    Left = 0,
    Right = 1,
    Front = 2,
    Back = 3,
}

impl Side {
    pub const ALL: [Side; 4] = [Side::Left, Side::Right, Side::Front, Side::Back];

    pub const fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
            Side::Front => Side::Back,
            Side::Back => Side::Front,
        }
    }

    /// Chunk-grid offset this side points towards.
    pub const fn offset(self) -> (i32, i32) {
        match self {
            Side::Left => (-1, 0),
            Side::Right => (1, 0),
            Side::Front => (0, -1),
            Side::Back => (0, 1),
        }
    }
}

/// Key identifying one leaf inside one segment, for the occlusion
/// counter map. `position` is the leaf's minimum corner so the same
/// leaf maps to the same key regardless of which interior point was
/// queried to find it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct NodeKey {
    segment: u8,
    position: (u8, u8, u8),
}

/// `(face, leaf)` -> insertions counted against that face so far.
/// Never decremented: once a voxel is removed the counter can
/// overcount, a known limitation carried over from the original (see
/// `DESIGN.md`).
type OcclusionMap = HashMap<(Face, NodeKey), u32>;

struct ChunkSegment {
    octree: Octree,
    initialized: bool,
    modified: bool,
}

impl ChunkSegment {
    fn fresh() -> Self {
        Self {
            octree: Octree::new(CHUNK_SCALE_LOG2, (0, 0, 0)),
            initialized: false,
            modified: false,
        }
    }
}

struct ChunkState {
    segments: Vec<ChunkSegment>,
    mask_container: [usize; 6],
    neighbors: [Option<Weak<Chunk>>; 4],
    occlusion: OcclusionMap,
}

impl ChunkState {
    fn fresh() -> Self {
        Self {
            segments: (0..CHUNK_SEGMENTS).map(|_| ChunkSegment::fresh()).collect(),
            mask_container: [0; 6],
            neighbors: [None, None, None, None],
            occlusion: HashMap::new(),
        }
    }
}

/// Resolution of an occlusion-bookkeeping neighbor query: either a
/// position in this same chunk, a position in another (possibly
/// absent, possibly dropped) chunk, or nothing at the world boundary.
enum Target {
    None,
    SameChunk { segment: u8, pos: (u8, u8, u8) },
    OtherChunk { chunk: Arc<Chunk>, segment: u8, pos: (u8, u8, u8) },
}

/// A vertical stack of 16 octree segments covering `CHUNK_SIZE`
/// voxels in X and Z. Shared ownership: the platform's active and
/// queued sets can both hold an `Arc` to the same chunk when the
/// sliding window only translates.
pub struct Chunk {
    coord: ChunkCoord,
    ring_index: AtomicU16,
    state: Mutex<ChunkState>,
}

impl Chunk {
    pub fn new(coord: ChunkCoord, ring_index: u16) -> Arc<Self> {
        Arc::new(Self {
            coord,
            ring_index: AtomicU16::new(ring_index),
            state: Mutex::new(ChunkState::fresh()),
        })
    }

    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub fn ring_index(&self) -> u16 {
        self.ring_index.load(Ordering::Acquire)
    }

    pub fn set_ring_index(&self, ring_index: u16) {
        self.ring_index.store(ring_index, Ordering::Release);
    }

    /// Link `self` to `neighbor` across `side`, and write the
    /// reciprocal link on `neighbor`. Called by the platform while
    /// loading a ring so every chunk's neighbor table stays symmetric.
    pub fn link_neighbor(self: &Arc<Self>, side: Side, neighbor: &Arc<Chunk>) {
        self.state.lock().neighbors[side as usize] = Some(Arc::downgrade(neighbor));
        neighbor.state.lock().neighbors[side.opposite() as usize] = Some(Arc::downgrade(self));
    }

    fn segment_index(world_y: i32) -> Option<u8> {
        let offset = world_y - MIN_HEIGHT;
        if offset < 0 {
            return None;
        }
        let index = offset / CHUNK_SIZE as i32;
        if index >= CHUNK_SEGMENTS as i32 {
            return None;
        }
        Some(index as u8)
    }

    fn local_y(world_y: i32) -> u8 {
        (world_y - MIN_HEIGHT).rem_euclid(CHUNK_SIZE as i32) as u8
    }

    /// Translate a world position into `(segment_index, intra-segment
    /// position)`. Panics on a position outside this chunk's XZ
    /// footprint or Y range — callers are expected to have already
    /// resolved cross-chunk lookups via [`Chunk::find`]/neighbor links.
    fn locate(&self, world_position: (i32, i32, i32)) -> (u8, (u8, u8, u8)) {
        let origin = self.coord.world_origin();
        let local_x = world_position.0 - origin.0;
        let local_z = world_position.2 - origin.1;
        debug_assert!((0..CHUNK_SIZE as i32).contains(&local_x));
        debug_assert!((0..CHUNK_SIZE as i32).contains(&local_z));
        let segment_index = Self::segment_index(world_position.1)
            .expect("world Y outside the chunk's vertical range");
        (
            segment_index,
            (local_x as u8, Self::local_y(world_position.1), local_z as u8),
        )
    }

    /// Insert a voxel at `world_position`. Runs the occlusion pass
    /// against the six axis neighbors; if `recombine`, also compresses
    /// the touched segment afterwards.
    pub fn insert(self: &Arc<Self>, world_position: (i32, i32, i32), voxel_id: u8, recombine: bool) {
        let (segment_index, local) = self.locate(world_position);
        let mut state = self.state.lock();
        state.segments[segment_index as usize].octree.insert(local, voxel_id);
        state.segments[segment_index as usize].modified = true;

        for face in Face::ALL {
            self.apply_occlusion(&mut state, segment_index, local, face);
        }

        if recombine {
            let segment = &mut state.segments[segment_index as usize];
            segment.octree.recombine();
        }
    }

    fn neighbor_target(&self, state: &ChunkState, segment_index: u8, pos: (u8, u8, u8), face: Face) -> Target {
        let size = CHUNK_SIZE as i32;

        if matches!(face, Face::NegY | Face::PosY) {
            let (dy, wrap_edge) = if face == Face::NegY {
                (-1i32, CHUNK_SIZE as u8 - 1)
            } else {
                (1i32, 0u8)
            };
            let raw_y = pos.1 as i32 + dy;
            if (0..size).contains(&raw_y) {
                return Target::SameChunk {
                    segment: segment_index,
                    pos: (pos.0, raw_y as u8, pos.2),
                };
            }
            let neighbor_segment = if face == Face::NegY {
                segment_index.checked_sub(1)
            } else {
                Some(segment_index + 1)
            };
            return match neighbor_segment {
                Some(s) if (s as u32) < CHUNK_SEGMENTS => Target::SameChunk {
                    segment: s,
                    pos: (pos.0, wrap_edge, pos.2),
                },
                _ => Target::None,
            };
        }

        let (dx, _dy, dz) = face.offset();
        let raw_x = pos.0 as i32 + dx;
        let raw_z = pos.2 as i32 + dz;
        if (0..size).contains(&raw_x) && (0..size).contains(&raw_z) {
            return Target::SameChunk {
                segment: segment_index,
                pos: (raw_x as u8, pos.1, raw_z as u8),
            };
        }

        let side = match face {
            Face::NegX => Side::Left,
            Face::PosX => Side::Right,
            Face::NegZ => Side::Front,
            Face::PosZ => Side::Back,
            Face::NegY | Face::PosY => unreachable!("handled above"),
        };
        match state.neighbors[side as usize].as_ref().and_then(Weak::upgrade) {
            Some(chunk) => Target::OtherChunk {
                chunk,
                segment: segment_index,
                pos: (raw_x.rem_euclid(size) as u8, pos.1, raw_z.rem_euclid(size) as u8),
            },
            None => Target::None,
        }
    }

    fn apply_occlusion(self: &Arc<Self>, state: &mut ChunkState, segment_index: u8, pos: (u8, u8, u8), face: Face) {
        match self.neighbor_target(state, segment_index, pos, face) {
            Target::None => {}
            Target::SameChunk { segment, pos: npos } => {
                let occupied = occlude_neighbor(&mut state.segments, &mut state.occlusion, segment, npos, face);
                if occupied {
                    clear_own_face(&mut state.segments, segment_index, pos, face);
                }
            }
            Target::OtherChunk { chunk, segment, pos: npos } => {
                if let Some(mut other) = chunk.state.try_lock() {
                    let occupied = occlude_neighbor(&mut other.segments, &mut other.occlusion, segment, npos, face);
                    if occupied {
                        clear_own_face(&mut state.segments, segment_index, pos, face);
                    }
                }
            }
        }
    }

    /// Cross-chunk point query: shifts into the matching neighbor and
    /// recurses if `world_position` falls outside this chunk's XZ
    /// footprint. Assumes a unit-step query — only one axis is ever
    /// out of range at a time, which holds for every caller in this
    /// crate (occlusion bookkeeping only ever steps by one voxel along
    /// a single axis).
    pub fn find(self: &Arc<Self>, world_position: (i32, i32, i32)) -> Option<PackedWord> {
        let origin = self.coord.world_origin();
        let local_x = world_position.0 - origin.0;
        let local_z = world_position.2 - origin.1;
        let size = CHUNK_SIZE as i32;

        let out_x = local_x < 0 || local_x >= size;
        let out_z = local_z < 0 || local_z >= size;
        debug_assert!(!(out_x && out_z), "cross-chunk find assumes a unit-step query");

        if out_x || out_z {
            let side = if local_x < 0 {
                Side::Left
            } else if local_x >= size {
                Side::Right
            } else if local_z < 0 {
                Side::Front
            } else {
                Side::Back
            };
            let neighbor = {
                let state = self.state.lock();
                state.neighbors[side as usize].as_ref().and_then(Weak::upgrade)
            };
            return neighbor?.find(world_position);
        }

        let segment_index = Self::segment_index(world_position.1)?;
        let local = (local_x as u8, Self::local_y(world_position.1), local_z as u8);
        let state = self.state.lock();
        state.segments[segment_index as usize].octree.find(local).map(|n| n.word)
    }

    /// Per-column terrain generation: blends two fractal-noise fields
    /// into a biome pick and a height per `(x, z)` column, fills stone
    /// up to that height plus water up to `WATER_LEVEL`, then refreshes
    /// face masks and the per-face leaf-count cache.
    pub fn generate(self: &Arc<Self>) {
        let seed = (self.coord.x as u32).wrapping_mul(374_761_393) ^ (self.coord.z as u32).wrapping_mul(668_265_263);
        let biome_noise: Fbm<Perlin> = Fbm::new(seed);
        let height_noise: Fbm<Perlin> = Fbm::new(seed.wrapping_add(1));

        let origin = self.coord.world_origin();
        for x in 0..CHUNK_SIZE as i32 {
            for z in 0..CHUNK_SIZE as i32 {
                let wx = (origin.0 + x) as f64;
                let wz = (origin.1 + z) as f64;

                let biome_sample = biome_noise.get([wx * 0.013, wz * 0.013]);
                let height_sample = height_noise.get([wx * 0.02, wz * 0.02]);
                let height = (height_sample * 24.0) as i32;
                let surface_voxel = if biome_sample > 0.2 { VOXEL_SAND } else { VOXEL_DIRT };

                for y in MIN_HEIGHT..height {
                    self.insert((origin.0 + x, y, origin.1 + z), VOXEL_STONE, false);
                }
                if height > MIN_HEIGHT {
                    self.insert((origin.0 + x, height, origin.1 + z), surface_voxel, false);
                }
                for y in (height + 1)..=WATER_LEVEL {
                    self.insert((origin.0 + x, y, origin.1 + z), VOXEL_WATER, false);
                }
            }
        }

        self.refresh_masks();
    }

    /// Recompute `faces` bits and `mask_container` for every modified
    /// segment. Called after `generate` and again by the platform's
    /// compress step once segments have been recombined.
    pub fn refresh_masks(&self) {
        let ring_index = self.ring_index();
        let mut state = self.state.lock();
        let mut totals = [0usize; 6];

        for (i, segment) in state.segments.iter_mut().enumerate() {
            if !segment.modified && !segment.initialized {
                continue;
            }
            segment.octree.update_face_mask(ring_index, i as u8);
            segment.initialized = true;
            for face in Face::ALL {
                totals[face as usize] += segment.octree.count_mask(face);
            }
        }

        state.mask_container = totals;
    }

    /// Recombine every segment touched since the last compress pass,
    /// then refresh face masks and leaf counts.
    pub fn compress(&self) {
        {
            let mut state = self.state.lock();
            for segment in state.segments.iter_mut() {
                if segment.modified {
                    segment.octree.recombine();
                }
            }
        }
        self.refresh_masks();
    }

    /// Cheap chunk-level visibility test: any face with a nonzero leaf
    /// count must also be in the camera's axis-aligned face mask, and
    /// the chunk's XZ footprint must intersect the frustum.
    pub fn visible(&self, camera: &Camera) -> bool {
        let any_face_visible = {
            let state = self.state.lock();
            Face::ALL
                .iter()
                .any(|f| state.mask_container[*f as usize] > 0 && camera.face_mask() & f.bit() != 0)
        };
        if !any_face_visible {
            return false;
        }
        let origin = self.coord.world_origin();
        let center = Vec3::new(
            origin.0 as f32 + CHUNK_SIZE as f32 / 2.0,
            0.0,
            origin.1 as f32 + CHUNK_SIZE as f32 / 2.0,
        );
        camera.square_visible(center, CHUNK_SIZE as f32)
    }

    /// Cull every initialized segment into the renderer's per-thread
    /// writeable area, sized exactly from the cached per-face leaf
    /// counts.
    pub fn cull(
        &self,
        camera_mask: u8,
        frustum: &Frustum,
        collision: Collision,
        producer: &RenderProducer,
        thread_id: usize,
    ) {
        let state = self.state.lock();
        let reserved: usize = Face::ALL
            .iter()
            .filter(|f| camera_mask & f.bit() != 0)
            .map(|f| state.mask_container[*f as usize])
            .sum::<usize>()
            * 4;
        if reserved == 0 {
            return;
        }

        let origin = self.coord.world_origin();
        let mut area = producer.request_writeable_area(reserved, thread_id);

        for (i, segment) in state.segments.iter().enumerate() {
            if !segment.initialized {
                continue;
            }
            let segment_origin = Vec3::new(
                origin.0 as f32,
                (MIN_HEIGHT + i as i32 * CHUNK_SIZE as i32) as f32,
                origin.1 as f32,
            );
            segment.octree.cull(camera_mask, frustum, segment_origin, collision, &mut area);
        }
    }

    /// Ray-pick against every segment, returning the closest hit across
    /// the whole column. `max_distance` bounds the search (the caller
    /// passes `MAX_INTERACTION_RANGE`); segments prune themselves via
    /// their own AABB test before descending.
    pub fn pick(&self, ray: &Ray, max_distance: f32) -> Option<PickHit> {
        let origin = self.coord.world_origin();
        let state = self.state.lock();
        let mut best: Option<PickHit> = None;

        for (i, segment) in state.segments.iter().enumerate() {
            if !segment.initialized {
                continue;
            }
            let segment_origin = Vec3::new(
                origin.0 as f32,
                (MIN_HEIGHT + i as i32 * CHUNK_SIZE as i32) as f32,
                origin.1 as f32,
            );
            if let Some(hit) = segment.octree.pick(ray, segment_origin, max_distance) {
                if best.map_or(true, |b| hit.distance < b.distance) {
                    best = Some(hit);
                }
            }
        }

        best
    }
}

fn clear_own_face(segments: &mut [ChunkSegment], segment_index: u8, pos: (u8, u8, u8), face: Face) {
    if let Some(node) = segments[segment_index as usize].octree.find_mut(pos) {
        node.word = node.word.with_face_cleared(face);
    }
}

/// Looks up the neighbor leaf at `(neighbor_segment, neighbor_pos)`.
/// Returns `false` (no bookkeeping performed) if it's air. Otherwise
/// clears the current leaf's opposite face directly if the neighbor is
/// unit-scale, or bumps an occlusion counter until the neighbor's
/// larger face is fully covered.
fn occlude_neighbor(
    segments: &mut [ChunkSegment],
    occlusion: &mut OcclusionMap,
    neighbor_segment: u8,
    neighbor_pos: (u8, u8, u8),
    face_on_current: Face,
) -> bool {
    let neighbor_word = match segments[neighbor_segment as usize].octree.find(neighbor_pos) {
        Some(n) => n.word,
        None => return false,
    };
    if neighbor_word.voxel_id() == VOXEL_AIR {
        return false;
    }

    let opposite = face_on_current.opposite();
    if neighbor_word.scale_log2() == 0 {
        if let Some(node) = segments[neighbor_segment as usize].octree.find_mut(neighbor_pos) {
            node.word = node.word.with_face_cleared(opposite);
        }
    } else {
        let side = 1usize << neighbor_word.scale_log2();
        let threshold = side * side;
        let key = (
            opposite,
            NodeKey {
                segment: neighbor_segment,
                position: neighbor_word.position(),
            },
        );
        let counter = occlusion.entry(key).or_insert(0);
        *counter += 1;
        if *counter as usize >= threshold {
            if let Some(node) = segments[neighbor_segment as usize].octree.find_mut(neighbor_word.position()) {
                node.word = node.word.with_face_cleared(opposite);
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_find_roundtrips_within_one_chunk() {
        let chunk = Chunk::new(ChunkCoord::new(0, 0), 0);
        chunk.insert((5, 0, 5), VOXEL_STONE, false);
        let word = chunk.find((5, 0, 5)).expect("voxel must exist");
        assert_eq!(word.voxel_id(), VOXEL_STONE);
    }

    #[test]
    fn adjacent_unit_insertions_occlude_each_other() {
        let chunk = Chunk::new(ChunkCoord::new(0, 0), 0);
        chunk.insert((5, 0, 5), VOXEL_STONE, false);
        chunk.insert((6, 0, 5), VOXEL_STONE, false);

        let left = chunk.find((5, 0, 5)).unwrap();
        let right = chunk.find((6, 0, 5)).unwrap();
        assert!(!left.has_face(Face::PosX));
        assert!(!right.has_face(Face::NegX));
        // the non-shared faces stay visible.
        assert!(left.has_face(Face::NegX));
        assert!(right.has_face(Face::PosX));
    }

    #[test]
    fn vertical_neighbors_occlude_across_segment_boundary() {
        let chunk = Chunk::new(ChunkCoord::new(0, 0), 0);
        let y_top_of_segment_0 = MIN_HEIGHT + CHUNK_SIZE as i32 - 1;
        chunk.insert((3, y_top_of_segment_0, 3), VOXEL_STONE, false);
        chunk.insert((3, y_top_of_segment_0 + 1, 3), VOXEL_STONE, false);

        let below = chunk.find((3, y_top_of_segment_0, 3)).unwrap();
        let above = chunk.find((3, y_top_of_segment_0 + 1, 3)).unwrap();
        assert!(!below.has_face(Face::PosY));
        assert!(!above.has_face(Face::NegY));
    }

    #[test]
    fn cross_chunk_find_walks_the_neighbor_link() {
        let a = Chunk::new(ChunkCoord::new(0, 0), 0);
        let b = Chunk::new(ChunkCoord::new(1, 0), 1);
        a.link_neighbor(Side::Right, &b);

        b.insert((CHUNK_SIZE as i32, 0, 0), VOXEL_DIRT, false);
        let seen = a.find((CHUNK_SIZE as i32, 0, 0)).expect("neighbor link must resolve");
        assert_eq!(seen.voxel_id(), VOXEL_DIRT);
    }

    #[test]
    fn cross_chunk_insertions_occlude_the_shared_face() {
        let a = Chunk::new(ChunkCoord::new(0, 0), 0);
        let b = Chunk::new(ChunkCoord::new(1, 0), 1);
        a.link_neighbor(Side::Right, &b);

        let edge_x = CHUNK_SIZE as i32 - 1;
        a.insert((edge_x, 0, 0), VOXEL_STONE, false);
        b.insert((CHUNK_SIZE as i32, 0, 0), VOXEL_DIRT, false);

        let left = a.find((edge_x, 0, 0)).unwrap();
        let right = b.find((CHUNK_SIZE as i32, 0, 0)).unwrap();
        assert!(!left.has_face(Face::PosX));
        assert!(!right.has_face(Face::NegX));
    }

    #[test]
    fn generate_populates_mask_container() {
        let chunk = Chunk::new(ChunkCoord::new(0, 0), 0);
        chunk.generate();
        let total: usize = {
            let state = chunk.state.lock();
            state.mask_container.iter().sum()
        };
        assert!(total > 0, "a generated chunk must expose at least one visible face");
    }

    #[test]
    fn find_outside_chunk_without_neighbor_is_none() {
        let chunk = Chunk::new(ChunkCoord::new(0, 0), 0);
        assert!(chunk.find((CHUNK_SIZE as i32, 0, 0)).is_none());
    }

    #[test]
    fn pick_finds_the_closest_hit_across_segments() {
        let chunk = Chunk::new(ChunkCoord::new(0, 0), 0);
        chunk.insert((8, 0, 8), VOXEL_STONE, false);
        chunk.refresh_masks();

        let ray = crate::math::Ray::new(Vec3::new(8.5, 4.0, 8.5), Vec3::new(0.0, -1.0, 0.0));
        let hit = chunk.pick(&ray, crate::core::tunables::MAX_INTERACTION_RANGE).expect("ray must hit the stone");
        assert_eq!(hit.word.voxel_id(), VOXEL_STONE);
        assert_eq!(hit.face, Face::PosY);
    }

    #[test]
    fn pick_respects_max_interaction_range() {
        let chunk = Chunk::new(ChunkCoord::new(0, 0), 0);
        chunk.insert((8, MIN_HEIGHT, 8), VOXEL_STONE, false);
        chunk.refresh_masks();

        let ray = crate::math::Ray::new(Vec3::new(8.5, 4.0, 8.5), Vec3::new(0.0, -1.0, 0.0));
        assert!(chunk.pick(&ray, 2.0).is_none());
    }
}
