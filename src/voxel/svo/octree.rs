//! Sparse voxel octree: insert, find, face-mask propagation,
//! recombination, and vertex-emitting cull over a tree of packed
//! [`Node`]s.

use crate::math::frustum::{Collision, Frustum};
use crate::math::{Aabb, Ray};
use glam::Vec3;

use super::node::{Face, Node, PackedWord, ALL_FACES_MASK, OCTANT_SIGN};

/// Result of a successful [`Octree::pick`]: the hit leaf's packed word,
/// the distance from the ray origin, and the face the ray entered
/// through.
#[derive(Clone, Copy, Debug)]
pub struct PickHit {
    pub word: PackedWord,
    pub distance: f32,
    pub face: Face,
}

/// Which axis-aligned slab produced `t_near`, used to report the face a
/// ray entered an AABB through. Falls back to the dominant component of
/// the outward direction if two slabs tie (a corner/edge hit).
fn entry_face(ray: &Ray, aabb: &Aabb, t_near: f32) -> Face {
    let t1 = (aabb.min - ray.origin) * ray.inv_direction;
    let t2 = (aabb.max - ray.origin) * ray.inv_direction;
    let per_axis = [t1.x.min(t2.x), t1.y.min(t2.y), t1.z.min(t2.z)];
    const EPS: f32 = 1e-4;

    let axis = per_axis
        .iter()
        .enumerate()
        .filter(|(_, t)| (**t - t_near).abs() <= EPS)
        .map(|(i, _)| i)
        .next()
        .unwrap_or(0);

    match axis {
        0 => if ray.direction.x >= 0.0 { Face::NegX } else { Face::PosX },
        1 => if ray.direction.y >= 0.0 { Face::NegY } else { Face::PosY },
        _ => if ray.direction.z >= 0.0 { Face::NegZ } else { Face::PosZ },
    }
}

/// Receives vertices emitted by `Octree::cull`. Implemented by the
/// render producer's per-thread writeable-area handle; this is the
/// idiomatic seam in place of the original's raw writeable pointer.
pub trait VertexSink {
    fn push_face(&mut self, masked_word: PackedWord, face: Face);
}

/// A sink that only counts faces, used by tests and by callers that
/// want `count_mask`-style totals without a real render producer.
#[derive(Default)]
pub struct CountingSink {
    pub count: usize,
}

impl VertexSink for CountingSink {
    fn push_face(&mut self, _masked_word: PackedWord, _face: Face) {
        self.count += 1;
    }
}

/// A sparse octree over one chunk segment's cubic region.
#[derive(Debug, Clone)]
pub struct Octree {
    root: Node,
}

impl Octree {
    /// Create an empty octree whose root covers `2^root_scale_log2`
    /// voxels on a side, with its minimum corner at `origin` in
    /// intra-segment coordinates. `(x, y, z)` in a node's packed word
    /// is this minimum corner — the root's `origin` here, halved at
    /// every level by the octant's sign-table entry — rather than a
    /// true fractional centroid, so every field stays an exact integer
    /// down to `scale_log2 == 0`.
    pub fn new(root_scale_log2: u8, origin: (u8, u8, u8)) -> Self {
        let word = PackedWord::new()
            .with_scale_log2(root_scale_log2)
            .with_position(origin.0, origin.1, origin.2);
        Self {
            root: Node::leaf(word),
        }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    fn aabb_of(word: PackedWord) -> Aabb {
        let (x, y, z) = word.position();
        let scale = word.scale() as f32;
        let min = Vec3::new(x as f32, y as f32, z as f32);
        Aabb::new(min, min + Vec3::splat(scale))
    }

    /// Octant a voxel position routes to from a node's minimum corner
    /// and scale, via the three inequality bits
    /// `voxel.axis >= node.axis + half_scale`.
    fn select_child(node_pos: (u8, u8, u8), node_scale_log2: u8, voxel_pos: (u8, u8, u8)) -> u8 {
        debug_assert!(node_scale_log2 > 0);
        let half = 1u8 << (node_scale_log2 - 1);
        let mut octant = 0u8;
        if voxel_pos.0 >= node_pos.0 + half {
            octant |= 0b001;
        }
        if voxel_pos.1 >= node_pos.1 + half {
            octant |= 0b010;
        }
        if voxel_pos.2 >= node_pos.2 + half {
            octant |= 0b100;
        }
        octant
    }

    /// Minimum corner of the given octant of a parent at `parent_pos`
    /// with `parent_scale_log2`, using the sign table: a `-1` entry
    /// keeps the parent's corner on that axis, a `+1` entry advances it
    /// by the child's own scale (half the parent's).
    fn child_position(parent_pos: (u8, u8, u8), parent_scale_log2: u8, octant: u8) -> (u8, u8, u8) {
        debug_assert!(parent_scale_log2 > 0);
        let child_scale = 1u8 << (parent_scale_log2 - 1);
        let sign = OCTANT_SIGN[octant as usize];
        let apply = |base: u8, s: i8| -> u8 {
            if s > 0 {
                base + child_scale
            } else {
                base
            }
        };
        (
            apply(parent_pos.0, sign[0]),
            apply(parent_pos.1, sign[1]),
            apply(parent_pos.2, sign[2]),
        )
    }

    /// Insert `voxel_id` at `voxel_pos` (intra-segment coordinates).
    /// Not thread-safe against concurrent inserts into the same tree.
    pub fn insert(&mut self, voxel_pos: (u8, u8, u8), voxel_id: u8) {
        Self::insert_node(&mut self.root, voxel_pos, voxel_id);
    }

    fn insert_node(node: &mut Node, voxel_pos: (u8, u8, u8), voxel_id: u8) {
        if node.word.scale_log2() == 0 {
            debug_assert!(
                node.children.is_none(),
                "a scale_log2==0 node must never have children"
            );
            node.word = node
                .word
                .with_faces(ALL_FACES_MASK)
                .with_voxel_id(voxel_id);
            return;
        }

        let octant = Self::select_child(node.word.position(), node.word.scale_log2(), voxel_pos);

        if node.children.is_none() {
            let parent_pos = node.word.position();
            let parent_scale = node.word.scale_log2();
            let children: [Node; 8] = std::array::from_fn(|i| {
                let pos = Self::child_position(parent_pos, parent_scale, i as u8);
                Node::leaf(
                    PackedWord::new()
                        .with_position(pos.0, pos.1, pos.2)
                        .with_scale_log2(parent_scale - 1),
                )
            });
            node.children = Some(Box::new(children));
        }

        node.word = node.word.with_segments(node.word.segments() | (1 << octant));
        let child = node.child_mut(octant).expect("child slot just allocated");
        Self::insert_node(child, voxel_pos, voxel_id);
    }

    /// Find the leaf whose AABB contains `voxel_pos`, returning `None`
    /// on a missing segment. Larger (recombined) leaves can be located
    /// by any interior point of their cube.
    pub fn find(&self, voxel_pos: (u8, u8, u8)) -> Option<&Node> {
        Self::find_node(&self.root, voxel_pos)
    }

    fn find_node(node: &Node, voxel_pos: (u8, u8, u8)) -> Option<&Node> {
        let aabb = Self::aabb_of(node.word);
        let p = Vec3::new(
            voxel_pos.0 as f32 + 0.5,
            voxel_pos.1 as f32 + 0.5,
            voxel_pos.2 as f32 + 0.5,
        );
        if !aabb.contains_point(p) {
            return None;
        }
        if node.is_leaf() {
            return Some(node);
        }
        let octant = Self::select_child(node.word.position(), node.word.scale_log2(), voxel_pos);
        match node.child(octant) {
            Some(child) => Self::find_node(child, voxel_pos),
            None => None,
        }
    }

    /// Mutable counterpart of [`Octree::find`], used to flip a leaf's
    /// face bit when occlusion bookkeeping determines a shared face has
    /// become fully covered by a neighbor.
    pub fn find_mut(&mut self, voxel_pos: (u8, u8, u8)) -> Option<&mut Node> {
        Self::find_node_mut(&mut self.root, voxel_pos)
    }

    fn find_node_mut(node: &mut Node, voxel_pos: (u8, u8, u8)) -> Option<&mut Node> {
        let aabb = Self::aabb_of(node.word);
        let p = Vec3::new(
            voxel_pos.0 as f32 + 0.5,
            voxel_pos.1 as f32 + 0.5,
            voxel_pos.2 as f32 + 0.5,
        );
        if !aabb.contains_point(p) {
            return None;
        }
        if node.is_leaf() {
            return Some(node);
        }
        let octant = Self::select_child(node.word.position(), node.word.scale_log2(), voxel_pos);
        match node.child_mut(octant) {
            Some(child) => Self::find_node_mut(child, voxel_pos),
            None => None,
        }
    }

    /// Rewrite `chunk_index`/`segment_y` on every node in the subtree
    /// (the chunk's ring position may change when the platform slides).
    /// Returns the OR of leaf `faces` bits, re-propagated upward.
    pub fn update_face_mask(&mut self, chunk_index: u16, segment_y: u8) -> u8 {
        Self::update_face_mask_node(&mut self.root, chunk_index, segment_y)
    }

    fn update_face_mask_node(node: &mut Node, chunk_index: u16, segment_y: u8) -> u8 {
        node.word = node
            .word
            .with_chunk_index(chunk_index)
            .with_segment_y(segment_y);

        if node.is_leaf() {
            return node.word.faces();
        }

        let mut faces = 0u8;
        if let Some(children) = node.children.as_mut() {
            for child in children.iter_mut() {
                faces |= Self::update_face_mask_node(child, chunk_index, segment_y);
            }
        }
        node.word = node.word.with_faces(faces);
        faces
    }

    /// Post-order compress: collapse an interior node whose 8 children
    /// are all present, all leaves, share `voxel_id` and `scale_log2`,
    /// into one leaf at the parent's own `scale_log2` (one level above
    /// the children's, since children are created at `parent_scale - 1`).
    /// A node with fewer than 8 children is never collapsed. Idempotent.
    pub fn recombine(&mut self) {
        Self::recombine_node(&mut self.root);
    }

    fn recombine_node(node: &mut Node) {
        if node.is_leaf() {
            return;
        }
        if let Some(children) = node.children.as_mut() {
            for child in children.iter_mut() {
                Self::recombine_node(child);
            }
        }

        if node.word.segments() != 0xFF {
            return;
        }

        let children = node.children.as_ref().expect("interior node has children");
        if !Self::check_combinable(children) {
            return;
        }

        let voxel_id = children[0].word.voxel_id();
        let faces = Self::combine_faces(children);
        let (x, y, z) = node.word.position();
        let new_scale = node.word.scale_log2();

        node.word = PackedWord::new()
            .with_position(x, y, z)
            .with_scale_log2(new_scale)
            .with_chunk_index(node.word.chunk_index())
            .with_segment_y(node.word.segment_y())
            .with_faces(faces)
            .with_voxel_id(voxel_id);
        node.children = None;
    }

    /// All 8 children present, all leaves, same scale, same voxel_id.
    fn check_combinable(children: &[Node; 8]) -> bool {
        let first = &children[0];
        if !first.is_leaf() {
            return false;
        }
        let scale = first.word.scale_log2();
        let voxel_id = first.word.voxel_id();
        children.iter().all(|c| {
            c.is_leaf() && c.word.scale_log2() == scale && c.word.voxel_id() == voxel_id
        })
    }

    fn combine_faces(children: &[Node; 8]) -> u8 {
        children.iter().fold(0u8, |acc, c| acc | c.word.faces())
    }

    /// Recursive leaf count with `face_bit` set. Used to pre-size the
    /// writeable area exactly.
    pub fn count_mask(&self, face: Face) -> usize {
        Self::count_mask_node(&self.root, face)
    }

    fn count_mask_node(node: &Node, face: Face) -> usize {
        if node.is_leaf() {
            return if node.word.has_face(face) { 1 } else { 0 };
        }
        node.children
            .as_ref()
            .map(|c| c.iter().map(|n| Self::count_mask_node(n, face)).sum())
            .unwrap_or(0)
    }

    /// Emit vertices for every visible leaf face into `sink`. Skips
    /// subtrees whose `faces & camera_mask == 0`. Runs a sphere-in-
    /// frustum test on interior nodes big enough to matter
    /// (`scale_log2 >= 2`) when the caller is still `Intersect`;
    /// `Inside` children skip further frustum tests.
    pub fn cull(
        &self,
        camera_mask: u8,
        frustum: &Frustum,
        chunk_world_origin: Vec3,
        collision: Collision,
        sink: &mut dyn VertexSink,
    ) {
        Self::cull_node(&self.root, camera_mask, frustum, chunk_world_origin, collision, sink);
    }

    fn cull_node(
        node: &Node,
        camera_mask: u8,
        frustum: &Frustum,
        chunk_world_origin: Vec3,
        mut collision: Collision,
        sink: &mut dyn VertexSink,
    ) {
        if node.word.faces() & camera_mask == 0 {
            return;
        }

        if node.word.scale_log2() >= 2 && collision == Collision::Intersect {
            let aabb = Self::aabb_of(node.word);
            let center = chunk_world_origin + aabb.center();
            let radius = aabb.half_extent().length();
            collision = frustum.sphere_in_frustum(center, radius);
            if collision == Collision::Outside {
                return;
            }
        }

        if node.is_leaf() {
            let masked = node.word.masked_for_emit();
            for face in Face::ALL {
                if node.word.faces() & camera_mask & face.bit() != 0 {
                    sink.push_face(masked, face);
                }
            }
            return;
        }

        if let Some(children) = node.children.as_ref() {
            for child in children.iter() {
                Self::cull_node(child, camera_mask, frustum, chunk_world_origin, collision, sink);
            }
        }
    }

    /// Ray–AABB walk for the picker: prunes subtrees whose AABB the ray
    /// misses or whose nearest hit is already farther than `max_distance`,
    /// and returns the closest occupied leaf. `chunk_world_origin` places
    /// this octree's local integer grid in world space.
    pub fn pick(&self, ray: &Ray, chunk_world_origin: Vec3, max_distance: f32) -> Option<PickHit> {
        Self::pick_node(&self.root, ray, chunk_world_origin, max_distance)
    }

    fn pick_node(node: &Node, ray: &Ray, chunk_world_origin: Vec3, max_distance: f32) -> Option<PickHit> {
        let local_aabb = Self::aabb_of(node.word);
        let world_aabb = Aabb::new(
            chunk_world_origin + local_aabb.min,
            chunk_world_origin + local_aabb.max,
        );
        let (t_near, _t_far) = ray.intersects_aabb(&world_aabb)?;
        if t_near > max_distance {
            return None;
        }

        if node.is_leaf() {
            if node.word.voxel_id() == 0 {
                return None;
            }
            return Some(PickHit {
                word: node.word,
                distance: t_near,
                face: entry_face(ray, &world_aabb, t_near),
            });
        }

        let children = node.children.as_ref()?;
        let mut best: Option<PickHit> = None;
        for child in children.iter() {
            if let Some(hit) = Self::pick_node(child, ray, chunk_world_origin, max_distance) {
                if best.map_or(true, |b| hit.distance < b.distance) {
                    best = Some(hit);
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::frustum::Frustum;
    use glam::Vec3;

    fn camera_frustum_seeing_everything() -> Frustum {
        Frustum::new(
            Vec3::new(-1000.0, 16.0, 16.0),
            Vec3::X,
            Vec3::Y,
            Vec3::Z,
            80f32.to_radians(),
            1.0,
            0.1,
            5000.0,
        )
    }

    #[test]
    fn test_insert_and_find_roundtrip() {
        let mut tree = Octree::new(5, (16, 16, 16));
        tree.insert((4, 0, 4), 1);

        let leaf = tree.find((4, 0, 4)).expect("leaf must exist");
        assert!(leaf.is_leaf());
        assert_eq!(leaf.word.voxel_id(), 1);
        assert_eq!(leaf.word.scale_log2(), 0);
        assert_eq!(leaf.word.faces(), ALL_FACES_MASK);
    }

    #[test]
    fn test_find_on_missing_segment_is_none() {
        let tree = Octree::new(5, (16, 16, 16));
        assert!(tree.find((4, 0, 4)).is_none());
    }

    #[test]
    fn test_recombine_collapses_eight_children() {
        let mut tree = Octree::new(1, (0, 0, 0));
        for dx in 0..2u8 {
            for dy in 0..2u8 {
                for dz in 0..2u8 {
                    tree.insert((dx, dy, dz), 1);
                }
            }
        }
        tree.recombine();

        let root = tree.root();
        assert!(root.is_leaf());
        assert_eq!(root.word.scale_log2(), 1);
        assert_eq!(root.word.faces(), ALL_FACES_MASK);
        assert_eq!(root.word.voxel_id(), 1);

        assert_eq!(tree.find((0, 0, 0)).unwrap().word.voxel_id(), 1);
        assert_eq!(tree.find((1, 1, 1)).unwrap().word.voxel_id(), 1);
    }

    #[test]
    fn test_recombine_is_idempotent() {
        let mut tree = Octree::new(1, (0, 0, 0));
        for dx in 0..2u8 {
            for dy in 0..2u8 {
                for dz in 0..2u8 {
                    tree.insert((dx, dy, dz), 1);
                }
            }
        }
        tree.recombine();
        let after_one = tree.root().word;
        tree.recombine();
        assert_eq!(tree.root().word, after_one);
    }

    #[test]
    fn test_recombine_requires_all_eight_children() {
        let mut tree = Octree::new(1, (0, 0, 0));
        for dx in 0..2u8 {
            for dy in 0..2u8 {
                tree.insert((dx, dy, 0), 1);
            }
        }
        tree.recombine();
        assert!(!tree.root().is_leaf());
    }

    #[test]
    fn test_recombine_requires_matching_voxel_id() {
        let mut tree = Octree::new(1, (0, 0, 0));
        for dx in 0..2u8 {
            for dy in 0..2u8 {
                for dz in 0..2u8 {
                    let id = if dx == 0 && dy == 0 && dz == 0 { 2 } else { 1 };
                    tree.insert((dx, dy, dz), id);
                }
            }
        }
        tree.recombine();
        assert!(!tree.root().is_leaf());
    }

    #[test]
    fn test_count_mask_matches_emitted_faces() {
        let mut tree = Octree::new(5, (16, 16, 16));
        tree.insert((4, 0, 4), 1);

        let expected: usize = Face::ALL
            .iter()
            .map(|f| tree.count_mask(*f))
            .sum();
        assert_eq!(expected, 6);

        let mut sink = CountingSink::default();
        let frustum = camera_frustum_seeing_everything();
        tree.cull(ALL_FACES_MASK, &frustum, Vec3::ZERO, Collision::Intersect, &mut sink);
        assert_eq!(sink.count, expected);
    }

    #[test]
    fn test_cull_respects_camera_mask() {
        let mut tree = Octree::new(5, (16, 16, 16));
        tree.insert((4, 0, 4), 1);

        let mut sink = CountingSink::default();
        let frustum = camera_frustum_seeing_everything();
        // camera mask excludes every face
        tree.cull(0, &frustum, Vec3::ZERO, Collision::Intersect, &mut sink);
        assert_eq!(sink.count, 0);
    }

    #[test]
    fn test_update_face_mask_rewrites_ring_position() {
        let mut tree = Octree::new(5, (16, 16, 16));
        tree.insert((4, 0, 4), 1);
        let faces = tree.update_face_mask(42, 7);
        assert_eq!(faces, ALL_FACES_MASK);

        let leaf = tree.find((4, 0, 4)).unwrap();
        assert_eq!(leaf.word.chunk_index(), 42);
        assert_eq!(leaf.word.segment_y(), 7);
    }

    #[test]
    fn test_pick_hits_the_top_face_of_a_leaf_below() {
        let mut tree = Octree::new(5, (0, 0, 0));
        tree.insert((8, 0, 8), 1);

        let ray = Ray::new(Vec3::new(8.5, 5.0, 8.5), Vec3::new(0.0, -1.0, 0.0));
        let hit = tree.pick(&ray, Vec3::ZERO, 100.0).expect("ray must hit the inserted leaf");

        assert_eq!(hit.word.voxel_id(), 1);
        assert!((hit.distance - 4.0).abs() < 1e-4);
        assert_eq!(hit.face, Face::PosY);
    }

    #[test]
    fn test_pick_misses_empty_space() {
        let mut tree = Octree::new(5, (0, 0, 0));
        tree.insert((8, 0, 8), 1);

        let ray = Ray::new(Vec3::new(20.5, 5.0, 20.5), Vec3::new(0.0, -1.0, 0.0));
        assert!(tree.pick(&ray, Vec3::ZERO, 100.0).is_none());
    }

    #[test]
    fn test_pick_respects_max_distance() {
        let mut tree = Octree::new(5, (0, 0, 0));
        tree.insert((8, 0, 8), 1);

        let ray = Ray::new(Vec3::new(8.5, 5.0, 8.5), Vec3::new(0.0, -1.0, 0.0));
        assert!(tree.pick(&ray, Vec3::ZERO, 2.0).is_none());
    }
}
