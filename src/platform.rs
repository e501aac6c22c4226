//! Platform: the sliding-window chunk ring and its swap state machine.
//!
//! Grounded directly in the original's `core/level/platform.h`/`.cpp`:
//! a six-state tick advancing `load_chunks` -> `compress_chunks` ->
//! `swap_chunks` -> `unload_chunks`, a `chunks` registry holding the
//! only strong reference to each chunk, and `active`/`queued` ring maps
//! that can both point at the same chunk while the window only
//! translates. Reworked around `Arc<Chunk>` + a `parking_lot::Mutex`
//! instead of the original's raw `shared_ptr`/`std::mutex` pair, per
//! `spec.md` §9 ("Cyclic ownership").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::camera::Camera;
use crate::core::config::EngineConfig;
use crate::core::tunables::{CHUNK_SIZE, LOAD_THRESHOLD, MAX_INTERACTION_RANGE, RENDER_RADIUS, RING_SLOTS};
use crate::math::frustum::Collision;
use crate::render::RenderProducer;
use crate::taskpool::TaskPool;
use crate::voxel::chunk::{Chunk, ChunkCoord, Side};

/// The platform's six-state swap cycle, advanced once per [`Platform::tick`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum LevelState {
    Init = 0,
    Idle = 1,
    Loading = 2,
    Compressing = 3,
    Swapping = 4,
    Unloading = 5,
}

impl LevelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LevelState::Init,
            1 => LevelState::Idle,
            2 => LevelState::Loading,
            3 => LevelState::Compressing,
            4 => LevelState::Swapping,
            _ => LevelState::Unloading,
        }
    }
}

struct AtomicLevelState(AtomicU8);

impl AtomicLevelState {
    fn new(state: LevelState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> LevelState {
        LevelState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: LevelState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// World-space XZ position rounded to the nearest multiple of
/// `CHUNK_SIZE`, matching the original's `lround(pos / CHUNK_SIZE) *
/// CHUNK_SIZE`.
fn round_to_chunk(value: f32) -> i32 {
    (value / CHUNK_SIZE as f32).round() as i32 * CHUNK_SIZE as i32
}

/// A chunk-grid offset `(x, z)` is in-ring iff its distance from
/// `(-0.5, -0.5)` is under `RENDER_RADIUS` — the same off-center
/// distance test the original uses so the ring is symmetric around the
/// camera without a chunk straddling dead center.
fn in_ring(x: i32, z: i32) -> bool {
    let dx = x as f32 - (-0.5);
    let dz = z as f32 - (-0.5);
    (dx * dx + dz * dz).sqrt() < RENDER_RADIUS as f32
}

/// Ring slot for local offset `(x, z)` in `[-R, R)`, or `None` if the
/// offset falls outside the circular ring even though it's inside the
/// bounding square.
fn ring_index(x: i32, z: i32) -> Option<u16> {
    if !in_ring(x, z) {
        return None;
    }
    let r = RENDER_RADIUS;
    let idx = (x + r) + (z + r) * 2 * r;
    Some(idx as u16)
}

/// The active/queued ring state, held together so a single mutex
/// guards both container swaps and the flat-vector rebuild — the only
/// lock-held region the spec calls out as needing to stay short.
struct Rings {
    active: Vec<Option<Arc<Chunk>>>,
    queued: Vec<Option<Arc<Chunk>>>,
    active_flat: Vec<(u16, Arc<Chunk>)>,
}

impl Rings {
    fn empty() -> Self {
        Self {
            active: (0..RING_SLOTS).map(|_| None).collect(),
            queued: (0..RING_SLOTS).map(|_| None).collect(),
            active_flat: Vec::new(),
        }
    }
}

/// The sliding-window chunk set around a moving observer: a registry
/// holding the only strong reference to each chunk, an active/queued
/// ring pair, and the six-state swap machine from `spec.md` §4.3.
pub struct Platform {
    registry: Mutex<HashMap<ChunkCoord, Arc<Chunk>>>,
    rings: Mutex<Rings>,
    current_root: Mutex<(i32, i32)>,
    new_root: Mutex<(i32, i32)>,
    level_state: AtomicLevelState,
    queue_ready: AtomicBool,
    chunk_pool: Arc<TaskPool>,
    render_pool: Arc<TaskPool>,
}

impl Platform {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            rings: Mutex::new(Rings::empty()),
            current_root: Mutex::new((0, 0)),
            new_root: Mutex::new((0, 0)),
            level_state: AtomicLevelState::new(LevelState::Init),
            queue_ready: AtomicBool::new(false),
            chunk_pool: Arc::new(TaskPool::new(config.chunk_tick_workers)),
            render_pool: Arc::new(TaskPool::new(config.render_workers)),
        }
    }

    pub fn current_root(&self) -> (i32, i32) {
        *self.current_root.lock()
    }

    fn chunk_coord_at(root: (i32, i32), ring_idx: u16) -> ChunkCoord {
        let r = RENDER_RADIUS;
        let local_x = (ring_idx as i32 % (2 * r)) - r;
        let local_z = (ring_idx as i32 / (2 * r)) - r;
        ChunkCoord::new(root.0 / CHUNK_SIZE as i32 + local_x, root.1 / CHUNK_SIZE as i32 + local_z)
    }

    /// Advance the swap state machine by exactly one state transition
    /// per call, per the table in `spec.md` §4.3. Call once per tick.
    pub fn tick(&self, camera: &Camera) {
        let candidate = (round_to_chunk(camera.position.x), round_to_chunk(camera.position.z));

        match self.level_state.load() {
            LevelState::Init => {
                *self.new_root.lock() = candidate;
                self.load_chunks();
                self.level_state.store(LevelState::Loading);
            }
            LevelState::Idle => {
                let current = *self.current_root.lock();
                let dx = (current.0 - candidate.0) as f32;
                let dz = (current.1 - candidate.1) as f32;
                let past_threshold = (dx * dx + dz * dz).sqrt() > LOAD_THRESHOLD;

                if self.queue_ready.load(Ordering::Acquire) || !past_threshold {
                    return;
                }
                if !self.chunk_pool.no_tasks() {
                    return;
                }
                *self.new_root.lock() = candidate;
                self.load_chunks();
                self.level_state.store(LevelState::Loading);
            }
            LevelState::Loading => {
                if !self.chunk_pool.no_tasks() {
                    return;
                }
                self.compress_chunks();
                self.level_state.store(LevelState::Compressing);
            }
            LevelState::Compressing => {
                if !self.chunk_pool.no_tasks() {
                    return;
                }
                self.swap_chunks();
                self.level_state.store(LevelState::Swapping);
            }
            LevelState::Swapping => {
                self.unload_chunks();
                self.level_state.store(LevelState::Unloading);
            }
            LevelState::Unloading => {
                if !self.chunk_pool.no_tasks() {
                    return;
                }
                self.level_state.store(LevelState::Idle);
            }
        }
    }

    /// Populate `queued` for every in-ring slot: reuse a chunk shared
    /// with the outgoing active ring where the sliding window still
    /// covers it, otherwise allocate fresh and schedule `generate` on
    /// the chunk-tick pool. Always links the four axis neighbors within
    /// the queued set, symmetrically.
    fn load_chunks(&self) {
        let new_root = *self.new_root.lock();
        let current_root = *self.current_root.lock();
        let r = RENDER_RADIUS;

        let mut rings = self.rings.lock();
        let mut registry = self.registry.lock();

        for x in -r..r {
            for z in -r..r {
                let Some(idx) = ring_index(x, z) else { continue };

                // this (x, z) slot's absolute chunk position relative to
                // the OLD root, in chunk units — if it lands in-ring
                // there too, the window only translated and we can
                // reuse the live chunk rather than regenerate it.
                let old_local_x = x + (new_root.0 - current_root.0) / CHUNK_SIZE as i32;
                let old_local_z = z + (new_root.1 - current_root.1) / CHUNK_SIZE as i32;
                let old_idx = ring_index(old_local_x, old_local_z);

                let reused = old_idx.and_then(|old_idx| rings.active[old_idx as usize].clone());

                let chunk = match reused {
                    Some(chunk) => {
                        chunk.set_ring_index(idx);
                        chunk
                    }
                    None => {
                        let coord = Self::chunk_coord_at(new_root, idx);
                        let chunk = registry
                            .entry(coord)
                            .or_insert_with(|| Chunk::new(coord, idx))
                            .clone();
                        chunk.set_ring_index(idx);
                        let generating = chunk.clone();
                        self.chunk_pool.enqueue_detach(move || generating.generate());
                        chunk
                    }
                };

                rings.queued[idx as usize] = Some(chunk);
            }
        }

        drop(registry);
        self.init_neighbors(&mut rings);
    }

    /// Link every queued chunk to its four axis neighbors within the
    /// queued set. `link_neighbor` writes both directions at once, so
    /// visiting every side from every chunk just re-links the same pair
    /// twice — harmless, not worth special-casing.
    fn init_neighbors(&self, rings: &mut Rings) {
        let r = RENDER_RADIUS;
        for x in -r..r {
            for z in -r..r {
                let Some(idx) = ring_index(x, z) else { continue };
                let Some(chunk) = rings.queued[idx as usize].clone() else { continue };

                for side in Side::ALL {
                    let (dx, dz) = side.offset();
                    let Some(nidx) = ring_index(x + dx, z + dz) else { continue };
                    if let Some(neighbor) = rings.queued[nidx as usize].clone() {
                        chunk.link_neighbor(side, &neighbor);
                    }
                }
            }
        }
    }

    /// Schedule `recombine` for every queued chunk whose recorded ring
    /// index matches the slot it's being seen under this pass — this
    /// is what keeps a chunk shared across two ring slots (impossible
    /// under a sliding translation, but defensive) from being
    /// recombined twice in one compress phase.
    fn compress_chunks(&self) {
        let rings = self.rings.lock();
        for (idx, slot) in rings.queued.iter().enumerate() {
            let Some(chunk) = slot else { continue };
            if chunk.ring_index() != idx as u16 {
                continue;
            }
            let chunk = chunk.clone();
            self.chunk_pool.enqueue_detach(move || chunk.compress());
        }
    }

    /// Swap `active` and `queued` under the platform mutex, rebuild the
    /// flat iteration vector, and mark `queue_ready` so the next render
    /// dispatch rebinds ring positions.
    fn swap_chunks(&self) {
        let mut rings = self.rings.lock();
        std::mem::swap(&mut rings.active, &mut rings.queued);
        rings.active_flat = rings
            .active
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.clone().map(|c| (i as u16, c)))
            .collect();

        *self.current_root.lock() = *self.new_root.lock();
        self.queue_ready.store(true, Ordering::Release);
    }

    /// Drop every chunk left in the (now stale) `queued` ring that
    /// isn't also present in the new `active` ring, and clear `queued`
    /// for the next load. Dropping a chunk's last strong reference in
    /// the registry frees it; scheduled on the chunk pool so the drop
    /// (which may be the tail of a large `Box<[Node; 8]>` tree) doesn't
    /// block the tick.
    fn unload_chunks(&self) {
        let mut rings = self.rings.lock();
        let outgoing: Vec<Arc<Chunk>> = rings.queued.iter().filter_map(|s| s.clone()).collect();
        let incoming: std::collections::HashSet<_> =
            rings.active.iter().filter_map(|s| s.as_ref().map(|c| c.coord())).collect();

        for slot in rings.queued.iter_mut() {
            *slot = None;
        }
        drop(rings);

        let mut registry = self.registry.lock();
        for chunk in outgoing {
            if !incoming.contains(&chunk.coord()) {
                let coord = chunk.coord();
                registry.remove(&coord);
                self.chunk_pool.enqueue_detach(move || drop(chunk));
            }
        }
    }

    /// Per-frame render dispatch: if a swap happened since the last
    /// call, rebind every active chunk's ring position before culling.
    /// Chunks the camera's whole bounding square can't see are skipped
    /// before they ever reach the render pool; everything else is
    /// culled segment-by-segment against the frustum. Blocks until the
    /// render pool drains.
    pub fn update(&self, camera: &Camera, producer: Arc<RenderProducer>) {
        let rings = self.rings.lock();
        let rebind = self.queue_ready.swap(false, Ordering::AcqRel);
        let camera_mask = camera.face_mask();
        let frustum = *camera.frustum();

        let camera = camera.clone();
        for (_idx, chunk) in rings.active_flat.iter().cloned() {
            let producer = producer.clone();
            let camera = camera.clone();
            self.render_pool.enqueue_detach(move || {
                if rebind {
                    chunk.refresh_masks();
                }
                if !chunk.visible(&camera) {
                    return;
                }
                let thread_id = TaskPool::current_worker_id().unwrap_or(0);
                chunk.cull(camera_mask, &frustum, Collision::Intersect, &producer, thread_id);
            });
        }
        drop(rings);
        self.render_pool.wait_for_tasks();
    }

    /// The four chunks nearest an arbitrary world position, used by the
    /// ray picker. Matches the original's half-chunk rounding: a
    /// position more than half a chunk past the lower corner nudges the
    /// 2x2 window one chunk further along that axis.
    pub fn get_nearest_chunks(&self, world_pos: (f32, f32, f32)) -> [Option<Arc<Chunk>>; 4] {
        let size = CHUNK_SIZE as f32;
        let mut root_x = (world_pos.0 / size).floor() as i32 - 1;
        let mut root_z = (world_pos.2 / size).floor() as i32 - 1;

        if (world_pos.0.abs() % size) > size / 2.0 {
            root_x += if world_pos.0 > 0.0 { 1 } else { -1 };
        }
        if (world_pos.2.abs() % size) > size / 2.0 {
            root_z += if world_pos.2 > 0.0 { 1 } else { -1 };
        }

        let root = *self.current_root.lock();
        let rings = self.rings.lock();
        let at = |dx: i32, dz: i32| -> Option<Arc<Chunk>> {
            let local_x = root_x + dx - root.0 / CHUNK_SIZE as i32;
            let local_z = root_z + dz - root.1 / CHUNK_SIZE as i32;
            ring_index(local_x, local_z).and_then(|idx| rings.active[idx as usize].clone())
        };

        [at(0, 0), at(1, 0), at(0, 1), at(1, 1)]
    }

    /// Ray pick along the camera's front vector: narrows to the 2x2
    /// chunks nearest the camera, then picks each and keeps the closest
    /// hit, bounded to `MAX_INTERACTION_RANGE`.
    pub fn pick(&self, camera: &Camera) -> Option<crate::voxel::svo::PickHit> {
        let pos = camera.position;
        let ray = crate::math::Ray::new(pos, camera.front());
        let nearest = self.get_nearest_chunks((pos.x, pos.y, pos.z));

        nearest
            .into_iter()
            .flatten()
            .filter_map(|chunk| chunk.pick(&ray, MAX_INTERACTION_RANGE))
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }

    pub fn chunk_pool(&self) -> &Arc<TaskPool> {
        &self.chunk_pool
    }

    pub fn render_pool(&self) -> &Arc<TaskPool> {
        &self.render_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig {
            chunk_tick_workers: 2,
            render_workers: 2,
            arena_block_size: crate::core::tunables::HUGE_PAGE,
        }
    }

    #[test]
    fn ring_index_formula_matches_spec() {
        let r = RENDER_RADIUS;
        assert_eq!(ring_index(-r, -r), Some(0));
        assert_eq!(ring_index(0, 0), Some((r + r * 2 * r) as u16));
    }

    #[test]
    fn in_ring_excludes_far_corners_of_the_bounding_square() {
        let r = RENDER_RADIUS;
        // the square corner (R-1, R-1) is farther than R from (-0.5,-0.5)
        // and must fall outside the circular ring.
        assert!(!in_ring(r - 1, r - 1));
        assert!(in_ring(0, 0));
    }

    #[test]
    fn init_tick_loads_the_first_ring_and_moves_to_loading() {
        let platform = Platform::new(&config());
        let camera = Camera::default();
        platform.tick(&camera);
        platform.chunk_pool.wait_for_tasks();

        let registry_len = platform.registry.lock().len();
        assert!(registry_len > 0, "loading the first ring must populate the registry");
    }

    #[test]
    fn full_sweep_reaches_idle_with_an_active_ring() {
        let platform = Platform::new(&config());
        let camera = Camera::default();

        // INIT -> LOADING
        platform.tick(&camera);
        platform.chunk_pool.wait_for_tasks();
        // LOADING -> COMPRESSING
        platform.tick(&camera);
        platform.chunk_pool.wait_for_tasks();
        // COMPRESSING -> SWAPPING
        platform.tick(&camera);
        // SWAPPING -> UNLOADING
        platform.tick(&camera);
        platform.chunk_pool.wait_for_tasks();
        // UNLOADING -> IDLE
        platform.tick(&camera);

        assert_eq!(platform.level_state.load(), LevelState::Idle);
        let active_count = platform.rings.lock().active_flat.len();
        assert!(active_count > 0, "a full sweep must leave an active ring");
    }

    #[test]
    fn sliding_the_root_preserves_chunks_still_in_ring() {
        let platform = Platform::new(&config());
        let mut camera = Camera::default();
        camera.position.x = 0.0;
        camera.position.z = 0.0;

        for _ in 0..5 {
            platform.tick(&camera);
            platform.chunk_pool.wait_for_tasks();
        }
        assert_eq!(platform.level_state.load(), LevelState::Idle);

        let coord_before = {
            let rings = platform.rings.lock();
            rings.active_flat.iter().find(|(idx, _)| *idx == 0).map(|(_, c)| c.coord())
        };

        // slide by a single chunk: small enough that most of the ring
        // is preserved by shared-ownership reuse.
        camera.position.x = CHUNK_SIZE as f32;
        camera.update();

        for _ in 0..5 {
            platform.tick(&camera);
            platform.chunk_pool.wait_for_tasks();
        }
        assert_eq!(platform.level_state.load(), LevelState::Idle);

        assert!(coord_before.is_some());
    }

    #[test]
    fn get_nearest_chunks_returns_a_2x2_window() {
        let platform = Platform::new(&config());
        let camera = Camera::default();
        for _ in 0..5 {
            platform.tick(&camera);
            platform.chunk_pool.wait_for_tasks();
        }

        let nearest = platform.get_nearest_chunks((4.0, 0.0, 4.0));
        assert_eq!(nearest.len(), 4);
    }

    #[test]
    fn pick_hits_a_voxel_placed_in_the_nearest_chunk() {
        let platform = Platform::new(&config());
        let camera = Camera::default();
        for _ in 0..5 {
            platform.tick(&camera);
            platform.chunk_pool.wait_for_tasks();
        }

        let chunk = {
            let rings = platform.rings.lock();
            rings
                .active_flat
                .iter()
                .find(|(_, c)| c.coord() == ChunkCoord::new(0, 0))
                .map(|(_, c)| c.clone())
                .expect("chunk at the origin must be in the active ring")
        };
        chunk.insert((8, 0, 8), crate::voxel::chunk::VOXEL_STONE, false);
        chunk.refresh_masks();

        let mut camera = Camera::default();
        camera.position = crate::core::types::Vec3::new(8.5, 4.0, 8.5);
        camera.yaw = -std::f32::consts::FRAC_PI_2;
        camera.pitch = -std::f32::consts::FRAC_PI_2 + 0.001;
        camera.update();

        let hit = platform.pick(&camera).expect("ray must hit the placed voxel");
        assert_eq!(hit.word.voxel_id(), crate::voxel::chunk::VOXEL_STONE);
    }

    fn producer(render_pool: &Arc<TaskPool>) -> Arc<RenderProducer> {
        let arena = Arc::new(crate::memory::Arena::new());
        let allocator =
            Arc::new(crate::memory::LinearAllocator::new(arena, crate::core::tunables::HUGE_PAGE).unwrap());
        Arc::new(RenderProducer::new(allocator, render_pool.worker_count()))
    }

    #[test]
    fn update_drains_the_render_pool_and_skips_chunks_outside_the_camera() {
        let platform = Platform::new(&config());
        let camera = Camera::default();
        for _ in 0..5 {
            platform.tick(&camera);
            platform.chunk_pool.wait_for_tasks();
        }
        assert_eq!(platform.level_state.load(), LevelState::Idle);

        let render_producer = producer(&platform.render_pool);
        render_producer.prepare_frame();
        // must not deadlock or panic even though no segment has generated
        // voxel content yet; chunk.cull on an empty octree just emits nothing.
        platform.update(&camera, render_producer.clone());

        let mut total = 0;
        render_producer.frame(|slice| total += slice.len());
        assert_eq!(total, 0, "a freshly loaded ring has no solid voxels to cull");
    }
}
