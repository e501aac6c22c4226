//! Render producer: per-thread arena-backed vertex segments fed by
//! parallel chunk culling, drained once per frame by a rasterizer.
//!
//! Grounded in the original's `core/level/chunk/chunk_renderer.cpp`
//! (per-thread growing vector of buffers, `request_writeable_area` /
//! `add_size_writeable_area`) layered on the [`crate::memory`] bump
//! allocator instead of a raw per-thread pointer.

use std::ptr::NonNull;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::core::tunables::MAX_VERTICES_BUFFER;
use crate::memory::LinearAllocator;
use crate::voxel::svo::{Face, PackedWord, VertexSink};

/// The 8-byte vertex word handed to the rasterizer. Carries the node's
/// masked packed word (position, scale, chunk_index, segment_y,
/// voxel_id — see [`crate::voxel::svo::FACE_EMIT_MASK`]) OR'd with a
/// per-corner face template occupying the bits the mask clears
/// (segments 56-63, faces 50-55).
///
/// The external interface in `spec.md` §6 describes this as two 32-bit
/// lanes (`lane0`/`lane1`); [`Vertex::as_lanes`] is that split, offered
/// as a convenience for a rasterizer vertex-attribute declaration. It is
/// not meant to regroup fields by meaning — the shader side of that
/// boundary is out of scope here.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Vertex(pub u64);

impl Vertex {
    pub fn as_lanes(self) -> (u32, u32) {
        (self.0 as u32, (self.0 >> 32) as u32)
    }

    pub fn word(self) -> PackedWord {
        PackedWord(self.0)
    }
}

const CORNER_SHIFT: u32 = 50;
const U_SHIFT: u32 = 52;
const V_SHIFT: u32 = 53;
const NORMAL_SHIFT: u32 = 54;

const fn template_vertex(corner: u64, u: u64, v: u64, face: u8) -> u64 {
    (corner << CORNER_SHIFT) | (u << U_SHIFT) | (v << V_SHIFT) | ((face as u64) << NORMAL_SHIFT)
}

/// Four corners per face, baked once at compile time: `(corner, u, v)`
/// per vertex of a `0,1,3,1,2,3` index-buffer quad.
const fn face_template(face: u8) -> [u64; 4] {
    [
        template_vertex(0, 0, 0, face),
        template_vertex(1, 1, 0, face),
        template_vertex(2, 1, 1, face),
        template_vertex(3, 0, 1, face),
    ]
}

/// Pre-baked quad template per face direction, indexed by [`Face`]'s
/// discriminant (NegX, PosX, NegY, PosY, NegZ, PosZ).
pub const FACE_TEMPLATES: [[u64; 4]; 6] = [
    face_template(0),
    face_template(1),
    face_template(2),
    face_template(3),
    face_template(4),
    face_template(5),
];

/// A growing, append-only run of vertices bump-allocated from a
/// [`LinearAllocator`] page. `size` is the number actually written;
/// `capacity` is the number reserved by `request_writeable_area`.
struct Buffer {
    mem: NonNull<Vertex>,
    capacity: usize,
    size: usize,
}

unsafe impl Send for Buffer {}

/// A reservation returned by [`RenderProducer::request_writeable_area`].
/// Implements [`VertexSink`] so `Octree::cull` can write directly into
/// it; the emitted count must never exceed the reserved capacity.
pub struct WriteableArea<'a> {
    producer: &'a RenderProducer,
    thread_id: usize,
    buffer_index: usize,
    mem: NonNull<Vertex>,
    capacity: usize,
    written: usize,
}

impl<'a> VertexSink for WriteableArea<'a> {
    fn push_face(&mut self, masked_word: PackedWord, face: Face) {
        debug_assert!(
            self.written + 4 <= self.capacity,
            "cull emitted more vertices than count_mask reserved"
        );
        let template = FACE_TEMPLATES[face as usize];
        for (i, corner) in template.iter().enumerate() {
            let vertex = Vertex(masked_word.0 | corner);
            unsafe { self.mem.as_ptr().add(self.written + i).write(vertex) };
        }
        self.written += 4;
    }
}

impl<'a> Drop for WriteableArea<'a> {
    fn drop(&mut self) {
        self.producer
            .add_size_writeable_area(self.thread_id, self.buffer_index, self.written);
    }
}

/// Per-thread arena-backed vertex producer. One `Vec<Buffer>` per
/// worker thread id, growing as chunks request more room than the
/// current tail buffer has left.
pub struct RenderProducer {
    allocator: Arc<LinearAllocator>,
    buffers: Vec<Mutex<Vec<Buffer>>>,
    vertices_per_buffer: usize,
}

impl RenderProducer {
    pub fn new(allocator: Arc<LinearAllocator>, worker_count: usize) -> Self {
        let buffers = (0..worker_count).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            allocator,
            buffers,
            vertices_per_buffer: MAX_VERTICES_BUFFER,
        }
    }

    /// Reset the backing bump allocator and push one fresh, empty
    /// buffer per worker so this frame's culls start from a clean tail.
    pub fn prepare_frame(&self) {
        self.allocator.reset();
        for slot in &self.buffers {
            let mut bufs = slot.lock();
            bufs.clear();
            bufs.push(self.fresh_buffer(self.vertices_per_buffer.max(1)));
        }
    }

    fn fresh_buffer(&self, capacity: usize) -> Buffer {
        let mem = self.allocator.allocate::<Vertex>(capacity);
        Buffer {
            mem,
            capacity,
            size: 0,
        }
    }

    /// Reserve room for exactly `len` vertices in `thread_id`'s tail
    /// buffer, growing a new one (sized to fit `len`, at least the
    /// default buffer size) if the tail doesn't have room.
    pub fn request_writeable_area(&self, len: usize, thread_id: usize) -> WriteableArea<'_> {
        let mut bufs = self.buffers[thread_id].lock();
        if bufs.is_empty() || bufs.last().unwrap().size + len > bufs.last().unwrap().capacity {
            let capacity = len.max(self.vertices_per_buffer);
            bufs.push(self.fresh_buffer(capacity));
        }
        let buffer_index = bufs.len() - 1;
        let tail = bufs.last().unwrap();
        let mem = unsafe { NonNull::new_unchecked(tail.mem.as_ptr().add(tail.size)) };
        let capacity = len;
        drop(bufs);

        WriteableArea {
            producer: self,
            thread_id,
            buffer_index,
            mem,
            capacity,
            written: 0,
        }
    }

    fn add_size_writeable_area(&self, thread_id: usize, buffer_index: usize, len: usize) {
        let mut bufs = self.buffers[thread_id].lock();
        bufs[buffer_index].size += len;
    }

    /// Drain every worker's buffers for this frame: every buffer but
    /// the tail is a full `MAX_VERTICES_BUFFER`-capacity draw; the tails
    /// are reported separately so a caller can batch them into as few
    /// draw calls as its quota allows.
    pub fn frame<F: FnMut(&[Vertex])>(&self, mut draw: F) {
        for slot in &self.buffers {
            let bufs = slot.lock();
            for buffer in bufs.iter() {
                if buffer.size == 0 {
                    continue;
                }
                let slice = unsafe { std::slice::from_raw_parts(buffer.mem.as_ptr(), buffer.size) };
                draw(slice);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Arena;

    fn producer(workers: usize) -> RenderProducer {
        let arena = Arc::new(Arena::new());
        let allocator = Arc::new(LinearAllocator::new(arena, crate::core::tunables::HUGE_PAGE).unwrap());
        RenderProducer::new(allocator, workers)
    }

    #[test]
    fn writeable_area_emits_four_vertices_per_face() {
        let producer = producer(1);
        producer.prepare_frame();

        let word = PackedWord::new().with_voxel_id(7).with_position(1, 2, 3);
        {
            let mut area = producer.request_writeable_area(4, 0);
            area.push_face(word, Face::PosY);
        }

        let mut total = 0;
        producer.frame(|slice| total += slice.len());
        assert_eq!(total, 4);
    }

    #[test]
    fn emitted_vertex_preserves_voxel_id_and_position() {
        let producer = producer(1);
        producer.prepare_frame();

        let word = PackedWord::new().with_voxel_id(9).with_position(4, 0, 4);
        {
            let mut area = producer.request_writeable_area(4, 0);
            area.push_face(word, Face::PosY);
        }

        let mut seen = Vec::new();
        producer.frame(|slice| seen.extend_from_slice(slice));
        assert_eq!(seen.len(), 4);
        for v in seen {
            assert_eq!(v.word().voxel_id(), 9);
            assert_eq!(v.word().position(), (4, 0, 4));
        }
    }

    #[test]
    fn request_writeable_area_grows_a_new_buffer_when_tail_is_full() {
        let producer = producer(1);
        producer.prepare_frame();

        {
            let mut area = producer.request_writeable_area(MAX_VERTICES_BUFFER, 0);
            for _ in 0..MAX_VERTICES_BUFFER / 4 {
                area.push_face(PackedWord::new(), Face::PosX);
            }
        }
        // this second reservation cannot fit in the now-full tail buffer.
        let area = producer.request_writeable_area(4, 0);
        assert_eq!(area.buffer_index, 1);
    }

    #[test]
    fn prepare_frame_resets_all_worker_buffers() {
        let producer = producer(2);
        producer.prepare_frame();
        {
            let mut area = producer.request_writeable_area(4, 0);
            area.push_face(PackedWord::new(), Face::NegZ);
        }
        producer.prepare_frame();

        let mut total = 0;
        producer.frame(|slice| total += slice.len());
        assert_eq!(total, 0);
    }
}
