//! Downstream-owned PCM buffer lifecycle: free/ready lists over a fixed
//! slab of [`PoolBuffer`]s.
//!
//! A `PoolBuffer`'s memory is owned by whatever allocated it downstream; the
//! node only holds a non-owning handle (via [`MappedMemory`]) plus free/
//! ready/outstanding membership. Unlike the intrusive `spa_list` the
//! original uses, membership here is just an index living in exactly one of
//! two `VecDeque`s (or neither, when outstanding) — Rust ownership makes an
//! index-based queue the natural equivalent.

use std::collections::VecDeque;

use crate::error::{NodeError, Result};

/// Maximum number of pool buffers the port can hold at once.
pub const MAX_BUFFERS: usize = 32;

/// A downstream-owned region of mapped memory the node can write PCM into.
///
/// Real hosts back this with a memfd/shm mapping; tests and the demo binary
/// back it with a plain heap allocation.
pub trait MappedMemory: Send {
    /// Mutable view of the whole backing region.
    fn data_mut(&mut self) -> &mut [u8];

    /// Capacity of the backing region in bytes.
    fn max_size(&self) -> usize;
}

/// A heap-backed [`MappedMemory`] for tests and the demo binary.
pub struct HeapMemory {
    bytes: Vec<u8>,
}

impl HeapMemory {
    pub fn new(max_size: usize) -> Self {
        HeapMemory {
            bytes: vec![0u8; max_size],
        }
    }
}

impl MappedMemory for HeapMemory {
    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn max_size(&self) -> usize {
        self.bytes.len()
    }
}

/// Chunk descriptor written when a buffer is handed to `ready`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunk {
    pub offset: u32,
    pub size: u32,
    pub stride: u32,
}

/// Optional per-buffer timestamp metadata, present only if the buffer the
/// host supplied declared a Header meta slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferHeader {
    pub seq: u64,
    pub pts: u64,
    pub dts_offset: i64,
}

/// One pool buffer: downstream memory plus free/ready/outstanding membership.
pub struct PoolBuffer {
    pub id: u32,
    pub outstanding: bool,
    pub memory: Box<dyn MappedMemory>,
    pub chunk: Chunk,
    pub header: Option<BufferHeader>,
}

/// Free/ready list manager over a slab of [`PoolBuffer`]s.
#[derive(Default)]
pub struct BufferPool {
    buffers: Vec<PoolBuffer>,
    free: VecDeque<u32>,
    ready: VecDeque<u32>,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool {
            buffers: Vec::new(),
            free: VecDeque::new(),
            ready: VecDeque::new(),
        }
    }

    /// Number of buffers currently configured.
    pub fn n_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Install a fresh set of buffers, discarding any previously configured
    /// ones first (no leak, no reuse across generations).
    ///
    /// `has_header` mirrors whether the host's buffers declared a Header
    /// meta slot for timestamping.
    pub fn use_buffers(
        &mut self,
        memories: Vec<Box<dyn MappedMemory>>,
        has_header: bool,
    ) -> Result<()> {
        if memories.len() > MAX_BUFFERS {
            return Err(NodeError::InvalidArg(format!(
                "too many buffers: {} > MAX_BUFFERS ({MAX_BUFFERS})",
                memories.len()
            )));
        }
        self.clear();

        self.buffers = memories
            .into_iter()
            .enumerate()
            .map(|(i, memory)| PoolBuffer {
                id: i as u32,
                outstanding: false,
                memory,
                chunk: Chunk::default(),
                header: has_header.then(BufferHeader::default),
            })
            .collect();

        self.reset_buffers();
        Ok(())
    }

    /// Place every known buffer on `free` and clear `outstanding`.
    pub fn reset_buffers(&mut self) {
        self.free.clear();
        self.ready.clear();
        for b in &mut self.buffers {
            b.outstanding = false;
            self.free.push_back(b.id);
        }
    }

    /// Drop all configured buffers.
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.free.clear();
        self.ready.clear();
    }

    /// Recycle a buffer back to `free`. Idempotent: recycling a buffer that
    /// isn't outstanding is a no-op, not an error.
    pub fn recycle(&mut self, id: u32) -> Result<()> {
        if self.buffers.is_empty() {
            return Err(NodeError::IoState("no buffers configured".into()));
        }
        let buffer = self
            .buffers
            .get_mut(id as usize)
            .ok_or_else(|| NodeError::InvalidArg(format!("invalid buffer id {id}")))?;
        if buffer.outstanding {
            buffer.outstanding = false;
            self.free.push_back(id);
        }
        Ok(())
    }

    /// Take the head of `free`, if any.
    pub fn dequeue_free(&mut self) -> Option<u32> {
        self.free.pop_front()
    }

    /// Append a buffer to `ready` (caller must have already removed it from
    /// `free`).
    pub fn enqueue_ready(&mut self, id: u32) {
        self.ready.push_back(id);
    }

    /// Take the head of `ready`, marking it outstanding.
    pub fn dequeue_ready(&mut self) -> Option<u32> {
        let id = self.ready.pop_front()?;
        if let Some(b) = self.buffers.get_mut(id as usize) {
            b.outstanding = true;
        }
        Some(id)
    }

    pub fn is_ready_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut PoolBuffer> {
        self.buffers.get_mut(id as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(n: usize) -> BufferPool {
        let mut pool = BufferPool::new();
        let mems: Vec<Box<dyn MappedMemory>> =
            (0..n).map(|_| Box::new(HeapMemory::new(4096)) as Box<dyn MappedMemory>).collect();
        pool.use_buffers(mems, true).unwrap();
        pool
    }

    #[test]
    fn fresh_pool_has_all_buffers_free() {
        let mut pool = pool_with(3);
        assert_eq!(pool.n_buffers(), 3);
        assert!(pool.is_ready_empty());
        for _ in 0..3 {
            assert!(pool.dequeue_free().is_some());
        }
        assert!(pool.dequeue_free().is_none());
    }

    #[test]
    fn recycle_is_idempotent() {
        let mut pool = pool_with(2);
        let id = pool.dequeue_free().unwrap();
        pool.enqueue_ready(id);
        let id = pool.dequeue_ready().unwrap();

        pool.recycle(id).unwrap();
        // Second recycle of the same (now non-outstanding) buffer is a no-op,
        // not an error, and must not double-insert into `free`.
        pool.recycle(id).unwrap();

        let mut seen = 0;
        while pool.dequeue_free().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn recycle_invalid_id_is_invalid_arg() {
        let mut pool = pool_with(2);
        assert!(matches!(pool.recycle(99), Err(NodeError::InvalidArg(_))));
    }

    #[test]
    fn recycle_with_no_buffers_is_io_state() {
        let mut pool = BufferPool::new();
        assert!(matches!(pool.recycle(0), Err(NodeError::IoState(_))));
    }

    #[test]
    fn use_buffers_frees_prior_generation() {
        let mut pool = pool_with(2);
        let id0 = pool.dequeue_free().unwrap();
        pool.enqueue_ready(id0);

        let mems: Vec<Box<dyn MappedMemory>> =
            vec![Box::new(HeapMemory::new(4096)) as Box<dyn MappedMemory>];
        pool.use_buffers(mems, false).unwrap();

        assert_eq!(pool.n_buffers(), 1);
        assert!(pool.is_ready_empty());
        assert!(pool.dequeue_free().is_some());
        assert!(pool.dequeue_free().is_none());
    }

    #[test]
    fn too_many_buffers_rejected() {
        let mut pool = BufferPool::new();
        let mems: Vec<Box<dyn MappedMemory>> = (0..MAX_BUFFERS + 1)
            .map(|_| Box::new(HeapMemory::new(16)) as Box<dyn MappedMemory>)
            .collect();
        assert!(matches!(
            pool.use_buffers(mems, false),
            Err(NodeError::InvalidArg(_))
        ));
    }
}
