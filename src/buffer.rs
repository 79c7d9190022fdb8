//! Fast-memory tile buffer management.
//!
//! Each input/output stream owns a small pool of fixed-size f32 scratch
//! buffers (depth 1 or 2, for double buffering). Acquisition hands out an RAII
//! guard; dropping the guard returns the buffer to the pool on every exit
//! path. The bounded hand-off is a `sync_channel` free-list: an acquire
//! blocks until a previously outstanding buffer has been released, which is
//! exactly the producer/consumer pairing the pipeline needs.
//!
//! Transfers between the large external slices and local scratch are
//! described by `(rows, count, stride)` and use compact padding: reads past
//! the end of the source are suppressed rather than padded, so no garbage
//! ever lands in a buffer that feeds the accumulation caches.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use crate::element::Element;

/// Identifies one data stream of a strategy (dy, x, dx, ...).
pub type StreamId = usize;

/// Shape of one strided transfer between external and local memory.
///
/// `rows` runs along the outer (strided) axis, `count` elements are moved
/// per row. Strides are in elements of the external tensor / local buffer
/// respectively.
#[derive(Debug, Clone, Copy)]
pub struct TransferDesc {
    pub offset: usize,
    pub rows: usize,
    pub count: usize,
    pub ext_stride: usize,
    pub local_stride: usize,
}

impl TransferDesc {
    /// A single contiguous run of `count` elements at `offset`.
    pub fn contiguous(offset: usize, count: usize) -> Self {
        Self {
            offset,
            rows: 1,
            count,
            ext_stride: 0,
            local_stride: 0,
        }
    }

    /// Local elements the transfer touches.
    pub fn local_len(&self) -> usize {
        if self.rows == 0 || self.count == 0 {
            return 0;
        }
        (self.rows - 1) * self.local_stride.max(self.count) + self.count
    }
}

/// One on-chip scratch buffer, checked out of a [`TileBufferPool`].
pub struct TileBuffer<'p> {
    data: Box<[f32]>,
    home: &'p SyncSender<Box<[f32]>>,
}

impl TileBuffer<'_> {
    /// Load external elements into the head of the buffer, widening to f32.
    /// Out-of-range rows/elements are suppressed (compact padding).
    pub fn load<E: Element>(&mut self, src: &[E], desc: TransferDesc) {
        assert!(
            desc.local_len() <= self.data.len(),
            "transfer of {} elements exceeds buffer budget of {}",
            desc.local_len(),
            self.data.len()
        );
        let row_stride = desc.local_stride.max(desc.count);
        for r in 0..desc.rows {
            let src_base = desc.offset + r * desc.ext_stride;
            let dst_base = r * row_stride;
            for i in 0..desc.count {
                let Some(&v) = src.get(src_base + i) else {
                    // Compact pad: stop at the edge, copy nothing further.
                    break;
                };
                self.data[dst_base + i] = v.to_f32();
            }
        }
    }

    /// Store the head of the buffer back to external memory, narrowing once.
    pub fn store<E: Element>(&self, dst: &mut [E], desc: TransferDesc) {
        assert!(
            desc.local_len() <= self.data.len(),
            "transfer of {} elements exceeds buffer budget of {}",
            desc.local_len(),
            self.data.len()
        );
        let row_stride = desc.local_stride.max(desc.count);
        for r in 0..desc.rows {
            let dst_base = desc.offset + r * desc.ext_stride;
            let src_base = r * row_stride;
            for i in 0..desc.count {
                let Some(slot) = dst.get_mut(dst_base + i) else {
                    break;
                };
                *slot = E::from_f32(self.data[src_base + i]);
            }
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl Drop for TileBuffer<'_> {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        // The channel capacity equals the pool depth, so the send never
        // blocks; a receiver can only be gone during teardown.
        let _ = self.home.send(data);
    }
}

struct Stream {
    free: Receiver<Box<[f32]>>,
    home: SyncSender<Box<[f32]>>,
}

/// Fixed set of per-stream double buffers for one parallel unit.
pub struct TileBufferPool {
    streams: Vec<Stream>,
}

impl TileBufferPool {
    /// `budget` is the per-buffer capacity in f32 elements; `depth` is the
    /// number of outstanding buffers allowed per stream (1 or 2).
    pub fn new(streams: usize, depth: usize, budget: usize) -> Self {
        assert!(depth == 1 || depth == 2, "buffer depth must be 1 or 2");
        assert!(budget > 0, "buffer budget must be non-zero");
        let streams = (0..streams)
            .map(|_| {
                let (home, free) = sync_channel(depth);
                for _ in 0..depth {
                    home.send(vec![0.0; budget].into_boxed_slice())
                        .expect("filling a fresh pool cannot block");
                }
                Stream { free, home }
            })
            .collect();
        Self { streams }
    }

    /// Check a buffer out of `stream`, blocking until one is free.
    pub fn acquire(&self, stream: StreamId) -> TileBuffer<'_> {
        let s = &self.streams[stream];
        let data = s
            .free
            .recv()
            .expect("tile buffer pool sender dropped while in use");
        TileBuffer {
            data,
            home: &s.home,
        }
    }
}
