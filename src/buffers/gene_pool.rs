use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};
use crate::buffers::gene_buf::{GeneBufMut, PooledBlock};

/// Buffers for small control frames (lost gene, stream control)
const SMALL_CLASS_LEN: usize = 64;

/// A pool of byte buffers in a few size classes. It is shared by all connections of an end
///  point, and every datagram the engine sends or receives lives in one of its buffers.
///
/// Renting and returning happens through a short critical section per size class, the
///  outstanding count is atomic. A buffer is returned when its last owner is dropped.
pub struct GenePool {
    classes: Vec<SizeClass>,
    outstanding: AtomicUsize,
    rented: AtomicU64,
    direct_allocations: AtomicU64,
}

struct SizeClass {
    buf_len: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

/// Snapshot of the pool's occupancy for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDump {
    /// (buffer length, number of pooled buffers) per size class
    pub classes: Vec<(usize, usize)>,
    pub outstanding: usize,
    pub rented: u64,
    pub direct_allocations: u64,
}

impl GenePool {
    pub fn new(max_frame_length: usize, max_pooled_per_class: usize) -> GenePool {
        let mut class_lens = vec![SMALL_CLASS_LEN.min(max_frame_length), max_frame_length];
        class_lens.dedup();

        GenePool {
            classes: class_lens.into_iter()
                .map(|buf_len| SizeClass {
                    buf_len,
                    buffers: Mutex::new(Vec::with_capacity(max_pooled_per_class)),
                    max_pooled: max_pooled_per_class,
                })
                .collect(),
            outstanding: AtomicUsize::new(0),
            rented: AtomicU64::new(0),
            direct_allocations: AtomicU64::new(0),
        }
    }

    /// Returns a buffer with a capacity of at least `min_len` bytes. Requests exceeding the
    ///  biggest size class are served by a direct allocation that is discarded after use.
    pub fn rent(self: &Arc<Self>, min_len: usize) -> GeneBufMut {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.rented.fetch_add(1, Ordering::Relaxed);

        let class_idx = self.classes.iter()
            .position(|c| c.buf_len >= min_len);

        let data = match class_idx {
            Some(idx) => self.take_from_class(idx),
            None => {
                debug!("requested buffer of {} bytes exceeds the pool's size classes - allocating directly", min_len);
                self.direct_allocations.fetch_add(1, Ordering::Relaxed);
                vec![0; min_len]
            }
        };

        GeneBufMut::new(PooledBlock::new(data, class_idx, self.clone()))
    }

    fn take_from_class(&self, idx: usize) -> Vec<u8> {
        let class = &self.classes[idx];
        {
            let mut buffers = class.buffers.lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        trace!("no buffer of {} bytes in pool: creating new buffer", class.buf_len);
        // buffers are reused aggressively, so initializing them once is not worth avoiding
        vec![0; class.buf_len]
    }

    /// called exactly once per rented buffer, when its last owner goes away
    pub(crate) fn return_to_pool(&self, data: Vec<u8>, class_idx: Option<usize>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        let Some(idx) = class_idx else {
            return;
        };
        let class = &self.classes[idx];
        if data.len() != class.buf_len {
            debug!("returned buffer does not have the size class's length of {} bytes - discarding", class.buf_len);
            return;
        }

        let mut buffers = class.buffers.lock()
            .unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < class.max_pooled {
            trace!("returning buffer to pool");
            buffers.push(data);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    /// number of buffers that were rented and not returned yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn max_class_len(&self) -> usize {
        self.classes.last()
            .map(|c| c.buf_len)
            .unwrap_or(0)
    }

    pub fn dump(&self) -> PoolDump {
        PoolDump {
            classes: self.classes.iter()
                .map(|c| (c.buf_len, c.buffers.lock().unwrap_or_else(PoisonError::into_inner).len()))
                .collect(),
            outstanding: self.outstanding(),
            rented: self.rented.load(Ordering::Relaxed),
            direct_allocations: self.direct_allocations.load(Ordering::Relaxed),
        }
    }
}
