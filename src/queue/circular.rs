//! Overwrite-on-full circular queue over two shared regions
//!
//! ```text
//! control region (4 x u64)          data region (capacity x 64 bytes)
//! +------+------+-----+------+      +--------+--------+-----+--------+
//! | head | tail | len | lock |      | slot 0 | slot 1 | ... | slot N |
//! +------+------+-----+------+      +--------+--------+-----+--------+
//! ```
//!
//! `lock` is a compare-and-swap spin word scoped to one index update plus the
//! 64-byte slot copy. It never suspends, so holding it across an `.await` is
//! impossible by construction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::record::{EventRecord, RECORD_BYTES, RECORD_WORDS};
use crate::error::{AppError, Result};
use crate::shm::{OpenMode, RegionSource, SharedRegion};

const HEAD: usize = 0;
const TAIL: usize = 1;
const LEN: usize = 2;
const LOCK: usize = 3;

/// Number of u64 words in the control region
pub const CONTROL_WORDS: usize = 4;
/// Size of the control region in bytes
pub const CONTROL_BYTES: usize = CONTROL_WORDS * 8;

/// Busy-spin iterations before yielding the thread while waiting for the lock
const SPINS_BEFORE_YIELD: u32 = 64;

/// Snapshot of the control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueIndices {
    pub head: usize,
    pub tail: usize,
    pub len: usize,
}

struct IndexGuard<'a> {
    lock: &'a AtomicU64,
}

impl Drop for IndexGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}

/// Fixed-capacity multi-producer, single-consumer event queue
pub struct CircularQueue {
    control: Arc<dyn SharedRegion>,
    data: Arc<dyn SharedRegion>,
    capacity: usize,
    released: AtomicBool,
}

impl std::fmt::Debug for CircularQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircularQueue")
            .field("control", &self.control.name())
            .field("data", &self.data.name())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl CircularQueue {
    /// Build a queue over existing regions.
    ///
    /// Capacity is derived from the data region size. The control block is
    /// validated, so a region holding garbage is refused instead of producing
    /// out-of-range slot indices later.
    pub fn from_regions(control: Arc<dyn SharedRegion>, data: Arc<dyn SharedRegion>) -> Result<Self> {
        if control.words().len() < CONTROL_WORDS {
            return Err(AppError::shm(
                control.name(),
                format!("control region needs {} bytes, has {}", CONTROL_BYTES, control.len()),
            ));
        }
        let capacity = data.len() / RECORD_BYTES;
        if capacity == 0 {
            return Err(AppError::shm(
                data.name(),
                format!("data region smaller than one record ({} bytes)", RECORD_BYTES),
            ));
        }

        let queue = Self {
            control,
            data,
            capacity,
            released: AtomicBool::new(false),
        };

        let indices = queue.indices();
        if indices.head >= capacity || indices.tail >= capacity || indices.len > capacity {
            return Err(AppError::shm(
                queue.control.name(),
                format!("corrupt control block {:?} for capacity {}", indices, capacity),
            ));
        }

        debug!(
            "Circular queue ready: capacity={}, control='{}', data='{}'",
            capacity,
            queue.control.name(),
            queue.data.name()
        );
        Ok(queue)
    }

    /// Open the control and data regions and build a queue over them
    pub fn open(
        head_tail: &RegionSource,
        buffer: &RegionSource,
        capacity: usize,
        mode: OpenMode,
    ) -> Result<Self> {
        if capacity == 0 && mode != OpenMode::Attach {
            return Err(AppError::Config("queue capacity must be non-zero".to_string()));
        }
        let control = head_tail.open(CONTROL_BYTES, mode)?;
        let data = buffer.open(capacity * RECORD_BYTES, mode)?;
        let queue = Self::from_regions(control, data)?;
        if queue.capacity != capacity {
            info!(
                "Queue capacity taken from attached region: {} (configured {})",
                queue.capacity, capacity
            );
        }
        Ok(queue)
    }

    /// In-process queue with fresh regions
    pub fn in_process(capacity: usize) -> Result<Self> {
        Self::open(
            &RegionSource::InProcess("queue-head-tail".to_string()),
            &RegionSource::InProcess("queue-buffer".to_string()),
            capacity,
            OpenMode::Create,
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn word(&self, index: usize) -> &AtomicU64 {
        &self.control.words()[index]
    }

    fn lock(&self) -> IndexGuard<'_> {
        let lock = self.word(LOCK);
        let mut spins = 0u32;
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins = spins.wrapping_add(1);
            if spins % SPINS_BEFORE_YIELD == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        IndexGuard { lock }
    }

    /// Current head/tail/len, read without taking the lock
    pub fn indices(&self) -> QueueIndices {
        QueueIndices {
            head: self.word(HEAD).load(Ordering::Acquire) as usize,
            tail: self.word(TAIL).load(Ordering::Acquire) as usize,
            len: self.word(LEN).load(Ordering::Acquire) as usize,
        }
    }

    pub fn len(&self) -> usize {
        self.indices().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a record, overwriting the oldest unread one when full.
    ///
    /// Returns `false` only once the queue has been cleaned up.
    pub fn enqueue(&self, record: &EventRecord) -> bool {
        if self.released.load(Ordering::Acquire) {
            return false;
        }
        let bytes = record.to_bytes();

        let _guard = self.lock();
        let head = self.word(HEAD).load(Ordering::Relaxed) as usize;
        let tail = self.word(TAIL).load(Ordering::Relaxed) as usize;
        let len = self.word(LEN).load(Ordering::Relaxed) as usize;

        if self
            .data
            .write_from(head * RECORD_BYTES, &bytes)
            .is_err()
        {
            return false;
        }

        let next_head = (head + 1) % self.capacity;
        if len == self.capacity {
            // Full: the slot just written was the oldest unread one
            self.word(TAIL)
                .store(((tail + 1) % self.capacity) as u64, Ordering::Relaxed);
        } else {
            self.word(LEN).store((len + 1) as u64, Ordering::Relaxed);
        }
        self.word(HEAD).store(next_head as u64, Ordering::Relaxed);
        true
    }

    /// Pop the oldest raw record
    pub fn dequeue_raw(&self) -> Option<[f64; RECORD_WORDS]> {
        let mut bytes = [0u8; RECORD_BYTES];
        {
            let _guard = self.lock();
            let len = self.word(LEN).load(Ordering::Relaxed) as usize;
            if len == 0 {
                return None;
            }
            let tail = self.word(TAIL).load(Ordering::Relaxed) as usize;
            self.data.read_into(tail * RECORD_BYTES, &mut bytes).ok()?;
            self.word(TAIL)
                .store(((tail + 1) % self.capacity) as u64, Ordering::Relaxed);
            self.word(LEN).store((len - 1) as u64, Ordering::Relaxed);
        }
        Some(EventRecord::words_from_bytes(&bytes))
    }

    /// Pop the oldest record, skipping slots that do not decode
    pub fn dequeue(&self) -> Option<EventRecord> {
        loop {
            let words = self.dequeue_raw()?;
            match EventRecord::from_words(&words) {
                Some(record) => return Some(record),
                None => warn!("Skipping undecodable queue record: {:?}", words),
            }
        }
    }

    /// Release the underlying regions. Safe to call more than once.
    pub fn cleanup(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let control = self.control.release();
        let data = self.data.release();
        info!("Circular queue released");
        control.and(data)
    }
}
