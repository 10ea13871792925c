//! Input event queue shared with the rendering loop
//!
//! Many WebSocket sessions enqueue, one rendering loop dequeues.

pub mod circular;
pub mod record;

pub use circular::{CircularQueue, QueueIndices, CONTROL_BYTES, CONTROL_WORDS};
pub use record::{EventKind, EventRecord, MouseButton, RECORD_BYTES, RECORD_WORDS};
