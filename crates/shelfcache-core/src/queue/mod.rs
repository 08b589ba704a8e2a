//! Offline mutation queue.
//!
//! Mutating requests made while offline are persisted here and replayed in
//! order once connectivity returns.

pub mod request_queue;

pub use request_queue::{
    DrainReport, PermanentFailure, QueuedRequest, RequestQueue, DEFAULT_MAX_RETRIES,
    QUEUE_STORAGE_KEY,
};
