//! Prepared-write reassembly
//!
//! BLE clients deliver long writes as a sequence of prepared (queued)
//! fragments followed by an execute-write that either commits or discards
//! them. Fragments are buffered here keyed by the platform request id and
//! concatenated in arrival order; the platform is trusted to deliver
//! fragments in order, so no reordering or dedup happens.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

/// Buffers partial write fragments until the client commits or cancels
#[derive(Default)]
pub struct WriteReassembler {
    buffers: Mutex<HashMap<u32, Vec<u8>>>,
}

impl WriteReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment to the buffer for `request_id`, creating it on the
    /// first fragment
    pub fn append(&self, request_id: u32, fragment: &[u8]) {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(request_id).or_default();
        buffer.extend_from_slice(fragment);
        trace!(
            request_id,
            fragment_len = fragment.len(),
            total_len = buffer.len(),
            "buffered prepared-write fragment"
        );
    }

    /// Atomically remove and return the accumulated buffer; `None` when
    /// nothing is queued under `request_id`
    pub fn execute(&self, request_id: u32) -> Option<Vec<u8>> {
        self.buffers.lock().remove(&request_id)
    }

    /// Discard any buffer queued under `request_id`
    pub fn cancel(&self, request_id: u32) {
        if self.buffers.lock().remove(&request_id).is_some() {
            trace!(request_id, "discarded prepared-write buffer");
        }
    }

    /// Number of request ids with queued fragments
    pub fn pending_count(&self) -> usize {
        self.buffers.lock().len()
    }
}
