//! Pipeline safety limits.

use serde::{Deserialize, Serialize};

/// Limits are explicit about their units to avoid confusion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_frame_bytes: usize,
    pub max_payload_bytes: usize,

    /// Requests queued on lanes and not yet started, across all entities.
    pub max_lane_queue_depth: usize,

    /// Live operations buffered per syncing key on a passive.
    pub max_sync_buffer_ops: usize,
    pub max_sync_buffer_bytes: usize,

    /// Capacity of the lane -> replication sender channel.
    pub repl_channel_capacity: usize,
    pub passive_ack_timeout_ms: u64,
    pub max_ack_batch: usize,

    pub max_cbor_depth: usize,
    pub max_cbor_map_entries: usize,
    pub max_cbor_array_entries: usize,
    pub max_cbor_bytes_string_len: usize,
    pub max_cbor_text_string_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            max_payload_bytes: 8 * 1024 * 1024,

            max_lane_queue_depth: 4_096,

            max_sync_buffer_ops: 10_000,
            max_sync_buffer_bytes: 64 * 1024 * 1024,

            repl_channel_capacity: 1_024,
            passive_ack_timeout_ms: 30_000,
            max_ack_batch: 64,

            max_cbor_depth: 16,
            max_cbor_map_entries: 10_000,
            max_cbor_array_entries: 100_000,
            max_cbor_bytes_string_len: 8 * 1024 * 1024,
            max_cbor_text_string_len: 64 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_fits_in_frame() {
        let limits = Limits::default();
        assert!(limits.max_payload_bytes < limits.max_frame_bytes);
        assert!(limits.max_cbor_bytes_string_len <= limits.max_frame_bytes);
        assert!(limits.max_ack_batch > 0);
    }
}
