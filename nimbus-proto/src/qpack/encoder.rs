use std::collections::{HashMap, VecDeque};

use bytes::Buf;

use super::prefix::{decode_prefix, encode_prefix, encode_string};
use super::{static_table, DynamicTable, QpackError};

/// A compressed field section plus the encoder stream bytes that must reach
/// the peer before (or alongside) it.
///
/// Dynamic-table inserts are committed in encoder-stream byte order: a block
/// whose required insert count is K may not be finalised for the wire until
/// the first K inserts have been emitted on the encoder stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlock {
    pub block: Vec<u8>,
    pub instructions: Vec<u8>,
    pub required_insert_count: u64,
}

/// The QPACK encoder half: compresses field lists and tracks what the peer
/// decoder has acknowledged.
#[derive(Debug, Default)]
pub struct Encoder {
    table: DynamicTable,
    max_blocked_streams: u64,
    // Required insert counts of in-flight blocks, per stream, oldest first.
    unacked: HashMap<u64, VecDeque<u64>>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt the capacity granted by the peer's SETTINGS and tell the peer
    /// decoder, emitting a Set Dynamic Table Capacity instruction.
    pub fn set_max_table_capacity(&mut self, capacity: usize, instructions: &mut Vec<u8>) {
        self.table.set_capacity(capacity);
        encode_prefix(instructions, 5, 0b001, capacity);
    }

    pub fn set_max_blocked_streams(&mut self, max: u64) {
        self.max_blocked_streams = max;
    }

    pub fn insert_count(&self) -> u64 {
        self.table.insert_count()
    }

    pub fn known_received_count(&self) -> u64 {
        self.table.known_received_count()
    }

    /// Streams with at least one unacknowledged blocking section in flight.
    pub fn blocked_stream_count(&self) -> usize {
        self.unacked.len()
    }

    /// Compress a field list for `stream_id`.
    ///
    /// Inserts are performed first so the section can reference them; when
    /// referencing unacknowledged entries would exceed the blocked-streams
    /// budget, the section falls back to literals and stays unblocked.
    pub fn encode(&mut self, stream_id: u64, fields: &[(String, String)]) -> EncodedBlock {
        let mut instructions = Vec::new();

        for (name, value) in fields {
            self.maybe_insert(name, value, &mut instructions);
        }

        let can_block = self.max_blocked_streams > 0
            && (self.unacked.contains_key(&stream_id)
                || (self.unacked.len() as u64) < self.max_blocked_streams);

        let base = self.table.insert_count();
        let known = self.table.known_received_count();
        let mut body = Vec::new();
        let mut max_ref = 0u64;

        for (name, value) in fields {
            // 1. Exact static hit.
            if let Some(index) = static_table::find(name, value) {
                encode_prefix(&mut body, 6, 0b11, index);
                continue;
            }

            let allowed = |abs: u64| abs <= known || can_block;

            // 2. Exact dynamic hit.
            if let Some(abs) = self.table.find(name, value) {
                if allowed(abs) {
                    encode_prefix(&mut body, 6, 0b10, (base - abs) as usize);
                    max_ref = max_ref.max(abs);
                    continue;
                }
            }

            // 3. Name-only hit in either table.
            if let Some(index) = static_table::find_name(name) {
                encode_prefix(&mut body, 4, 0b0101, index);
                encode_string(&mut body, 7, 0, value.as_bytes());
                continue;
            }
            if let Some(abs) = self.table.find_name(name) {
                if allowed(abs) {
                    encode_prefix(&mut body, 4, 0b0100, (base - abs) as usize);
                    encode_string(&mut body, 7, 0, value.as_bytes());
                    max_ref = max_ref.max(abs);
                    continue;
                }
            }

            // 4. Plain literal: pattern 001, N=0, then H and a 3-bit length.
            encode_string(&mut body, 3, 0b0010, name.as_bytes());
            encode_string(&mut body, 7, 0, value.as_bytes());
        }

        let mut block = Vec::with_capacity(body.len() + 2);
        self.encode_section_prefix(&mut block, max_ref, base);
        block.extend_from_slice(&body);

        if max_ref > known {
            self.unacked.entry(stream_id).or_default().push_back(max_ref);
        }

        EncodedBlock {
            block,
            instructions,
            required_insert_count: max_ref,
        }
    }

    /// Compress against the static table only. Used for header blocks that
    /// must be valid against unknown dynamic state, such as requests
    /// pre-encoded for the 0-RTT flight.
    pub fn encode_static_only(fields: &[(String, String)]) -> Vec<u8> {
        let mut block = Vec::new();
        encode_prefix(&mut block, 8, 0, 0);
        encode_prefix(&mut block, 7, 0, 0);

        for (name, value) in fields {
            if let Some(index) = static_table::find(name, value) {
                encode_prefix(&mut block, 6, 0b11, index);
            } else if let Some(index) = static_table::find_name(name) {
                encode_prefix(&mut block, 4, 0b0101, index);
                encode_string(&mut block, 7, 0, value.as_bytes());
            } else {
                encode_string(&mut block, 3, 0b0010, name.as_bytes());
                encode_string(&mut block, 7, 0, value.as_bytes());
            }
        }

        block
    }

    fn maybe_insert(&mut self, name: &str, value: &str, instructions: &mut Vec<u8>) {
        // Static exact hits never benefit from the dynamic table, and a field
        // already present would only be duplicated.
        if static_table::find(name, value).is_some() || self.table.find(name, value).is_some() {
            return;
        }

        // Only static name references are used in insert instructions; a
        // dynamic name reference could be evicted by the very insert that
        // uses it.
        let name_ref = static_table::find_name(name);

        if self.table.insert(name, value).is_none() {
            return;
        }

        match name_ref {
            Some(index) => {
                encode_prefix(instructions, 6, 0b11, index);
                encode_string(instructions, 7, 0, value.as_bytes());
            }
            None => {
                encode_string(instructions, 5, 0b01, name.as_bytes());
                encode_string(instructions, 7, 0, value.as_bytes());
            }
        }
    }

    // Field section prefix: encoded required insert count, then S flag and
    // delta base. RFC 9204 section 4.5.1.
    fn encode_section_prefix(&self, block: &mut Vec<u8>, required: u64, base: u64) {
        let encoded = if required == 0 {
            0
        } else {
            (required % (2 * self.table.max_entries())) + 1
        };
        encode_prefix(block, 8, 0, encoded as usize);

        let delta = if required == 0 { 0 } else { base - required };
        encode_prefix(block, 7, 0, delta as usize);
    }

    /// Consume decoder-stream bytes: section acknowledgments, stream
    /// cancellations, and insert count increments.
    pub fn handle_decoder_instructions<B: Buf>(&mut self, buf: &mut B) -> Result<(), QpackError> {
        while self.handle_one_decoder_instruction(buf)? {}
        Ok(())
    }

    /// Handle a single decoder stream instruction. Returns false when the
    /// buffer is empty; [`QpackError::ShortRead`] means the instruction is
    /// split across packets and should be retried with more bytes.
    pub fn handle_one_decoder_instruction<B: Buf>(&mut self, buf: &mut B) -> Result<bool, QpackError> {
        if buf.has_remaining() {
            let first = buf.chunk()[0];

            if first & 0x80 != 0 {
                // Section Acknowledgment, 7-bit stream id.
                let (_, stream_id) = decode_prefix(buf, 7)?;
                self.section_acked(stream_id as u64)?;
            } else if first & 0x40 != 0 {
                // Stream Cancellation, 6-bit stream id.
                let (_, stream_id) = decode_prefix(buf, 6)?;
                self.unacked.remove(&(stream_id as u64));
            } else {
                // Insert Count Increment, 6-bit delta.
                let (_, increment) = decode_prefix(buf, 6)?;
                let next = self.table.known_received_count() + increment as u64;
                if increment == 0 || next > self.table.insert_count() {
                    return Err(QpackError::InvalidRequiredInsertCount);
                }
                self.table.acknowledge(next);
            }

            return Ok(true);
        }

        Ok(false)
    }

    fn section_acked(&mut self, stream_id: u64) -> Result<(), QpackError> {
        let Some(pending) = self.unacked.get_mut(&stream_id) else {
            return Err(QpackError::InvalidRequiredInsertCount);
        };

        // Acks arrive in section order; the oldest outstanding one is done.
        if let Some(required) = pending.pop_front() {
            self.table.acknowledge(required);
        }
        if pending.is_empty() {
            self.unacked.remove(&stream_id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|&(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn static_only_block_has_zero_prefix() {
        let block = Encoder::encode_static_only(&fields(&[(":method", "HEAD")]));
        assert_eq!(&block[..2], &[0x00, 0x00]);
    }

    #[test]
    fn oversized_field_falls_back_to_literal() {
        let mut encoder = Encoder::new();
        let mut instructions = Vec::new();
        encoder.set_max_table_capacity(64, &mut instructions);
        encoder.set_max_blocked_streams(100);

        let huge = "v".repeat(256);
        let block = encoder.encode(0, &fields(&[("x-big", &huge)]));

        // Too big to insert: nothing on the encoder stream, no blocking.
        assert!(block.instructions.is_empty());
        assert_eq!(block.required_insert_count, 0);
        assert_eq!(encoder.insert_count(), 0);
    }

    #[test]
    fn second_stream_does_not_block_when_budget_is_one() {
        let mut encoder = Encoder::new();
        let mut instructions = Vec::new();
        encoder.set_max_table_capacity(4096, &mut instructions);
        encoder.set_max_blocked_streams(1);

        let a = encoder.encode(0, &fields(&[("x-a", "1")]));
        assert_eq!(a.required_insert_count, 1);

        // Stream 4 would be a second blocked stream; it must use literals.
        let b = encoder.encode(4, &fields(&[("x-b", "2")]));
        assert_eq!(b.required_insert_count, 0);
    }

    #[test]
    fn stream_cancel_clears_blocking() {
        let mut encoder = Encoder::new();
        let mut instructions = Vec::new();
        encoder.set_max_table_capacity(4096, &mut instructions);
        encoder.set_max_blocked_streams(1);

        encoder.encode(0, &fields(&[("x-a", "1")]));
        assert_eq!(encoder.blocked_stream_count(), 1);

        let mut cancel = Vec::new();
        encode_prefix(&mut cancel, 6, 0b01, 0);
        encoder
            .handle_decoder_instructions(&mut cancel.as_slice())
            .unwrap();
        assert_eq!(encoder.blocked_stream_count(), 0);
    }

    #[test]
    fn insert_count_increment_past_inserts_is_an_error() {
        let mut encoder = Encoder::new();
        let mut instructions = Vec::new();
        encoder.set_max_table_capacity(4096, &mut instructions);

        let mut bogus = Vec::new();
        encode_prefix(&mut bogus, 6, 0b00, 5);
        assert!(encoder
            .handle_decoder_instructions(&mut bogus.as_slice())
            .is_err());
    }
}
