use bytes::Buf;

use super::prefix::{decode_prefix, decode_string, encode_prefix};
use super::{static_table, DynamicTable, QpackError};

/// The QPACK decoder half: mirrors the encoder's dynamic table from encoder
/// stream instructions and decodes field sections against it.
#[derive(Debug, Default)]
pub struct Decoder {
    table: DynamicTable,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_count(&self) -> u64 {
        self.table.insert_count()
    }

    /// Apply a run of encoder stream instructions, returning how many inserts
    /// were performed (the value to report in Insert Count Increment).
    pub fn apply_encoder_instructions<B: Buf>(&mut self, buf: &mut B) -> Result<u64, QpackError> {
        let before = self.table.insert_count();
        while self.apply_one_instruction(buf)? {}
        Ok(self.table.insert_count() - before)
    }

    /// Apply a single encoder stream instruction. Returns false when the
    /// buffer is empty. A [`QpackError::ShortRead`] means the instruction is
    /// split across packets; the caller should retry with more bytes.
    pub fn apply_one_instruction<B: Buf>(&mut self, buf: &mut B) -> Result<bool, QpackError> {
        if buf.has_remaining() {
            let first = buf.chunk()[0];

            if first & 0x80 != 0 {
                // Insert with name reference: 1 T + 6-bit index.
                let (flags, index) = decode_prefix(buf, 6)?;
                let name = if flags & 1 == 1 {
                    static_table::get(index)
                        .ok_or(QpackError::InvalidStaticIndex(index))?
                        .0
                        .to_string()
                } else {
                    let abs = self.relative_to_absolute(index as u64)?;
                    self.table
                        .get(abs)
                        .ok_or(QpackError::InvalidDynamicIndex(abs))?
                        .0
                        .to_string()
                };
                let (_, value) = decode_string(buf, 7)?;
                let value = String::from_utf8(value)?;
                self.insert(&name, &value)?;
            } else if first & 0x40 != 0 {
                // Insert with literal name: 01 H + 5-bit name length.
                let (_, name) = decode_string(buf, 5)?;
                let name = String::from_utf8(name)?;
                let (_, value) = decode_string(buf, 7)?;
                let value = String::from_utf8(value)?;
                self.insert(&name, &value)?;
            } else if first & 0x20 != 0 {
                // Set Dynamic Table Capacity: 001 + 5-bit capacity.
                let (_, capacity) = decode_prefix(buf, 5)?;
                self.table.set_capacity(capacity);
            } else {
                // Duplicate: 000 + 5-bit relative index.
                let (_, index) = decode_prefix(buf, 5)?;
                let abs = self.relative_to_absolute(index as u64)?;
                let (name, value) = self
                    .table
                    .get(abs)
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .ok_or(QpackError::InvalidDynamicIndex(abs))?;
                self.insert(&name, &value)?;
            }

            return Ok(true);
        }

        Ok(false)
    }

    // Encoder-stream relative index: 0 is the newest entry.
    fn relative_to_absolute(&self, relative: u64) -> Result<u64, QpackError> {
        self.table
            .insert_count()
            .checked_sub(relative)
            .filter(|&abs| abs > 0)
            .ok_or(QpackError::InvalidDynamicIndex(relative))
    }

    fn insert(&mut self, name: &str, value: &str) -> Result<(), QpackError> {
        self.table
            .insert(name, value)
            .map(|_| ())
            .ok_or(QpackError::CapacityExceeded)
    }

    /// Decode one field section. The caller is expected to have applied all
    /// received encoder stream bytes first; a section that still references
    /// unseen inserts fails with [`QpackError::Blocked`].
    pub fn decode_block<B: Buf>(&mut self, buf: &mut B) -> Result<Vec<(String, String)>, QpackError> {
        self.decode_section(buf).map(|(fields, _)| fields)
    }

    /// Like [`Decoder::decode_block`], but also returns the section's
    /// required insert count so the caller knows whether to acknowledge it.
    pub fn decode_section<B: Buf>(
        &mut self,
        buf: &mut B,
    ) -> Result<(Vec<(String, String)>, u64), QpackError> {
        let required = self.decode_required_insert_count(buf)?;
        if required > self.table.insert_count() {
            return Err(QpackError::Blocked {
                required,
                have: self.table.insert_count(),
            });
        }

        let (sign, delta) = decode_prefix(buf, 7)?;
        let base = if sign & 1 == 0 {
            required + delta as u64
        } else {
            required
                .checked_sub(delta as u64 + 1)
                .ok_or(QpackError::InvalidRequiredInsertCount)?
        };

        let mut fields = Vec::new();
        while buf.has_remaining() {
            let first = buf.chunk()[0];

            let (name, value) = if first & 0x80 != 0 {
                // Indexed field line: 1 T + 6-bit index.
                let (flags, index) = decode_prefix(buf, 6)?;
                if flags & 1 == 1 {
                    let (n, v) = static_table::get(index)
                        .ok_or(QpackError::InvalidStaticIndex(index))?;
                    (n.to_string(), v.to_string())
                } else {
                    let abs = base
                        .checked_sub(index as u64)
                        .filter(|&abs| abs > 0)
                        .ok_or(QpackError::InvalidDynamicIndex(index as u64))?;
                    self.dynamic(abs)?
                }
            } else if first & 0x40 != 0 {
                // Literal with name reference: 01 N T + 4-bit index.
                let (flags, index) = decode_prefix(buf, 4)?;
                let name = if flags & 1 == 1 {
                    static_table::get(index)
                        .ok_or(QpackError::InvalidStaticIndex(index))?
                        .0
                        .to_string()
                } else {
                    let abs = base
                        .checked_sub(index as u64)
                        .filter(|&abs| abs > 0)
                        .ok_or(QpackError::InvalidDynamicIndex(index as u64))?;
                    self.dynamic(abs)?.0
                };
                let (_, value) = decode_string(buf, 7)?;
                (name, String::from_utf8(value)?)
            } else if first & 0x20 != 0 {
                // Literal with literal name: 001 N H + 3-bit name length.
                let (_, name) = decode_string(buf, 3)?;
                let (_, value) = decode_string(buf, 7)?;
                (String::from_utf8(name)?, String::from_utf8(value)?)
            } else if first & 0x10 != 0 {
                // Indexed with post-base index: 0001 + 4-bit index.
                let (_, index) = decode_prefix(buf, 4)?;
                self.dynamic(base + index as u64 + 1)?
            } else {
                // Literal with post-base name reference: 0000 N + 3-bit index.
                let (_, index) = decode_prefix(buf, 3)?;
                let name = self.dynamic(base + index as u64 + 1)?.0;
                let (_, value) = decode_string(buf, 7)?;
                (name, String::from_utf8(value)?)
            };

            fields.push((name, value));
        }

        Ok((fields, required))
    }

    fn dynamic(&self, absolute: u64) -> Result<(String, String), QpackError> {
        self.table
            .get(absolute)
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .ok_or(QpackError::InvalidDynamicIndex(absolute))
    }

    // RFC 9204 section 4.5.1.1: reconstruct the required insert count from
    // its modular wire encoding.
    fn decode_required_insert_count<B: Buf>(&self, buf: &mut B) -> Result<u64, QpackError> {
        let (_, encoded) = decode_prefix(buf, 8)?;
        let encoded = encoded as u64;
        if encoded == 0 {
            return Ok(0);
        }

        let max_entries = self.table.max_entries();
        let full_range = 2 * max_entries;
        if encoded > full_range {
            return Err(QpackError::InvalidRequiredInsertCount);
        }

        let max_value = self.table.insert_count() + max_entries;
        let max_wrapped = (max_value / full_range) * full_range;
        let mut required = max_wrapped + encoded - 1;

        if required > max_value {
            if required <= full_range {
                return Err(QpackError::InvalidRequiredInsertCount);
            }
            required -= full_range;
        }

        if required == 0 {
            return Err(QpackError::InvalidRequiredInsertCount);
        }

        Ok(required)
    }

    /// Emit a Section Acknowledgment for a fully processed block.
    pub fn section_ack(stream_id: u64, out: &mut Vec<u8>) {
        encode_prefix(out, 7, 0b1, stream_id as usize);
    }

    /// Emit a Stream Cancellation.
    pub fn stream_cancel(stream_id: u64, out: &mut Vec<u8>) {
        encode_prefix(out, 6, 0b01, stream_id as usize);
    }

    /// Emit an Insert Count Increment for `n` newly applied inserts.
    pub fn insert_count_increment(n: u64, out: &mut Vec<u8>) {
        encode_prefix(out, 6, 0b00, n as usize);
    }
}
