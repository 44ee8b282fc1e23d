use std::{
    collections::HashMap,
    ops::{Deref, DerefMut},
};

use bytes::{Buf, BufMut};

use thiserror::Error;

use super::{VarInt, VarIntError};

/// A settings parameter identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Setting(pub VarInt);

impl Setting {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntError> {
        Ok(Setting(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }
}

macro_rules! settings {
    {$($name:ident = $val:expr,)*} => {
        impl Setting {
            $(pub const $name: Setting = Setting(VarInt::from_u32($val));)*
        }
    }
}

settings! {
    QPACK_MAX_TABLE_CAPACITY = 0x01,
    MAX_FIELD_SECTION_SIZE = 0x06,
    QPACK_BLOCKED_STREAMS = 0x07,
}

pub const DEFAULT_QPACK_MAX_TABLE_CAPACITY: u64 = 4096;
pub const DEFAULT_MAX_FIELD_SECTION_SIZE: u64 = 16384;
pub const DEFAULT_QPACK_BLOCKED_STREAMS: u64 = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    /// The payload did not consist of whole (id, value) pairs.
    #[error("trailing bytes in settings payload")]
    InvalidSize,
}

/// The parameters exchanged in the first frame on each control stream.
///
/// Unknown identifiers are kept as-is; the peer is allowed to send settings we
/// don't recognize.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Settings(HashMap<Setting, VarInt>);

impl Settings {
    /// The values advertised when the caller doesn't override anything.
    pub fn defaults() -> Self {
        let mut settings = Settings::default();
        settings.insert(
            Setting::QPACK_MAX_TABLE_CAPACITY,
            VarInt::from_u32(DEFAULT_QPACK_MAX_TABLE_CAPACITY as u32),
        );
        settings.insert(
            Setting::MAX_FIELD_SECTION_SIZE,
            VarInt::from_u32(DEFAULT_MAX_FIELD_SECTION_SIZE as u32),
        );
        settings.insert(
            Setting::QPACK_BLOCKED_STREAMS,
            VarInt::from_u32(DEFAULT_QPACK_BLOCKED_STREAMS as u32),
        );
        settings
    }

    /// Decode a SETTINGS payload, consuming the entire buffer.
    pub fn decode_payload<B: Buf>(buf: &mut B) -> Result<Self, SettingsError> {
        let mut settings = Settings::default();
        while buf.has_remaining() {
            // A pair that runs out of bytes mid-way is a protocol error, not a
            // retryable short read.
            let id = Setting::decode(buf).map_err(|_| SettingsError::InvalidSize)?;
            let value = VarInt::decode(buf).map_err(|_| SettingsError::InvalidSize)?;
            settings.0.insert(id, value);
        }

        Ok(settings)
    }

    pub fn encode_payload<B: BufMut>(&self, buf: &mut B) {
        for (id, value) in &self.0 {
            id.encode(buf);
            value.encode(buf);
        }
    }

    pub fn qpack_max_table_capacity(&self) -> u64 {
        self.get(&Setting::QPACK_MAX_TABLE_CAPACITY)
            .map(|v| v.into_inner())
            .unwrap_or(0)
    }

    pub fn max_field_section_size(&self) -> u64 {
        self.get(&Setting::MAX_FIELD_SECTION_SIZE)
            .map(|v| v.into_inner())
            .unwrap_or(u64::MAX)
    }

    pub fn qpack_blocked_streams(&self) -> u64 {
        self.get(&Setting::QPACK_BLOCKED_STREAMS)
            .map(|v| v.into_inner())
            .unwrap_or(0)
    }
}

impl Deref for Settings {
    type Target = HashMap<Setting, VarInt>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Settings {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
