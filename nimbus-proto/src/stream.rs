use bytes::{Buf, BufMut};

use super::{VarInt, VarIntError};

/// Sent as the first bytes of a unidirectional stream to identify its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamType(pub VarInt);

impl StreamType {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntError> {
        Ok(StreamType(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }

    /// Reserved types of the form 0x21 + 0x1f * N, sent to exercise the
    /// requirement that unknown stream types are skipped.
    pub fn is_grease(&self) -> bool {
        let val = self.0.into_inner();
        if val < 0x21 {
            return false;
        }

        (val - 0x21) % 0x1f == 0
    }
}

macro_rules! stream_types {
    {$($name:ident = $val:expr,)*} => {
        impl StreamType {
            $(pub const $name: StreamType = StreamType(VarInt::from_u32($val));)*
        }
    }
}

stream_types! {
    CONTROL = 0x00,
    PUSH = 0x01,
    QPACK_ENCODER = 0x02,
    QPACK_DECODER = 0x03,
}
