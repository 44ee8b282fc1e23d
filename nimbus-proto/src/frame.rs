use bytes::{Buf, BufMut, Bytes};

use thiserror::Error;

use super::{Settings, SettingsError, VarInt, VarIntError};

/// A frame type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameType(pub VarInt);

impl FrameType {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntError> {
        Ok(FrameType(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }

    /// Reserved types of the form 0x21 + 0x1f * N.
    pub fn is_grease(&self) -> bool {
        let val = self.0.into_inner();
        if val < 0x21 {
            return false;
        }

        (val - 0x21) % 0x1f == 0
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub const $name: FrameType = FrameType(VarInt::from_u32($val));)*
        }
    }
}

frame_types! {
    DATA = 0x00,
    HEADERS = 0x01,
    CANCEL_PUSH = 0x03,
    SETTINGS = 0x04,
    PUSH_PROMISE = 0x05,
    GOAWAY = 0x07,
    MAX_PUSH_ID = 0x0d,
    DATAGRAM = 0x30,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The input ended before the declared frame length was available.
    #[error("short read: truncated frame")]
    ShortRead,

    /// The payload did not parse as the declared type requires.
    #[error("malformed {0:?} payload")]
    Malformed(FrameType),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
}

/// An HTTP/3 frame: varint(type) || varint(length) || payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    Headers(Bytes),
    CancelPush(VarInt),
    Settings(Settings),
    PushPromise { push_id: VarInt, block: Bytes },
    GoAway(VarInt),
    MaxPushId(VarInt),
    /// Unknown and reserved types are tolerated and preserved as-is.
    Unknown { typ: FrameType, payload: Bytes },
}

impl Frame {
    pub fn typ(&self) -> FrameType {
        match self {
            Frame::Data(_) => FrameType::DATA,
            Frame::Headers(_) => FrameType::HEADERS,
            Frame::CancelPush(_) => FrameType::CANCEL_PUSH,
            Frame::Settings(_) => FrameType::SETTINGS,
            Frame::PushPromise { .. } => FrameType::PUSH_PROMISE,
            Frame::GoAway(_) => FrameType::GOAWAY,
            Frame::MaxPushId(_) => FrameType::MAX_PUSH_ID,
            Frame::Unknown { typ, .. } => *typ,
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        let typ = FrameType::decode(buf).map_err(|_| FrameError::ShortRead)?;
        let len = VarInt::decode(buf).map_err(|_| FrameError::ShortRead)?;
        let len = len.into_inner() as usize;

        if buf.remaining() < len {
            return Err(FrameError::ShortRead);
        }

        let mut payload = buf.copy_to_bytes(len);

        match typ {
            FrameType::DATA => Ok(Frame::Data(payload)),
            FrameType::HEADERS => Ok(Frame::Headers(payload)),
            FrameType::CANCEL_PUSH => Ok(Frame::CancelPush(Self::single_varint(typ, payload)?)),
            FrameType::SETTINGS => {
                let settings = Settings::decode_payload(&mut payload)?;
                Ok(Frame::Settings(settings))
            }
            FrameType::PUSH_PROMISE => {
                let push_id =
                    VarInt::decode(&mut payload).map_err(|_| FrameError::Malformed(typ))?;
                Ok(Frame::PushPromise {
                    push_id,
                    block: payload,
                })
            }
            FrameType::GOAWAY => Ok(Frame::GoAway(Self::single_varint(typ, payload)?)),
            FrameType::MAX_PUSH_ID => Ok(Frame::MaxPushId(Self::single_varint(typ, payload)?)),
            typ => Ok(Frame::Unknown { typ, payload }),
        }
    }

    // CANCEL_PUSH, GOAWAY and MAX_PUSH_ID carry exactly one varint.
    fn single_varint(typ: FrameType, mut payload: Bytes) -> Result<VarInt, FrameError> {
        let id = VarInt::decode(&mut payload).map_err(|_| FrameError::Malformed(typ))?;
        if payload.has_remaining() {
            return Err(FrameError::Malformed(typ));
        }

        Ok(id)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        // Encode to a temporary buffer so we can learn the length.
        let mut tmp = Vec::new();
        match self {
            Frame::Data(payload) | Frame::Headers(payload) => tmp.extend_from_slice(payload),
            Frame::CancelPush(id) | Frame::GoAway(id) | Frame::MaxPushId(id) => {
                id.encode(&mut tmp)
            }
            Frame::Settings(settings) => settings.encode_payload(&mut tmp),
            Frame::PushPromise { push_id, block } => {
                push_id.encode(&mut tmp);
                tmp.extend_from_slice(block);
            }
            Frame::Unknown { payload, .. } => tmp.extend_from_slice(payload),
        }

        self.typ().encode(buf);
        VarInt::try_from(tmp.len())
            .expect("frame payload exceeds varint range")
            .encode(buf);
        buf.put_slice(&tmp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Setting;

    fn roundtrip(frame: Frame) {
        let mut buf = Vec::new();
        frame.encode(&mut buf);

        let mut read = buf.as_slice();
        let decoded = Frame::decode(&mut read).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(read.len(), 0);
    }

    #[test]
    fn data_roundtrip() {
        roundtrip(Frame::Data(Bytes::from_static(b"hello")));
        roundtrip(Frame::Data(Bytes::new()));
    }

    #[test]
    fn headers_roundtrip() {
        roundtrip(Frame::Headers(Bytes::from_static(&[0x00, 0x00, 0xd1])));
    }

    #[test]
    fn control_frames_roundtrip() {
        roundtrip(Frame::CancelPush(VarInt::from_u32(7)));
        roundtrip(Frame::GoAway(VarInt::from_u32(400)));
        roundtrip(Frame::MaxPushId(VarInt::from_u32(16384)));
        roundtrip(Frame::PushPromise {
            push_id: VarInt::from_u32(3),
            block: Bytes::from_static(&[0x00, 0x00]),
        });
    }

    #[test]
    fn settings_roundtrip() {
        let mut settings = Settings::defaults();
        settings.insert(Setting(VarInt::from_u32(0x4321)), VarInt::from_u32(9));
        roundtrip(Frame::Settings(settings));
    }

    #[test]
    fn unknown_preserved() {
        // type=33, len=2, payload AA BB
        let wire = [0x21u8, 0x02, 0xaa, 0xbb];
        let mut read = wire.as_slice();
        let frame = Frame::decode(&mut read).unwrap();

        match &frame {
            Frame::Unknown { typ, payload } => {
                assert_eq!(typ.0.into_inner(), 33);
                assert_eq!(payload.as_ref(), &[0xaa, 0xbb]);
            }
            other => panic!("expected unknown frame, got {other:?}"),
        }

        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(buf, wire);
    }

    #[test]
    fn truncated_payload() {
        // HEADERS with a declared length of 4 but only 2 payload bytes.
        let wire = [0x01u8, 0x04, 0xaa, 0xbb];
        assert_eq!(
            Frame::decode(&mut wire.as_slice()),
            Err(FrameError::ShortRead)
        );
    }

    #[test]
    fn goaway_with_trailing_bytes() {
        // GOAWAY must contain exactly one varint.
        let wire = [0x07u8, 0x02, 0x01, 0x01];
        assert_eq!(
            Frame::decode(&mut wire.as_slice()),
            Err(FrameError::Malformed(FrameType::GOAWAY))
        );
    }
}
