use std::collections::HashMap;

use thiserror::Error;

use nimbus_proto::{ErrorCode, StreamType};

use crate::{RequestStream, StreamRole, StreamState};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("too many concurrent streams")]
    TooManyStreams,

    #[error("stream already exists")]
    AlreadyExists,

    #[error("stream closed")]
    StreamClosed,

    #[error("send side closed")]
    SendSideClosed,

    #[error("stream reset: {0}")]
    Reset(ErrorCode),

    #[error("unknown stream {0}")]
    UnknownStream(u64),

    #[error("invalid stream state transition")]
    InvalidTransition,

    /// The peer opened a second critical stream.
    #[error("duplicate {0:?} stream")]
    DuplicateCritical(StreamRole),
}

/// Where an incoming unidirectional stream should be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingStream {
    PeerControl,
    PeerQpackEncoder,
    PeerQpackDecoder,
    Push,
    /// Unrecognized or reserved type: consume and discard, never fatal.
    Unknown,
}

/// Tracks every stream on one connection and enforces the critical-stream
/// rules. Streams are stored by id; callers hold ids, not references.
#[derive(Debug)]
pub struct StreamManager {
    streams: HashMap<u64, RequestStream>,
    max_concurrent: usize,

    control_stream_id: Option<u64>,
    qpack_encoder_stream_id: Option<u64>,
    qpack_decoder_stream_id: Option<u64>,

    peer_control_stream_id: Option<u64>,
    peer_qpack_encoder_stream_id: Option<u64>,
    peer_qpack_decoder_stream_id: Option<u64>,
}

impl StreamManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            streams: HashMap::new(),
            max_concurrent,
            control_stream_id: None,
            qpack_encoder_stream_id: None,
            qpack_decoder_stream_id: None,
            peer_control_stream_id: None,
            peer_qpack_encoder_stream_id: None,
            peer_qpack_decoder_stream_id: None,
        }
    }

    pub fn active_request_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| s.role == StreamRole::Request && s.is_active())
            .count()
    }

    /// Register a fresh bidirectional request stream. The id comes from the
    /// QUIC layer.
    pub fn create_request_stream(
        &mut self,
        id: u64,
        now_ms: u64,
    ) -> Result<&mut RequestStream, StreamError> {
        if self.active_request_count() >= self.max_concurrent {
            return Err(StreamError::TooManyStreams);
        }
        if self.streams.contains_key(&id) {
            return Err(StreamError::AlreadyExists);
        }

        self.streams
            .insert(id, RequestStream::new(id, StreamRole::Request, now_ms));
        Ok(self.streams.get_mut(&id).expect("just inserted"))
    }

    /// Register our control stream. Returns the type byte to emit first.
    pub fn create_control_stream(
        &mut self,
        id: u64,
        now_ms: u64,
    ) -> Result<StreamType, StreamError> {
        if self.control_stream_id.is_some() {
            return Err(StreamError::AlreadyExists);
        }

        self.control_stream_id = Some(id);
        let mut stream = RequestStream::new(id, StreamRole::Control, now_ms);
        stream.open(now_ms)?;
        self.streams.insert(id, stream);
        Ok(StreamType::CONTROL)
    }

    pub fn create_qpack_encoder_stream(
        &mut self,
        id: u64,
        now_ms: u64,
    ) -> Result<StreamType, StreamError> {
        if self.qpack_encoder_stream_id.is_some() {
            return Err(StreamError::AlreadyExists);
        }

        self.qpack_encoder_stream_id = Some(id);
        let mut stream = RequestStream::new(id, StreamRole::QpackEncoder, now_ms);
        stream.open(now_ms)?;
        self.streams.insert(id, stream);
        Ok(StreamType::QPACK_ENCODER)
    }

    pub fn create_qpack_decoder_stream(
        &mut self,
        id: u64,
        now_ms: u64,
    ) -> Result<StreamType, StreamError> {
        if self.qpack_decoder_stream_id.is_some() {
            return Err(StreamError::AlreadyExists);
        }

        self.qpack_decoder_stream_id = Some(id);
        let mut stream = RequestStream::new(id, StreamRole::QpackDecoder, now_ms);
        stream.open(now_ms)?;
        self.streams.insert(id, stream);
        Ok(StreamType::QPACK_DECODER)
    }

    /// Classify a server-initiated unidirectional stream from its type byte.
    ///
    /// A duplicate critical stream is a protocol violation; anything
    /// unrecognized is consumed and discarded by the caller.
    pub fn handle_incoming(&mut self, id: u64, typ: StreamType) -> Result<IncomingStream, StreamError> {
        match typ {
            StreamType::CONTROL => {
                if self.peer_control_stream_id.is_some() {
                    return Err(StreamError::DuplicateCritical(StreamRole::Control));
                }
                self.peer_control_stream_id = Some(id);
                Ok(IncomingStream::PeerControl)
            }
            StreamType::QPACK_ENCODER => {
                if self.peer_qpack_encoder_stream_id.is_some() {
                    return Err(StreamError::DuplicateCritical(StreamRole::QpackEncoder));
                }
                self.peer_qpack_encoder_stream_id = Some(id);
                Ok(IncomingStream::PeerQpackEncoder)
            }
            StreamType::QPACK_DECODER => {
                if self.peer_qpack_decoder_stream_id.is_some() {
                    return Err(StreamError::DuplicateCritical(StreamRole::QpackDecoder));
                }
                self.peer_qpack_decoder_stream_id = Some(id);
                Ok(IncomingStream::PeerQpackDecoder)
            }
            StreamType::PUSH => Ok(IncomingStream::Push),
            typ => {
                if typ.is_grease() {
                    log::debug!("ignoring grease stream type {:?}", typ);
                } else {
                    log::debug!("ignoring unknown stream type {:?}", typ);
                }
                Ok(IncomingStream::Unknown)
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<&RequestStream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Result<&mut RequestStream, StreamError> {
        self.streams
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream(id))
    }

    pub fn close_stream(&mut self, id: u64, now_ms: u64) -> Result<(), StreamError> {
        let stream = self.get_mut(id)?;
        stream.close(now_ms);
        Ok(())
    }

    /// Reset a stream, cancelling its waiters with the given code. The caller
    /// is responsible for signalling the QUIC-level reset.
    pub fn reset_stream(&mut self, id: u64, code: ErrorCode, now_ms: u64) -> Result<(), StreamError> {
        let stream = self.get_mut(id)?;
        stream.reset(code, now_ms);
        Ok(())
    }

    /// Reset every active stream, used when the connection dies.
    pub fn reset_all(&mut self, code: ErrorCode, now_ms: u64) {
        for stream in self.streams.values_mut() {
            if stream.is_active() {
                stream.reset(code, now_ms);
            }
        }
    }

    pub fn is_peer_control(&self, id: u64) -> bool {
        self.peer_control_stream_id == Some(id)
    }

    pub fn control_stream_id(&self) -> Option<u64> {
        self.control_stream_id
    }

    /// Ids of request streams still in flight, oldest first.
    pub fn active_request_ids(&self) -> Vec<u64> {
        let mut ids: Vec<_> = self
            .streams
            .values()
            .filter(|s| s.role == StreamRole::Request && s.is_active())
            .map(|s| (s.created_at_ms, s.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Drop closed and reset streams older than the given horizon.
    pub fn prune(&mut self, horizon_ms: u64) {
        self.streams.retain(|_, s| {
            !matches!(s.state(), StreamState::Closed | StreamState::Reset)
                || s.last_activity_ms >= horizon_ms
        });
    }
}
