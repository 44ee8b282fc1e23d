use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use nimbus_proto::ErrorCode;

use crate::StreamError;

/// What a stream is for, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    Request,
    Control,
    QpackEncoder,
    QpackDecoder,
    Push,
}

/// Request stream lifecycle. Reset and Error-adjacent states are absorbing;
/// a stream never re-enters Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    Reset,
}

/// Urgency classes for request scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Urgency {
    Urgent,
    High,
    Normal,
    Low,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub urgency: Urgency,
    /// 1..=256.
    pub weight: u16,
}

impl Default for Priority {
    fn default() -> Self {
        Self {
            urgency: Urgency::Normal,
            weight: 16,
        }
    }
}

/// Book-keeping for one HTTP/3 stream, keyed by its 62-bit QUIC stream id.
///
/// The manager owns these; everything else refers to streams by id.
#[derive(Debug)]
pub struct RequestStream {
    pub id: u64,
    pub role: StreamRole,
    state: StreamState,
    pub priority: Priority,

    /// DATA payloads queued before the send side is flushed.
    pub send_buffer: Vec<Bytes>,
    /// Partial frame bytes awaiting reassembly.
    pub recv_buffer: BytesMut,

    pub request_headers: Vec<(String, String)>,
    pub response_headers: Vec<(String, String)>,
    pub response_trailers: Vec<(String, String)>,

    pub created_at_ms: u64,
    pub last_activity_ms: u64,

    bytes_sent: u64,
    bytes_received: u64,

    reset_code: Option<ErrorCode>,

    /// Woken when the stream closes, resets, or its response completes.
    pub completion: Arc<Notify>,
}

impl RequestStream {
    pub fn new(id: u64, role: StreamRole, now_ms: u64) -> Self {
        Self {
            id,
            role,
            state: StreamState::Idle,
            priority: Priority::default(),
            send_buffer: Vec::new(),
            recv_buffer: BytesMut::new(),
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            response_trailers: Vec::new(),
            created_at_ms: now_ms,
            last_activity_ms: now_ms,
            bytes_sent: 0,
            bytes_received: 0,
            reset_code: None,
            completion: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn reset_code(&self) -> Option<ErrorCode> {
        self.reset_code
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, StreamState::Closed | StreamState::Reset)
    }

    pub fn open(&mut self, now_ms: u64) -> Result<(), StreamError> {
        match self.state {
            StreamState::Idle => {
                self.state = StreamState::Open;
                self.touch(now_ms);
                Ok(())
            }
            _ => Err(StreamError::InvalidTransition),
        }
    }

    /// Record sent payload bytes. Refused once the send side is closed.
    pub fn record_sent(&mut self, n: u64, now_ms: u64) -> Result<(), StreamError> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedRemote => {
                self.bytes_sent += n;
                self.touch(now_ms);
                Ok(())
            }
            StreamState::Reset => Err(self.reset_error()),
            _ => Err(StreamError::SendSideClosed),
        }
    }

    pub fn record_received(&mut self, n: u64, now_ms: u64) -> Result<(), StreamError> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => {
                self.bytes_received += n;
                self.touch(now_ms);
                Ok(())
            }
            StreamState::Reset => Err(self.reset_error()),
            _ => Err(StreamError::InvalidTransition),
        }
    }

    pub fn half_close_local(&mut self, now_ms: u64) -> Result<(), StreamError> {
        self.touch(now_ms);
        match self.state {
            StreamState::Open => {
                self.state = StreamState::HalfClosedLocal;
                Ok(())
            }
            StreamState::HalfClosedRemote => {
                self.state = StreamState::Closed;
                self.completion.notify_waiters();
                Ok(())
            }
            _ => Err(StreamError::InvalidTransition),
        }
    }

    pub fn half_close_remote(&mut self, now_ms: u64) -> Result<(), StreamError> {
        self.touch(now_ms);
        match self.state {
            StreamState::Open => {
                self.state = StreamState::HalfClosedRemote;
                Ok(())
            }
            StreamState::HalfClosedLocal => {
                self.state = StreamState::Closed;
                self.completion.notify_waiters();
                Ok(())
            }
            _ => Err(StreamError::InvalidTransition),
        }
    }

    pub fn close(&mut self, now_ms: u64) {
        if self.is_active() {
            self.state = StreamState::Closed;
            self.touch(now_ms);
            self.completion.notify_waiters();
        }
    }

    pub fn reset(&mut self, code: ErrorCode, now_ms: u64) {
        if self.state != StreamState::Reset {
            self.state = StreamState::Reset;
            self.reset_code = Some(code);
            self.send_buffer.clear();
            self.touch(now_ms);
            self.completion.notify_waiters();
        }
    }

    fn reset_error(&self) -> StreamError {
        StreamError::Reset(self.reset_code.unwrap_or(ErrorCode::H3_NO_ERROR))
    }

    fn touch(&mut self, now_ms: u64) {
        self.last_activity_ms = self.last_activity_ms.max(now_ms);
    }
}
