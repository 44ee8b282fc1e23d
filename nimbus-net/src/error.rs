use thiserror::Error;

use nimbus_proto::{qpack::QpackError, ErrorCode, FrameError, SettingsError};

use crate::{ConnectionState, EarlyDataError, StreamError, TransportError};

/// The error surfaced to callers of [`crate::Http3Client`].
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("qpack error: {0}")]
    Qpack(#[from] QpackError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("early data error: {0}")]
    EarlyData(#[from] EarlyDataError),

    #[error("connection closed with {0}")]
    ConnectionClosed(ErrorCode),

    #[error("connection not usable in state {0:?}")]
    InvalidState(ConnectionState),

    #[error("request rejected by peer")]
    RequestRejected,

    #[error("request cancelled")]
    RequestCancelled,

    #[error("request deadline expired")]
    Timeout,

    #[error("response incomplete")]
    Incomplete,

    #[error("invalid request url: {0}")]
    InvalidUrl(String),

    #[error("peer violated the protocol: {0}")]
    Protocol(ErrorCode),
}

impl ClientError {
    /// The wire code this error maps to when resetting a stream or closing
    /// the connection.
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Frame(_) => ErrorCode::H3_FRAME_ERROR,
            ClientError::Settings(_) => ErrorCode::H3_SETTINGS_ERROR,
            ClientError::Qpack(_) => ErrorCode::QPACK_DECOMPRESSION_FAILED,
            ClientError::Stream(StreamError::Reset(code)) => *code,
            ClientError::Stream(_) => ErrorCode::H3_STREAM_CREATION_ERROR,
            ClientError::ConnectionClosed(code) | ClientError::Protocol(code) => *code,
            ClientError::RequestRejected => ErrorCode::H3_REQUEST_REJECTED,
            ClientError::RequestCancelled | ClientError::Timeout => {
                ErrorCode::H3_REQUEST_CANCELLED
            }
            ClientError::Incomplete => ErrorCode::H3_REQUEST_INCOMPLETE,
            ClientError::EarlyData(_) => ErrorCode::H3_REQUEST_REJECTED,
            ClientError::Transport(_) | ClientError::InvalidState(_) => {
                ErrorCode::H3_INTERNAL_ERROR
            }
            ClientError::InvalidUrl(_) => ErrorCode::H3_MESSAGE_ERROR,
        }
    }

    /// Whether the request may be retried on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::RequestRejected)
    }
}
