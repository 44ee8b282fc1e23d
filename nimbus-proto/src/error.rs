use std::fmt;

/// A wire error code, reported in RESET_STREAM / CONNECTION_CLOSE.
///
/// HTTP/3 uses 0x0100..0x01ff, QPACK uses 0x0200..0x02ff, and QUIC transport
/// codes 0x00..0x10 pass through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u64);

macro_rules! error_codes {
    {$($name:ident = $val:expr,)*} => {
        impl ErrorCode {
            $(pub const $name: ErrorCode = ErrorCode($val);)*
        }
    }
}

error_codes! {
    H3_NO_ERROR = 0x0100,
    H3_GENERAL_PROTOCOL_ERROR = 0x0101,
    H3_INTERNAL_ERROR = 0x0102,
    H3_STREAM_CREATION_ERROR = 0x0103,
    H3_CLOSED_CRITICAL_STREAM = 0x0104,
    H3_FRAME_UNEXPECTED = 0x0105,
    H3_FRAME_ERROR = 0x0106,
    H3_EXCESSIVE_LOAD = 0x0107,
    H3_ID_ERROR = 0x0108,
    H3_SETTINGS_ERROR = 0x0109,
    H3_MISSING_SETTINGS = 0x010a,
    H3_REQUEST_REJECTED = 0x010b,
    H3_REQUEST_CANCELLED = 0x010c,
    H3_REQUEST_INCOMPLETE = 0x010d,
    H3_MESSAGE_ERROR = 0x010e,
    H3_CONNECT_ERROR = 0x010f,
    H3_VERSION_FALLBACK = 0x0110,

    QPACK_DECOMPRESSION_FAILED = 0x0200,
    QPACK_ENCODER_STREAM_ERROR = 0x0201,
    QPACK_DECODER_STREAM_ERROR = 0x0202,
}

/// Which subsystem an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer violated the protocol.
    Protocol,
    /// One of our own invariants broke.
    Implementation,
    /// The underlying transport failed.
    Connection,
    /// Scoped to a single stream.
    Stream,
    /// QPACK state diverged.
    Compression,
    /// Request/response semantics.
    Application,
    /// Authentication or replay protection.
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
    Critical,
    Fatal,
}

/// What the caller should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ignore,
    Retry,
    ResetStream,
    CloseConnection,
    Recover,
}

impl ErrorCode {
    pub fn is_http3(&self) -> bool {
        (0x0100..=0x01ff).contains(&self.0)
    }

    pub fn is_qpack(&self) -> bool {
        (0x0200..=0x02ff).contains(&self.0)
    }

    pub fn is_transport(&self) -> bool {
        self.0 <= 0x10
    }

    pub fn kind(&self) -> ErrorKind {
        match *self {
            ErrorCode::H3_INTERNAL_ERROR => ErrorKind::Implementation,
            ErrorCode::H3_REQUEST_REJECTED
            | ErrorCode::H3_REQUEST_CANCELLED
            | ErrorCode::H3_REQUEST_INCOMPLETE
            | ErrorCode::H3_MESSAGE_ERROR => ErrorKind::Application,
            ErrorCode::H3_STREAM_CREATION_ERROR | ErrorCode::H3_CONNECT_ERROR => ErrorKind::Stream,
            code if code.is_qpack() => ErrorKind::Compression,
            code if code.is_transport() => ErrorKind::Connection,
            _ => ErrorKind::Protocol,
        }
    }

    pub fn severity(&self) -> Severity {
        match *self {
            ErrorCode::H3_NO_ERROR => Severity::Warning,
            ErrorCode::H3_REQUEST_REJECTED
            | ErrorCode::H3_REQUEST_CANCELLED
            | ErrorCode::H3_REQUEST_INCOMPLETE => Severity::Error,
            ErrorCode::H3_CLOSED_CRITICAL_STREAM | ErrorCode::H3_MISSING_SETTINGS => {
                Severity::Fatal
            }
            code if code.is_qpack() => Severity::Critical,
            _ => Severity::Critical,
        }
    }

    /// The recommended reaction. A recoverable code never moves the
    /// connection into the error state.
    pub fn action(&self) -> Action {
        match *self {
            ErrorCode::H3_NO_ERROR => Action::Ignore,
            ErrorCode::H3_REQUEST_REJECTED => Action::Retry,
            ErrorCode::H3_REQUEST_CANCELLED
            | ErrorCode::H3_REQUEST_INCOMPLETE
            | ErrorCode::H3_MESSAGE_ERROR
            | ErrorCode::H3_STREAM_CREATION_ERROR
            | ErrorCode::H3_CONNECT_ERROR => Action::ResetStream,
            ErrorCode::H3_VERSION_FALLBACK => Action::Recover,
            _ => Action::CloseConnection,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self.action(), Action::CloseConnection)
    }
}

impl From<ErrorCode> for u64 {
    fn from(code: ErrorCode) -> Self {
        code.0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}
