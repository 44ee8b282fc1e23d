//! The interfaces this crate requires of its collaborators: the QUIC packet
//! layer, the TLS handshake, and the on-disk blob store. The core never
//! touches sockets or certificates itself.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;

use thiserror::Error;

/// Errors surfaced by the QUIC transport.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("stream reset by peer: code {0}")]
    Reset(u64),

    #[error("stream finished early")]
    FinishedEarly,

    #[error("stream already closed")]
    ClosedStream,

    #[error("datagrams unsupported by peer")]
    DatagramUnsupported,

    #[error("datagram too large")]
    DatagramTooLarge,

    #[error("io error: {0}")]
    Io(String),
}

/// The sending half of a QUIC stream.
pub trait QuicSendStream: Send {
    /// The 62-bit stream id assigned by the transport.
    fn id(&self) -> u64;

    fn write(&mut self, data: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Half-close the send side (FIN).
    fn finish(&mut self) -> Result<(), TransportError>;

    /// Abandon the stream with an application error code.
    fn reset(&mut self, code: u64);
}

/// The receiving half of a QUIC stream.
pub trait QuicRecvStream: Send {
    fn id(&self) -> u64;

    /// Read the next chunk of ordered data, or None at FIN.
    fn read(&mut self) -> impl Future<Output = Result<Option<Bytes>, TransportError>> + Send;

    /// Tell the peer to stop sending, with an application error code.
    fn stop(&mut self, code: u64);
}

/// Negotiated TLS parameters, available once the handshake completes.
pub trait HandshakeInfo: Send + Sync {
    fn alpn(&self) -> String;
    fn cipher_suite(&self) -> String;
    fn tls_version(&self) -> String;
    fn server_cert_hash(&self) -> Vec<u8>;

    /// A resumption ticket issued by the server, if one arrived.
    fn session_ticket(&self) -> Option<Bytes>;

    /// The QUIC transport parameters to remember alongside a ticket.
    fn transport_parameters(&self) -> HashMap<String, u64>;
}

/// An established QUIC connection.
///
/// Cloning produces another handle to the same connection, mirroring how the
/// transport crates in this space expose theirs.
pub trait QuicConnection: Clone + Send + Sync + 'static {
    type SendStream: QuicSendStream + 'static;
    type RecvStream: QuicRecvStream + 'static;
    type Handshake: HandshakeInfo;

    fn open_bi(
        &self,
    ) -> impl Future<Output = Result<(Self::SendStream, Self::RecvStream), TransportError>> + Send;

    fn open_uni(&self) -> impl Future<Output = Result<Self::SendStream, TransportError>> + Send;

    fn accept_uni(&self) -> impl Future<Output = Result<Self::RecvStream, TransportError>> + Send;

    fn send_datagram(&self, payload: Bytes) -> Result<(), TransportError>;

    fn recv_datagram(&self) -> impl Future<Output = Result<Bytes, TransportError>> + Send;

    fn max_datagram_size(&self) -> usize;

    /// Resolves when the TLS handshake has completed.
    fn completed_handshake(
        &self,
    ) -> impl Future<Output = Result<Self::Handshake, TransportError>> + Send;

    /// Resolves after the server's first flight: true when early data sent on
    /// this connection was accepted. Resolves false when none was offered.
    fn early_data_accepted(&self) -> impl Future<Output = bool> + Send;

    fn rtt(&self) -> Duration;

    fn close(&self, code: u64, reason: &[u8]);

    /// Resolves when the connection is fully closed.
    fn closed(&self) -> impl Future<Output = TransportError> + Send;
}

/// Resumption state handed to the transport when dialing 0-RTT.
#[derive(Debug, Clone)]
pub struct Resumption {
    pub ticket: Bytes,
    pub alpn: String,
    pub transport_parameters: HashMap<String, u64>,
}

/// Opens QUIC connections. Implemented over the real packet layer in the
/// embedder, and over in-memory pipes in tests.
pub trait Dialer: Send + Sync + 'static {
    type Connection: QuicConnection;

    fn dial(
        &self,
        host: &str,
        port: u16,
        resumption: Option<Resumption>,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// Durable key/value storage for persisted state (session tickets).
///
/// Loads and stores are small and synchronous; the disk format is owned by
/// the embedder.
pub trait BlobStore: Send + Sync {
    fn load(&self, key: &str) -> std::io::Result<Option<Vec<u8>>>;
    fn store(&self, key: &str, value: &[u8]) -> std::io::Result<()>;
    fn remove(&self, key: &str) -> std::io::Result<()>;
}

/// An in-memory blob store, used in tests and as a default.
#[derive(Debug, Default)]
pub struct MemoryBlobStore(std::sync::Mutex<HashMap<String, Vec<u8>>>);

impl BlobStore for MemoryBlobStore {
    fn load(&self, key: &str) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.0.lock().unwrap().get(key).cloned())
    }

    fn store(&self, key: &str, value: &[u8]) -> std::io::Result<()> {
        self.0.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> std::io::Result<()> {
        self.0.lock().unwrap().remove(key);
        Ok(())
    }
}
