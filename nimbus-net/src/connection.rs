use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::time::{sleep, timeout};

use nimbus_proto::{qpack, ErrorCode, Frame, FrameError, Settings, StreamType, VarInt};

use crate::{
    Clock, ClientError, IncomingStream, Priority, QuicConnection, QuicRecvStream, QuicSendStream,
    Response, StreamError, StreamManager, TransportError,
};

/// Connection lifecycle. Error is terminal and orthogonal to the graceful
/// path through GoingAway and Closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    GoingAway,
    Closing,
    Closed,
    Error,
}

struct QpackPair {
    encoder: qpack::Encoder,
    decoder: qpack::Decoder,
}

struct Shared<C: QuicConnection> {
    quic: C,

    host: String,
    port: u16,
    secure: bool,

    state: Mutex<ConnectionState>,
    manager: Mutex<StreamManager>,
    qpack: Mutex<QpackPair>,
    peer_settings: Mutex<Option<Settings>>,
    local_settings: Settings,

    // Send halves of our critical streams. Tokio mutexes: writes await.
    control_send: tokio::sync::Mutex<Option<C::SendStream>>,
    qpack_encoder_send: tokio::sync::Mutex<Option<C::SendStream>>,
    qpack_decoder_send: tokio::sync::Mutex<Option<C::SendStream>>,

    last_activity_ms: AtomicU64,
    idle_timeout: Duration,
    clock: Arc<dyn Clock>,
}

/// One HTTP/3 connection to an origin. Cheap to clone; all clones share
/// state.
pub struct Connection<C: QuicConnection> {
    shared: Arc<Shared<C>>,
}

impl<C: QuicConnection> Clone for Connection<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: QuicConnection> Connection<C> {
    /// Take ownership of an established QUIC connection, wait for the
    /// handshake, and perform the HTTP/3 preamble: control stream first with
    /// SETTINGS as its first frame, then the QPACK streams.
    pub async fn establish(
        quic: C,
        host: &str,
        port: u16,
        secure: bool,
        local_settings: Settings,
        max_concurrent: usize,
        idle_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ClientError> {
        Self::establish_inner(
            quic,
            host,
            port,
            secure,
            local_settings,
            max_concurrent,
            idle_timeout,
            clock,
            false,
        )
        .await
    }

    /// Like [`Connection::establish`], but does not wait for the handshake:
    /// streams opened immediately ride the 0-RTT flight.
    pub async fn establish_with_early_data(
        quic: C,
        host: &str,
        port: u16,
        secure: bool,
        local_settings: Settings,
        max_concurrent: usize,
        idle_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ClientError> {
        Self::establish_inner(
            quic,
            host,
            port,
            secure,
            local_settings,
            max_concurrent,
            idle_timeout,
            clock,
            true,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn establish_inner(
        quic: C,
        host: &str,
        port: u16,
        secure: bool,
        local_settings: Settings,
        max_concurrent: usize,
        idle_timeout: Duration,
        clock: Arc<dyn Clock>,
        early_data: bool,
    ) -> Result<Self, ClientError> {
        let now = clock.now_unix_millis();
        let shared = Arc::new(Shared {
            quic,
            host: host.to_string(),
            port,
            secure,
            state: Mutex::new(ConnectionState::Connecting),
            manager: Mutex::new(StreamManager::new(max_concurrent)),
            qpack: Mutex::new(QpackPair {
                encoder: qpack::Encoder::new(),
                decoder: qpack::Decoder::new(),
            }),
            peer_settings: Mutex::new(None),
            local_settings,
            control_send: tokio::sync::Mutex::new(None),
            qpack_encoder_send: tokio::sync::Mutex::new(None),
            qpack_decoder_send: tokio::sync::Mutex::new(None),
            last_activity_ms: AtomicU64::new(now),
            idle_timeout,
            clock,
        });
        let conn = Self { shared };

        if !early_data {
            conn.shared.quic.completed_handshake().await?;
        }

        conn.open_critical_streams().await?;
        conn.set_state(ConnectionState::Connected);

        let acceptor = conn.clone();
        tokio::spawn(async move { acceptor.run_incoming().await });

        let monitor = conn.clone();
        tokio::spawn(async move { monitor.run_idle_monitor().await });

        Ok(conn)
    }

    async fn open_critical_streams(&self) -> Result<(), ClientError> {
        let now = self.now_ms();

        // Control stream: the SETTINGS frame must be the first frame on it.
        let mut control = self.shared.quic.open_uni().await?;
        let typ = {
            let mut manager = self.shared.manager.lock().unwrap();
            manager.create_control_stream(control.id(), now)?
        };
        let mut buf = Vec::new();
        typ.encode(&mut buf);
        Frame::Settings(self.shared.local_settings.clone()).encode(&mut buf);
        control.write(&buf).await?;
        *self.shared.control_send.lock().await = Some(control);

        let mut encoder = self.shared.quic.open_uni().await?;
        let typ = {
            let mut manager = self.shared.manager.lock().unwrap();
            manager.create_qpack_encoder_stream(encoder.id(), now)?
        };
        let mut buf = Vec::new();
        typ.encode(&mut buf);
        encoder.write(&buf).await?;
        *self.shared.qpack_encoder_send.lock().await = Some(encoder);

        let mut decoder = self.shared.quic.open_uni().await?;
        let typ = {
            let mut manager = self.shared.manager.lock().unwrap();
            manager.create_qpack_decoder_stream(decoder.id(), now)?
        };
        let mut buf = Vec::new();
        typ.encode(&mut buf);
        decoder.write(&buf).await?;
        *self.shared.qpack_decoder_send.lock().await = Some(decoder);

        Ok(())
    }

    pub fn host(&self) -> &str {
        &self.shared.host
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn is_secure(&self) -> bool {
        self.shared.secure
    }

    pub fn quic(&self) -> &C {
        &self.shared.quic
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn peer_settings(&self) -> Option<Settings> {
        self.shared.peer_settings.lock().unwrap().clone()
    }

    /// Whether new requests may be submitted.
    pub fn is_usable(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.shared.state.lock().unwrap();
        // Error and Closed are terminal.
        if !matches!(*state, ConnectionState::Error | ConnectionState::Closed) {
            *state = next;
        }
    }

    fn now_ms(&self) -> u64 {
        self.shared.clock.now_unix_millis()
    }

    fn touch(&self) {
        self.shared
            .last_activity_ms
            .store(self.now_ms(), Ordering::Relaxed);
    }

    /// Send one request and await its complete response.
    ///
    /// `fields` is the full header list, pseudo-headers first. The send side
    /// is half-closed after the body; the future resolves once response
    /// headers and the FIN have both been seen, or earlier with the mapped
    /// error on reset.
    pub async fn request(
        &self,
        fields: Vec<(String, String)>,
        body: Option<Bytes>,
        priority: Priority,
        deadline: Option<Duration>,
    ) -> Result<Response, ClientError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::GoingAway => return Err(ClientError::RequestRejected),
            state => return Err(ClientError::InvalidState(state)),
        }

        self.touch();
        let (mut send, mut recv) = self.shared.quic.open_bi().await?;
        let id = send.id();
        let now = self.now_ms();

        {
            let mut manager = self.shared.manager.lock().unwrap();
            let stream = manager.create_request_stream(id, now)?;
            stream.open(now)?;
            stream.priority = priority;
            stream.request_headers = fields.clone();
            if let Some(body) = &body {
                stream.send_buffer.push(body.clone());
            }
        }

        let result = self.drive_request(&mut send, &mut recv, id, fields, deadline).await;

        match result {
            Ok(response) => Ok(response),
            Err(err) => {
                let code = err.code();
                send.reset(code.0);
                recv.stop(code.0);
                {
                    let mut manager = self.shared.manager.lock().unwrap();
                    let _ = manager.reset_stream(id, code, self.now_ms());
                }

                // Stream-scoped errors stop here; connection-scoped codes
                // take the whole connection down.
                if code.action() == nimbus_proto::Action::CloseConnection {
                    self.fail(code);
                }
                Err(err)
            }
        }
    }

    async fn drive_request(
        &self,
        send: &mut C::SendStream,
        recv: &mut C::RecvStream,
        id: u64,
        fields: Vec<(String, String)>,
        deadline: Option<Duration>,
    ) -> Result<Response, ClientError> {
        // Compress under the shared QPACK lock; the dynamic-table inserts
        // must be on the encoder stream before the block hits the wire.
        let block = {
            let mut qpack = self.shared.qpack.lock().unwrap();
            qpack.encoder.encode(id, &fields)
        };

        if !block.instructions.is_empty() {
            let mut guard = self.shared.qpack_encoder_send.lock().await;
            if let Some(stream) = guard.as_mut() {
                stream.write(&block.instructions).await?;
            }
        }

        let mut out = Vec::new();
        Frame::Headers(Bytes::from(block.block)).encode(&mut out);
        send.write(&out).await?;
        self.record_sent(id, out.len() as u64)?;

        // Drain queued body chunks as DATA frames.
        let chunks = {
            let mut manager = self.shared.manager.lock().unwrap();
            std::mem::take(&mut manager.get_mut(id)?.send_buffer)
        };
        for chunk in chunks {
            let mut out = Vec::new();
            Frame::Data(chunk).encode(&mut out);
            send.write(&out).await?;
            self.record_sent(id, out.len() as u64)?;
        }

        send.finish()?;
        {
            let mut manager = self.shared.manager.lock().unwrap();
            manager.get_mut(id)?.half_close_local(self.now_ms())?;
        }

        match deadline {
            Some(limit) => timeout(limit, self.read_response(recv, id))
                .await
                .map_err(|_| ClientError::Timeout)?,
            None => self.read_response(recv, id).await,
        }
    }

    async fn read_response(
        &self,
        recv: &mut C::RecvStream,
        id: u64,
    ) -> Result<Response, ClientError> {
        let mut reader = FrameReader::default();
        let mut headers: Option<Vec<(String, String)>> = None;
        let mut trailers: Vec<(String, String)> = Vec::new();
        let mut body = BytesMut::new();

        // The stream's completion signal wakes this task when something else
        // resets the stream (connection teardown, explicit cancellation).
        let completion = {
            let manager = self.shared.manager.lock().unwrap();
            manager.get(id).map(|s| s.completion.clone())
        };

        loop {
            if let Some(err) = self.cancelled(id) {
                return Err(err);
            }

            let next = match &completion {
                Some(completion) => {
                    tokio::select! {
                        next = reader.next(recv) => next,
                        _ = completion.notified() => {
                            continue;
                        }
                    }
                }
                None => reader.next(recv).await,
            };

            let frame = match next {
                Ok(frame) => frame,
                Err(ClientError::Transport(TransportError::Reset(code))) => {
                    return Err(ClientError::Stream(StreamError::Reset(ErrorCode(code))));
                }
                Err(err) => return Err(err),
            };

            self.touch();
            match frame {
                Some(Frame::Headers(block)) => {
                    let fields = self.decode_field_section(id, &block).await?;
                    if headers.is_none() {
                        headers = Some(fields);
                    } else if trailers.is_empty() {
                        trailers = fields;
                    } else {
                        return Err(ClientError::Protocol(ErrorCode::H3_FRAME_UNEXPECTED));
                    }
                }
                Some(Frame::Data(chunk)) => {
                    if headers.is_none() {
                        return Err(ClientError::Protocol(ErrorCode::H3_FRAME_UNEXPECTED));
                    }
                    self.record_received(id, chunk.len() as u64)?;
                    body.extend_from_slice(&chunk);
                }
                Some(Frame::PushPromise { push_id, .. }) => {
                    // We never raised MAX_PUSH_ID.
                    log::debug!("ignoring push promise {}", push_id);
                }
                Some(Frame::Unknown { typ, .. }) => {
                    log::debug!("ignoring unknown frame {:?} on request stream", typ);
                }
                Some(_) => {
                    // SETTINGS, GOAWAY, CANCEL_PUSH, MAX_PUSH_ID are
                    // forbidden outside the control stream.
                    return Err(ClientError::Protocol(ErrorCode::H3_FRAME_UNEXPECTED));
                }
                None => break,
            }
        }

        {
            let mut manager = self.shared.manager.lock().unwrap();
            let now = self.now_ms();
            let stream = manager.get_mut(id)?;
            stream.half_close_remote(now)?;
            if let Some(headers) = &headers {
                stream.response_headers = headers.clone();
            }
            stream.response_trailers = trailers.clone();
        }

        let headers = headers.ok_or(ClientError::Incomplete)?;
        Response::from_fields(headers, trailers, body.freeze())
    }

    // An externally-reset stream fails its waiter with the captured code.
    fn cancelled(&self, id: u64) -> Option<ClientError> {
        let manager = self.shared.manager.lock().unwrap();
        let stream = manager.get(id)?;
        match stream.state() {
            crate::StreamState::Reset => Some(match stream.reset_code() {
                Some(code) => ClientError::Stream(StreamError::Reset(code)),
                None => ClientError::RequestCancelled,
            }),
            _ => None,
        }
    }

    /// Decode a HEADERS payload against the shared decoder. A section that
    /// still waits on encoder-stream inserts is retried on a short sleep; the
    /// instruction reader unblocks it well before the request deadline does.
    async fn decode_field_section(
        &self,
        id: u64,
        block: &[u8],
    ) -> Result<Vec<(String, String)>, ClientError> {
        loop {
            let outcome = {
                let mut qpack = self.shared.qpack.lock().unwrap();
                match qpack.decoder.decode_section(&mut Cursor::new(block)) {
                    Ok(decoded) => Some(decoded),
                    Err(qpack::QpackError::Blocked { .. }) => None,
                    Err(err) => return Err(err.into()),
                }
            };

            match outcome {
                Some((fields, required)) => {
                    if required > 0 {
                        let mut ack = Vec::new();
                        qpack::Decoder::section_ack(id, &mut ack);
                        self.write_decoder_stream(&ack).await?;
                    }
                    return Ok(fields);
                }
                None => sleep(Duration::from_millis(10)).await,
            }
        }
    }

    async fn write_decoder_stream(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let mut guard = self.shared.qpack_decoder_send.lock().await;
        if let Some(stream) = guard.as_mut() {
            stream.write(bytes).await?;
        }
        Ok(())
    }

    fn record_sent(&self, id: u64, n: u64) -> Result<(), ClientError> {
        let mut manager = self.shared.manager.lock().unwrap();
        let now = self.now_ms();
        manager.get_mut(id)?.record_sent(n, now)?;
        Ok(())
    }

    fn record_received(&self, id: u64, n: u64) -> Result<(), ClientError> {
        let mut manager = self.shared.manager.lock().unwrap();
        let now = self.now_ms();
        manager.get_mut(id)?.record_received(n, now)?;
        Ok(())
    }

    /// Cancel one request stream.
    pub fn cancel_request(&self, id: u64) {
        let mut manager = self.shared.manager.lock().unwrap();
        let now = self.now_ms();
        let _ = manager.reset_stream(id, ErrorCode::H3_REQUEST_CANCELLED, now);
    }

    /// Close gracefully: tell the peer we're done, then close the transport.
    pub async fn close(&self) {
        self.set_state(ConnectionState::Closing);

        let mut out = Vec::new();
        Frame::GoAway(VarInt::from_u32(0)).encode(&mut out);
        {
            let mut guard = self.shared.control_send.lock().await;
            if let Some(stream) = guard.as_mut() {
                let _ = stream.write(&out).await;
            }
        }

        {
            let mut manager = self.shared.manager.lock().unwrap();
            manager.reset_all(ErrorCode::H3_REQUEST_CANCELLED, self.now_ms());
        }

        self.shared
            .quic
            .close(ErrorCode::H3_NO_ERROR.0, b"idle close");
        self.set_state(ConnectionState::Closed);
    }

    /// Tear down after a fatal error: reset every stream with the classified
    /// code and surface it on the transport.
    fn fail(&self, code: ErrorCode) {
        self.set_state(ConnectionState::Error);
        {
            let mut manager = self.shared.manager.lock().unwrap();
            manager.reset_all(code, self.now_ms());
        }
        self.shared.quic.close(code.0, b"");
    }

    async fn run_incoming(self) {
        loop {
            let recv = match self.shared.quic.accept_uni().await {
                Ok(recv) => recv,
                Err(_) => {
                    // Transport gone; nothing more will arrive.
                    if matches!(
                        self.state(),
                        ConnectionState::Connected | ConnectionState::GoingAway
                    ) {
                        self.fail(ErrorCode::H3_INTERNAL_ERROR);
                    }
                    return;
                }
            };

            let conn = self.clone();
            tokio::spawn(async move {
                if let Err(err) = conn.handle_incoming_stream(recv).await {
                    let code = err.code();
                    log::warn!("incoming stream error: {err}");
                    conn.fail(code);
                }
            });
        }
    }

    async fn handle_incoming_stream(&self, mut recv: C::RecvStream) -> Result<(), ClientError> {
        // Peek the stream-type varint.
        let mut buf = BytesMut::new();
        let typ = loop {
            let mut cursor = Cursor::new(&buf[..]);
            match StreamType::decode(&mut cursor) {
                Ok(typ) => {
                    let n = cursor.position() as usize;
                    buf.advance(n);
                    break typ;
                }
                Err(_) => match recv.read().await? {
                    Some(chunk) => buf.extend_from_slice(&chunk),
                    None => return Ok(()),
                },
            }
        };

        let kind = {
            let mut manager = self.shared.manager.lock().unwrap();
            manager.handle_incoming(recv.id(), typ)
        };
        let kind = match kind {
            Ok(kind) => kind,
            Err(StreamError::DuplicateCritical(_)) => {
                return Err(ClientError::Protocol(ErrorCode::H3_STREAM_CREATION_ERROR));
            }
            Err(err) => return Err(err.into()),
        };

        match kind {
            IncomingStream::PeerControl => self.run_peer_control(recv, buf).await,
            IncomingStream::PeerQpackEncoder => self.run_peer_qpack_encoder(recv, buf).await,
            IncomingStream::PeerQpackDecoder => self.run_peer_qpack_decoder(recv, buf).await,
            IncomingStream::Push | IncomingStream::Unknown => {
                // Not fatal: consume and discard.
                while recv.read().await?.is_some() {}
                Ok(())
            }
        }
    }

    async fn run_peer_control(
        &self,
        mut recv: C::RecvStream,
        leftover: BytesMut,
    ) -> Result<(), ClientError> {
        let mut reader = FrameReader::with_buffer(leftover);
        let mut saw_settings = false;

        loop {
            let frame = reader.next(&mut recv).await?;
            self.touch();

            match frame {
                Some(Frame::Settings(settings)) => {
                    if saw_settings {
                        return Err(ClientError::Protocol(ErrorCode::H3_FRAME_UNEXPECTED));
                    }
                    saw_settings = true;
                    self.apply_peer_settings(settings).await?;
                }
                Some(frame) if !saw_settings => {
                    log::warn!("first control frame was {:?}", frame.typ());
                    return Err(ClientError::Protocol(ErrorCode::H3_MISSING_SETTINGS));
                }
                Some(Frame::GoAway(id)) => {
                    log::debug!("goaway: last accepted request stream {}", id);
                    self.set_state(ConnectionState::GoingAway);
                }
                Some(Frame::CancelPush(_)) | Some(Frame::Unknown { .. }) => {}
                Some(_) => {
                    return Err(ClientError::Protocol(ErrorCode::H3_FRAME_UNEXPECTED));
                }
                None => {
                    // Closing the control stream is fatal.
                    return Err(ClientError::Protocol(ErrorCode::H3_CLOSED_CRITICAL_STREAM));
                }
            }
        }
    }

    async fn apply_peer_settings(&self, settings: Settings) -> Result<(), ClientError> {
        let instructions = {
            let mut qpack = self.shared.qpack.lock().unwrap();
            let mut instructions = Vec::new();
            let capacity = settings.qpack_max_table_capacity() as usize;
            if capacity > 0 {
                qpack
                    .encoder
                    .set_max_table_capacity(capacity, &mut instructions);
            }
            qpack
                .encoder
                .set_max_blocked_streams(settings.qpack_blocked_streams());
            instructions
        };

        if !instructions.is_empty() {
            let mut guard = self.shared.qpack_encoder_send.lock().await;
            if let Some(stream) = guard.as_mut() {
                stream.write(&instructions).await?;
            }
        }

        *self.shared.peer_settings.lock().unwrap() = Some(settings);
        Ok(())
    }

    async fn run_peer_qpack_encoder(
        &self,
        mut recv: C::RecvStream,
        mut buf: BytesMut,
    ) -> Result<(), ClientError> {
        loop {
            // Apply whole instructions; a trailing partial one waits for the
            // next chunk.
            loop {
                let applied = {
                    let mut qpack = self.shared.qpack.lock().unwrap();
                    let before = qpack.decoder.insert_count();
                    let mut cursor = Cursor::new(&buf[..]);
                    match qpack.decoder.apply_one_instruction(&mut cursor) {
                        Ok(true) => {
                            let n = cursor.position() as usize;
                            buf.advance(n);
                            Some(qpack.decoder.insert_count() - before)
                        }
                        Ok(false) => None,
                        Err(qpack::QpackError::ShortRead) => None,
                        Err(err) => {
                            return Err(ClientError::Protocol(err.encoder_stream_code()))
                        }
                    }
                };

                match applied {
                    Some(inserts) if inserts > 0 => {
                        let mut out = Vec::new();
                        qpack::Decoder::insert_count_increment(inserts, &mut out);
                        self.write_decoder_stream(&out).await?;
                    }
                    Some(_) => {}
                    None => break,
                }
            }

            match recv.read().await? {
                Some(chunk) => buf.extend_from_slice(&chunk),
                None => {
                    return Err(ClientError::Protocol(ErrorCode::H3_CLOSED_CRITICAL_STREAM))
                }
            }
        }
    }

    async fn run_peer_qpack_decoder(
        &self,
        mut recv: C::RecvStream,
        mut buf: BytesMut,
    ) -> Result<(), ClientError> {
        loop {
            loop {
                let progressed = {
                    let mut qpack = self.shared.qpack.lock().unwrap();
                    let mut cursor = Cursor::new(&buf[..]);
                    match qpack.encoder.handle_one_decoder_instruction(&mut cursor) {
                        Ok(true) => {
                            let n = cursor.position() as usize;
                            buf.advance(n);
                            true
                        }
                        Ok(false) => false,
                        Err(qpack::QpackError::ShortRead) => false,
                        Err(err) => {
                            return Err(ClientError::Protocol(err.decoder_stream_code()))
                        }
                    }
                };
                if !progressed {
                    break;
                }
            }

            match recv.read().await? {
                Some(chunk) => buf.extend_from_slice(&chunk),
                None => {
                    return Err(ClientError::Protocol(ErrorCode::H3_CLOSED_CRITICAL_STREAM))
                }
            }
        }
    }

    async fn run_idle_monitor(self) {
        let period = (self.shared.idle_timeout / 4).max(Duration::from_millis(250));
        loop {
            sleep(period).await;

            match self.state() {
                ConnectionState::Closed | ConnectionState::Error => return,
                _ => {}
            }

            let last = self.shared.last_activity_ms.load(Ordering::Relaxed);
            let idle_ms = self.now_ms().saturating_sub(last);
            let busy = {
                let manager = self.shared.manager.lock().unwrap();
                manager.active_request_count() > 0
            };

            if !busy && idle_ms >= self.shared.idle_timeout.as_millis() as u64 {
                log::debug!("closing idle connection to {}:{}", self.shared.host, self.shared.port);
                self.close().await;
                return;
            }
        }
    }
}

/// Reassembles frames from a stream of chunks.
#[derive(Default)]
struct FrameReader {
    buf: BytesMut,
    fin: bool,
}

impl FrameReader {
    fn with_buffer(buf: BytesMut) -> Self {
        Self { buf, fin: false }
    }

    /// The next whole frame, or None at a clean FIN.
    async fn next<R: QuicRecvStream>(&mut self, recv: &mut R) -> Result<Option<Frame>, ClientError> {
        loop {
            if !self.buf.is_empty() {
                let mut cursor = Cursor::new(&self.buf[..]);
                match Frame::decode(&mut cursor) {
                    Ok(frame) => {
                        let n = cursor.position() as usize;
                        self.buf.advance(n);
                        return Ok(Some(frame));
                    }
                    Err(FrameError::ShortRead) => {
                        if self.fin {
                            // Truncated frame at end of stream.
                            return Err(ClientError::Frame(FrameError::ShortRead));
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            if self.fin {
                return Ok(None);
            }

            match recv.read().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => self.fin = true,
            }
        }
    }
}
