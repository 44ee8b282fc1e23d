//! End-to-end exercises of the client against an in-memory QUIC transport.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use nimbus_net::{
    ClientConfig, ClientError, Clock, Connection, Dialer, EarlyDataConfig, EarlyDataManager,
    HandshakeInfo, Http3Client, MemoryBlobStore, Priority, QuicConnection, QuicRecvStream,
    QuicSendStream, Request, Resumption, SessionTicket, SystemClock, TransportError,
};
use nimbus_proto::{qpack, Frame, Settings, StreamType};

/// What the fake transport captured from one client-opened stream.
#[derive(Clone)]
struct Captured {
    id: u64,
    data: Arc<Mutex<Vec<u8>>>,
    fin: Arc<AtomicBool>,
}

impl Captured {
    fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

/// A scripted response for one client-opened bidirectional stream.
struct Script {
    chunks: Vec<Bytes>,
    /// Leave the stream open instead of delivering FIN.
    hang: bool,
}

struct FakeInner {
    next_id: AtomicU64,
    bi_scripts: Mutex<VecDeque<Script>>,
    captured: Mutex<Vec<Captured>>,
    incoming: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<FakeRecv>>,
    early_accepted: bool,
}

#[derive(Clone)]
struct FakeQuic(Arc<FakeInner>);

struct Harness {
    quic: FakeQuic,
    /// Push server-initiated unidirectional streams here.
    server_streams: tokio::sync::mpsc::UnboundedSender<FakeRecv>,
}

impl Harness {
    fn new(early_accepted: bool) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let quic = FakeQuic(Arc::new(FakeInner {
            next_id: AtomicU64::new(0),
            bi_scripts: Mutex::new(VecDeque::new()),
            captured: Mutex::new(Vec::new()),
            incoming: tokio::sync::Mutex::new(rx),
            early_accepted,
        }));
        Self {
            quic,
            server_streams: tx,
        }
    }

    fn script_response(&self, chunks: Vec<Bytes>) {
        self.quic
            .0
            .bi_scripts
            .lock()
            .unwrap()
            .push_back(Script { chunks, hang: false });
    }

    fn script_hang(&self) {
        self.quic
            .0
            .bi_scripts
            .lock()
            .unwrap()
            .push_back(Script { chunks: Vec::new(), hang: true });
    }

    /// Deliver a server-initiated unidirectional stream.
    fn push_uni(&self, bytes: Vec<u8>) {
        let recv = FakeRecv {
            id: 1000 + bytes.len() as u64,
            chunks: VecDeque::from([Bytes::from(bytes)]),
            hang: true,
        };
        let _ = self.server_streams.send(recv);
    }

    /// Streams the client opened, in order.
    fn captured(&self) -> Vec<Captured> {
        self.quic.0.captured.lock().unwrap().clone()
    }
}

struct FakeSend {
    id: u64,
    data: Arc<Mutex<Vec<u8>>>,
    fin: Arc<AtomicBool>,
}

impl QuicSendStream for FakeSend {
    fn id(&self) -> u64 {
        self.id
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.data.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        self.fin.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&mut self, _code: u64) {}
}

struct FakeRecv {
    id: u64,
    chunks: VecDeque<Bytes>,
    hang: bool,
}

impl QuicRecvStream for FakeRecv {
    fn id(&self) -> u64 {
        self.id
    }

    async fn read(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.chunks.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None if self.hang => std::future::pending().await,
            None => Ok(None),
        }
    }

    fn stop(&mut self, _code: u64) {}
}

struct FakeHandshake;

impl HandshakeInfo for FakeHandshake {
    fn alpn(&self) -> String {
        "h3".to_string()
    }
    fn cipher_suite(&self) -> String {
        "TLS_CHACHA20_POLY1305_SHA256".to_string()
    }
    fn tls_version(&self) -> String {
        "1.3".to_string()
    }
    fn server_cert_hash(&self) -> Vec<u8> {
        vec![0xab; 32]
    }
    fn session_ticket(&self) -> Option<Bytes> {
        Some(Bytes::from_static(b"fresh-ticket"))
    }
    fn transport_parameters(&self) -> HashMap<String, u64> {
        HashMap::new()
    }
}

impl QuicConnection for FakeQuic {
    type SendStream = FakeSend;
    type RecvStream = FakeRecv;
    type Handshake = FakeHandshake;

    async fn open_bi(&self) -> Result<(FakeSend, FakeRecv), TransportError> {
        let id = self.0.next_id.fetch_add(4, Ordering::SeqCst);
        let captured = Captured {
            id,
            data: Arc::new(Mutex::new(Vec::new())),
            fin: Arc::new(AtomicBool::new(false)),
        };
        self.0.captured.lock().unwrap().push(captured.clone());

        let script = self
            .0
            .bi_scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script { chunks: Vec::new(), hang: true });

        Ok((
            FakeSend {
                id,
                data: captured.data,
                fin: captured.fin,
            },
            FakeRecv {
                id,
                chunks: script.chunks.into(),
                hang: script.hang,
            },
        ))
    }

    async fn open_uni(&self) -> Result<FakeSend, TransportError> {
        let id = self.0.next_id.fetch_add(4, Ordering::SeqCst) + 2;
        let captured = Captured {
            id,
            data: Arc::new(Mutex::new(Vec::new())),
            fin: Arc::new(AtomicBool::new(false)),
        };
        self.0.captured.lock().unwrap().push(captured.clone());
        Ok(FakeSend {
            id,
            data: captured.data,
            fin: captured.fin,
        })
    }

    async fn accept_uni(&self) -> Result<FakeRecv, TransportError> {
        let mut incoming = self.0.incoming.lock().await;
        match incoming.recv().await {
            Some(recv) => Ok(recv),
            None => std::future::pending().await,
        }
    }

    fn send_datagram(&self, _payload: Bytes) -> Result<(), TransportError> {
        Ok(())
    }

    async fn recv_datagram(&self) -> Result<Bytes, TransportError> {
        std::future::pending().await
    }

    fn max_datagram_size(&self) -> usize {
        1200
    }

    async fn completed_handshake(&self) -> Result<FakeHandshake, TransportError> {
        Ok(FakeHandshake)
    }

    async fn early_data_accepted(&self) -> bool {
        self.0.early_accepted
    }

    fn rtt(&self) -> Duration {
        Duration::from_millis(40)
    }

    fn close(&self, _code: u64, _reason: &[u8]) {}

    async fn closed(&self) -> TransportError {
        std::future::pending().await
    }
}

struct FakeDialer {
    harness: Harness,
    dialed_with_resumption: Arc<Mutex<Vec<Option<Resumption>>>>,
}

impl Dialer for FakeDialer {
    type Connection = FakeQuic;

    async fn dial(
        &self,
        _host: &str,
        _port: u16,
        resumption: Option<Resumption>,
    ) -> Result<FakeQuic, TransportError> {
        self.dialed_with_resumption
            .lock()
            .unwrap()
            .push(resumption);
        Ok(self.harness.quic.clone())
    }
}

fn response_bytes(status: &str, extra: &[(&str, &str)], body: &[u8]) -> Vec<Bytes> {
    let mut fields = vec![(":status".to_string(), status.to_string())];
    for (name, value) in extra {
        fields.push((name.to_string(), value.to_string()));
    }
    let block = qpack::Encoder::encode_static_only(&fields);

    let mut wire = Vec::new();
    Frame::Headers(Bytes::from(block)).encode(&mut wire);
    if !body.is_empty() {
        Frame::Data(Bytes::copy_from_slice(body)).encode(&mut wire);
    }
    vec![Bytes::from(wire)]
}

fn server_control_bytes(extra_frames: &[Frame]) -> Vec<u8> {
    let mut wire = Vec::new();
    StreamType::CONTROL.encode(&mut wire);
    Frame::Settings(Settings::defaults()).encode(&mut wire);
    for frame in extra_frames {
        frame.encode(&mut wire);
    }
    wire
}

async fn establish(harness: &Harness) -> Connection<FakeQuic> {
    Connection::establish(
        harness.quic.clone(),
        "example.com",
        443,
        true,
        Settings::defaults(),
        16,
        Duration::from_secs(30),
        Arc::new(SystemClock),
    )
    .await
    .unwrap()
}

fn decode_request(bytes: &[u8]) -> (Vec<(String, String)>, Vec<u8>) {
    let mut cursor = std::io::Cursor::new(bytes);
    let mut headers = None;
    let mut body = Vec::new();

    while (cursor.position() as usize) < bytes.len() {
        match Frame::decode(&mut cursor).unwrap() {
            Frame::Headers(block) => {
                let mut decoder = qpack::Decoder::new();
                headers = Some(decoder.decode_block(&mut &block[..]).unwrap());
            }
            Frame::Data(chunk) => body.extend_from_slice(&chunk),
            other => panic!("unexpected request frame {other:?}"),
        }
    }

    (headers.expect("request had no HEADERS"), body)
}

#[tokio::test]
async fn request_response_roundtrip() {
    let harness = Harness::new(false);
    harness.script_response(response_bytes(
        "200",
        &[("server", "fake"), ("set-cookie", "sid=abc123; Path=/")],
        b"hello world",
    ));

    let conn = establish(&harness).await;

    let fields = vec![
        (":method".to_string(), "POST".to_string()),
        (":scheme".to_string(), "https".to_string()),
        (":authority".to_string(), "example.com".to_string()),
        (":path".to_string(), "/submit".to_string()),
        ("content-length".to_string(), "4".to_string()),
    ];
    let response = conn
        .request(
            fields,
            Some(Bytes::from_static(b"ping")),
            Priority::default(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(response.status, http::StatusCode::OK);
    assert_eq!(response.header("server"), Some("fake"));
    assert_eq!(response.body.as_ref(), b"hello world");

    // The wire side: control stream carried SETTINGS first.
    let captured = harness.captured();
    let control = captured
        .iter()
        .find(|c| c.bytes().first() == Some(&0x00))
        .expect("control stream");
    let control_bytes = control.bytes();
    // Type byte, then a SETTINGS frame (type 0x04).
    assert_eq!(control_bytes[1], 0x04);

    // The request stream: HEADERS then DATA, send side finished.
    let request_stream = captured
        .iter()
        .find(|c| {
            let b = c.bytes();
            b.first() == Some(&0x01)
        })
        .expect("request stream");
    let (headers, body) = decode_request(&request_stream.bytes());
    assert_eq!(headers[0], (":method".to_string(), "POST".to_string()));
    assert_eq!(headers[3], (":path".to_string(), "/submit".to_string()));
    assert_eq!(body, b"ping");
    assert!(request_stream.fin.load(Ordering::SeqCst));
}

#[tokio::test]
async fn peer_settings_are_applied_from_control_stream() {
    let harness = Harness::new(false);
    let conn = establish(&harness).await;
    assert!(conn.peer_settings().is_none());

    harness.push_uni(server_control_bytes(&[]));

    // The acceptor task picks the stream up shortly.
    for _ in 0..50 {
        if conn.peer_settings().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let settings = conn.peer_settings().expect("peer settings");
    assert_eq!(settings.qpack_max_table_capacity(), 4096);
}

#[tokio::test]
async fn goaway_refuses_new_requests() {
    let harness = Harness::new(false);
    let conn = establish(&harness).await;

    harness.push_uni(server_control_bytes(&[Frame::GoAway(
        nimbus_proto::VarInt::from_u32(0),
    )]));

    for _ in 0..50 {
        if !conn.is_usable() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let fields = vec![
        (":method".to_string(), "GET".to_string()),
        (":scheme".to_string(), "https".to_string()),
        (":authority".to_string(), "example.com".to_string()),
        (":path".to_string(), "/".to_string()),
    ];
    let err = conn
        .request(fields, None, Priority::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::RequestRejected));
}

#[tokio::test]
async fn deadline_expiry_cancels_the_request() {
    let harness = Harness::new(false);
    harness.script_hang();
    let conn = establish(&harness).await;

    let fields = vec![
        (":method".to_string(), "GET".to_string()),
        (":scheme".to_string(), "https".to_string()),
        (":authority".to_string(), "example.com".to_string()),
        (":path".to_string(), "/slow".to_string()),
    ];
    let err = conn
        .request(
            fields,
            None,
            Priority::default(),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout));
}

#[tokio::test]
async fn truncated_response_is_incomplete() {
    let harness = Harness::new(false);
    // FIN with no HEADERS at all.
    harness.script_response(Vec::new());
    let conn = establish(&harness).await;

    let fields = vec![
        (":method".to_string(), "GET".to_string()),
        (":scheme".to_string(), "https".to_string()),
        (":authority".to_string(), "example.com".to_string()),
        (":path".to_string(), "/".to_string()),
    ];
    let err = conn
        .request(fields, None, Priority::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Incomplete));
}

fn client_with_ticket(
    harness: Harness,
) -> (Http3Client<FakeDialer>, Arc<EarlyDataManager>, Arc<Mutex<Vec<Option<Resumption>>>>) {
    let dialed = Arc::new(Mutex::new(Vec::new()));
    let dialer = FakeDialer {
        harness,
        dialed_with_resumption: dialed.clone(),
    };

    let clock = Arc::new(SystemClock);
    let manager = Arc::new(EarlyDataManager::new(
        Arc::new(MemoryBlobStore::default()),
        [3u8; 32],
        clock.clone(),
        EarlyDataConfig::default(),
    ));

    let now = clock.now_unix();
    let mut ticket = SessionTicket::new(
        "example.com:443",
        Bytes::from_static(b"resume-me"),
        now,
        now + 7200,
    );
    ticket.alpn = "h3".to_string();
    manager.insert_ticket(ticket);

    let client =
        Http3Client::new(dialer, ClientConfig::default()).with_early_data(manager.clone());
    (client, manager, dialed)
}

#[tokio::test]
async fn early_data_accepted_path_sends_once() {
    let harness = Harness::new(true);
    harness.script_response(response_bytes("200", &[], b"early ok"));
    let (client, manager, dialed) = client_with_ticket(harness);

    let response = client
        .fetch(Request::get(Url::parse("https://example.com/").unwrap()))
        .await
        .unwrap();
    assert_eq!(response.body.as_ref(), b"early ok");

    // Dialed once, with the ticket.
    let dialed = dialed.lock().unwrap();
    assert_eq!(dialed.len(), 1);
    assert_eq!(
        dialed[0].as_ref().unwrap().ticket,
        Bytes::from_static(b"resume-me")
    );

    let ticket = manager.ticket("example.com:443").unwrap();
    assert!(ticket.accepted);
    assert!(ticket.average_rtt_ms > 0.0);
}

#[tokio::test]
async fn early_data_rejection_redrives_once_without_replay_headers() {
    let harness = Harness::new(false);
    // The 0-RTT stream hangs (server discarded it); the 1-RTT retry works.
    harness.script_hang();
    harness.script_response(response_bytes("200", &[], b"second try"));

    let quic = harness.quic.clone();
    let (client, manager, dialed) = client_with_ticket(harness);

    let response = client
        .fetch(
            Request::get(Url::parse("https://example.com/").unwrap())
                .header("accept", "text/html"),
        )
        .await
        .unwrap();
    assert_eq!(response.body.as_ref(), b"second try");
    assert_eq!(dialed.lock().unwrap().len(), 1);

    // Exactly two request streams: the early one with replay-protection
    // headers, the re-drive without them.
    let captured: Vec<_> = quic
        .0
        .captured
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.bytes().first() == Some(&0x01))
        .cloned()
        .collect();
    assert_eq!(captured.len(), 2);

    let (early_headers, _) = decode_request(&captured[0].bytes());
    assert!(early_headers.iter().any(|(n, v)| n == "early-data" && v == "1"));
    assert!(early_headers.iter().any(|(n, _)| n == "early-data-nonce"));
    assert!(early_headers
        .iter()
        .any(|(n, _)| n == "early-data-timestamp"));

    let (retry_headers, _) = decode_request(&captured[1].bytes());
    assert!(!retry_headers.iter().any(|(n, _)| n.starts_with("early-data")));

    // The ticket recorded the rejection.
    let ticket = manager.ticket("example.com:443").unwrap();
    assert_eq!(ticket.rejection_count, 1);
    assert!(ticket.success_rate < 1.0);
}

#[tokio::test]
async fn ineligible_request_falls_back_to_one_rtt() {
    let harness = Harness::new(true);
    harness.script_response(response_bytes("200", &[], b"plain"));

    let quic = harness.quic.clone();
    let (client, _manager, dialed) = client_with_ticket(harness);

    // A cookie-bearing GET must never ride 0-RTT.
    let response = client
        .fetch(
            Request::get(Url::parse("https://example.com/").unwrap())
                .header("Cookie", "a=b"),
        )
        .await
        .unwrap();
    assert_eq!(response.body.as_ref(), b"plain");

    // Dialed once, without a resumption ticket.
    let dialed = dialed.lock().unwrap();
    assert_eq!(dialed.len(), 1);
    assert!(dialed[0].is_none());

    // The request went out exactly once, with no replay-protection headers.
    let captured: Vec<_> = quic
        .0
        .captured
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.bytes().first() == Some(&0x01))
        .cloned()
        .collect();
    assert_eq!(captured.len(), 1);
    let (headers, _) = decode_request(&captured[0].bytes());
    assert!(!headers.iter().any(|(n, _)| n.starts_with("early-data")));
    assert!(headers.iter().any(|(n, v)| n == "cookie" && v == "a=b"));
}

#[tokio::test]
async fn cookies_flow_through_the_client() {
    let harness = Harness::new(false);
    harness.script_response(response_bytes(
        "200",
        &[("set-cookie", "sid=abc123; Path=/; Secure")],
        b"first",
    ));
    harness.script_response(response_bytes("200", &[], b"second"));

    let dialed = Arc::new(Mutex::new(Vec::new()));
    let quic = harness.quic.clone();
    let dialer = FakeDialer {
        harness,
        dialed_with_resumption: dialed,
    };
    let client = Http3Client::new(dialer, ClientConfig::default());

    let url = Url::parse("https://example.com/").unwrap();
    client.fetch(Request::get(url.clone())).await.unwrap();
    client.fetch(Request::get(url)).await.unwrap();

    let captured: Vec<_> = quic
        .0
        .captured
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.bytes().first() == Some(&0x01))
        .cloned()
        .collect();
    assert_eq!(captured.len(), 2);

    let (first_headers, _) = decode_request(&captured[0].bytes());
    assert!(!first_headers.iter().any(|(n, _)| n == "cookie"));

    let (second_headers, _) = decode_request(&captured[1].bytes());
    assert!(second_headers
        .iter()
        .any(|(n, v)| n == "cookie" && v == "sid=abc123"));
}
