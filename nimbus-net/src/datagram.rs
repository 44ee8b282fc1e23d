//! HTTP/3 Datagram extension: unreliable-by-default messaging over QUIC
//! datagrams, with optional acknowledged delivery for higher QoS classes.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use thiserror::Error;

use crate::{QuicConnection, TransportError};

/// The datagram frame type byte preceding every HTTP/3 datagram.
pub const DATAGRAM_TYPE: u8 = 0x30;

/// Wire header size after the type byte: 8-byte id, 1-byte QoS, 3-byte flow
/// id, 4-byte context id.
pub const HEADER_SIZE: usize = 16;

/// Flow ids fit the 3-byte wire field; zero is reserved.
const MAX_FLOW_ID: u32 = 1 << 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatagramError {
    #[error("too many datagrams in flight")]
    InFlightLimit,

    #[error("insufficient send window: need {needed}, have {window}")]
    WindowExhausted { needed: u64, window: u64 },

    #[error("unknown flow {0}")]
    UnknownFlow(u32),

    #[error("unknown datagram id {0}")]
    UnknownDatagram(u64),

    #[error("datagram exceeds transport limit")]
    TooLarge,

    #[error("malformed datagram header")]
    Malformed,

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<TransportError> for DatagramError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::DatagramTooLarge => DatagramError::TooLarge,
            other => DatagramError::Transport(other.to_string()),
        }
    }
}

/// Delivery class. Anything above BestEffort is tracked for retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Qos {
    BestEffort = 0,
    Reliable = 1,
    Critical = 2,
    Realtime = 3,
}

impl Qos {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Qos::BestEffort),
            1 => Some(Qos::Reliable),
            2 => Some(Qos::Critical),
            3 => Some(Qos::Realtime),
            _ => None,
        }
    }

    pub fn is_tracked(&self) -> bool {
        *self >= Qos::Reliable
    }
}

/// The 16-byte header carried after the 0x30 type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramHeader {
    pub id: u64,
    pub qos: Qos,
    pub flow_id: u32,
    pub context_id: u32,
}

impl DatagramHeader {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(DATAGRAM_TYPE);
        buf.put_u64(self.id);
        buf.put_u8(self.qos as u8);
        // 3-byte flow id, big endian.
        buf.put_u8((self.flow_id >> 16) as u8);
        buf.put_u16(self.flow_id as u16);
        buf.put_u32(self.context_id);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, DatagramError> {
        if buf.remaining() < 1 + HEADER_SIZE {
            return Err(DatagramError::Malformed);
        }
        if buf.get_u8() != DATAGRAM_TYPE {
            return Err(DatagramError::Malformed);
        }

        let id = buf.get_u64();
        let qos = Qos::from_u8(buf.get_u8()).ok_or(DatagramError::Malformed)?;
        let flow_hi = buf.get_u8() as u32;
        let flow_lo = buf.get_u16() as u32;
        let context_id = buf.get_u32();

        Ok(Self {
            id,
            qos,
            flow_id: (flow_hi << 16) | flow_lo,
            context_id,
        })
    }
}

/// Per-flow delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub sent: u64,
    pub received: u64,
    pub acked: u64,
    pub lost: u64,
    pub retransmitted: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug)]
struct Flow {
    priority: u8,
    stats: FlowStats,
}

struct PendingDatagram {
    flow_id: u32,
    payload: Bytes,
    size: u64,
    retries: u32,
}

#[derive(Debug, Clone)]
pub struct DatagramConfig {
    pub max_in_flight: usize,
    pub max_retries: u32,
    pub initial_window: u64,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 256,
            max_retries: 3,
            initial_window: 1 << 20,
        }
    }
}

struct ManagerState {
    flows: HashMap<u32, Flow>,
    pending: HashMap<u64, PendingDatagram>,
    in_flight: usize,
    window: u64,
    next_id: u64,
    rng: StdRng,
}

/// Sends and receives HTTP/3 datagrams on one connection, enforcing the
/// credit window and driving retransmits for tracked QoS classes.
pub struct DatagramManager<C: QuicConnection> {
    quic: C,
    config: DatagramConfig,
    state: Mutex<ManagerState>,
}

impl<C: QuicConnection> DatagramManager<C> {
    pub fn new(quic: C, config: DatagramConfig) -> Self {
        let window = config.initial_window;
        Self {
            quic,
            config,
            state: Mutex::new(ManagerState {
                flows: HashMap::new(),
                pending: HashMap::new(),
                in_flight: 0,
                window,
                next_id: 1,
                rng: StdRng::from_entropy(),
            }),
        }
    }

    /// Deterministic RNG for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.state.get_mut().unwrap().rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Register a flow, picking a random unused non-zero id.
    pub fn create_flow(&self, priority: u8) -> u32 {
        let mut state = self.state.lock().unwrap();
        loop {
            let id = state.rng.gen_range(1..MAX_FLOW_ID);
            if !state.flows.contains_key(&id) {
                state.flows.insert(
                    id,
                    Flow {
                        priority,
                        stats: FlowStats::default(),
                    },
                );
                return id;
            }
        }
    }

    pub fn close_flow(&self, flow_id: u32) -> Result<FlowStats, DatagramError> {
        let mut state = self.state.lock().unwrap();
        state
            .flows
            .remove(&flow_id)
            .map(|f| f.stats)
            .ok_or(DatagramError::UnknownFlow(flow_id))
    }

    pub fn flow_stats(&self, flow_id: u32) -> Result<FlowStats, DatagramError> {
        let state = self.state.lock().unwrap();
        state
            .flows
            .get(&flow_id)
            .map(|f| f.stats)
            .ok_or(DatagramError::UnknownFlow(flow_id))
    }

    pub fn flow_priority(&self, flow_id: u32) -> Result<u8, DatagramError> {
        let state = self.state.lock().unwrap();
        state
            .flows
            .get(&flow_id)
            .map(|f| f.priority)
            .ok_or(DatagramError::UnknownFlow(flow_id))
    }

    /// Send a datagram on a flow. Refused, without any state change, when the
    /// in-flight limit or the credit window would be violated.
    pub fn send(
        &self,
        flow_id: u32,
        qos: Qos,
        context_id: u32,
        payload: &[u8],
    ) -> Result<u64, DatagramError> {
        let total_size = (1 + HEADER_SIZE + payload.len()) as u64;
        if 1 + HEADER_SIZE + payload.len() > self.quic.max_datagram_size() {
            return Err(DatagramError::TooLarge);
        }

        let mut state = self.state.lock().unwrap();
        if !state.flows.contains_key(&flow_id) {
            return Err(DatagramError::UnknownFlow(flow_id));
        }
        if state.in_flight >= self.config.max_in_flight {
            return Err(DatagramError::InFlightLimit);
        }
        if state.window < total_size {
            return Err(DatagramError::WindowExhausted {
                needed: total_size,
                window: state.window,
            });
        }

        let id = state.next_id;
        state.next_id += 1;

        let header = DatagramHeader {
            id,
            qos,
            flow_id,
            context_id,
        };
        let mut buf = BytesMut::with_capacity(1 + HEADER_SIZE + payload.len());
        header.encode(&mut buf);
        buf.put_slice(payload);
        let wire = buf.freeze();

        self.quic.send_datagram(wire.clone())?;

        state.in_flight += 1;
        state.window -= total_size;
        if let Some(flow) = state.flows.get_mut(&flow_id) {
            flow.stats.sent += 1;
            flow.stats.bytes_sent += total_size;
        }

        if qos.is_tracked() {
            state.pending.insert(
                id,
                PendingDatagram {
                    flow_id,
                    payload: wire,
                    size: total_size,
                    retries: 0,
                },
            );
        } else {
            // Fire and forget: the slot frees immediately, credit returns.
            state.in_flight -= 1;
            state.window += total_size;
        }

        Ok(id)
    }

    /// The QUIC layer confirmed delivery.
    pub fn on_ack(&self, id: u64) -> Result<(), DatagramError> {
        let mut state = self.state.lock().unwrap();
        let pending = state
            .pending
            .remove(&id)
            .ok_or(DatagramError::UnknownDatagram(id))?;

        state.in_flight -= 1;
        state.window += pending.size;
        if let Some(flow) = state.flows.get_mut(&pending.flow_id) {
            flow.stats.acked += 1;
        }
        Ok(())
    }

    /// The QUIC layer reported loss: retransmit up to the configured limit,
    /// then declare the datagram lost.
    pub fn on_loss(&self, id: u64) -> Result<(), DatagramError> {
        let mut state = self.state.lock().unwrap();
        let pending = state
            .pending
            .get_mut(&id)
            .ok_or(DatagramError::UnknownDatagram(id))?;

        if pending.retries < self.config.max_retries {
            pending.retries += 1;
            let wire = pending.payload.clone();
            let flow_id = pending.flow_id;
            self.quic.send_datagram(wire)?;
            if let Some(flow) = state.flows.get_mut(&flow_id) {
                flow.stats.retransmitted += 1;
            }
            return Ok(());
        }

        let pending = state
            .pending
            .remove(&id)
            .ok_or(DatagramError::UnknownDatagram(id))?;
        state.in_flight -= 1;
        state.window += pending.size;
        if let Some(flow) = state.flows.get_mut(&pending.flow_id) {
            flow.stats.lost += 1;
        }
        Ok(())
    }

    /// Grant additional send credit.
    pub fn add_credit(&self, bytes: u64) {
        let mut state = self.state.lock().unwrap();
        state.window += bytes;
    }

    pub fn window(&self) -> u64 {
        self.state.lock().unwrap().window
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    /// Receive the next datagram, decoding its header and updating stats.
    pub async fn recv(&self) -> Result<(DatagramHeader, Bytes), DatagramError> {
        let mut wire = self.quic.recv_datagram().await?;
        let header = DatagramHeader::decode(&mut wire)?;

        let mut state = self.state.lock().unwrap();
        if let Some(flow) = state.flows.get_mut(&header.flow_id) {
            flow.stats.received += 1;
            flow.stats.bytes_received += wire.len() as u64;
        }
        Ok((header, wire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::{HandshakeInfo, QuicRecvStream, QuicSendStream};

    #[derive(Clone, Default)]
    struct FakeQuic {
        sent: Arc<Mutex<Vec<Bytes>>>,
        inbound: Arc<Mutex<VecDeque<Bytes>>>,
        max_size: usize,
    }

    impl FakeQuic {
        fn new(max_size: usize) -> Self {
            Self {
                sent: Arc::default(),
                inbound: Arc::default(),
                max_size,
            }
        }
    }

    struct NoStream;

    impl QuicSendStream for NoStream {
        fn id(&self) -> u64 {
            0
        }
        async fn write(&mut self, _data: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
        fn finish(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn reset(&mut self, _code: u64) {}
    }

    impl QuicRecvStream for NoStream {
        fn id(&self) -> u64 {
            0
        }
        async fn read(&mut self) -> Result<Option<Bytes>, TransportError> {
            Ok(None)
        }
        fn stop(&mut self, _code: u64) {}
    }

    struct NoHandshake;

    impl HandshakeInfo for NoHandshake {
        fn alpn(&self) -> String {
            "h3".to_string()
        }
        fn cipher_suite(&self) -> String {
            String::new()
        }
        fn tls_version(&self) -> String {
            String::new()
        }
        fn server_cert_hash(&self) -> Vec<u8> {
            Vec::new()
        }
        fn session_ticket(&self) -> Option<Bytes> {
            None
        }
        fn transport_parameters(&self) -> std::collections::HashMap<String, u64> {
            Default::default()
        }
    }

    impl QuicConnection for FakeQuic {
        type SendStream = NoStream;
        type RecvStream = NoStream;
        type Handshake = NoHandshake;

        async fn open_bi(&self) -> Result<(NoStream, NoStream), TransportError> {
            Ok((NoStream, NoStream))
        }
        async fn open_uni(&self) -> Result<NoStream, TransportError> {
            Ok(NoStream)
        }
        async fn accept_uni(&self) -> Result<NoStream, TransportError> {
            std::future::pending().await
        }
        fn send_datagram(&self, payload: Bytes) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
        async fn recv_datagram(&self) -> Result<Bytes, TransportError> {
            match self.inbound.lock().unwrap().pop_front() {
                Some(d) => Ok(d),
                None => Err(TransportError::ConnectionLost("drained".to_string())),
            }
        }
        fn max_datagram_size(&self) -> usize {
            self.max_size
        }
        async fn completed_handshake(&self) -> Result<NoHandshake, TransportError> {
            Ok(NoHandshake)
        }
        async fn early_data_accepted(&self) -> bool {
            false
        }
        fn rtt(&self) -> Duration {
            Duration::from_millis(30)
        }
        fn close(&self, _code: u64, _reason: &[u8]) {}
        async fn closed(&self) -> TransportError {
            std::future::pending().await
        }
    }

    fn manager(max_size: usize, config: DatagramConfig) -> DatagramManager<FakeQuic> {
        DatagramManager::new(FakeQuic::new(max_size), config).with_seed(7)
    }

    #[test]
    fn header_roundtrip() {
        let header = DatagramHeader {
            id: 0x0102030405060708,
            qos: Qos::Critical,
            flow_id: 0xabcdef,
            context_id: 0xdeadbeef,
        };

        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), 1 + HEADER_SIZE);
        assert_eq!(buf[0], DATAGRAM_TYPE);

        let decoded = DatagramHeader::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn flow_ids_are_nonzero_and_unique() {
        let mgr = manager(1500, DatagramConfig::default());
        let a = mgr.create_flow(1);
        let b = mgr.create_flow(2);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        assert!(a < MAX_FLOW_ID && b < MAX_FLOW_ID);
    }

    #[test]
    fn best_effort_send_frees_slot_immediately() {
        let mgr = manager(1500, DatagramConfig::default());
        let flow = mgr.create_flow(0);

        mgr.send(flow, Qos::BestEffort, 0, b"hello").unwrap();
        assert_eq!(mgr.in_flight(), 0);
        assert_eq!(mgr.window(), DatagramConfig::default().initial_window);
        assert_eq!(mgr.flow_stats(flow).unwrap().sent, 1);
    }

    #[test]
    fn window_violation_refuses_without_state_change() {
        let config = DatagramConfig {
            initial_window: 10,
            ..Default::default()
        };
        let mgr = manager(1500, config);
        let flow = mgr.create_flow(0);

        let err = mgr.send(flow, Qos::Reliable, 0, b"hello world").unwrap_err();
        assert!(matches!(err, DatagramError::WindowExhausted { .. }));
        assert_eq!(mgr.in_flight(), 0);
        assert_eq!(mgr.window(), 10);
        assert_eq!(mgr.flow_stats(flow).unwrap().sent, 0);
    }

    #[test]
    fn in_flight_limit_refuses() {
        let config = DatagramConfig {
            max_in_flight: 1,
            ..Default::default()
        };
        let mgr = manager(1500, config);
        let flow = mgr.create_flow(0);

        mgr.send(flow, Qos::Reliable, 0, b"a").unwrap();
        assert_eq!(
            mgr.send(flow, Qos::Reliable, 0, b"b").unwrap_err(),
            DatagramError::InFlightLimit
        );
    }

    #[test]
    fn ack_releases_credit() {
        let mgr = manager(1500, DatagramConfig::default());
        let flow = mgr.create_flow(0);
        let before = mgr.window();

        let id = mgr.send(flow, Qos::Reliable, 0, b"payload").unwrap();
        assert!(mgr.window() < before);
        assert_eq!(mgr.in_flight(), 1);

        mgr.on_ack(id).unwrap();
        assert_eq!(mgr.window(), before);
        assert_eq!(mgr.in_flight(), 0);
        assert_eq!(mgr.flow_stats(flow).unwrap().acked, 1);
    }

    #[test]
    fn loss_retransmits_then_gives_up() {
        let config = DatagramConfig {
            max_retries: 2,
            ..Default::default()
        };
        let mgr = manager(1500, config);
        let flow = mgr.create_flow(0);

        let id = mgr.send(flow, Qos::Critical, 0, b"important").unwrap();
        let sent = mgr.quic.sent.clone();
        assert_eq!(sent.lock().unwrap().len(), 1);

        mgr.on_loss(id).unwrap();
        mgr.on_loss(id).unwrap();
        assert_eq!(sent.lock().unwrap().len(), 3);
        assert_eq!(mgr.flow_stats(flow).unwrap().retransmitted, 2);

        // Third loss exhausts the retry budget.
        mgr.on_loss(id).unwrap();
        assert_eq!(sent.lock().unwrap().len(), 3);
        assert_eq!(mgr.flow_stats(flow).unwrap().lost, 1);
        assert_eq!(mgr.in_flight(), 0);
        assert!(mgr.on_ack(id).is_err());
    }

    #[test]
    fn oversized_datagram_is_refused() {
        let mgr = manager(32, DatagramConfig::default());
        let flow = mgr.create_flow(0);
        assert_eq!(
            mgr.send(flow, Qos::BestEffort, 0, &[0u8; 64]).unwrap_err(),
            DatagramError::TooLarge
        );
    }

    #[tokio::test]
    async fn recv_decodes_and_counts() {
        let mgr = manager(1500, DatagramConfig::default());
        let flow = mgr.create_flow(0);

        let header = DatagramHeader {
            id: 9,
            qos: Qos::BestEffort,
            flow_id: flow,
            context_id: 1,
        };
        let mut wire = BytesMut::new();
        header.encode(&mut wire);
        wire.put_slice(b"pong");
        mgr.quic.inbound.lock().unwrap().push_back(wire.freeze());

        let (decoded, payload) = mgr.recv().await.unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload.as_ref(), b"pong");
        assert_eq!(mgr.flow_stats(flow).unwrap().received, 1);
    }
}
