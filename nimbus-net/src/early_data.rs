//! Session resumption and 0-RTT early data.
//!
//! The manager persists session tickets per origin, decides which requests
//! are replay-safe enough to ride the 0-RTT flight, and pre-encodes header
//! blocks against the QPACK static table so they can be written the moment
//! the early keys are installed.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aead::{Aead, KeyInit};
use bytes::{Buf, BufMut, Bytes};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use thiserror::Error;

use nimbus_proto::qpack::Encoder;

use crate::{BlobStore, Clock, HandshakeInfo, Resumption};

/// Tickets kept per origin before the oldest is evicted.
pub const DEFAULT_MAX_TICKETS_PER_ORIGIN: usize = 3;

/// Rejections after which a ticket is never selected again.
const MAX_REJECTIONS: u32 = 3;

/// The replay window is the hourly bucket carried in Early-Data-Timestamp.
const REPLAY_WINDOW_SECS: u64 = 3600;

const STORE_KEY: &str = "early-data/tickets";
const STORE_VERSION: u8 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EarlyDataError {
    #[error("method {0} not allowed in early data")]
    MethodNotAllowed(String),

    #[error("credential header {0} present")]
    CredentialHeader(String),

    #[error("request already marked as early data")]
    AlreadyMarked,

    #[error("nonce replayed within the current window")]
    ReplayedNonce,

    #[error("no usable ticket for origin")]
    NoTicket,

    #[error("ticket store corrupted")]
    CorruptStore,

    #[error("failed to persist ticket store: {0}")]
    Persist(String),
}

/// Everything remembered about one resumable session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTicket {
    /// host:port of the issuing origin.
    pub origin: String,
    pub ticket: Bytes,
    pub transport_parameters: HashMap<String, u64>,

    pub issued_at: u64,
    pub expires_at: u64,
    pub last_used_at: u64,

    pub cipher_suite: String,
    pub tls_version: String,
    pub alpn: String,
    pub server_cert_hash: Vec<u8>,

    pub usage_count: u32,
    /// Selection weight in [0, 1].
    pub priority: f64,
    /// Acceptance EWMA in [0, 1].
    pub success_rate: f64,
    pub rejection_count: u32,
    pub accepted: bool,
    pub average_rtt_ms: f64,

    /// Nonces issued under this ticket, with their window expiry.
    pub nonces: Vec<(String, u64)>,
    pub nonce_counter: u64,

    pub allowed_methods: Vec<String>,
    pub context_binding: Vec<u8>,
}

impl SessionTicket {
    pub fn new(origin: &str, ticket: Bytes, issued_at: u64, expires_at: u64) -> Self {
        Self {
            origin: origin.to_string(),
            ticket,
            transport_parameters: HashMap::new(),
            issued_at,
            expires_at,
            last_used_at: issued_at,
            cipher_suite: String::new(),
            tls_version: String::new(),
            alpn: String::new(),
            server_cert_hash: Vec::new(),
            usage_count: 0,
            priority: 0.5,
            success_rate: 1.0,
            rejection_count: 0,
            accepted: false,
            average_rtt_ms: 0.0,
            nonces: Vec::new(),
            nonce_counter: 0,
            allowed_methods: vec!["GET".to_string(), "HEAD".to_string()],
            context_binding: Vec::new(),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    fn score(&self) -> f64 {
        self.priority * self.success_rate
    }

    fn is_selectable(&self, now: u64) -> bool {
        !self.is_expired(now) && self.rejection_count < MAX_REJECTIONS
    }

    fn allows_method(&self, method: &http::Method) -> bool {
        self.allowed_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_str(buf, &self.origin);
        put_bytes(buf, &self.ticket);

        buf.put_u16(self.transport_parameters.len() as u16);
        for (key, value) in &self.transport_parameters {
            put_str(buf, key);
            buf.put_u64(*value);
        }

        buf.put_u64(self.issued_at);
        buf.put_u64(self.expires_at);
        buf.put_u64(self.last_used_at);

        put_str(buf, &self.cipher_suite);
        put_str(buf, &self.tls_version);
        put_str(buf, &self.alpn);
        put_bytes(buf, &self.server_cert_hash);

        buf.put_u32(self.usage_count);
        buf.put_f64(self.priority);
        buf.put_f64(self.success_rate);
        buf.put_u32(self.rejection_count);
        buf.put_u8(self.accepted as u8);
        buf.put_f64(self.average_rtt_ms);

        buf.put_u16(self.nonces.len() as u16);
        for (nonce, expiry) in &self.nonces {
            put_str(buf, nonce);
            buf.put_u64(*expiry);
        }
        buf.put_u64(self.nonce_counter);

        buf.put_u8(self.allowed_methods.len() as u8);
        for method in &self.allowed_methods {
            put_str(buf, method);
        }

        put_bytes(buf, &self.context_binding);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, EarlyDataError> {
        let origin = get_str(buf)?;
        let ticket = Bytes::from(get_bytes(buf)?);

        let mut transport_parameters = HashMap::new();
        let params = get_u16(buf)?;
        for _ in 0..params {
            let key = get_str(buf)?;
            let value = get_u64(buf)?;
            transport_parameters.insert(key, value);
        }

        let issued_at = get_u64(buf)?;
        let expires_at = get_u64(buf)?;
        let last_used_at = get_u64(buf)?;

        let cipher_suite = get_str(buf)?;
        let tls_version = get_str(buf)?;
        let alpn = get_str(buf)?;
        let server_cert_hash = get_bytes(buf)?;

        let usage_count = get_u32(buf)?;
        let priority = get_f64(buf)?;
        let success_rate = get_f64(buf)?;
        let rejection_count = get_u32(buf)?;
        let accepted = get_u8(buf)? != 0;
        let average_rtt_ms = get_f64(buf)?;

        let mut nonces = Vec::new();
        let count = get_u16(buf)?;
        for _ in 0..count {
            let nonce = get_str(buf)?;
            let expiry = get_u64(buf)?;
            nonces.push((nonce, expiry));
        }
        let nonce_counter = get_u64(buf)?;

        let mut allowed_methods = Vec::new();
        let count = get_u8(buf)?;
        for _ in 0..count {
            allowed_methods.push(get_str(buf)?);
        }

        let context_binding = get_bytes(buf)?;

        Ok(Self {
            origin,
            ticket,
            transport_parameters,
            issued_at,
            expires_at,
            last_used_at,
            cipher_suite,
            tls_version,
            alpn,
            server_cert_hash,
            usage_count,
            priority,
            success_rate,
            rejection_count,
            accepted,
            average_rtt_ms,
            nonces,
            nonce_counter,
            allowed_methods,
            context_binding,
        })
    }

    /// Temporal and numeric sanity, applied on load.
    fn is_sane(&self, now: u64) -> bool {
        self.issued_at <= now
            && self.expires_at > now
            && (0.0..=1.0).contains(&self.priority)
            && (0.0..=1.0).contains(&self.success_rate)
            && self.average_rtt_ms.is_finite()
    }
}

/// A request pre-encoded against the static table, ready to write as soon as
/// the 0-RTT keys exist.
#[derive(Debug, Clone)]
pub struct PrecomputedRequest {
    pub method: http::Method,
    pub path: String,
    pub block: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct EarlyDataConfig {
    pub max_tickets_per_origin: usize,
    pub rotation_interval: Duration,
}

impl Default for EarlyDataConfig {
    fn default() -> Self {
        Self {
            max_tickets_per_origin: DEFAULT_MAX_TICKETS_PER_ORIGIN,
            rotation_interval: Duration::from_secs(3600),
        }
    }
}

struct State {
    tickets: HashMap<String, Vec<SessionTicket>>,
    locked_out: HashSet<String>,
    rng: StdRng,
}

/// Owns the ticket store and every replay-safety decision.
pub struct EarlyDataManager {
    state: Mutex<State>,
    blob: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    key: [u8; 32],
    config: EarlyDataConfig,
}

impl EarlyDataManager {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        key: [u8; 32],
        clock: Arc<dyn Clock>,
        config: EarlyDataConfig,
    ) -> Self {
        let manager = Self {
            state: Mutex::new(State {
                tickets: HashMap::new(),
                locked_out: HashSet::new(),
                rng: StdRng::from_entropy(),
            }),
            blob,
            clock,
            key,
            config,
        };
        manager.load();
        manager
    }

    /// Deterministic RNG for tests.
    pub fn new_seeded(
        blob: Arc<dyn BlobStore>,
        key: [u8; 32],
        clock: Arc<dyn Clock>,
        config: EarlyDataConfig,
        seed: u64,
    ) -> Self {
        let manager = Self::new(blob, key, clock, config);
        manager.state.lock().unwrap().rng = StdRng::seed_from_u64(seed);
        manager
    }

    /// Remember a ticket issued during a completed handshake.
    pub fn on_session_ticket(
        &self,
        origin: &str,
        handshake: &impl HandshakeInfo,
        lifetime: Duration,
    ) {
        let Some(ticket) = handshake.session_ticket() else {
            return;
        };

        let now = self.clock.now_unix();
        let mut entry = SessionTicket::new(origin, ticket, now, now + lifetime.as_secs());
        entry.cipher_suite = handshake.cipher_suite();
        entry.tls_version = handshake.tls_version();
        entry.alpn = handshake.alpn();
        entry.server_cert_hash = handshake.server_cert_hash();
        entry.transport_parameters = handshake.transport_parameters();

        self.insert_ticket(entry);
    }

    pub fn insert_ticket(&self, ticket: SessionTicket) {
        {
            let mut state = self.state.lock().unwrap();
            let slot = state.tickets.entry(ticket.origin.clone()).or_default();
            slot.push(ticket);

            // Per-origin cap: the oldest ticket goes first.
            while slot.len() > self.config.max_tickets_per_origin {
                let oldest = slot
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, t)| t.issued_at)
                    .map(|(i, _)| i);
                match oldest {
                    Some(index) => {
                        slot.remove(index);
                    }
                    None => break,
                }
            }
        }

        self.persist();
    }

    /// Refuse to resume to an origin until further notice.
    pub fn lock_out(&self, origin: &str) {
        self.state.lock().unwrap().locked_out.insert(origin.to_string());
    }

    pub fn clear_lock_out(&self, origin: &str) {
        self.state.lock().unwrap().locked_out.remove(origin);
    }

    /// Pick the best usable ticket for an origin and mark it used.
    ///
    /// Expired tickets, tickets rejected three times, and locked-out origins
    /// never resume. Among the rest the highest priority x success-rate wins.
    pub fn select_resumption(&self, origin: &str) -> Option<Resumption> {
        let now = self.clock.now_unix();
        let mut state = self.state.lock().unwrap();

        if state.locked_out.contains(origin) {
            return None;
        }

        let tickets = state.tickets.get_mut(origin)?;
        let best = tickets
            .iter_mut()
            .filter(|t| t.is_selectable(now))
            .max_by(|a, b| {
                a.score()
                    .partial_cmp(&b.score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;

        best.last_used_at = now;
        best.usage_count += 1;

        Some(Resumption {
            ticket: best.ticket.clone(),
            alpn: best.alpn.clone(),
            transport_parameters: best.transport_parameters.clone(),
        })
    }

    /// Vet a request for the 0-RTT flight and mint its replay-protection
    /// headers.
    pub fn prepare_request(
        &self,
        origin: &str,
        method: &http::Method,
        headers: &[(String, String)],
    ) -> Result<Vec<(String, String)>, EarlyDataError> {
        for (name, _) in headers {
            if name.eq_ignore_ascii_case("authorization")
                || name.eq_ignore_ascii_case("cookie")
                || name.eq_ignore_ascii_case("set-cookie")
            {
                return Err(EarlyDataError::CredentialHeader(name.to_ascii_lowercase()));
            }
            if name.eq_ignore_ascii_case("early-data") {
                return Err(EarlyDataError::AlreadyMarked);
            }
        }

        let now = self.clock.now_unix();
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        let ticket = state
            .tickets
            .get_mut(origin)
            .and_then(|tickets| {
                tickets
                    .iter_mut()
                    .filter(|t| t.is_selectable(now))
                    .max_by_key(|t| t.last_used_at)
            })
            .ok_or(EarlyDataError::NoTicket)?;

        let method_ok = if *method == http::Method::GET || *method == http::Method::HEAD {
            true
        } else if *method == http::Method::POST {
            // POST only rides 0-RTT for form submissions the ticket grants.
            let form = headers.iter().any(|(n, v)| {
                n.eq_ignore_ascii_case("content-type")
                    && v.starts_with("application/x-www-form-urlencoded")
            });
            form && ticket.allows_method(method)
        } else {
            ticket.allows_method(method)
        };
        if !method_ok {
            return Err(EarlyDataError::MethodNotAllowed(method.to_string()));
        }

        // Hourly replay bucket; the nonce must be fresh within it.
        let window_start = now - now % REPLAY_WINDOW_SECS;
        let window_end = window_start + REPLAY_WINDOW_SECS;

        ticket.nonces.retain(|(_, expiry)| *expiry > now);

        let mut raw = [0u8; 16];
        state.rng.fill_bytes(&mut raw);
        let nonce = hex(&raw);

        if ticket.nonces.iter().any(|(n, _)| *n == nonce) {
            return Err(EarlyDataError::ReplayedNonce);
        }
        ticket.nonces.push((nonce.clone(), window_end));
        ticket.nonce_counter += 1;

        Ok(vec![
            ("early-data".to_string(), "1".to_string()),
            ("early-data-nonce".to_string(), nonce),
            ("early-data-timestamp".to_string(), window_start.to_string()),
        ])
    }

    /// Check a nonce against the replay window, recording it. Duplicates
    /// within the window are refused.
    pub fn check_replay(&self, origin: &str, nonce: &str) -> Result<(), EarlyDataError> {
        let now = self.clock.now_unix();
        let window_end = now - now % REPLAY_WINDOW_SECS + REPLAY_WINDOW_SECS;

        let mut state = self.state.lock().unwrap();
        let ticket = state
            .tickets
            .get_mut(origin)
            .and_then(|tickets| tickets.iter_mut().max_by_key(|t| t.last_used_at))
            .ok_or(EarlyDataError::NoTicket)?;

        ticket.nonces.retain(|(_, expiry)| *expiry > now);
        if ticket.nonces.iter().any(|(n, _)| n == nonce) {
            return Err(EarlyDataError::ReplayedNonce);
        }

        ticket.nonces.push((nonce.to_string(), window_end));
        Ok(())
    }

    /// Remove replay-protection headers before a 1-RTT re-drive.
    pub fn strip_replay_headers(fields: &mut Vec<(String, String)>) {
        fields.retain(|(name, _)| {
            !name.eq_ignore_ascii_case("early-data")
                && !name.eq_ignore_ascii_case("early-data-nonce")
                && !name.eq_ignore_ascii_case("early-data-timestamp")
        });
    }

    /// The server took our early data.
    pub fn on_accepted(&self, origin: &str, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1000.0;
        {
            let mut state = self.state.lock().unwrap();
            if let Some(ticket) = state
                .tickets
                .get_mut(origin)
                .and_then(|tickets| tickets.iter_mut().max_by_key(|t| t.last_used_at))
            {
                ticket.accepted = true;
                ticket.success_rate = 0.8 * ticket.success_rate + 0.2;
                ticket.average_rtt_ms = if ticket.average_rtt_ms == 0.0 {
                    sample
                } else {
                    0.7 * ticket.average_rtt_ms + 0.3 * sample
                };
            }
        }
        self.persist();
    }

    /// The server rejected our early data.
    pub fn on_rejected(&self, origin: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(ticket) = state
                .tickets
                .get_mut(origin)
                .and_then(|tickets| tickets.iter_mut().max_by_key(|t| t.last_used_at))
            {
                ticket.rejection_count += 1;
                ticket.success_rate *= 0.8;
            }
        }
        self.persist();
    }

    /// Pre-encode header blocks for the most likely resources on an origin.
    /// Only the static table is referenced: the dynamic table state is
    /// unknown until the handshake completes.
    pub fn precompute_requests(
        &self,
        authority: &str,
        resources: &[(http::Method, String)],
        top_k: usize,
    ) -> Vec<PrecomputedRequest> {
        resources
            .iter()
            .take(top_k)
            .map(|(method, path)| {
                let fields = vec![
                    (":method".to_string(), method.as_str().to_string()),
                    (":scheme".to_string(), "https".to_string()),
                    (":authority".to_string(), authority.to_string()),
                    (":path".to_string(), path.clone()),
                    ("early-data".to_string(), "1".to_string()),
                ];
                PrecomputedRequest {
                    method: method.clone(),
                    path: path.clone(),
                    block: Encoder::encode_static_only(&fields),
                }
            })
            .collect()
    }

    pub fn ticket_count(&self, origin: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .tickets
            .get(origin)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub fn ticket(&self, origin: &str) -> Option<SessionTicket> {
        self.state
            .lock()
            .unwrap()
            .tickets
            .get(origin)
            .and_then(|tickets| tickets.iter().max_by_key(|t| t.last_used_at))
            .cloned()
    }

    /// Drop expired tickets and stale nonces, then re-persist.
    pub fn prune_expired(&self) {
        let now = self.clock.now_unix();
        {
            let mut state = self.state.lock().unwrap();
            for tickets in state.tickets.values_mut() {
                tickets.retain(|t| !t.is_expired(now));
                for ticket in tickets.iter_mut() {
                    ticket.nonces.retain(|(_, expiry)| *expiry > now);
                }
            }
            state.tickets.retain(|_, tickets| !tickets.is_empty());
        }
        self.persist();
    }

    /// Periodic rotation: prune and re-persist on the configured interval.
    pub fn spawn_rotation(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let period = manager.config.rotation_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.prune_expired();
            }
        })
    }

    fn load(&self) {
        let blob = match self.blob.load(STORE_KEY) {
            Ok(Some(blob)) => blob,
            Ok(None) => return,
            Err(err) => {
                log::warn!("failed to load ticket store: {err}");
                return;
            }
        };

        let Some(plaintext) = self.decrypt(&blob) else {
            log::warn!("discarding ticket store that failed integrity checks");
            let _ = self.blob.remove(STORE_KEY);
            return;
        };

        match Self::parse_store(&plaintext, self.clock.now_unix()) {
            Ok(tickets) => {
                self.state.lock().unwrap().tickets = tickets;
            }
            Err(err) => {
                log::warn!("discarding malformed ticket store: {err}");
                let _ = self.blob.remove(STORE_KEY);
            }
        }
    }

    fn parse_store(
        plaintext: &[u8],
        now: u64,
    ) -> Result<HashMap<String, Vec<SessionTicket>>, EarlyDataError> {
        let mut buf = plaintext;
        if get_u8(&mut buf)? != STORE_VERSION {
            return Err(EarlyDataError::CorruptStore);
        }

        let count = get_u32(&mut buf)?;
        let mut tickets: HashMap<String, Vec<SessionTicket>> = HashMap::new();
        for _ in 0..count {
            let ticket = SessionTicket::decode(&mut buf)?;
            // Tickets from the future or past are dropped on the floor.
            if ticket.is_sane(now) {
                tickets.entry(ticket.origin.clone()).or_default().push(ticket);
            }
        }

        Ok(tickets)
    }

    fn persist(&self) {
        let mut plaintext = Vec::new();
        {
            let state = self.state.lock().unwrap();
            plaintext.put_u8(STORE_VERSION);
            let count: usize = state.tickets.values().map(|t| t.len()).sum();
            plaintext.put_u32(count as u32);
            for tickets in state.tickets.values() {
                for ticket in tickets {
                    ticket.encode(&mut plaintext);
                }
            }
        }

        let blob = self.encrypt(&plaintext);
        if let Err(err) = self.blob.store(STORE_KEY, &blob) {
            log::warn!("failed to persist ticket store: {err}");
        }
    }

    // Store layout: 12-byte nonce || ciphertext || 16-byte tag.
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));

        let mut nonce = [0u8; 12];
        self.state.lock().unwrap().rng.fill_bytes(&mut nonce);

        let mut out = nonce.to_vec();
        match cipher.encrypt(Nonce::from_slice(&nonce), plaintext) {
            Ok(ciphertext) => out.extend_from_slice(&ciphertext),
            Err(_) => out.clear(),
        }
        out
    }

    fn decrypt(&self, blob: &[u8]) -> Option<Vec<u8>> {
        if blob.len() < 12 + 16 {
            return None;
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(&blob[..12]), &blob[12..])
            .ok()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn get_u8<B: Buf>(buf: &mut B) -> Result<u8, EarlyDataError> {
    if buf.remaining() < 1 {
        return Err(EarlyDataError::CorruptStore);
    }
    Ok(buf.get_u8())
}

fn get_u16<B: Buf>(buf: &mut B) -> Result<u16, EarlyDataError> {
    if buf.remaining() < 2 {
        return Err(EarlyDataError::CorruptStore);
    }
    Ok(buf.get_u16())
}

fn get_u32<B: Buf>(buf: &mut B) -> Result<u32, EarlyDataError> {
    if buf.remaining() < 4 {
        return Err(EarlyDataError::CorruptStore);
    }
    Ok(buf.get_u32())
}

fn get_u64<B: Buf>(buf: &mut B) -> Result<u64, EarlyDataError> {
    if buf.remaining() < 8 {
        return Err(EarlyDataError::CorruptStore);
    }
    Ok(buf.get_u64())
}

fn get_f64<B: Buf>(buf: &mut B) -> Result<f64, EarlyDataError> {
    if buf.remaining() < 8 {
        return Err(EarlyDataError::CorruptStore);
    }
    Ok(buf.get_f64())
}

fn get_str<B: Buf>(buf: &mut B) -> Result<String, EarlyDataError> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(EarlyDataError::CorruptStore);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| EarlyDataError::CorruptStore)
}

fn get_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>, EarlyDataError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(EarlyDataError::CorruptStore);
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}
