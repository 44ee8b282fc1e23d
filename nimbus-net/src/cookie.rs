//! The process-wide cookie jar: scope and security policy on the way in,
//! RFC 6265 matching and ordering on the way out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aead::{Aead, KeyInit};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use url::Url;

use thiserror::Error;

use crate::Clock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CookieError {
    #[error("cookie already expired")]
    Expired,

    #[error("malformed set-cookie header")]
    Malformed,

    #[error("cookie value could not be decrypted")]
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// How aggressively the jar hardens cookies before storing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityPolicy {
    /// Store what the server sent.
    Minimal,
    /// Upgrade Secure on HTTPS origins and default SameSite to Lax.
    PreferSecure,
    /// Also force HttpOnly and SameSite Strict.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Unix seconds; None means session cookie.
    pub expires: Option<u64>,
    pub created_at: u64,
    pub last_access: u64,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
}

impl Cookie {
    pub fn new(name: &str, value: &str, domain: &str, path: &str, now: u64) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: path.to_string(),
            expires: None,
            created_at: now,
            last_access: now,
            secure: false,
            http_only: false,
            same_site: SameSite::Lax,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires, Some(expiry) if now >= expiry)
    }

    /// Cookie identity is (name, domain, path).
    fn same_identity(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }

    fn domain_matches(&self, host: &str) -> bool {
        if self.domain == host {
            return true;
        }
        if let Some(suffix) = self.domain.strip_prefix('.') {
            return host == suffix || host.ends_with(&self.domain);
        }
        false
    }

    fn path_matches(&self, request_path: &str) -> bool {
        if self.path == request_path {
            return true;
        }
        if let Some(rest) = request_path.strip_prefix(&self.path) {
            return self.path.ends_with('/') || rest.starts_with('/');
        }
        false
    }
}

#[derive(Debug, Clone)]
struct StoredCookie {
    cookie: Cookie,
    /// Value held as base64(nonce || ciphertext || tag).
    encrypted: bool,
}

#[derive(Debug, Clone)]
struct CsrfToken {
    token: String,
    issued_at: u64,
}

struct JarState {
    domains: HashMap<String, Vec<StoredCookie>>,
    csrf: HashMap<String, CsrfToken>,
    rng: StdRng,
}

/// Names that get encrypted at rest with the jar's master key.
const SENSITIVE_PATTERNS: [&str; 6] = ["session", "token", "auth", "csrf", "secret", "sid"];

fn is_sensitive(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

fn is_safe_method(method: &http::Method) -> bool {
    *method == http::Method::GET
        || *method == http::Method::HEAD
        || *method == http::Method::OPTIONS
        || *method == http::Method::TRACE
}

pub struct CookieJar {
    state: Mutex<JarState>,
    policy: SecurityPolicy,
    key: [u8; 32],
    per_domain_cap: usize,
    global_cap: usize,
    clock: Arc<dyn Clock>,
}

impl CookieJar {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let mut rng = StdRng::from_entropy();
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);

        Self {
            state: Mutex::new(JarState {
                domains: HashMap::new(),
                csrf: HashMap::new(),
                rng,
            }),
            policy: SecurityPolicy::PreferSecure,
            key,
            per_domain_cap: 50,
            global_cap: 3000,
            clock,
        }
    }

    pub fn with_policy(mut self, policy: SecurityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_master_key(mut self, key: [u8; 32]) -> Self {
        self.key = key;
        self
    }

    pub fn with_caps(mut self, per_domain: usize, global: usize) -> Self {
        self.per_domain_cap = per_domain;
        self.global_cap = global;
        self
    }

    /// Deterministic RNG for tests.
    pub fn with_seed(self, seed: u64) -> Self {
        self.state.lock().unwrap().rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.domains.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().domains.clear();
    }

    /// Store a cookie. Expired cookies are refused; the security policy may
    /// upgrade flags before storage; identical (name, domain, path) replaces.
    pub fn insert(&self, mut cookie: Cookie, https_origin: bool) -> Result<(), CookieError> {
        let now = self.clock.now_unix();
        if cookie.is_expired(now) {
            return Err(CookieError::Expired);
        }

        match self.policy {
            SecurityPolicy::Minimal => {}
            SecurityPolicy::PreferSecure => {
                if https_origin {
                    cookie.secure = true;
                }
            }
            SecurityPolicy::Strict => {
                if https_origin {
                    cookie.secure = true;
                }
                cookie.http_only = true;
                cookie.same_site = SameSite::Strict;
            }
        }

        // SameSite=None is only meaningful on Secure cookies.
        if cookie.same_site == SameSite::None && !cookie.secure {
            cookie.same_site = SameSite::Lax;
        }

        let encrypted = is_sensitive(&cookie.name);

        let mut state = self.state.lock().unwrap();
        if encrypted {
            cookie.value = Self::seal(&self.key, &mut state.rng, &cookie.value);
        }

        let total: usize = state.domains.values().map(|v| v.len()).sum();
        let slot = state.domains.entry(cookie.domain.clone()).or_default();

        if let Some(existing) = slot.iter_mut().find(|c| c.cookie.same_identity(&cookie)) {
            // Overwrite keeps the original creation time.
            cookie.created_at = existing.cookie.created_at;
            *existing = StoredCookie { cookie, encrypted };
            return Ok(());
        }

        // Per-domain then global caps, evicting the oldest.
        if slot.len() >= self.per_domain_cap {
            Self::evict_oldest(slot);
        }
        slot.push(StoredCookie { cookie, encrypted });

        if total + 1 > self.global_cap {
            let oldest_domain = state
                .domains
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .min_by_key(|(_, v)| {
                    v.iter().map(|c| c.cookie.created_at).min().unwrap_or(u64::MAX)
                })
                .map(|(d, _)| d.clone());
            if let Some(domain) = oldest_domain {
                if let Some(slot) = state.domains.get_mut(&domain) {
                    Self::evict_oldest(slot);
                }
            }
        }

        Ok(())
    }

    fn evict_oldest(slot: &mut Vec<StoredCookie>) {
        if let Some(index) = slot
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.cookie.created_at)
            .map(|(i, _)| i)
        {
            slot.remove(index);
        }
    }

    /// Cookies matching a request, in RFC 6265 order: longest path first,
    /// then earliest creation. Expired cookies are pruned as a side effect.
    pub fn get(
        &self,
        url: &Url,
        source: Option<&Url>,
        top_level_navigation: bool,
        method: &http::Method,
    ) -> Vec<Cookie> {
        let Some(host) = url.host_str() else {
            return Vec::new();
        };
        let https = url.scheme() == "https";
        let request_path = if url.path().is_empty() { "/" } else { url.path() };
        let now = self.clock.now_unix();

        let same_site_context = match source {
            Some(source) => source.host_str() == Some(host),
            // Address-bar navigations are first-party.
            None => true,
        };

        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let mut matches: Vec<Cookie> = Vec::new();

        for slot in state.domains.values_mut() {
            slot.retain(|c| !c.cookie.is_expired(now));

            for stored in slot.iter_mut() {
                let cookie = &mut stored.cookie;
                if !cookie.domain_matches(host) || !cookie.path_matches(request_path) {
                    continue;
                }
                if cookie.secure && !https {
                    continue;
                }

                let allowed = match cookie.same_site {
                    SameSite::Strict => same_site_context,
                    SameSite::Lax => {
                        same_site_context || (top_level_navigation && is_safe_method(method))
                    }
                    SameSite::None => cookie.secure,
                };
                if !allowed {
                    continue;
                }

                cookie.last_access = now;
                let mut result = cookie.clone();
                if stored.encrypted {
                    match Self::open(&self.key, &result.value) {
                        Some(value) => result.value = value,
                        None => continue,
                    }
                }
                matches.push(result);
            }
        }

        matches.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then(a.created_at.cmp(&b.created_at))
        });
        matches
    }

    /// The Cookie header value for a request, or None when nothing matches.
    pub fn cookie_header(
        &self,
        url: &Url,
        source: Option<&Url>,
        top_level_navigation: bool,
        method: &http::Method,
    ) -> Option<String> {
        let cookies = self.get(url, source, top_level_navigation, method);
        if cookies.is_empty() {
            return None;
        }

        Some(
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Parse a Set-Cookie header received from `url` and store the result.
    pub fn apply_set_cookie(&self, url: &Url, header: &str) -> Result<(), CookieError> {
        let cookie = self.parse_set_cookie(url, header)?;
        self.insert(cookie, url.scheme() == "https")
    }

    fn parse_set_cookie(&self, url: &Url, header: &str) -> Result<Cookie, CookieError> {
        let now = self.clock.now_unix();
        let mut parts = header.split(';').map(str::trim);

        let (name, value) = parts
            .next()
            .and_then(|pair| pair.split_once('='))
            .map(|(n, v)| (n.trim(), v.trim()))
            .filter(|(n, _)| !n.is_empty())
            .ok_or(CookieError::Malformed)?;

        let host = url.host_str().unwrap_or_default();
        let mut cookie = Cookie::new(name, value, host, &default_path(url), now);

        let mut max_age: Option<i64> = None;
        let mut expires: Option<u64> = None;

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim()),
                None => (attr.to_ascii_lowercase(), ""),
            };

            match key.as_str() {
                "domain" => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    if !domain.is_empty() {
                        cookie.domain = format!(".{domain}");
                    }
                }
                "path" => {
                    if val.starts_with('/') {
                        cookie.path = val.to_string();
                    }
                }
                "max-age" => max_age = val.parse().ok(),
                "expires" => expires = parse_http_date(val),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "samesite" => {
                    cookie.same_site = match val.to_ascii_lowercase().as_str() {
                        "strict" => SameSite::Strict,
                        "none" => SameSite::None,
                        _ => SameSite::Lax,
                    };
                }
                _ => {}
            }
        }

        // Max-Age wins over Expires.
        cookie.expires = match max_age {
            Some(age) if age <= 0 => Some(0),
            Some(age) => Some(now + age as u64),
            None => expires,
        };

        Ok(cookie)
    }

    // Sensitive values at rest: base64(nonce || ciphertext || tag).
    fn seal(key: &[u8; 32], rng: &mut StdRng, plaintext: &str) -> String {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let mut nonce = [0u8; 12];
        rng.fill_bytes(&mut nonce);

        let mut blob = nonce.to_vec();
        if let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes()) {
            blob.extend_from_slice(&ciphertext);
        }
        URL_SAFE_NO_PAD.encode(blob)
    }

    fn open(key: &[u8; 32], sealed: &str) -> Option<String> {
        let blob = URL_SAFE_NO_PAD.decode(sealed).ok()?;
        if blob.len() < 12 + 16 {
            return None;
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&blob[..12]), &blob[12..])
            .ok()?;
        String::from_utf8(plaintext).ok()
    }

    /// Issue a fresh CSRF token for an origin.
    pub fn issue_csrf_token(&self, origin: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let mut raw = [0u8; 32];
        state.rng.fill_bytes(&mut raw);
        let token = URL_SAFE_NO_PAD.encode(raw);

        state.csrf.insert(
            origin.to_string(),
            CsrfToken {
                token: token.clone(),
                issued_at: self.clock.now_unix(),
            },
        );
        token
    }

    /// Validate a CSRF token for an origin within `max_age`.
    pub fn validate_csrf_token(&self, origin: &str, token: &str, max_age: Duration) -> bool {
        let now = self.clock.now_unix();
        let state = self.state.lock().unwrap();
        match state.csrf.get(origin) {
            Some(entry) => {
                entry.token == token && now.saturating_sub(entry.issued_at) <= max_age.as_secs()
            }
            None => false,
        }
    }
}

/// The default cookie path: the request path up to its last slash.
fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}

/// Parse an HTTP date, e.g. "Sun, 06 Nov 1994 08:49:37 GMT".
fn parse_http_date(value: &str) -> Option<u64> {
    let value = value.trim();
    let rest = match value.split_once(", ") {
        Some((_, rest)) => rest,
        None => value,
    };

    // "06 Nov 1994 08:49:37 GMT" or "06-Nov-1994 08:49:37 GMT"
    let mut tokens = rest.split(&[' ', '-'][..]).filter(|t| !t.is_empty());
    let day: u32 = tokens.next()?.parse().ok()?;
    let month = month_number(tokens.next()?)?;
    let year_token = tokens.next()?;
    let mut year: i64 = year_token.parse().ok()?;
    if year_token.len() == 2 {
        year += if year < 70 { 2000 } else { 1900 };
    }

    let time = tokens.next()?;
    let mut hms = time.split(':');
    let hour: u64 = hms.next()?.parse().ok()?;
    let minute: u64 = hms.next()?.parse().ok()?;
    let second: u64 = hms.next()?.parse().ok()?;
    if hour > 23 || minute > 59 || second > 60 {
        return None;
    }

    let days = days_from_civil(year, month, day);
    if days < 0 {
        return None;
    }

    Some(days as u64 * 86400 + hour * 3600 + minute * 60 + second)
}

fn month_number(name: &str) -> Option<u32> {
    match name.to_ascii_lowercase().as_str() {
        "jan" => Some(1),
        "feb" => Some(2),
        "mar" => Some(3),
        "apr" => Some(4),
        "may" => Some(5),
        "jun" => Some(6),
        "jul" => Some(7),
        "aug" => Some(8),
        "sep" => Some(9),
        "oct" => Some(10),
        "nov" => Some(11),
        "dec" => Some(12),
    _ => None,
    }
}

// Howard Hinnant's civil-days algorithm; days since 1970-01-01.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = if month > 2 { month - 3 } else { month + 9 } as i64;
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FixedClock;

    fn jar_at(now_secs: u64) -> (CookieJar, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(now_secs * 1000));
        let jar = CookieJar::with_clock(clock.clone())
            .with_master_key([9u8; 32])
            .with_seed(1);
        (jar, clock)
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn names(cookies: &[Cookie]) -> Vec<&str> {
        cookies.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn identity_overwrites() {
        let (jar, _) = jar_at(1_000);
        let c1 = Cookie::new("a", "1", "example.com", "/", 1_000);
        let mut c2 = Cookie::new("a", "2", "example.com", "/", 2_000);
        c2.created_at = 2_000;

        jar.insert(c1, true).unwrap();
        jar.insert(c2, true).unwrap();
        assert_eq!(jar.len(), 1);

        let got = jar.get(&url("https://example.com/"), None, true, &http::Method::GET);
        assert_eq!(got[0].value, "2");
        // Overwrite preserved the original creation time.
        assert_eq!(got[0].created_at, 1_000);
    }

    #[test]
    fn expired_cookie_refused_on_insert() {
        let (jar, _) = jar_at(1_000);
        let mut cookie = Cookie::new("a", "1", "example.com", "/", 1_000);
        cookie.expires = Some(500);
        assert_eq!(jar.insert(cookie, true), Err(CookieError::Expired));
    }

    #[test]
    fn expired_cookies_pruned_on_access() {
        let (jar, clock) = jar_at(1_000);
        let mut cookie = Cookie::new("a", "1", "example.com", "/", 1_000);
        cookie.expires = Some(2_000);
        jar.insert(cookie, true).unwrap();

        clock.advance(2_000 * 1000);
        let got = jar.get(&url("https://example.com/"), None, true, &http::Method::GET);
        assert!(got.is_empty());
        assert_eq!(jar.len(), 0);
    }

    #[test]
    fn domain_matching() {
        let (jar, _) = jar_at(1_000);
        jar.insert(Cookie::new("host", "1", "example.com", "/", 1_000), true)
            .unwrap();
        jar.insert(Cookie::new("wild", "1", ".example.com", "/", 1_000), true)
            .unwrap();

        let got = jar.get(&url("https://example.com/"), None, true, &http::Method::GET);
        assert_eq!(got.len(), 2);

        // Subdomain only matches the dotted domain.
        let got = jar.get(&url("https://www.example.com/"), None, true, &http::Method::GET);
        assert_eq!(names(&got), vec!["wild"]);

        // Unrelated host matches nothing.
        let got = jar.get(&url("https://example.org/"), None, true, &http::Method::GET);
        assert!(got.is_empty());
    }

    #[test]
    fn path_matching_has_segment_boundaries() {
        let (jar, _) = jar_at(1_000);
        jar.insert(Cookie::new("a", "1", "example.com", "/app", 1_000), true)
            .unwrap();

        let m = http::Method::GET;
        assert_eq!(jar.get(&url("https://example.com/app"), None, true, &m).len(), 1);
        assert_eq!(jar.get(&url("https://example.com/app/x"), None, true, &m).len(), 1);
        assert!(jar.get(&url("https://example.com/application"), None, true, &m).is_empty());
    }

    #[test]
    fn secure_cookies_need_https() {
        let (jar, _) = jar_at(1_000);
        let mut cookie = Cookie::new("s", "1", "example.com", "/", 1_000);
        cookie.secure = true;
        jar.insert(cookie, true).unwrap();

        let m = http::Method::GET;
        assert_eq!(jar.get(&url("https://example.com/"), None, true, &m).len(), 1);
        assert!(jar.get(&url("http://example.com/"), None, true, &m).is_empty());
    }

    #[test]
    fn same_site_strict_requires_same_origin_source() {
        let (jar, _) = jar_at(1_000);
        let mut cookie = Cookie::new("s", "1", "example.com", "/", 1_000);
        cookie.same_site = SameSite::Strict;
        jar.insert(cookie, true).unwrap();

        let target = url("https://example.com/");
        let m = http::Method::GET;

        let cross = url("https://other.com/");
        assert!(jar.get(&target, Some(&cross), true, &m).is_empty());

        let same = url("https://example.com/page");
        assert_eq!(names(&jar.get(&target, Some(&same), true, &m)), vec!["s"]);
    }

    #[test]
    fn same_site_lax_allows_top_level_safe_navigation() {
        let (jar, _) = jar_at(1_000);
        let mut cookie = Cookie::new("l", "1", "example.com", "/", 1_000);
        cookie.same_site = SameSite::Lax;
        jar.insert(cookie, true).unwrap();

        let target = url("https://example.com/");
        let cross = url("https://other.com/");

        assert_eq!(
            jar.get(&target, Some(&cross), true, &http::Method::GET).len(),
            1
        );
        // Cross-site POST is not a safe navigation.
        assert!(jar
            .get(&target, Some(&cross), true, &http::Method::POST)
            .is_empty());
        // Subresource fetches don't qualify either.
        assert!(jar
            .get(&target, Some(&cross), false, &http::Method::GET)
            .is_empty());
    }

    #[test]
    fn retrieval_ordering_by_path_then_creation() {
        let (jar, _) = jar_at(1_000);
        let mut newer = Cookie::new("b", "1", "example.com", "/", 1_000);
        newer.created_at = 2_000;
        jar.insert(newer, true).unwrap();

        let mut older = Cookie::new("a", "1", "example.com", "/", 1_000);
        older.created_at = 1_000;
        jar.insert(older, true).unwrap();

        jar.insert(Cookie::new("deep", "1", "example.com", "/a/b", 1_000), true)
            .unwrap();

        let got = jar.get(
            &url("https://example.com/a/b/c"),
            None,
            true,
            &http::Method::GET,
        );
        assert_eq!(names(&got), vec!["deep", "a", "b"]);
    }

    #[test]
    fn cookie_header_format() {
        let (jar, _) = jar_at(1_000);
        jar.insert(Cookie::new("a", "1", "example.com", "/", 1_000), true)
            .unwrap();
        jar.insert(Cookie::new("b", "2", "example.com", "/", 1_000), true)
            .unwrap();

        let header = jar
            .cookie_header(&url("https://example.com/"), None, true, &http::Method::GET)
            .unwrap();
        assert!(header == "a=1; b=2" || header == "b=2; a=1");
    }

    #[test]
    fn sensitive_values_are_encrypted_at_rest_and_decrypted_on_read() {
        let (jar, _) = jar_at(1_000);
        jar.insert(
            Cookie::new("session_id", "top-secret", "example.com", "/", 1_000),
            true,
        )
        .unwrap();

        {
            let state = jar.state.lock().unwrap();
            let stored = &state.domains["example.com"][0];
            assert!(stored.encrypted);
            assert_ne!(stored.cookie.value, "top-secret");
        }

        let got = jar.get(&url("https://example.com/"), None, true, &http::Method::GET);
        assert_eq!(got[0].value, "top-secret");
    }

    #[test]
    fn policy_upgrades_flags() {
        let clock = Arc::new(FixedClock::new(1_000 * 1000));
        let jar = CookieJar::with_clock(clock)
            .with_policy(SecurityPolicy::Strict)
            .with_seed(1);

        jar.insert(Cookie::new("a", "1", "example.com", "/", 1_000), true)
            .unwrap();

        let state = jar.state.lock().unwrap();
        let stored = &state.domains["example.com"][0].cookie;
        assert!(stored.secure);
        assert!(stored.http_only);
        assert_eq!(stored.same_site, SameSite::Strict);
    }

    #[test]
    fn per_domain_cap_evicts_oldest() {
        let clock = Arc::new(FixedClock::new(10_000 * 1000));
        let jar = CookieJar::with_clock(clock).with_caps(2, 100).with_seed(1);

        for i in 0..3u64 {
            let mut cookie = Cookie::new(&format!("c{i}"), "1", "example.com", "/", 10_000);
            cookie.created_at = 1_000 + i;
            jar.insert(cookie, true).unwrap();
        }

        assert_eq!(jar.len(), 2);
        let got = jar.get(&url("https://example.com/"), None, true, &http::Method::GET);
        assert_eq!(names(&got), vec!["c1", "c2"]);
    }

    #[test]
    fn set_cookie_parsing() {
        let (jar, _) = jar_at(1_000_000);
        let target = url("https://example.com/a/b");

        jar.apply_set_cookie(
            &target,
            "pref=dark; Domain=example.com; Path=/; Max-Age=3600; Secure; HttpOnly; SameSite=Strict",
        )
        .unwrap();

        let state = jar.state.lock().unwrap();
        let stored = &state.domains[".example.com"][0].cookie;
        assert_eq!(stored.name, "pref");
        assert_eq!(stored.value, "dark");
        assert_eq!(stored.path, "/");
        assert_eq!(stored.expires, Some(1_003_600));
        assert!(stored.secure && stored.http_only);
        assert_eq!(stored.same_site, SameSite::Strict);
    }

    #[test]
    fn set_cookie_defaults_from_request_url() {
        let (jar, _) = jar_at(1_000);
        jar.apply_set_cookie(&url("https://example.com/a/b/c"), "x=1").unwrap();

        let state = jar.state.lock().unwrap();
        let stored = &state.domains["example.com"][0].cookie;
        assert_eq!(stored.domain, "example.com");
        assert_eq!(stored.path, "/a/b");
        assert_eq!(stored.expires, None);
    }

    #[test]
    fn set_cookie_expired_max_age_is_refused() {
        let (jar, _) = jar_at(1_000);
        assert_eq!(
            jar.apply_set_cookie(&url("https://example.com/"), "x=1; Max-Age=0"),
            Err(CookieError::Expired)
        );
    }

    #[test]
    fn http_date_parsing() {
        assert_eq!(
            parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"),
            Some(784111777)
        );
        assert_eq!(
            parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT"),
            Some(784111777)
        );
        assert_eq!(parse_http_date("Thu, 01 Jan 1970 00:00:00 GMT"), Some(0));
        assert_eq!(parse_http_date("not a date"), None);
    }

    #[test]
    fn csrf_tokens_roundtrip() {
        let (jar, clock) = jar_at(1_000);
        let token = jar.issue_csrf_token("https://example.com");

        assert!(jar.validate_csrf_token("https://example.com", &token, Duration::from_secs(60)));
        assert!(!jar.validate_csrf_token("https://example.com", "forged", Duration::from_secs(60)));
        assert!(!jar.validate_csrf_token("https://other.com", &token, Duration::from_secs(60)));

        clock.advance(120 * 1000);
        assert!(!jar.validate_csrf_token("https://example.com", &token, Duration::from_secs(60)));
    }
}
