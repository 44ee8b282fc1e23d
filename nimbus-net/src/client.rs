use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use nimbus_proto::{ErrorCode, Settings};

use crate::{
    ClientError, Clock, Connection, CookieJar, Dialer, EarlyDataManager, Priority, QuicConnection,
    SystemClock,
};

/// An outbound request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: http::Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub priority: Priority,
    pub deadline: Option<Duration>,

    /// The document that initiated this request, for cookie same-site checks.
    pub source: Option<Url>,
    /// Whether this request is a top-level navigation.
    pub top_level_navigation: bool,
}

impl Request {
    pub fn new(method: http::Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
            priority: Priority::default(),
            deadline: None,
            source: None,
            top_level_navigation: true,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(http::Method::GET, url)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A complete response: headers, body, and any trailers.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: http::StatusCode,
    pub headers: Vec<(String, String)>,
    pub trailers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub(crate) fn from_fields(
        fields: Vec<(String, String)>,
        trailers: Vec<(String, String)>,
        body: Bytes,
    ) -> Result<Self, ClientError> {
        let mut status = None;
        let mut headers = Vec::with_capacity(fields.len());

        for (name, value) in fields {
            if name == ":status" {
                status = http::StatusCode::from_bytes(value.as_bytes()).ok();
            } else if !name.starts_with(':') {
                headers.push((name, value));
            }
        }

        let status = status.ok_or(ClientError::Protocol(ErrorCode::H3_MESSAGE_ERROR))?;
        Ok(Self {
            status,
            headers,
            trailers,
            body,
        })
    }

    /// First header with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every Set-Cookie header, in order.
    pub fn set_cookies(&self) -> impl Iterator<Item = &str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("set-cookie"))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub settings: Settings,
    pub max_concurrent_streams: usize,
    pub idle_timeout: Duration,
    pub alpn: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            settings: Settings::defaults(),
            max_concurrent_streams: 100,
            idle_timeout: Duration::from_secs(30),
            alpn: "h3".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Origin {
    host: String,
    port: u16,
    alpn: String,
}

impl Origin {
    fn from_url(url: &Url, alpn: &str) -> Result<Self, ClientError> {
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::InvalidUrl(url.to_string()))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);
        Ok(Self {
            host,
            port,
            alpn: alpn.to_string(),
        })
    }

    fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The browser's HTTP/3 entry point: one connection per origin, cookies
/// attached on the way out and captured on the way in, 0-RTT when a usable
/// ticket exists.
pub struct Http3Client<D: Dialer> {
    dialer: D,
    config: ClientConfig,
    pool: Mutex<HashMap<Origin, Connection<D::Connection>>>,
    cookies: Arc<CookieJar>,
    early_data: Option<Arc<EarlyDataManager>>,
    clock: Arc<dyn Clock>,
}

impl<D: Dialer> Http3Client<D> {
    pub fn new(dialer: D, config: ClientConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            dialer,
            config,
            pool: Mutex::new(HashMap::new()),
            cookies: Arc::new(CookieJar::with_clock(clock.clone())),
            early_data: None,
            clock,
        }
    }

    pub fn with_cookie_jar(mut self, jar: Arc<CookieJar>) -> Self {
        self.cookies = jar;
        self
    }

    pub fn with_early_data(mut self, manager: Arc<EarlyDataManager>) -> Self {
        self.early_data = Some(manager);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cookie_jar(&self) -> &Arc<CookieJar> {
        &self.cookies
    }

    /// Submit a request and await the complete response.
    pub async fn fetch(&self, request: Request) -> Result<Response, ClientError> {
        let origin = Origin::from_url(&request.url, &self.config.alpn)?;

        // A pooled connection means the handshake is long done; 0-RTT only
        // matters on a cold origin.
        let pooled = self.lookup(&origin);
        if pooled.is_none() {
            if let Some(manager) = self.early_data.clone() {
                if let Some(resumption) = manager.select_resumption(&origin.key()) {
                    match manager.prepare_request(&origin.key(), &request.method, &request.headers)
                    {
                        Ok(replay_headers) => {
                            return self
                                .fetch_early(&origin, &request, resumption, replay_headers, manager)
                                .await;
                        }
                        Err(err) => {
                            log::debug!("request not eligible for early data: {err}");
                        }
                    }
                }
            }
        }

        let conn = match pooled {
            Some(conn) => conn,
            None => self.connect(&origin).await?,
        };
        self.send_on(&conn, &request, &[]).await
    }

    /// Dial with a resumption ticket and send the request in the 0-RTT
    /// flight. On rejection the request is re-driven exactly once on the
    /// 1-RTT session, replay-protection headers stripped.
    async fn fetch_early(
        &self,
        origin: &Origin,
        request: &Request,
        resumption: crate::Resumption,
        replay_headers: Vec<(String, String)>,
        manager: Arc<EarlyDataManager>,
    ) -> Result<Response, ClientError> {
        let quic = self
            .dialer
            .dial(&origin.host, origin.port, Some(resumption))
            .await?;

        let conn = Connection::establish_with_early_data(
            quic.clone(),
            &origin.host,
            origin.port,
            request.url.scheme() == "https",
            self.config.settings.clone(),
            self.config.max_concurrent_streams,
            self.config.idle_timeout,
            self.clock.clone(),
        )
        .await?;
        self.pool
            .lock()
            .unwrap()
            .insert(origin.clone(), conn.clone());

        let early_fut = self.send_on(&conn, request, &replay_headers);
        tokio::pin!(early_fut);

        let mut early_result = None;
        let accepted = tokio::select! {
            accepted = quic.early_data_accepted() => accepted,
            response = &mut early_fut => {
                // A complete response before the acceptance signal means the
                // server took the early data; an error defers to the signal.
                let ok = response.is_ok();
                early_result = Some(response);
                if ok { true } else { quic.early_data_accepted().await }
            }
        };

        if accepted {
            manager.on_accepted(&origin.key(), quic.rtt());
            return match early_result {
                Some(response) => response,
                None => early_fut.await,
            };
        }

        manager.on_rejected(&origin.key());
        log::debug!("early data rejected by {}; retrying on 1-rtt", origin.key());
        self.send_on(&conn, request, &[]).await
    }

    fn lookup(&self, origin: &Origin) -> Option<Connection<D::Connection>> {
        let pool = self.pool.lock().unwrap();
        pool.get(origin).filter(|c| c.is_usable()).cloned()
    }

    async fn connect(&self, origin: &Origin) -> Result<Connection<D::Connection>, ClientError> {
        let quic = self.dialer.dial(&origin.host, origin.port, None).await?;
        let conn = Connection::establish(
            quic,
            &origin.host,
            origin.port,
            true,
            self.config.settings.clone(),
            self.config.max_concurrent_streams,
            self.config.idle_timeout,
            self.clock.clone(),
        )
        .await?;

        self.pool
            .lock()
            .unwrap()
            .insert(origin.clone(), conn.clone());
        Ok(conn)
    }

    async fn send_on(
        &self,
        conn: &Connection<D::Connection>,
        request: &Request,
        replay_headers: &[(String, String)],
    ) -> Result<Response, ClientError> {
        // Early-data requests must not carry credentials, so the jar is only
        // consulted on the normal path.
        let attach_cookies = replay_headers.is_empty();
        let fields = build_field_list(request, replay_headers, attach_cookies.then_some(&self.cookies));

        let response = conn
            .request(fields, request.body.clone(), request.priority, request.deadline)
            .await?;

        for set_cookie in response.set_cookies() {
            if let Err(err) = self.cookies.apply_set_cookie(&request.url, set_cookie) {
                log::debug!("rejected set-cookie from {}: {err}", request.url);
            }
        }

        Ok(response)
    }

    /// Close every pooled connection gracefully.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = {
            let mut pool = self.pool.lock().unwrap();
            pool.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.close().await;
        }
    }
}

/// Synthesize the header list for the wire: pseudo-headers in canonical order
/// first, then regular headers, lowercased, caller values overriding
/// case-insensitively.
fn build_field_list(
    request: &Request,
    replay_headers: &[(String, String)],
    cookies: Option<&Arc<CookieJar>>,
) -> Vec<(String, String)> {
    let url = &request.url;

    let authority = request
        .headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("host"))
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        });

    let path = match url.path() {
        "" => "/".to_string(),
        path => path.to_string(),
    };
    let path = match url.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };

    let mut fields: Vec<(String, String)> = vec![
        (":method".to_string(), request.method.as_str().to_string()),
        (":scheme".to_string(), url.scheme().to_string()),
        (":authority".to_string(), authority),
        (":path".to_string(), path),
    ];

    // Merge caller headers, last writer wins on a case-insensitive match.
    let mut regular: Vec<(String, String)> = Vec::new();
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        let name = name.to_ascii_lowercase();
        match regular.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value.clone(),
            None => regular.push((name, value.clone())),
        }
    }

    if request.body.is_some() && !regular.iter().any(|(n, _)| n == "content-length") {
        let len = request.body.as_ref().map(|b| b.len()).unwrap_or(0);
        regular.push(("content-length".to_string(), len.to_string()));
    }

    if let Some(jar) = cookies {
        if !regular.iter().any(|(n, _)| n == "cookie") {
            if let Some(header) = jar.cookie_header(
                url,
                request.source.as_ref(),
                request.top_level_navigation,
                &request.method,
            ) {
                regular.push(("cookie".to_string(), header));
            }
        }
    }

    for (name, value) in replay_headers {
        regular.push((name.clone(), value.clone()));
    }

    fields.extend(regular);
    fields
}
