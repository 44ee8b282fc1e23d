//! SOCKS4/4a/5 proxy client, RFC 1928 and RFC 1929.
//!
//! Establishes TCP tunnels through a proxy; the handshake is generic over the
//! I/O type so tests can drive it over an in-memory pipe.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V4a,
    V5,
}

#[derive(Debug, Clone)]
pub struct SocksAuth {
    pub username: String,
    pub password: String,
}

#[derive(Error, Debug)]
pub enum SocksError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("proxy speaks the wrong protocol version: {0:#04x}")]
    UnexpectedVersion(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableAuth,

    #[error("authentication failed")]
    AuthFailed,

    #[error("username or password exceeds 255 bytes")]
    CredentialsTooLong,

    #[error("hostname exceeds 255 bytes")]
    HostTooLong,

    #[error("general SOCKS server failure")]
    GeneralFailure,

    #[error("connection not allowed by ruleset")]
    NotAllowed,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("TTL expired")]
    TtlExpired,

    #[error("command not supported")]
    CommandNotSupported,

    #[error("address type not supported")]
    AddressTypeNotSupported,

    #[error("unknown reply code {0:#04x}")]
    UnknownReply(u8),

    #[error("SOCKS4 does not support this address")]
    UnsupportedAddress,
}

fn socks5_reply_error(code: u8) -> SocksError {
    match code {
        0x01 => SocksError::GeneralFailure,
        0x02 => SocksError::NotAllowed,
        0x03 => SocksError::NetworkUnreachable,
        0x04 => SocksError::HostUnreachable,
        0x05 => SocksError::ConnectionRefused,
        0x06 => SocksError::TtlExpired,
        0x07 => SocksError::CommandNotSupported,
        0x08 => SocksError::AddressTypeNotSupported,
        code => SocksError::UnknownReply(code),
    }
}

fn socks4_reply_error(code: u8) -> SocksError {
    match code {
        91 => SocksError::ConnectionRefused,
        92 => SocksError::NotAllowed,
        93 => SocksError::AuthFailed,
        code => SocksError::UnknownReply(code),
    }
}

#[derive(Debug, Clone)]
pub struct SocksClient {
    pub proxy_host: String,
    pub proxy_port: u16,
    pub version: SocksVersion,
    pub auth: Option<SocksAuth>,
}

impl SocksClient {
    pub fn new(proxy_host: &str, proxy_port: u16, version: SocksVersion) -> Self {
        Self {
            proxy_host: proxy_host.to_string(),
            proxy_port,
            version,
            auth: None,
        }
    }

    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.auth = Some(SocksAuth {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Open a TCP tunnel to `host:port` through the proxy.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, SocksError> {
        let mut stream =
            TcpStream::connect((self.proxy_host.as_str(), self.proxy_port)).await?;
        self.establish(&mut stream, host, port).await?;
        Ok(stream)
    }

    /// Run the handshake on an already-connected stream.
    pub async fn establish<S>(&self, stream: &mut S, host: &str, port: u16) -> Result<(), SocksError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.version {
            SocksVersion::V5 => self.establish_v5(stream, host, port).await,
            SocksVersion::V4 | SocksVersion::V4a => self.establish_v4(stream, host, port).await,
        }
    }

    async fn establish_v5<S>(&self, stream: &mut S, host: &str, port: u16) -> Result<(), SocksError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Method negotiation.
        let mut greeting = vec![0x05u8];
        match &self.auth {
            Some(_) => {
                greeting.push(2);
                greeting.push(0x00);
                greeting.push(0x02);
            }
            None => {
                greeting.push(1);
                greeting.push(0x00);
            }
        }
        stream.write_all(&greeting).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != 0x05 {
            return Err(SocksError::UnexpectedVersion(reply[0]));
        }

        match reply[1] {
            0x00 => {}
            0x02 => {
                let auth = self.auth.as_ref().ok_or(SocksError::NoAcceptableAuth)?;
                self.authenticate(stream, auth).await?;
            }
            0xff => return Err(SocksError::NoAcceptableAuth),
            method => return Err(SocksError::UnknownReply(method)),
        }

        // CONNECT request.
        let mut request = vec![0x05u8, 0x01, 0x00];
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) => {
                request.push(0x01);
                request.extend_from_slice(&addr.octets());
            }
            Ok(IpAddr::V6(addr)) => {
                request.push(0x04);
                request.extend_from_slice(&addr.octets());
            }
            Err(_) => {
                if host.len() > 255 {
                    return Err(SocksError::HostTooLong);
                }
                request.push(0x03);
                request.push(host.len() as u8);
                request.extend_from_slice(host.as_bytes());
            }
        }
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        // Reply: VER REP RSV ATYP BND.ADDR BND.PORT.
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != 0x05 {
            return Err(SocksError::UnexpectedVersion(head[0]));
        }
        if head[1] != 0x00 {
            return Err(socks5_reply_error(head[1]));
        }

        let bound_len = match head[3] {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            _ => return Err(SocksError::AddressTypeNotSupported),
        };

        let mut bound = vec![0u8; bound_len + 2];
        stream.read_exact(&mut bound).await?;
        Ok(())
    }

    // RFC 1929 username/password subnegotiation.
    async fn authenticate<S>(&self, stream: &mut S, auth: &SocksAuth) -> Result<(), SocksError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if auth.username.len() > 255 || auth.password.len() > 255 {
            return Err(SocksError::CredentialsTooLong);
        }

        let mut request = vec![0x01u8, auth.username.len() as u8];
        request.extend_from_slice(auth.username.as_bytes());
        request.push(auth.password.len() as u8);
        request.extend_from_slice(auth.password.as_bytes());
        stream.write_all(&request).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != 0x01 {
            return Err(SocksError::UnexpectedVersion(reply[0]));
        }
        if reply[1] != 0x00 {
            return Err(SocksError::AuthFailed);
        }
        Ok(())
    }

    async fn establish_v4<S>(&self, stream: &mut S, host: &str, port: u16) -> Result<(), SocksError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request = vec![0x04u8, 0x01];
        request.extend_from_slice(&port.to_be_bytes());

        let hostname = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) => {
                request.extend_from_slice(&addr.octets());
                None
            }
            Ok(IpAddr::V6(_)) => return Err(SocksError::UnsupportedAddress),
            Err(_) => {
                if self.version != SocksVersion::V4a {
                    return Err(SocksError::UnsupportedAddress);
                }
                if host.len() > 255 {
                    return Err(SocksError::HostTooLong);
                }
                // 4a marker address 0.0.0.x, x nonzero.
                request.extend_from_slice(&Ipv4Addr::new(0, 0, 0, 1).octets());
                Some(host)
            }
        };

        // User id, NUL terminated.
        if let Some(auth) = &self.auth {
            request.extend_from_slice(auth.username.as_bytes());
        }
        request.push(0x00);

        // SOCKS4a: hostname after the user id, NUL terminated.
        if let Some(hostname) = hostname {
            request.extend_from_slice(hostname.as_bytes());
            request.push(0x00);
        }

        stream.write_all(&request).await?;

        // Reply: VN(0) CD DSTPORT DSTIP.
        let mut reply = [0u8; 8];
        stream.read_exact(&mut reply).await?;
        if reply[0] != 0x00 {
            return Err(SocksError::UnexpectedVersion(reply[0]));
        }
        match reply[1] {
            90 => Ok(()),
            code => Err(socks4_reply_error(code)),
        }
    }
}

/// A bounded pool of idle tunnels keyed by (target host, target port).
/// Returning a connection past the cap closes it instead.
pub struct SocksPool {
    max_per_target: usize,
    idle: Mutex<HashMap<(String, u16), Vec<TcpStream>>>,
}

impl SocksPool {
    pub fn new(max_per_target: usize) -> Self {
        Self {
            max_per_target,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Take an idle tunnel to the target, if one is pooled.
    pub fn checkout(&self, host: &str, port: u16) -> Option<TcpStream> {
        let mut idle = self.idle.lock().unwrap();
        idle.get_mut(&(host.to_string(), port)).and_then(Vec::pop)
    }

    /// Return a tunnel to the pool. Dropped (closed) when the target is at
    /// capacity.
    pub fn checkin(&self, host: &str, port: u16, stream: TcpStream) {
        let mut idle = self.idle.lock().unwrap();
        let slot = idle.entry((host.to_string(), port)).or_default();
        if slot.len() < self.max_per_target {
            slot.push(stream);
        }
    }

    pub fn idle_count(&self, host: &str, port: u16) -> usize {
        let idle = self.idle.lock().unwrap();
        idle.get(&(host.to_string(), port)).map(Vec::len).unwrap_or(0)
    }
}
