//! Upstream resolvers.
//!
//! The router talks to its two resolvers through the [`Upstream`] trait;
//! [`DnsUpstream`] is the network implementation, speaking plain DNS over
//! UDP (retrying over TCP on truncation) or TCP.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::dns::{Answer, DnsQuery, RCODE_REFUSED, RCODE_SERVFAIL, RecordType, header_truncated};
use crate::error::{UpstreamAddrError, UpstreamError};
use crate::transport::{MAX_DNS_PACKET_SIZE, Protocol};

const DEFAULT_DNS_PORT: u16 = 53;

/// A resolver the router can ask for an answer.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn query(&self, name: &str, record_type: RecordType) -> Result<Answer, UpstreamError>;
}

/// Where and how to reach an upstream resolver.
///
/// Parsed from `udp://host:port`, `tcp://host:port`, `host:port` or a bare
/// IP (UDP, port 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamAddr {
    pub protocol: Protocol,
    pub addr: SocketAddr,
}

impl FromStr for UpstreamAddr {
    type Err = UpstreamAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, rest) = if let Some(rest) = s.strip_prefix("udp://") {
            (Protocol::Udp, rest)
        } else if let Some(rest) = s.strip_prefix("tcp://") {
            (Protocol::Tcp, rest)
        } else if s.contains("://") {
            return Err(UpstreamAddrError::UnsupportedScheme(s.to_string()));
        } else {
            (Protocol::Udp, s)
        };

        let addr = match rest.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => {
                let ip: IpAddr = rest
                    .parse()
                    .map_err(|_| UpstreamAddrError::InvalidAddress(s.to_string()))?;
                SocketAddr::new(ip, DEFAULT_DNS_PORT)
            }
        };

        Ok(Self { protocol, addr })
    }
}

impl fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol.scheme(), self.addr)
    }
}

/// Upstream DNS server reached over the network.
pub struct DnsUpstream {
    server: UpstreamAddr,
    timeout: Duration,
}

impl DnsUpstream {
    pub fn new(server: UpstreamAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    pub fn server(&self) -> UpstreamAddr {
        self.server
    }

    /// Send over UDP and wait for the datagram carrying our transaction id.
    async fn exchange_udp(&self, query: &[u8], id: u16) -> Result<Vec<u8>, UpstreamError> {
        let server = self.server.addr;
        let io_err = |source: std::io::Error| UpstreamError::Io { server, source };

        let bind_addr: SocketAddr = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(io_err)?;
        socket.connect(server).await.map_err(io_err)?;
        socket.send(query).await.map_err(io_err)?;

        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
        loop {
            let len = socket.recv(&mut buf).await.map_err(io_err)?;
            if len >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
                buf.truncate(len);
                return Ok(buf);
            }
            debug!(server = %server, len, "Ignoring stray UDP datagram");
        }
    }

    /// Send a length-prefixed query over TCP and read one response.
    async fn exchange_tcp(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let server = self.server.addr;
        let io_err = |source: std::io::Error| UpstreamError::Io { server, source };

        let mut stream = TcpStream::connect(server).await.map_err(io_err)?;

        let mut framed = Vec::with_capacity(query.len() + 2);
        framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
        framed.extend_from_slice(query);
        stream.write_all(&framed).await.map_err(io_err)?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.map_err(io_err)?;
        let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut buf).await.map_err(io_err)?;

        Ok(buf)
    }

    async fn exchange(&self, query: &[u8], id: u16) -> Result<Answer, UpstreamError> {
        if self.server.protocol == Protocol::Udp {
            let message = self.exchange_udp(query, id).await?;
            if !header_truncated(&message) {
                return Answer::parse(message);
            }
            debug!(server = %self.server, "UDP answer truncated, retrying over TCP");
        }
        Answer::parse(self.exchange_tcp(query).await?)
    }
}

#[async_trait]
impl Upstream for DnsUpstream {
    async fn query(&self, name: &str, record_type: RecordType) -> Result<Answer, UpstreamError> {
        let id: u16 = rand::random();
        let query = DnsQuery::new(id, name, record_type).to_bytes();
        let server = self.server.addr;

        let answer = tokio::time::timeout(self.timeout, self.exchange(&query, id))
            .await
            .map_err(|_| UpstreamError::Timeout { server })??;

        if answer.id() != id {
            return Err(UpstreamError::Malformed("transaction id mismatch"));
        }
        let expected = name.trim_end_matches('.');
        let same_question = answer.question().is_some_and(|(qname, qtype)| {
            qtype == record_type && qname.eq_ignore_ascii_case(expected)
        });
        if !same_question {
            return Err(UpstreamError::Malformed("question mismatch"));
        }

        match answer.rcode() {
            RCODE_SERVFAIL | RCODE_REFUSED => Err(UpstreamError::ServerFailure {
                server,
                rcode: answer.rcode(),
            }),
            _ => Ok(answer),
        }
    }
}
