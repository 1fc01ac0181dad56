//! Transport layer implementations.
//!
//! Provides UDP and TCP listeners that decode client queries, hand them to
//! the [`Router`], and encode the replies.

pub mod tcp;
pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

use std::io;
use std::time::Duration;

use tracing::debug;

use crate::dns::{DnsQuery, DnsResponse, MAX_UDP_PAYLOAD};
use crate::router::Router;

/// Delay before a failed listener is bound again.
const REBIND_BACKOFF: Duration = Duration::from_secs(1);

/// Transport protocol identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Socket errors that do not warrant rebinding the listener.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Answer one raw client query.
///
/// Returns `None` when the packet is not a query we can parse; the caller
/// drops it. UDP replies that do not fit a classic datagram are replaced by
/// an empty truncated reply so the client retries over TCP.
async fn handle_query(router: &Router, packet: &[u8], protocol: Protocol) -> Option<Vec<u8>> {
    let Some(query) = DnsQuery::parse(packet) else {
        debug!(protocol = protocol.as_str(), len = packet.len(), "Dropping malformed query");
        return None;
    };

    let resolution = router.resolve(&query.domain, query.qtype).await;

    let reply = match resolution.answer {
        Some(answer) => answer.to_reply(&query),
        None => DnsResponse::servfail(&query).to_bytes(),
    };

    if protocol == Protocol::Udp && reply.len() > MAX_UDP_PAYLOAD {
        return Some(DnsResponse::truncated(&query).to_bytes());
    }

    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Answer, DnsRecord, HEADER_LEN, RCODE_SERVFAIL, RecordType};
    use crate::error::UpstreamError;
    use crate::routes::RouteTable;
    use crate::upstream::Upstream;
    use async_trait::async_trait;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    struct Fixed(Option<Vec<Ipv4Addr>>);

    #[async_trait]
    impl Upstream for Fixed {
        async fn query(&self, name: &str, qtype: RecordType) -> Result<Answer, UpstreamError> {
            let addrs = self.0.as_ref().ok_or(UpstreamError::Timeout {
                server: SocketAddr::from(([127, 0, 0, 1], 53)),
            })?;
            let records = addrs.iter().map(|&addr| DnsRecord::a(name, 60, addr)).collect();
            let query = DnsQuery::new(99, name, qtype);
            Answer::parse(DnsResponse::reply_to(&query, records).to_bytes())
        }
    }

    fn router(local: Option<Vec<Ipv4Addr>>, remote: Option<Vec<Ipv4Addr>>) -> Router {
        Router::new(
            RouteTable::from_text("1.0.0.0/8\n"),
            Arc::new(Fixed(local)),
            Arc::new(Fixed(remote)),
        )
    }

    #[tokio::test]
    async fn handle_query_replies_with_client_id() {
        let router = router(Some(vec![Ipv4Addr::new(1, 0, 1, 1)]), None);
        let packet = DnsQuery::new(0x4242, "example.com", RecordType::A).to_bytes();

        let reply = handle_query(&router, &packet, Protocol::Udp).await.unwrap();
        let answer = Answer::parse(reply).unwrap();

        assert_eq!(answer.id(), 0x4242);
        assert_eq!(answer.addresses().len(), 1);
    }

    #[tokio::test]
    async fn handle_query_echoes_mixed_case_question() {
        let router = router(Some(vec![Ipv4Addr::new(1, 0, 1, 1)]), None);
        let packet = DnsQuery::new(9, "ExAmPle.CoM", RecordType::A).to_bytes();

        let reply = handle_query(&router, &packet, Protocol::Udp).await.unwrap();

        let name_end = packet.len() - 4;
        assert_eq!(&reply[HEADER_LEN..name_end], &packet[HEADER_LEN..name_end]);
        assert_eq!(Answer::parse(reply).unwrap().addresses().len(), 1);
    }

    #[tokio::test]
    async fn handle_query_encodes_failure_as_servfail() {
        let router = router(None, None);
        let packet = DnsQuery::new(7, "example.com", RecordType::A).to_bytes();

        let reply = handle_query(&router, &packet, Protocol::Tcp).await.unwrap();

        assert_eq!(Answer::parse(reply).unwrap().rcode(), RCODE_SERVFAIL);
    }

    #[tokio::test]
    async fn oversized_udp_reply_is_truncated() {
        let many = (0..40).map(|i| Ipv4Addr::new(1, 0, 1, i)).collect();
        let router = router(Some(many), None);
        let packet = DnsQuery::new(7, "example.com", RecordType::A).to_bytes();

        let udp = handle_query(&router, &packet, Protocol::Udp).await.unwrap();
        let tcp = handle_query(&router, &packet, Protocol::Tcp).await.unwrap();

        assert!(Answer::parse(udp).unwrap().is_truncated());
        assert!(!Answer::parse(tcp).unwrap().is_truncated());
    }

    #[tokio::test]
    async fn handle_query_drops_garbage() {
        let router = router(None, None);

        assert!(handle_query(&router, &[1, 2, 3], Protocol::Udp).await.is_none());
    }
}
