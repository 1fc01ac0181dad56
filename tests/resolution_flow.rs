//! End-to-end resolution through real sockets against mock upstream servers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use splitdns::config::{CliOverrides, Config};
use splitdns::dns::{Answer, DnsQuery, DnsRecord, DnsResponse, RCODE_SERVFAIL, RecordType};
use splitdns::proxy::build_router;
use splitdns::router::{Outcome, Router};
use splitdns::routes::RouteTable;
use splitdns::transport::Protocol;
use splitdns::transport::tcp::TcpTransport;
use splitdns::transport::udp::UdpTransport;
use splitdns::upstream::{DnsUpstream, Upstream, UpstreamAddr};

const ROUTES: &str = "\
# domestic networks
1.0.1.0/24
114.114.0.0/16
";

/// Mock resolver: answers with `addr` for every query and counts queries.
struct MockServer {
    addr: SocketAddr,
    queries: Arc<AtomicUsize>,
}

async fn spawn_mock(addr: Ipv4Addr, ttl: u32) -> MockServer {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local_addr = socket.local_addr().unwrap();
    let queries = Arc::new(AtomicUsize::new(0));
    let counter = queries.clone();

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Some(query) = DnsQuery::parse(&buf[..len]) else {
                continue;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let response =
                DnsResponse::reply_to(&query, vec![DnsRecord::a(&query.domain, ttl, addr)]);
            let _ = socket.send_to(&response.to_bytes(), peer).await;
        }
    });

    MockServer {
        addr: local_addr,
        queries,
    }
}

/// A UDP port with nothing answering on it.
async fn silent_server() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

fn upstream(addr: SocketAddr) -> Arc<dyn Upstream> {
    Arc::new(DnsUpstream::new(
        UpstreamAddr {
            protocol: Protocol::Udp,
            addr,
        },
        Duration::from_millis(300),
    ))
}

async fn start_udp(router: Router) -> (Arc<Router>, SocketAddr) {
    let router = Arc::new(router);
    let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = transport.local_addr();
    transport.start(router.clone());
    (router, addr)
}

async fn ask_udp(server: SocketAddr, id: u16, name: &str, qtype: RecordType) -> Answer {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&DnsQuery::new(id, name, qtype).to_bytes(), server)
        .await
        .unwrap();

    let mut buf = [0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    Answer::parse(buf[..len].to_vec()).unwrap()
}

fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

#[tokio::test]
async fn domestic_answer_is_served_from_local_resolver() {
    let local = spawn_mock(Ipv4Addr::new(1, 0, 1, 8), 300).await;
    let remote = spawn_mock(Ipv4Addr::new(8, 8, 8, 8), 300).await;
    let router = Router::new(
        RouteTable::from_text(ROUTES),
        upstream(local.addr),
        upstream(remote.addr),
    );
    let (_router, server) = start_udp(router).await;

    let answer = ask_udp(server, 0x0101, "www.example.cn", RecordType::A).await;

    assert_eq!(answer.id(), 0x0101);
    assert_eq!(answer.addresses(), vec![v4(1, 0, 1, 8)]);
    assert_eq!(local.queries.load(Ordering::SeqCst), 1);
    assert_eq!(remote.queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn foreign_answer_is_replaced_by_remote_and_cached() {
    let local = spawn_mock(Ipv4Addr::new(93, 46, 8, 90), 300).await;
    let remote = spawn_mock(Ipv4Addr::new(104, 244, 42, 1), 300).await;
    let router = Router::new(
        RouteTable::from_text(ROUTES),
        upstream(local.addr),
        upstream(remote.addr),
    );
    let (router, server) = start_udp(router).await;

    let first = ask_udp(server, 1, "twitter.com", RecordType::A).await;
    let second = ask_udp(server, 2, "twitter.com", RecordType::A).await;

    assert_eq!(first.addresses(), vec![v4(104, 244, 42, 1)]);
    assert_eq!(second.id(), 2);
    assert_eq!(second.addresses(), vec![v4(104, 244, 42, 1)]);
    assert_eq!(remote.queries.load(Ordering::SeqCst), 1);
    assert_eq!(router.cache_len(), 1);
}

#[tokio::test]
async fn silent_remote_falls_back_to_local_answer() {
    let local = spawn_mock(Ipv4Addr::new(93, 46, 8, 90), 300).await;
    let (_silent, remote_addr) = silent_server().await;
    let router = Router::new(
        RouteTable::from_text(ROUTES),
        upstream(local.addr),
        upstream(remote_addr),
    );

    let resolution = router.resolve("example.org", RecordType::A).await;

    assert_eq!(resolution.outcome, Outcome::FallbackLocal);
    assert_eq!(router.cache_len(), 0);
}

#[tokio::test]
async fn both_resolvers_silent_yields_servfail() {
    let (_silent_local, local_addr) = silent_server().await;
    let (_silent_remote, remote_addr) = silent_server().await;
    let router = Router::new(
        RouteTable::from_text(ROUTES),
        upstream(local_addr),
        upstream(remote_addr),
    );
    let (_router, server) = start_udp(router).await;

    let answer = ask_udp(server, 77, "example.org", RecordType::A).await;

    assert_eq!(answer.id(), 77);
    assert_eq!(answer.rcode(), RCODE_SERVFAIL);
}

#[tokio::test]
async fn concurrent_queries_are_answered_independently() {
    let local = spawn_mock(Ipv4Addr::new(1, 0, 1, 8), 300).await;
    let remote = spawn_mock(Ipv4Addr::new(8, 8, 8, 8), 300).await;
    let router = Router::new(
        RouteTable::from_text(ROUTES),
        upstream(local.addr),
        upstream(remote.addr),
    );
    let (_router, server) = start_udp(router).await;

    let names: Vec<String> = (0..16).map(|i| format!("host{i}.example.cn")).collect();
    let answers = futures::future::join_all(
        names
            .iter()
            .enumerate()
            .map(|(i, name)| ask_udp(server, i as u16, name, RecordType::A)),
    )
    .await;

    for (i, answer) in answers.iter().enumerate() {
        assert_eq!(answer.id(), i as u16);
        assert_eq!(answer.addresses(), vec![v4(1, 0, 1, 8)]);
    }
    assert_eq!(local.queries.load(Ordering::SeqCst), 16);
}

#[tokio::test]
async fn tcp_connection_answers_multiple_queries() {
    let local = spawn_mock(Ipv4Addr::new(1, 0, 1, 8), 300).await;
    let remote = spawn_mock(Ipv4Addr::new(8, 8, 8, 8), 300).await;
    let router = Arc::new(Router::new(
        RouteTable::from_text(ROUTES),
        upstream(local.addr),
        upstream(remote.addr),
    ));
    let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let server = transport.local_addr();
    transport.start(router);

    let mut stream = TcpStream::connect(server).await.unwrap();
    for id in [10u16, 11] {
        let query = DnsQuery::new(id, "www.example.cn", RecordType::A).to_bytes();
        let mut framed = (query.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&query);
        stream.write_all(&framed).await.unwrap();

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut buf).await.unwrap();
        let answer = Answer::parse(buf).unwrap();

        assert_eq!(answer.id(), id);
        assert_eq!(answer.addresses(), vec![v4(1, 0, 1, 8)]);
    }
    assert_eq!(local.queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn router_is_built_from_configuration() {
    let local = spawn_mock(Ipv4Addr::new(114, 114, 1, 1), 0).await;
    let remote = spawn_mock(Ipv4Addr::new(8, 8, 8, 8), 300).await;
    let routes_path =
        std::env::temp_dir().join(format!("splitdns-flow-routes-{}.txt", std::process::id()));
    std::fs::write(&routes_path, ROUTES).unwrap();

    let config = Config::load(
        None,
        CliOverrides {
            local: Some(local.addr.to_string()),
            remote: Some(format!("udp://{}", remote.addr)),
            routes: Some(routes_path.clone()),
            ..Default::default()
        },
    )
    .unwrap();
    let router = build_router(&config).unwrap();
    std::fs::remove_file(&routes_path).unwrap();

    let resolution = router.resolve("www.example.cn", RecordType::A).await;

    assert_eq!(router.route_count(), 2);
    assert_eq!(resolution.outcome, Outcome::Local);
    assert_eq!(resolution.ttl, config.default_ttl());
}
