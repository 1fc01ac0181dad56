//! UDP transport for DNS queries.
//!
//! Each datagram is answered by its own task, so a slow upstream never holds
//! up other clients. Replies go back to the datagram's source address.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::dns::HEADER_LEN;
use crate::router::Router;

use super::{MAX_DNS_PACKET_SIZE, Protocol, REBIND_BACKOFF, handle_query, is_transient};

/// UDP listener for the router.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the UDP transport.
    ///
    /// Spawns a supervisor task that serves queries and rebinds the socket
    /// if the receive loop fails.
    pub fn start(self, router: Arc<Router>) {
        info!(addr = %self.local_addr, "Listening for datagrams");
        tokio::spawn(supervise(self.socket, self.local_addr, router));
    }
}

async fn supervise(mut socket: Arc<UdpSocket>, addr: SocketAddr, router: Arc<Router>) {
    loop {
        let err = serve(&socket, &router).await;
        warn!(addr = %addr, error = %err, "UDP listener failed, rebinding");
        drop(socket);

        socket = rebind(addr).await;
        info!(addr = %addr, "UDP listener restored");
    }
}

/// Bind `addr` again, retrying every [`REBIND_BACKOFF`] until it succeeds.
async fn rebind(addr: SocketAddr) -> Arc<UdpSocket> {
    loop {
        tokio::time::sleep(REBIND_BACKOFF).await;
        match UdpSocket::bind(addr).await {
            Ok(socket) => return Arc::new(socket),
            Err(e) => warn!(addr = %addr, error = %e, "UDP rebind failed"),
        }
    }
}

/// Receive loop. Only returns on a non-transient socket error.
async fn serve(socket: &Arc<UdpSocket>, router: &Arc<Router>) -> io::Error {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) if is_transient(&e) => {
                debug!(error = %e, "UDP recv error");
                continue;
            }
            Err(e) => return e,
        };

        if len < HEADER_LEN {
            continue;
        }

        let packet = buf[..len].to_vec();
        let socket = Arc::clone(socket);
        let router = Arc::clone(router);
        tokio::spawn(async move {
            let Some(reply) = handle_query(&router, &packet, Protocol::Udp).await else {
                return;
            };
            if let Err(e) = socket.send_to(&reply, src).await {
                warn!(client = %src, error = %e, "UDP response error");
            }
        });
    }
}
