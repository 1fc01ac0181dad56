//! TCP transport for DNS queries.
//!
//! Each client connection is handled independently. TCP DNS messages are
//! prefixed with a 2-byte length; a client may send several queries on one
//! connection, answered in order.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::router::Router;

use super::{Protocol, REBIND_BACKOFF, handle_query, is_transient};

/// How long an idle connection may wait for its next query.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP listener for the router.
///
/// Each connection is handled in a separate task.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the TCP transport.
    ///
    /// Spawns an accept loop under a supervisor that rebinds the listener if
    /// accepting fails.
    pub fn start(self, router: Arc<Router>) {
        info!(addr = %self.local_addr, "Listening for connections");
        tokio::spawn(supervise(self.listener, self.local_addr, router));
    }
}

async fn supervise(mut listener: TcpListener, addr: SocketAddr, router: Arc<Router>) {
    loop {
        let err = run_accept_loop(&listener, &router).await;
        warn!(addr = %addr, error = %err, "TCP listener failed, rebinding");
        drop(listener);

        listener = rebind(addr).await;
        info!(addr = %addr, "TCP listener restored");
    }
}

/// Bind `addr` again, retrying every [`REBIND_BACKOFF`] until it succeeds.
async fn rebind(addr: SocketAddr) -> TcpListener {
    loop {
        tokio::time::sleep(REBIND_BACKOFF).await;
        match TcpListener::bind(addr).await {
            Ok(listener) => return listener,
            Err(e) => warn!(addr = %addr, error = %e, "TCP rebind failed"),
        }
    }
}

/// Accept loop - spawns a handler task for each incoming connection.
async fn run_accept_loop(listener: &TcpListener, router: &Arc<Router>) -> io::Error {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                tokio::spawn(handle_connection(client, peer, Arc::clone(router)));
            }
            Err(e) if is_transient(&e) => {
                debug!(error = %e, "TCP accept error");
            }
            Err(e) => return e,
        }
    }
}

/// Answer queries on one connection until the client closes it or idles out.
async fn handle_connection(mut client: TcpStream, peer: SocketAddr, router: Arc<Router>) {
    loop {
        let query = match tokio::time::timeout(IDLE_TIMEOUT, read_dns_message(&mut client)).await {
            Ok(Some(q)) => q,
            Ok(None) => return,
            Err(_) => {
                debug!(client = %peer, "Closing idle TCP connection");
                return;
            }
        };

        let Some(reply) = handle_query(&router, &query, Protocol::Tcp).await else {
            return;
        };

        let mut framed = Vec::with_capacity(reply.len() + 2);
        framed.extend_from_slice(&(reply.len() as u16).to_be_bytes());
        framed.extend_from_slice(&reply);
        if let Err(e) = client.write_all(&framed).await {
            debug!(client = %peer, error = %e, "TCP response error");
            return;
        }
    }
}

/// Read one length-prefixed DNS message, without its prefix.
async fn read_dns_message(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.ok()?;

    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut buf).await.ok()?;

    Some(buf)
}
