//! Server orchestration.
//!
//! Loads the route table, builds the router, binds transports and runs the
//! server.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::router::Router;
use crate::routes::RouteTable;
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};
use crate::upstream::DnsUpstream;

/// Build a router from configuration: route table, upstreams, default TTL.
pub fn build_router(config: &Config) -> anyhow::Result<Router> {
    let routes = RouteTable::load(&config.routes.path)?;

    let timeout = config.upstream_timeout();
    let local = DnsUpstream::new(config.local_upstream()?, timeout);
    let remote = DnsUpstream::new(config.remote_upstream()?, timeout);
    info!(
        local = %local.server(),
        remote = %remote.server(),
        timeout_ms = config.upstream.timeout_ms,
        "Upstreams configured"
    );

    let router = Router::new(routes, Arc::new(local), Arc::new(remote))
        .with_default_ttl(config.default_ttl());

    Ok(router)
}

/// Run the DNS router with the given configuration.
///
/// Starts UDP and TCP transports on the bind address. Runs indefinitely.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let router = Arc::new(build_router(&config)?);

    let bind_addr = config.bind_addr()?;
    let udp = UdpTransport::bind(bind_addr).await?;
    let tcp = TcpTransport::bind(bind_addr).await?;

    info!(
        addr = %bind_addr,
        routes = router.route_count(),
        "DNS router listening"
    );

    udp.start(router.clone());
    tcp.start(router.clone());

    match config.logging.stats_interval_secs {
        0 => std::future::pending::<()>().await,
        secs => report_stats(&router, Duration::from_secs(secs)).await,
    }

    Ok(())
}

/// Log a statistics line every `period`, forever.
async fn report_stats(router: &Router, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip first immediate tick
    loop {
        interval.tick().await;
        let stats = router.stats_snapshot_and_reset();
        info!(
            cache = router.cache_len(),
            requests = stats.requests,
            cache_hits = stats.cache_hits,
            local = stats.local,
            remote = stats.remote,
            fallback = stats.fallback,
            failed = stats.failed,
            avg_response_ms = stats.avg_response_ms,
            "[stats]"
        );
    }
}
