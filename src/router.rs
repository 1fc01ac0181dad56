//! Split-horizon resolution.
//!
//! For each query the router:
//! 1. Serves a live cache entry if there is one
//! 2. Asks the local resolver
//! 3. Trusts the local answer if its addresses are all domestic
//! 4. Otherwise asks the remote resolver, falling back to the local answer
//!
//! Transports handle the wire, the router handles decisions.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::dns::{Answer, RecordType};
use crate::routes::RouteTable;
use crate::stats::{Stats, StatsSnapshot};
use crate::upstream::Upstream;

/// TTL used when no answer record carries a positive one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// How a query was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    CacheHit,
    Local,
    Remote,
    /// Remote failed; the untrusted local answer is served but not cached.
    FallbackLocal,
    /// Neither resolver answered.
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::CacheHit => "CACHE",
            Outcome::Local => "LOCAL",
            Outcome::Remote => "REMOTE",
            Outcome::FallbackLocal => "FALLBACK_LOCAL",
            Outcome::Failed => "FAILED",
        })
    }
}

/// Result of [`Router::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: Outcome,
    /// `None` only when the outcome is [`Outcome::Failed`].
    pub answer: Option<Arc<Answer>>,
    /// Cache lifetime applied (remaining lifetime for cache hits).
    pub ttl: Duration,
}

impl Resolution {
    fn answered(outcome: Outcome, answer: Arc<Answer>, ttl: Duration) -> Self {
        Self {
            outcome,
            answer: Some(answer),
            ttl,
        }
    }

    fn failed() -> Self {
        Self {
            outcome: Outcome::Failed,
            answer: None,
            ttl: Duration::ZERO,
        }
    }
}

/// Chooses between the local and remote resolver for each query.
pub struct Router {
    routes: RouteTable,
    cache: Cache,
    local: Arc<dyn Upstream>,
    remote: Arc<dyn Upstream>,
    default_ttl: Duration,
    stats: Stats,
}

impl Router {
    pub fn new(routes: RouteTable, local: Arc<dyn Upstream>, remote: Arc<dyn Upstream>) -> Self {
        Self {
            routes,
            cache: Cache::new(),
            local,
            remote,
            default_ttl: DEFAULT_TTL,
            stats: Stats::new(),
        }
    }

    pub fn with_default_ttl(mut self, default_ttl: Duration) -> Self {
        self.default_ttl = default_ttl;
        self
    }

    /// Resolve `name` (lower-cased) for `record_type`.
    pub async fn resolve(&self, name: &str, record_type: RecordType) -> Resolution {
        let start = Instant::now();
        let resolution = self.decide(name, record_type).await;
        self.stats.record(resolution.outcome, start.elapsed());
        resolution
    }

    async fn decide(&self, name: &str, record_type: RecordType) -> Resolution {
        if let Some(cached) = self.cache.get(name, record_type) {
            info!(domain = name, qtype = %record_type, "-> CACHE");
            return Resolution::answered(Outcome::CacheHit, cached.answer, cached.remaining);
        }

        let local = match self.local.query(name, record_type).await {
            Ok(answer) => Some(Arc::new(answer)),
            Err(e) => {
                warn!(domain = name, qtype = %record_type, error = %e, "Local resolver failed");
                None
            }
        };

        if let Some(answer) = &local {
            let addresses = answer.addresses();
            let ttl = self.effective_ttl(answer);
            if self.is_trusted(record_type, &addresses) {
                info!(
                    domain = name,
                    qtype = %record_type,
                    addresses = ?addresses,
                    ttl = ttl.as_secs(),
                    "-> LOCAL"
                );
                self.cache.put(name, record_type, Arc::clone(answer), ttl);
                return Resolution::answered(Outcome::Local, Arc::clone(answer), ttl);
            }
            debug!(domain = name, addresses = ?addresses, "Local answer is not domestic");
        }

        match self.remote.query(name, record_type).await {
            Ok(answer) => {
                let answer = Arc::new(answer);
                let ttl = self.effective_ttl(&answer);
                info!(domain = name, qtype = %record_type, ttl = ttl.as_secs(), "-> REMOTE");
                self.cache.put(name, record_type, Arc::clone(&answer), ttl);
                Resolution::answered(Outcome::Remote, answer, ttl)
            }
            Err(e) => {
                warn!(domain = name, qtype = %record_type, error = %e, "Remote resolver failed");
                match local {
                    Some(answer) => {
                        let ttl = self.effective_ttl(&answer);
                        info!(domain = name, qtype = %record_type, "-> FALLBACK_LOCAL");
                        Resolution::answered(Outcome::FallbackLocal, answer, ttl)
                    }
                    None => {
                        warn!(domain = name, qtype = %record_type, "-> FAILED");
                        Resolution::failed()
                    }
                }
            }
        }
    }

    /// AAAA answers are always trusted: the route table is IPv4-only. An
    /// answer without addresses (e.g. CNAME only) is trusted as well.
    fn is_trusted(&self, record_type: RecordType, addresses: &[IpAddr]) -> bool {
        record_type == RecordType::AAAA || addresses.iter().all(|&ip| self.routes.contains(ip))
    }

    fn effective_ttl(&self, answer: &Answer) -> Duration {
        answer
            .min_positive_ttl()
            .map(|ttl| Duration::from_secs(u64::from(ttl)))
            .unwrap_or(self.default_ttl)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn stats_snapshot_and_reset(&self) -> StatsSnapshot {
        self.stats.snapshot_and_reset()
    }
}
