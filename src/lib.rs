//! splitdns - a split-horizon DNS router.
//!
//! Answers each query from a fast local resolver when every address it
//! returns is inside the domestic route table, and from a remote resolver
//! otherwise. Chosen answers are cached for their TTL.

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod proxy;
pub mod router;
pub mod routes;
pub mod stats;
pub mod transport;
pub mod upstream;
