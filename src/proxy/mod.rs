//! Proxy rotation
//!
//! Workers route every request through an egress proxy from a static list.
//! The pool spreads load across IPs with a per-IP cooldown and parks IPs the
//! target site has rate-limited or banned.
//!
//! # Components
//!
//! - `ProxyInfo`: one proxy from the list file
//! - `ProxyPool`: the shared cooldown/block state machine
//! - `ProxyHandle`: a reservation returned by `ProxyPool::acquire`

mod loader;
mod pool;

pub use loader::{load_proxies, parse_proxy_list, ProxyInfo};
pub use pool::{PoolStatus, ProxyHandle, ProxyPool};
