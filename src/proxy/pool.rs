use crate::proxy::ProxyInfo;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Per-IP bookkeeping, keyed by proxy host
#[derive(Debug, Default)]
struct PoolState {
    /// When each IP was last handed out
    last_used: HashMap<String, Instant>,

    /// When each IP was blocked by a 429/403
    blocked_at: HashMap<String, Instant>,
}

/// A proxy reserved by `ProxyPool::acquire`
///
/// The handle remembers the reservation instant so that a late `release`
/// cannot clear a newer reservation of the same IP.
#[derive(Debug)]
pub struct ProxyHandle {
    proxy: ProxyInfo,
    reserved_at: Instant,
}

impl ProxyHandle {
    pub fn proxy(&self) -> &ProxyInfo {
        &self.proxy
    }

    pub fn ip(&self) -> &str {
        &self.proxy.host
    }
}

/// Snapshot of the pool for progress logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub blocked: usize,
    pub cooling_down: usize,
}

/// Rotating pool of egress proxies
///
/// Each IP moves between three states:
///
/// | State       | Entered by                | Left when                        |
/// |-------------|---------------------------|----------------------------------|
/// | Available   | start, expiry             | `acquire` hands it out           |
/// | Cooldown    | `acquire`                 | `min_request_interval` elapses   |
/// | Blocked     | `mark_blocked`            | `block_duration` elapses         |
///
/// A block is checked before the cooldown, so an IP whose cooldown has
/// expired is still skipped while it is blocked. All state sits behind one
/// mutex and `acquire` checks and reserves under the same lock.
#[derive(Debug)]
pub struct ProxyPool {
    proxies: Vec<ProxyInfo>,
    min_request_interval: Duration,
    block_duration: Duration,
    state: Mutex<PoolState>,
}

impl ProxyPool {
    pub fn new(proxies: Vec<ProxyInfo>, min_request_interval: Duration, block_duration: Duration) -> Self {
        Self {
            proxies,
            min_request_interval,
            block_duration,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Builds a pool from the proxy section of the configuration
    pub fn from_config(config: &crate::config::ProxyConfig) -> Self {
        let proxies = crate::proxy::load_proxies(std::path::Path::new(&config.file));
        Self::new(
            proxies,
            config.min_request_interval(),
            config.block_duration(),
        )
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Reserves the first eligible proxy in load order
    ///
    /// Returns `None` when every IP is blocked or cooling down. Callers treat
    /// that as a retryable exhaustion, not a hard failure.
    pub fn acquire(&self) -> Option<ProxyHandle> {
        self.acquire_at(Instant::now())
    }

    pub(crate) fn acquire_at(&self, now: Instant) -> Option<ProxyHandle> {
        let mut state = self.lock();

        for proxy in &self.proxies {
            let ip = proxy.host.as_str();

            if let Some(&blocked_at) = state.blocked_at.get(ip) {
                if now.saturating_duration_since(blocked_at) < self.block_duration {
                    continue;
                }
                state.blocked_at.remove(ip);
                tracing::debug!("Block on {} expired", ip);
            }

            if let Some(&last) = state.last_used.get(ip) {
                if now.saturating_duration_since(last) < self.min_request_interval {
                    continue;
                }
            }

            state.last_used.insert(ip.to_string(), now);
            return Some(ProxyHandle {
                proxy: proxy.clone(),
                reserved_at: now,
            });
        }

        None
    }

    /// Ends a reservation early so the IP can be reused before its cooldown
    ///
    /// The minimum request interval is only enforced while a reservation is
    /// held; after a release the IP can be acquired again at once. Blocks
    /// are unaffected.
    pub fn release(&self, handle: ProxyHandle) {
        let mut state = self.lock();
        if state.last_used.get(handle.ip()) == Some(&handle.reserved_at) {
            state.last_used.remove(handle.ip());
        }
    }

    /// Blocks the handle's IP for `block_duration`, regardless of cooldown
    pub fn mark_blocked(&self, handle: &ProxyHandle) {
        self.mark_blocked_at(handle, Instant::now());
    }

    pub(crate) fn mark_blocked_at(&self, handle: &ProxyHandle, now: Instant) {
        self.lock()
            .blocked_at
            .insert(handle.ip().to_string(), now);
        tracing::info!("Marked IP {} as blocked", handle.ip());
    }

    /// Whether the IP is currently blocked
    pub fn is_blocked(&self, ip: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .blocked_at
            .get(ip)
            .map(|&at| now.saturating_duration_since(at) < self.block_duration)
            .unwrap_or(false)
    }

    pub fn status(&self) -> PoolStatus {
        let now = Instant::now();
        let state = self.lock();

        let blocked = state
            .blocked_at
            .values()
            .filter(|&&at| now.saturating_duration_since(at) < self.block_duration)
            .count();
        let cooling_down = state
            .last_used
            .values()
            .filter(|&&at| now.saturating_duration_since(at) < self.min_request_interval)
            .count();

        PoolStatus {
            total: self.proxies.len(),
            blocked,
            cooling_down,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const INTERVAL: Duration = Duration::from_secs(2);
    const BLOCK: Duration = Duration::from_secs(3600);

    fn pool(hosts: &[&str]) -> ProxyPool {
        let proxies = hosts
            .iter()
            .enumerate()
            .map(|(i, h)| ProxyInfo::new(*h, 8080 + i as u16))
            .collect();
        ProxyPool::new(proxies, INTERVAL, BLOCK)
    }

    #[test]
    fn test_acquire_scans_in_load_order() {
        let pool = pool(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let now = Instant::now();

        assert_eq!(pool.acquire_at(now).unwrap().ip(), "10.0.0.1");
        assert_eq!(pool.acquire_at(now).unwrap().ip(), "10.0.0.2");
        assert_eq!(pool.acquire_at(now).unwrap().ip(), "10.0.0.3");
        assert!(pool.acquire_at(now).is_none());
    }

    #[test]
    fn test_cooldown_expires() {
        let pool = pool(&["10.0.0.1"]);
        let start = Instant::now();

        assert!(pool.acquire_at(start).is_some());
        assert!(pool.acquire_at(start + Duration::from_millis(1999)).is_none());
        assert!(pool.acquire_at(start + INTERVAL).is_some());
    }

    #[test]
    fn test_block_outlasts_cooldown() {
        let pool = pool(&["10.0.0.1"]);
        let start = Instant::now();

        let handle = pool.acquire_at(start).unwrap();
        pool.mark_blocked_at(&handle, start);

        assert!(pool.acquire_at(start + Duration::from_secs(3)).is_none());
        assert!(pool.acquire_at(start + Duration::from_secs(3599)).is_none());
        assert!(pool.acquire_at(start + BLOCK).is_some());
    }

    #[test]
    fn test_blocked_ip_skipped_for_next_one() {
        let pool = pool(&["10.0.0.1", "10.0.0.2"]);
        let start = Instant::now();

        let first = pool.acquire_at(start).unwrap();
        pool.mark_blocked_at(&first, start);
        pool.release(first);

        let next = pool.acquire_at(start + Duration::from_secs(5)).unwrap();
        assert_eq!(next.ip(), "10.0.0.2");
    }

    #[test]
    fn test_release_allows_early_reuse() {
        let pool = pool(&["10.0.0.1"]);
        let start = Instant::now();

        let handle = pool.acquire_at(start).unwrap();
        pool.release(handle);
        assert!(pool.acquire_at(start + Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_stale_release_keeps_newer_reservation() {
        let pool = pool(&["10.0.0.1"]);
        let start = Instant::now();

        let old = pool.acquire_at(start).unwrap();
        let later = start + Duration::from_secs(3);
        let _current = pool.acquire_at(later).unwrap();

        pool.release(old);
        assert!(pool.acquire_at(later + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_same_host_shares_state() {
        let proxies = vec![ProxyInfo::new("10.0.0.1", 8080), ProxyInfo::new("10.0.0.1", 8081)];
        let pool = ProxyPool::new(proxies, INTERVAL, BLOCK);
        let now = Instant::now();

        assert!(pool.acquire_at(now).is_some());
        assert!(pool.acquire_at(now).is_none());
    }

    #[test]
    fn test_empty_pool_is_exhausted() {
        let pool = ProxyPool::new(Vec::new(), INTERVAL, BLOCK);
        assert!(pool.is_empty());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_concurrent_acquire_hands_out_once() {
        let pool = Arc::new(pool(&["10.0.0.1"]));

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    scope.spawn(move || pool.acquire().is_some() as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(winners, 1);
    }

    #[test]
    fn test_status_counts() {
        let pool = pool(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let first = pool.acquire().unwrap();
        pool.mark_blocked(&first);
        let _second = pool.acquire().unwrap();

        let status = pool.status();
        assert_eq!(status.total, 3);
        assert_eq!(status.blocked, 1);
        assert_eq!(status.cooling_down, 2);
        assert!(pool.is_blocked("10.0.0.1"));
        assert!(!pool.is_blocked("10.0.0.3"));
    }
}
