//! In-memory per-IP sliding-window rate limiter
//!
//! Auth endpoints only: login 5 per 15 minutes, refresh 10 per 15 minutes.
//! The key defaults to the transport remote address; `X-Forwarded-For` is
//! honoured only when `trust_proxy` is set in config. Exceeding a window
//! yields 429 with `Retry-After`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const WINDOW: Duration = Duration::from_secs(15 * 60);
pub const LOGIN_LIMIT: usize = 5;
pub const REFRESH_LIMIT: usize = 10;

/// Sliding window limiter keyed by (endpoint class, client IP)
pub struct RateLimiter {
    windows: Mutex<HashMap<(&'static str, IpAddr), Vec<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit and enforce the limit for the class
    pub fn check(&self, class: &'static str, ip: IpAddr, limit: usize) -> Result<()> {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| Error::Internal("rate limiter poisoned".to_string()))?;

        let hits = windows.entry((class, ip)).or_default();
        hits.retain(|t| now.duration_since(*t) < WINDOW);

        if hits.len() >= limit {
            let oldest = hits.first().copied().unwrap_or(now);
            let retry_after = WINDOW
                .saturating_sub(now.duration_since(oldest))
                .as_secs()
                .max(1);
            return Err(Error::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        hits.push(now);
        Ok(())
    }

    /// Drop windows with no recent hits; called opportunistically
    pub fn prune(&self) {
        let now = Instant::now();
        if let Ok(mut windows) = self.windows.lock() {
            windows.retain(|_, hits| {
                hits.retain(|t| now.duration_since(*t) < WINDOW);
                !hits.is_empty()
            });
        }
    }
}

/// Resolve the client IP for rate limiting.
///
/// The transport remote address is authoritative unless the deployment
/// explicitly trusts its reverse proxy.
#[must_use]
pub fn client_ip(
    remote: IpAddr,
    forwarded_for: Option<&str>,
    trust_proxy: bool,
) -> IpAddr {
    if !trust_proxy {
        return remote;
    }
    forwarded_for
        .and_then(|header| header.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or(remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn limit_is_enforced_per_ip() {
        let limiter = RateLimiter::new();
        for _ in 0..LOGIN_LIMIT {
            limiter.check("login", ip(1), LOGIN_LIMIT).unwrap();
        }
        let err = limiter.check("login", ip(1), LOGIN_LIMIT).unwrap_err();
        match err {
            Error::RateLimited { retry_after_secs } => assert!(retry_after_secs >= 1),
            other => panic!("unexpected {other:?}"),
        }
        // A different IP is unaffected
        limiter.check("login", ip(2), LOGIN_LIMIT).unwrap();
    }

    #[test]
    fn classes_do_not_share_windows() {
        let limiter = RateLimiter::new();
        for _ in 0..LOGIN_LIMIT {
            limiter.check("login", ip(1), LOGIN_LIMIT).unwrap();
        }
        // Refresh still has headroom for the same IP
        limiter.check("refresh", ip(1), REFRESH_LIMIT).unwrap();
    }

    #[test]
    fn forwarded_header_ignored_without_trust() {
        let remote = ip(1);
        let resolved = client_ip(remote, Some("192.168.1.50"), false);
        assert_eq!(resolved, remote);
    }

    #[test]
    fn forwarded_header_used_with_trust() {
        let remote = ip(1);
        let resolved = client_ip(remote, Some("192.168.1.50, 10.0.0.9"), true);
        assert_eq!(resolved, "192.168.1.50".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn malformed_forwarded_header_falls_back() {
        let remote = ip(1);
        assert_eq!(client_ip(remote, Some("not-an-ip"), true), remote);
        assert_eq!(client_ip(remote, None, true), remote);
    }

    #[test]
    fn prune_clears_empty_windows() {
        let limiter = RateLimiter::new();
        limiter.check("login", ip(1), LOGIN_LIMIT).unwrap();
        limiter.prune();
        // Entry still present because the hit is recent
        assert_eq!(limiter.windows.lock().unwrap().len(), 1);
    }
}
