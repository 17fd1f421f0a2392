//! DNS blacklist probe.
//!
//! An address is blacklisted when the reversed-octet hostname under any
//! configured zone resolves. Resolution goes through [`HostResolver`] so
//! the check can be exercised without real DNS.

use async_trait::async_trait;
use std::net::Ipv4Addr;

#[async_trait]
pub trait HostResolver: Send + Sync {
    /// True when `host` resolves to at least one address.
    async fn resolves(&self, host: &str) -> bool;
}

/// System resolver via tokio's getaddrinfo wrapper.
pub struct TokioResolver;

#[async_trait]
impl HostResolver for TokioResolver {
    async fn resolves(&self, host: &str) -> bool {
        tokio::net::lookup_host((host, 0))
            .await
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false)
    }
}

/// Check `ip` against every zone in the comma-separated `zones` list.
pub async fn is_blacklisted(resolver: &dyn HostResolver, zones: &str, ip: Ipv4Addr) -> bool {
    let [a, b, c, d] = ip.octets();
    let reversed = format!("{d}.{c}.{b}.{a}");
    for zone in zones.split(',') {
        let zone = zone.trim();
        if zone.is_empty() {
            continue;
        }
        let host = format!("{reversed}.{zone}");
        if resolver.resolves(&host).await {
            tracing::info!("[dnsbl] [blacklisted] ip={} zone={}", ip, zone);
            return true;
        }
    }
    false
}
