//! DNS block/allow list probing.
//!
//! A listing is an A record under `<reversed-octets>.<zone>`. Probing is
//! sequential and stops at the first hit; whitelist zones are exhausted
//! before any blacklist zone is queried, so an allow-listing short-circuits
//! the block lists. Resolution failures on a zone count as "not listed".

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveError;
use hickory_resolver::TokioAsyncResolver;
use log::{debug, trace};

/// Which kind of list produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    White,
    Black,
}

impl std::fmt::Display for ListKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListKind::White => write!(f, "white"),
            ListKind::Black => write!(f, "black"),
        }
    }
}

/// The first positive listing found for a client IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsVerdict {
    pub list_type: ListKind,
    /// Zone that answered, e.g. `zen.spamhaus.org`.
    pub list_name: String,
    /// Comma-joined A record values returned by the zone.
    pub list_value: String,
}

/// Minimal resolver surface the prober needs; lets tests substitute a stub.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup_ipv4(&self, name: &str) -> Result<Vec<Ipv4Addr>, ResolveError>;
}

#[async_trait]
impl Resolve for TokioAsyncResolver {
    async fn lookup_ipv4(&self, name: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
        Ok(self
            .ipv4_lookup(name)
            .await?
            .iter()
            .map(|record| record.0)
            .collect())
    }
}

/// Probes DNSxL zones for one client IP at a time.
pub struct DnsListProber {
    resolver: Arc<dyn Resolve>,
}

impl DnsListProber {
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        DnsListProber { resolver }
    }

    /// Builds a prober over the system resolver configuration, falling
    /// back to the library defaults when none can be read.
    pub fn from_system() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
            debug!("system resolver configuration unavailable ({err}), using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        DnsListProber::new(Arc::new(resolver))
    }

    /// Checks `ip` against the configured zones, whitelists first.
    ///
    /// Returns the first positive verdict, or `None` when the IP is not
    /// listed anywhere, is IPv6, or is private/reserved (those bypass all
    /// list checks).
    pub async fn check(
        &self,
        ip: IpAddr,
        whitelists: &[String],
        blacklists: &[String],
    ) -> Option<DnsVerdict> {
        let IpAddr::V4(v4) = ip else {
            return None;
        };
        if bypasses_lists(v4) {
            trace!("{v4} is private/reserved, skipping DNS list checks");
            return None;
        }

        for (kind, zones) in [(ListKind::White, whitelists), (ListKind::Black, blacklists)] {
            for zone in zones {
                let name = query_name(v4, zone);
                match self.resolver.lookup_ipv4(&name).await {
                    Ok(addresses) if !addresses.is_empty() => {
                        let value = addresses
                            .iter()
                            .map(|a| a.to_string())
                            .collect::<Vec<_>>()
                            .join(",");
                        debug!("{v4} listed by {zone} as {value}");
                        return Some(DnsVerdict {
                            list_type: kind,
                            list_name: zone.clone(),
                            list_value: value,
                        });
                    }
                    Ok(_) => trace!("{v4} not listed by {zone}"),
                    // Any resolution failure on a zone means "not listed".
                    Err(err) => trace!("{zone} lookup for {v4} failed: {err}"),
                }
            }
        }
        None
    }
}

/// The reversed-octet query name for `ip` under `zone`, fully qualified
/// so resolver search domains never apply.
fn query_name(ip: Ipv4Addr, zone: &str) -> String {
    let o = ip.octets();
    format!("{}.{}.{}.{}.{}.", o[3], o[2], o[1], o[0], zone.trim_end_matches('.'))
}

/// Private and reserved source ranges that bypass all list checks:
/// 127/8, 10/8, 172.16/12, 192.168/16, 169.254/16, and 192.0.2/24.
fn bypasses_lists(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    ip.is_loopback()
        || o[0] == 10
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
        || (o[0] == 169 && o[1] == 254)
        || (o[0] == 192 && o[1] == 0 && o[2] == 2)
}
