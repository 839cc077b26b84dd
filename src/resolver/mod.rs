//! Target address resolution under a preferred IP protocol with optional fallback.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, timeout_at};
use tracing::{error, info};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::IpProtocol;
use crate::error::ProbeError;

/// Which record types a lookup asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
    Any,
}

impl From<IpProtocol> for AddressFamily {
    fn from(protocol: IpProtocol) -> Self {
        match protocol {
            IpProtocol::Ip4 => AddressFamily::V4,
            IpProtocol::Ip6 => AddressFamily::V6,
        }
    }
}

/// Name lookup backend.
#[async_trait]
pub trait HostLookup: Send + Sync {
    /// Returns the addresses of `host` in resolver order.
    async fn lookup(&self, host: &str, family: AddressFamily) -> Result<Vec<IpAddr>, ProbeError>;
}

#[async_trait]
impl HostLookup for TokioAsyncResolver {
    async fn lookup(&self, host: &str, family: AddressFamily) -> Result<Vec<IpAddr>, ProbeError> {
        let addrs: Vec<IpAddr> = match family {
            AddressFamily::V4 => self
                .ipv4_lookup(host)
                .await
                .map_err(|e| ProbeError::resolution(host, e.to_string()))?
                .iter()
                .map(|a| IpAddr::V4(a.0))
                .collect(),
            AddressFamily::V6 => self
                .ipv6_lookup(host)
                .await
                .map_err(|e| ProbeError::resolution(host, e.to_string()))?
                .iter()
                .map(|aaaa| IpAddr::V6(aaaa.0))
                .collect(),
            AddressFamily::Any => self
                .lookup_ip(host)
                .await
                .map_err(|e| ProbeError::resolution(host, e.to_string()))?
                .iter()
                .collect(),
        };
        Ok(addrs)
    }
}

/// A resolved target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddr {
    pub ip: IpAddr,
    /// Protocol of `ip`, which differs from the preferred one after a fallback.
    pub protocol: IpProtocol,
}

impl ResolvedAddr {
    fn new(ip: IpAddr) -> Self {
        let protocol = if ip.is_ipv4() {
            IpProtocol::Ip4
        } else {
            IpProtocol::Ip6
        };
        Self { ip, protocol }
    }

    /// Stable hash of the address bytes, exported to detect address changes between probes.
    pub fn hash(&self) -> f64 {
        ip_hash(&self.ip)
    }
}

/// Result of [`ProtocolResolver::resolve`]. `elapsed` is reported on success and failure alike.
#[derive(Debug)]
pub struct LookupOutcome {
    pub elapsed: Duration,
    pub result: Result<ResolvedAddr, ProbeError>,
}

pub struct ProtocolResolver {
    lookup: Arc<dyn HostLookup>,
}

impl ProtocolResolver {
    pub fn new(lookup: Arc<dyn HostLookup>) -> Self {
        Self { lookup }
    }

    pub fn lookup(&self) -> Arc<dyn HostLookup> {
        self.lookup.clone()
    }

    pub async fn resolve(
        &self,
        target: &str,
        preferred: Option<IpProtocol>,
        fallback_allowed: bool,
        deadline: Instant,
    ) -> LookupOutcome {
        let start = Instant::now();

        if let Some(ip) = parse_ip_literal(target) {
            return LookupOutcome {
                elapsed: start.elapsed(),
                result: Ok(ResolvedAddr::new(ip)),
            };
        }

        let preferred = preferred.unwrap_or(IpProtocol::Ip6);
        info!(host = target, ip_protocol = %preferred, "Resolving target address");

        let result = match timeout_at(deadline, self.pick(target, preferred, fallback_allowed)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProbeError::resolution(target, "lookup timed out")),
        };
        let elapsed = start.elapsed();

        match &result {
            Ok(resolved) => {
                info!(host = target, ip = %resolved.ip, "Resolved target address");
            }
            Err(e) => {
                error!(host = target, ip_protocol = %preferred, err = %e, "Resolution with IP protocol failed");
            }
        }

        LookupOutcome { elapsed, result }
    }

    async fn pick(
        &self,
        target: &str,
        preferred: IpProtocol,
        fallback_allowed: bool,
    ) -> Result<ResolvedAddr, ProbeError> {
        if !fallback_allowed {
            let addrs = self.lookup.lookup(target, preferred.into()).await?;
            return addrs
                .into_iter()
                .find(|ip| preferred.matches(ip))
                .map(ResolvedAddr::new)
                .ok_or_else(|| {
                    ProbeError::resolution(target, format!("no {preferred} address found"))
                });
        }

        let addrs = self.lookup.lookup(target, AddressFamily::Any).await?;
        let mut fallback = None;
        for ip in addrs {
            if preferred.matches(&ip) {
                return Ok(ResolvedAddr::new(ip));
            }
            fallback.get_or_insert(ip);
        }
        fallback
            .map(ResolvedAddr::new)
            .ok_or_else(|| ProbeError::resolution(target, "unable to find ip; no fallback"))
    }
}

/// Accepts `203.0.113.5`, `2001:db8::1` and the bracketed `[2001:db8::1]`.
pub fn parse_ip_literal(target: &str) -> Option<IpAddr> {
    let trimmed = target
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .unwrap_or(target);
    trimmed.parse().ok()
}

/// FNV-1a (32 bit) over the 4 or 16 address bytes.
pub fn ip_hash(ip: &IpAddr) -> f64 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let bytes: Vec<u8> = match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    let hash = bytes
        .iter()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u32::from(*byte)).wrapping_mul(PRIME));
    f64::from(hash)
}
