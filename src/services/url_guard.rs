//! Outbound URL policy for article fetches.
//!
//! A URL is fetchable when its scheme is http or https and every address
//! its host resolves to sits outside private, loopback, link-local,
//! metadata-service and other non-public ranges. The same check runs on
//! every redirect hop and inside the HTTP client's DNS resolver, so a host
//! that changes its answer between the check and the connect is still
//! refused before a socket opens.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ipnet::IpNet;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use url::{Host, Url};

use crate::error::{AppError, Result};

const BLOCKED_RANGES: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10", // carrier-grade NAT
    "127.0.0.0/8",
    "169.254.0.0/16", // link-local, cloud metadata
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "::/128",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "metadata.google.internal",
    "metadata.gke.internal",
    "instance-data",
];

/// Refusal raised inside the HTTP client, from the redirect policy or the
/// DNS resolver, where errors travel boxed. The fetcher turns it back into
/// [`AppError::Blocked`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Refused(pub String);

impl From<AppError> for Refused {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Blocked(reason) => Refused(reason),
            other => Refused(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UrlGuard {
    blocked_ranges: Arc<Vec<IpNet>>,
    blocked_hosts: Arc<HashSet<String>>,
}

impl Default for UrlGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlGuard {
    pub fn new() -> Self {
        Self {
            blocked_ranges: Arc::new(
                BLOCKED_RANGES
                    .iter()
                    .filter_map(|cidr| cidr.parse().ok())
                    .collect(),
            ),
            blocked_hosts: Arc::new(BLOCKED_HOSTS.iter().map(|h| h.to_string()).collect()),
        }
    }

    /// Same policy with loopback reachable, for fetches against a local server.
    #[cfg(test)]
    pub(crate) fn allowing_loopback() -> Self {
        let guard = Self::new();
        let loopback = IpAddr::from([127, 0, 0, 1]);
        let ranges = guard
            .blocked_ranges
            .iter()
            .filter(|net| !net.contains(&loopback))
            .cloned()
            .collect();
        Self {
            blocked_ranges: Arc::new(ranges),
            ..guard
        }
    }

    pub fn check_ip(&self, ip: IpAddr) -> Result<()> {
        // ::ffff:a.b.c.d is judged as the IPv4 address it wraps
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        if self.blocked_ranges.iter().any(|net| net.contains(&ip)) {
            return Err(AppError::Blocked(format!("{ip} is in a non-public range")));
        }
        Ok(())
    }

    /// Checks that need no DNS: scheme, host presence, known internal
    /// host names and literal IP hosts.
    pub fn check_url(&self, url: &Url) -> Result<()> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::Blocked(format!(
                "scheme {:?} is not http or https",
                url.scheme()
            )));
        }
        match url.host() {
            None => Err(AppError::Blocked(format!("{url} has no host"))),
            Some(Host::Ipv4(ip)) => self.check_ip(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => self.check_ip(IpAddr::V6(ip)),
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if self.blocked_hosts.contains(&domain) || domain.ends_with(".localhost") {
                    return Err(AppError::Blocked(format!("host {domain} is internal")));
                }
                Ok(())
            }
        }
    }

    /// [`UrlGuard::check_url`] plus a DNS lookup; every resolved address
    /// must pass.
    pub async fn check_resolved(&self, url: &Url) -> Result<()> {
        self.check_url(url)?;
        let Some(Host::Domain(domain)) = url.host() else {
            return Ok(());
        };
        let port = url.port_or_known_default().unwrap_or(80);
        let addrs = tokio::net::lookup_host((domain, port))
            .await
            .map_err(|e| AppError::ExternalService(format!("DNS lookup for {domain} failed: {e}")))?;

        let mut resolved = false;
        for addr in addrs {
            resolved = true;
            self.check_ip(addr.ip())
                .map_err(|e| AppError::Blocked(format!("{domain} resolves to {}: {e}", addr.ip())))?;
        }
        if !resolved {
            return Err(AppError::ExternalService(format!("{domain} did not resolve")));
        }
        Ok(())
    }

    /// A DNS resolver for the HTTP client that refuses blocked answers.
    pub fn resolver(&self) -> Arc<GuardedResolver> {
        Arc::new(GuardedResolver {
            guard: self.clone(),
        })
    }
}

pub struct GuardedResolver {
    guard: UrlGuard,
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let guard = self.guard.clone();
        Box::pin(async move {
            let host = name.as_str().to_string();
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await?
                .collect();
            for addr in &addrs {
                if let Err(e) = guard.check_ip(addr.ip()) {
                    let Refused(reason) = Refused::from(e);
                    let refused = Refused(format!("{host} resolves to {}: {reason}", addr.ip()));
                    return Err(Box::new(refused) as Box<dyn std::error::Error + Send + Sync>);
                }
            }
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok(addrs)
        })
    }
}
