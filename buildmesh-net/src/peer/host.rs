//! Host introspection for building the local advertisement.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use super::hardware;
use super::info::{PeerFlags, PeerInfo};

const HOSTNAME_SOURCES: &[&str] = &["/proc/sys/kernel/hostname", "/etc/hostname"];

/// Upper bound on each DNS query made while describing the host.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Build the advertisement for this machine.
///
/// `advertise_ips`, when non-empty, replaces the detected addresses.
pub async fn describe_local(flags: PeerFlags, advertise_ips: &[IpAddr]) -> PeerInfo {
    let host = hostname().await;
    let ips = if advertise_ips.is_empty() {
        local_ips(&host).await
    } else {
        advertise_ips.to_vec()
    };
    let domain = match ips.first() {
        Some(ip) => reverse_domain(*ip).await.unwrap_or_default(),
        None => String::new(),
    };

    let mut info = PeerInfo::new(host, ips, flags);
    info.domain = domain;
    info.hardware = hardware::survey().await;

    tracing::debug!(
        host = %info.host,
        domain = %info.domain,
        ips = ?info.ips,
        "Described local host"
    );
    info
}

/// Short hostname of this machine.
pub async fn hostname() -> String {
    for path in HOSTNAME_SOURCES {
        if let Ok(text) = tokio::fs::read_to_string(path).await {
            let name = text.trim();
            if !name.is_empty() {
                return short_name(name).to_string();
            }
        }
    }
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .map(|name| short_name(&name).to_string())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Non-loopback addresses of this machine.
///
/// Resolves the hostname first; falls back to the address the kernel would
/// route outbound traffic from.
pub async fn local_ips(host: &str) -> Vec<IpAddr> {
    let mut ips = match timeout(LOOKUP_TIMEOUT, tokio::net::lookup_host((host, 0))).await {
        Ok(Ok(addrs)) => filter_routable(addrs.map(|addr| addr.ip())),
        Ok(Err(e)) => {
            tracing::debug!(host, error = %e, "Hostname lookup failed");
            Vec::new()
        }
        Err(_) => Vec::new(),
    };

    if ips.is_empty() {
        if let Some(ip) = outbound_ip().await {
            ips.push(ip);
        }
    }
    ips
}

/// Domain part of the reverse-DNS name of `ip`, if any.
pub async fn reverse_domain(ip: IpAddr) -> Option<String> {
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    let lookup = match timeout(LOOKUP_TIMEOUT, resolver.reverse_lookup(ip)).await {
        Ok(Ok(lookup)) => lookup,
        Ok(Err(e)) => {
            tracing::debug!(%ip, error = %e, "Reverse lookup failed");
            return None;
        }
        Err(_) => {
            tracing::debug!(%ip, "Reverse lookup timed out");
            return None;
        }
    };
    let name = lookup.iter().next()?.to_string();
    domain_of(&name)
}

async fn outbound_ip() -> Option<IpAddr> {
    // Connecting a UDP socket sends nothing; it only selects a route.
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .await
        .ok()?;
    socket
        .connect(SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 9)))
        .await
        .ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

fn filter_routable(ips: impl Iterator<Item = IpAddr>) -> Vec<IpAddr> {
    let mut out: Vec<IpAddr> = ips
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn short_name(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

fn domain_of(fqdn: &str) -> Option<String> {
    let fqdn = fqdn.trim_end_matches('.');
    let (_, domain) = fqdn.split_once('.')?;
    (!domain.is_empty()).then(|| domain.to_string())
}
