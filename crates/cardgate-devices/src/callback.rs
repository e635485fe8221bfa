//! Callback address of this gateway as seen from a device.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;

use crate::registry::DeviceConfig;

const SCHEME: &str = "cetp";

/// IPv4 prefix length treated as "same subnet".
pub const SAME_SUBNET_PREFIX: u32 = 24;

/// Where a device pushes its events, `cetp://<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallbackAddress {
    pub host: String,
    pub port: u16,
}

impl CallbackAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn uri(&self) -> String {
        self.to_string()
    }

    /// Whether a remote `eventTo` value points at this address.
    ///
    /// The scheme and path are optional. A value without a port matches on
    /// host alone.
    pub fn matches(&self, event_to: &str) -> bool {
        match split_host_port(event_to) {
            Some((host, port)) => {
                host.eq_ignore_ascii_case(&self.host) && port.map_or(true, |p| p == self.port)
            }
            None => false,
        }
    }
}

impl fmt::Display for CallbackAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", SCHEME, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", SCHEME, self.host, self.port)
        }
    }
}

fn split_host_port(event_to: &str) -> Option<(&str, Option<u16>)> {
    let rest = event_to
        .split_once("://")
        .map_or(event_to, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest).trim();
    if authority.is_empty() {
        return None;
    }

    if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port.parse().ok()?),
            None => None,
        };
        return Some((host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Some((host, Some(port.parse().ok()?))),
        Some(_) => Some((authority, None)),
        None => Some((authority, None)),
    }
}

/// Determines the callback address for a device.
#[async_trait]
pub trait CallbackResolver: Send + Sync {
    /// `None` when no usable address exists; the device is skipped.
    async fn resolve(&self, device: &DeviceConfig) -> Option<CallbackAddress>;
}

/// Picks the local address routed toward the device when it shares the
/// device's /24, otherwise the configured fallback host.
#[derive(Debug, Clone, Default)]
pub struct SubnetResolver {
    fallback: Option<String>,
}

impl SubnetResolver {
    pub fn new(fallback: Option<String>) -> Self {
        Self { fallback }
    }

    async fn local_route_to(host: &str, port: u16) -> Option<(IpAddr, IpAddr)> {
        let remote: SocketAddr = lookup_host((host, port)).await.ok()?.next()?;
        let bind = if remote.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await.ok()?;
        // Connecting a UDP socket only selects a route, nothing is sent.
        socket.connect(remote).await.ok()?;
        let local = socket.local_addr().ok()?;
        Some((local.ip(), remote.ip()))
    }
}

/// Whether two addresses share the same IPv4 /24.
pub fn same_subnet(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            let mask = u32::MAX << (32 - SAME_SUBNET_PREFIX);
            (u32::from(a) & mask) == (u32::from(b) & mask)
        }
        _ => false,
    }
}

#[async_trait]
impl CallbackResolver for SubnetResolver {
    async fn resolve(&self, device: &DeviceConfig) -> Option<CallbackAddress> {
        if let Some((local, remote)) = Self::local_route_to(device.host(), device.port()).await {
            if same_subnet(local, remote) {
                return Some(CallbackAddress::new(local.to_string(), device.port()));
            }
            debug!(device = %device.key(), local = %local, "No local address on the device subnet");
        }
        self.fallback
            .as_ref()
            .map(|host| CallbackAddress::new(host.clone(), device.port()))
    }
}
