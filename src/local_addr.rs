//! Which addresses are this node, so PONG advertisements never loop back to us.

use anyhow::{Context, Result};
use log::debug;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

pub trait LocalAddrs {
    fn is_local(&self, ip: Ipv4Addr, port: u16) -> bool;
}

#[derive(Debug, Clone)]
pub struct InterfaceAddrs {
    ips: HashSet<Ipv4Addr>,
    port: u16,
}

impl InterfaceAddrs {
    pub fn new(ips: impl IntoIterator<Item = Ipv4Addr>, port: u16) -> Self {
        Self { ips: ips.into_iter().collect(), port }
    }

    /// Every IPv4 interface address of this host plus `extra` (listen or
    /// advertise addresses), bound to our listening `port`.
    pub fn discover(port: u16, extra: impl IntoIterator<Item = Ipv4Addr>) -> Result<Self> {
        let ifaces = local_ip_address::list_afinet_netifas().context("failed to enumerate network interfaces")?;
        let mut ips: HashSet<Ipv4Addr> = ifaces
            .into_iter()
            .filter_map(|(name, ip)| match ip {
                IpAddr::V4(v4) => {
                    debug!("🔌 Interface {} has {}", name, v4);
                    Some(v4)
                }
                IpAddr::V6(_) => None,
            })
            .collect();
        ips.insert(Ipv4Addr::LOCALHOST);
        ips.extend(extra.into_iter().filter(|ip| !ip.is_unspecified()));
        Ok(Self { ips, port })
    }

    /// A routable address of this host: the lowest non-loopback one, or
    /// loopback when there is nothing else.
    pub fn primary(&self) -> Ipv4Addr {
        self.ips
            .iter()
            .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
            .min()
            .copied()
            .unwrap_or(Ipv4Addr::LOCALHOST)
    }
}

impl LocalAddrs for InterfaceAddrs {
    fn is_local(&self, ip: Ipv4Addr, port: u16) -> bool {
        port == self.port && (ip.is_unspecified() || self.ips.contains(&ip))
    }
}
