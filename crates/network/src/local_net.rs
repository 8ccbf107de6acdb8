//! Local network catalog
//!
//! Snapshot of this host's interface addresses, taken once when the process
//! context first needs it. Answers "is this address mine?" for the
//! self-peering check and "is this address on my segment?" for the
//! local-peering policy. Interfaces that are down or point-to-point never
//! count toward the local segment.

use std::net::{IpAddr, Ipv4Addr};

use tracing::{info, trace};

use crate::error::{MeshError, Result};

/// One address of one interface, with the flags the catalog filters on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEntry {
    pub name: String,
    pub addr: IpAddr,
    pub up: bool,
    pub point_to_point: bool,
}

impl InterfaceEntry {
    /// An address on an interface that is up and not point-to-point.
    pub fn new(name: impl Into<String>, addr: IpAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            up: true,
            point_to_point: false,
        }
    }

    pub fn down(mut self) -> Self {
        self.up = false;
        self
    }

    pub fn point_to_point(mut self) -> Self {
        self.point_to_point = true;
        self
    }
}

/// Interface addresses of the local host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalNetworkCatalog {
    /// IPv4 addresses of interfaces that are up, not loopback and not
    /// point-to-point.
    local_net: Vec<Ipv4Addr>,
    /// Every address of every interface, loopback included.
    host_addrs: Vec<IpAddr>,
    interfaces: Vec<(String, IpAddr)>,
}

impl LocalNetworkCatalog {
    /// Enumerate the host's interfaces.
    ///
    /// Failure is fatal for node construction: there is no safe partial
    /// catalog to fall back to.
    pub fn discover() -> Result<Self> {
        let interfaces = netdev::get_interfaces();
        if interfaces.is_empty() {
            return Err(MeshError::InterfaceEnumeration(
                "no network interfaces reported".to_string(),
            ));
        }

        let mut entries = Vec::new();
        for iface in &interfaces {
            let addrs = iface
                .ipv4
                .iter()
                .map(|net| IpAddr::V4(net.addr()))
                .chain(iface.ipv6.iter().map(|net| IpAddr::V6(net.addr())));
            for addr in addrs {
                entries.push(InterfaceEntry {
                    name: iface.name.clone(),
                    addr,
                    up: iface.is_up(),
                    point_to_point: iface.is_point_to_point(),
                });
            }
        }
        let catalog = Self::from_interfaces(entries);
        info!("local net: {:?}", catalog.local_net);
        Ok(catalog)
    }

    pub fn from_interfaces(entries: impl IntoIterator<Item = InterfaceEntry>) -> Self {
        let mut local_net = Vec::new();
        let mut host_addrs = Vec::new();
        let mut interfaces = Vec::new();
        for entry in entries {
            let (name, ip) = (&entry.name, entry.addr);
            if !host_addrs.contains(&ip) {
                host_addrs.push(ip);
            }
            match ip {
                IpAddr::V4(v4) if v4.is_loopback() => {
                    trace!("skip loopback address {} on {}", v4, name);
                }
                IpAddr::V4(v4) if !entry.up => trace!("skip {} on down interface {}", v4, name),
                IpAddr::V4(v4) if entry.point_to_point => {
                    trace!("skip {} on point-to-point interface {}", v4, name);
                }
                IpAddr::V4(v4) => {
                    if !local_net.contains(&v4) {
                        local_net.push(v4);
                    }
                }
                IpAddr::V6(_) => trace!("skip non-ipv4 address {} on {}", ip, name),
            }
            interfaces.push((entry.name, ip));
        }

        Self {
            local_net,
            host_addrs,
            interfaces,
        }
    }

    /// True when `ip` is one of this host's non-loopback IPv4 addresses.
    pub fn is_local_address(&self, ip: IpAddr) -> bool {
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => return false,
            },
        };
        self.local_net.iter().any(|addr| *addr == v4)
    }

    /// True when `ip` belongs to any interface of this host.
    pub fn is_host_address(&self, ip: IpAddr) -> bool {
        self.host_addrs.contains(&ip)
    }

    pub fn local_net(&self) -> &[Ipv4Addr] {
        &self.local_net
    }

    /// IPv4 addresses bound to the interface called `name`, or `None` if the
    /// host has no such interface.
    pub fn interface_addresses(&self, name: &str) -> Option<Vec<Ipv4Addr>> {
        let mut found = false;
        let mut addrs = Vec::new();
        for (iface, ip) in &self.interfaces {
            if iface != name {
                continue;
            }
            found = true;
            match ip {
                IpAddr::V4(v4) => addrs.push(*v4),
                IpAddr::V6(_) => trace!("skip non-ipv4 address {} on {}", ip, name),
            }
        }
        found.then_some(addrs)
    }
}
