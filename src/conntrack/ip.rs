use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use strum_macros::Display;

// Network scope of an IP address, from most to least local.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Default, PartialOrd, Ord,
)]
pub enum IpScope {
    #[default]
    Invalid,
    HostLocal,
    LinkLocal,
    SiteLocal,
    LocalMulticast,
    GlobalMulticast,
    Global,
}

impl IpScope {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                if v4.is_unspecified() {
                    IpScope::Invalid
                } else if v4.is_loopback() {
                    IpScope::HostLocal
                } else if v4.is_link_local() {
                    IpScope::LinkLocal
                } else if v4.is_private() {
                    IpScope::SiteLocal
                } else if v4.is_broadcast() {
                    IpScope::LocalMulticast
                } else if v4.is_multicast() {
                    // 224.0.0.0/24 and 239.0.0.0/8 do not leave the local network.
                    if (octets[0] == 224 && octets[1] == 0 && octets[2] == 0) || octets[0] == 239 {
                        IpScope::LocalMulticast
                    } else {
                        IpScope::GlobalMulticast
                    }
                } else {
                    IpScope::Global
                }
            }
            IpAddr::V6(v6) => {
                let segments = v6.segments();
                if v6.is_unspecified() {
                    IpScope::Invalid
                } else if v6.is_loopback() {
                    IpScope::HostLocal
                } else if (segments[0] & 0xffc0) == 0xfe80 {
                    IpScope::LinkLocal
                } else if (segments[0] & 0xfe00) == 0xfc00 {
                    IpScope::SiteLocal
                } else if (segments[0] & 0xff00) == 0xff00 {
                    // Multicast scope field: interface- up to site-local stays local.
                    if (segments[0] & 0x000f) <= 0x5 {
                        IpScope::LocalMulticast
                    } else {
                        IpScope::GlobalMulticast
                    }
                } else {
                    IpScope::Global
                }
            }
        }
    }

    pub fn is_localhost(&self) -> bool {
        matches!(self, IpScope::HostLocal)
    }

    pub fn is_lan(&self) -> bool {
        matches!(
            self,
            IpScope::LinkLocal | IpScope::SiteLocal | IpScope::LocalMulticast
        )
    }

    pub fn is_global(&self) -> bool {
        matches!(self, IpScope::Global | IpScope::GlobalMulticast)
    }
}
