use crate::conntrack::ip::IpScope;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

// The remote peer of a connection. The domain and CNAME chain start
// empty and are backfilled once correlated DNS context is discovered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub ip: Option<IpAddr>,
    pub protocol: u8,
    pub port: u16,
    pub domain: String,
    pub cnames: Vec<String>,
    pub ip_scope: IpScope,
}

impl Entity {
    pub fn new(ip: Option<IpAddr>, port: u16, protocol: u8) -> Self {
        let ip_scope = match &ip {
            Some(ip) => IpScope::of(ip),
            None => IpScope::Invalid,
        };
        Self {
            ip,
            protocol,
            port,
            domain: String::new(),
            cnames: Vec::new(),
            ip_scope,
        }
    }

    pub fn from_domain(domain: &str, cnames: Vec<String>) -> Self {
        Self {
            ip: None,
            protocol: 0,
            port: 0,
            domain: domain.to_string(),
            cnames,
            // DNS requests go to the wider internet unless proven otherwise.
            ip_scope: IpScope::Global,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_scope_derivation() {
        let entity = Entity::new(Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))), 443, 6);
        assert_eq!(entity.ip_scope, IpScope::Global);
        assert!(entity.domain.is_empty());

        let local = Entity::new(Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))), 22, 6);
        assert_eq!(local.ip_scope, IpScope::SiteLocal);
    }

    #[test]
    fn test_from_domain() {
        let entity = Entity::from_domain("example.com", vec!["cdn.example.net".to_string()]);
        assert_eq!(entity.domain, "example.com");
        assert_eq!(entity.ip_scope, IpScope::Global);
        assert!(entity.ip.is_none());
    }
}
