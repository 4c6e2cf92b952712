use crate::rwlock::CustomRwLock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::trace;

// Scope key for resolutions that went through the system resolver rather
// than an application-scoped one.
pub const PROFILE_SCOPE_GLOBAL: &str = "global";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResolverInfo {
    pub name: String,
    pub source: String,
}

// Context of the DNS request that most likely resolved the IP of a
// connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DnsRequestContext {
    pub domain: String,
    pub served_from_cache: bool,
    pub requesting_new: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedDomain {
    pub domain: String,
    pub cnames: Vec<String>,
    pub dns_request_context: DnsRequestContext,
    pub resolver: ResolverInfo,
    pub resolved_at: DateTime<Utc>,
}

// Everything known about an IP address within one profile scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpInfo {
    pub ip: IpAddr,
    pub resolved_domains: Vec<ResolvedDomain>,
}

impl IpInfo {
    pub fn most_recent_domain(&self) -> Option<&ResolvedDomain> {
        self.resolved_domains
            .iter()
            .max_by_key(|resolved| resolved.resolved_at)
    }
}

// Reverse-IP knowledge of the embedded resolver, consumed by the flow
// correlator to backfill domains on IP connections.
#[async_trait]
pub trait DnsIntel: Send + Sync {
    async fn ip_info(&self, profile_scope: &str, ip: IpAddr) -> Option<IpInfo>;

    // Drops the open DNS request of (pid, domain) once a connection has
    // claimed it.
    async fn remove_open_dns_request(&self, pid: i32, domain: &str);
}

lazy_static! {
    static ref DNS_INTEL: CustomRwLock<Option<Arc<dyn DnsIntel>>> = CustomRwLock::new(None);
}

pub async fn set_dns_intel(intel: Arc<dyn DnsIntel>) {
    *DNS_INTEL.write().await = Some(intel);
}

pub async fn get_ip_info(profile_scope: &str, ip: IpAddr) -> Option<IpInfo> {
    match DNS_INTEL.read().await.as_ref() {
        Some(intel) => intel.ip_info(profile_scope, ip).await,
        None => None,
    }
}

pub async fn remove_open_dns_request(pid: i32, domain: &str) {
    if let Some(intel) = DNS_INTEL.read().await.as_ref() {
        intel.remove_open_dns_request(pid, domain).await;
    }
}

// Default DnsIntel implementation: a reverse-IP cache fed by the
// embedded resolver, scoped per profile with a global fallback scope,
// plus a ledger of open DNS requests.
pub struct ReverseIpCache {
    resolutions: DashMap<(String, IpAddr), IpInfo>,
    open_requests: DashMap<String, i64>,
}

impl ReverseIpCache {
    pub fn new() -> Self {
        Self {
            resolutions: DashMap::new(),
            open_requests: DashMap::new(),
        }
    }

    pub fn record_resolution(&self, profile_scope: &str, ip: IpAddr, resolved: ResolvedDomain) {
        trace!(
            "DNS resolution in scope {}: {} -> {}",
            profile_scope,
            ip,
            resolved.domain
        );
        self.resolutions
            .entry((profile_scope.to_string(), ip))
            .and_modify(|info| info.resolved_domains.push(resolved.clone()))
            .or_insert_with(|| IpInfo {
                ip,
                resolved_domains: vec![resolved],
            });
    }

    pub fn record_open_request(&self, pid: i32, domain: &str) {
        self.open_requests
            .insert(Self::open_request_key(pid, domain), Utc::now().timestamp());
    }

    pub fn has_open_request(&self, pid: i32, domain: &str) -> bool {
        self.open_requests
            .contains_key(&Self::open_request_key(pid, domain))
    }

    fn open_request_key(pid: i32, domain: &str) -> String {
        format!("{}/{}", pid, domain)
    }
}

impl Default for ReverseIpCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsIntel for ReverseIpCache {
    async fn ip_info(&self, profile_scope: &str, ip: IpAddr) -> Option<IpInfo> {
        self.resolutions
            .get(&(profile_scope.to_string(), ip))
            .map(|entry| entry.value().clone())
    }

    async fn remove_open_dns_request(&self, pid: i32, domain: &str) {
        self.open_requests.remove(&Self::open_request_key(pid, domain));
    }
}
