use crate::rwlock::CustomRwLock;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

// Captive portal currently reported by the network environment module.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptivePortal {
    pub ip: Option<IpAddr>,
    pub domain: String,
}

lazy_static! {
    static ref CAPTIVE_PORTAL: CustomRwLock<CaptivePortal> =
        CustomRwLock::new(CaptivePortal::default());
}

pub async fn set_captive_portal(portal: CaptivePortal) {
    *CAPTIVE_PORTAL.write().await = portal;
}

pub async fn get_captive_portal() -> CaptivePortal {
    CAPTIVE_PORTAL.read().await.clone()
}
