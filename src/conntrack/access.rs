use crate::rwlock::CustomRwLock;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use strum_macros::Display;
use thiserror::Error;

// Gated product features relevant to connection handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum Feature {
    History,
    BandwidthVisibility,
    Tunnel,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    // Not an error condition for connection handling: an anonymous user
    // simply has no gated features.
    #[error("not logged in")]
    NotLoggedIn,
    #[error("access service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Default)]
pub struct User {
    pub username: String,
    features: HashSet<Feature>,
}

impl User {
    pub fn new(username: &str, features: &[Feature]) -> Self {
        Self {
            username: username.to_string(),
            features: features.iter().copied().collect(),
        }
    }

    pub fn may_use(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

pub trait AccessGate: Send + Sync {
    fn current_user(&self) -> Result<Arc<User>, AccessError>;
}

lazy_static! {
    static ref ACCESS_GATE: CustomRwLock<Option<Arc<dyn AccessGate>>> = CustomRwLock::new(None);
}

pub async fn set_access_gate(gate: Arc<dyn AccessGate>) {
    *ACCESS_GATE.write().await = Some(gate);
}

pub async fn get_user() -> Result<Arc<User>, AccessError> {
    match ACCESS_GATE.read().await.as_ref() {
        Some(gate) => gate.current_user(),
        None => Err(AccessError::NotLoggedIn),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct StaticGate(Arc<User>);

    impl AccessGate for StaticGate {
        fn current_user(&self) -> Result<Arc<User>, AccessError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_feature_gate() {
        let user = Arc::new(User::new("alice", &[Feature::History]));
        set_access_gate(Arc::new(StaticGate(user))).await;

        let user = get_user().await.unwrap();
        assert!(user.may_use(Feature::History));
        assert!(!user.may_use(Feature::BandwidthVisibility));
    }

    #[tokio::test]
    #[serial]
    async fn test_no_gate_is_not_logged_in() {
        *super::ACCESS_GATE.write().await = None;
        assert_eq!(get_user().await.unwrap_err(), AccessError::NotLoggedIn);
    }
}
