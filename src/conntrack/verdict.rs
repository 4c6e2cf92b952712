use crate::rwlock::CustomRwLock;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::Display;

// Verdicts ordered by severity. The ordering is load-bearing: the worst
// verdict of a connection is the maximum of all verdicts ever assigned.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    Default,
)]
pub enum Verdict {
    #[default]
    Undecided,
    Accept,
    Trust,
    RerouteToNameserver,
    RerouteToTunnel,
    Block,
    Drop,
    Failed,
}

impl Verdict {
    pub fn verb(&self) -> &'static str {
        match self {
            Verdict::Undecided => "undecided",
            Verdict::Accept => "allowed",
            Verdict::Trust => "trusted",
            Verdict::RerouteToNameserver => "rerouted to nameserver",
            Verdict::RerouteToTunnel => "rerouted to tunnel",
            Verdict::Block => "blocked",
            Verdict::Drop => "dropped",
            Verdict::Failed => "failed",
        }
    }
}

// The three verdict views of a connection: the strongest ever assigned,
// the one currently answered with, and the most recent firewall decision.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerdictTriple {
    pub worst: Verdict,
    pub active: Verdict,
    pub firewall: Verdict,
}

// Decides whether the active verdict may move from `from` to `to`.
// Transitions that require the connection to be re-established are the
// business of the verdict-application layer, which registers this hook.
pub type TransitionPredicate = dyn Fn(Verdict, Verdict) -> bool + Send + Sync;

lazy_static! {
    static ref TRANSITION_PREDICATE: CustomRwLock<Option<Arc<TransitionPredicate>>> =
        CustomRwLock::new(None);
}

pub async fn set_transition_predicate(predicate: Arc<TransitionPredicate>) {
    *TRANSITION_PREDICATE.write().await = Some(predicate);
}

pub async fn clear_transition_predicate() {
    *TRANSITION_PREDICATE.write().await = None;
}

// Without a registered predicate every transition is allowed.
pub async fn transition_allowed(from: Verdict, to: Verdict) -> bool {
    match TRANSITION_PREDICATE.read().await.as_ref() {
        Some(predicate) => predicate(from, to),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_severity_order() {
        assert!(Verdict::Undecided < Verdict::Accept);
        assert!(Verdict::Accept < Verdict::Trust);
        assert!(Verdict::Trust < Verdict::RerouteToNameserver);
        assert!(Verdict::RerouteToNameserver < Verdict::RerouteToTunnel);
        assert!(Verdict::RerouteToTunnel < Verdict::Block);
        assert!(Verdict::Block < Verdict::Drop);
        assert!(Verdict::Drop < Verdict::Failed);
    }

    #[test]
    fn test_worst_is_max() {
        let mut worst = Verdict::Undecided;
        for v in [Verdict::Accept, Verdict::Block, Verdict::Accept] {
            worst = worst.max(v);
        }
        assert_eq!(worst, Verdict::Block);
    }

    #[tokio::test]
    #[serial]
    async fn test_transition_predicate() {
        // Default: everything is allowed.
        assert!(transition_allowed(Verdict::Block, Verdict::Accept).await);

        set_transition_predicate(Arc::new(|from, to| !(from == Verdict::Block && to == Verdict::Accept)))
            .await;
        assert!(!transition_allowed(Verdict::Block, Verdict::Accept).await);
        assert!(transition_allowed(Verdict::Accept, Verdict::Block).await);

        clear_transition_predicate().await;
        assert!(transition_allowed(Verdict::Block, Verdict::Accept).await);
    }
}
