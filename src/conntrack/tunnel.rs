use anyhow::Result;
use serde::{Deserialize, Serialize};

// Options governing how a connection is routed through the tunnel
// network. Interpreted by the tunnel module.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelOptions {
    pub routing_profile: String,
    pub require_trusted_exit: bool,
    pub home_hub: Option<String>,
}

// Live tunnel of a connection. The tunnel module owns the transport;
// the connection core only needs the exit identity and a way to tear
// the tunnel down.
pub trait TunnelContext: Send + Sync + std::fmt::Debug {
    fn exit_node_id(&self) -> String;
    fn stop_tunnel(&self) -> Result<()>;
}
