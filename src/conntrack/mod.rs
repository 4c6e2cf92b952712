pub mod access;
pub mod connection;
pub mod entity;
pub mod ip;
pub mod metrics;
pub mod netenv;
pub mod packet;
pub mod process;
pub mod registry;
pub mod resolver;
pub mod state;
pub mod store;
pub mod tunnel;
pub mod verdict;

pub use connection::{
    cancel_packet_workers, info_only_packets_active, set_default_firewall_handler, Connection,
    ConnectionState, ConnectionType, FirewallHandler, Reason,
};
pub use entity::Entity;
pub use ip::IpScope;
pub use packet::{IpProtocol, IpVersion, Packet, PacketInfo};
pub use process::{
    get_process_context, set_process_resolver, Process, ProcessContext, ProcessResolver, Profile,
    NETWORK_HOST_PROCESS_ID, UNDEFINED_PROCESS_ID,
};
pub use registry::{
    get_all_connections, get_all_dns_connections, get_connection, get_connections_of_pid,
    get_dns_connection, get_dns_request_connection,
};
pub use resolver::{
    set_dns_intel, DnsIntel, DnsRequestContext, IpInfo, ResolvedDomain, ResolverInfo,
    ReverseIpCache, PROFILE_SCOPE_GLOBAL,
};
pub use state::SystemStateResolver;
pub use store::{set_update_sink, RecordMeta, UpdateSink};
pub use tunnel::{TunnelContext, TunnelOptions};
pub use verdict::{set_transition_predicate, Verdict, VerdictTriple};
