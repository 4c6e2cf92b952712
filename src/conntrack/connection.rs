use crate::conntrack::access::{get_user, AccessError, Feature};
use crate::conntrack::entity::Entity;
use crate::conntrack::ip::IpScope;
use crate::conntrack::metrics;
use crate::conntrack::netenv::get_captive_portal;
use crate::conntrack::packet::{IpProtocol, IpVersion, Packet, PacketInfo};
use crate::conntrack::process::{
    get_network_host, get_pid_of_connection, get_process_context, get_process_with_profile,
    Process, ProcessContext, NETWORK_HOST_PROCESS_ID, UNDEFINED_PROCESS_ID,
};
use crate::conntrack::registry;
use crate::conntrack::resolver::{
    get_ip_info, remove_open_dns_request, DnsRequestContext, ResolverInfo, PROFILE_SCOPE_GLOBAL,
};
use crate::conntrack::store::{make_key, push_update, RecordMeta, DB_SCOPE_DNS, DB_SCOPE_IP};
use crate::conntrack::tunnel::{TunnelContext, TunnelOptions};
use crate::conntrack::verdict::{transition_allowed, Verdict, VerdictTriple};
use crate::runtime::{async_spawn, TaskHandle};
use crate::rwlock::CustomRwLock;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use strum_macros::Display;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};

// Per-connection handling queue capacity. Overflowing packets are
// dropped, never blocked on.
const PACKET_QUEUE_SIZE: usize = 100;

// How long an ended DNS request connection may still donate its PID to
// a follow-up DNS request.
const DNS_REQUEST_LINGER_SECS: i64 = 3;

// Started timestamps before this (2020-01-01 UTC) are clock garbage.
const TOO_OLD_TIMESTAMP: i64 = 1_577_836_800;

// How long the worker waits for an info-only follow-up packet before
// handling the first packet of a connection.
const INFO_PACKET_WAIT_MS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Default)]
pub enum ConnectionType {
    #[default]
    Undefined,
    IpConnection,
    DnsRequest,
}

// Scope tags of packet connections. DNS request connections carry the
// queried domain as their scope instead.
pub const SCOPE_INCOMING_HOST: &str = "IH";
pub const SCOPE_INCOMING_LAN: &str = "IL";
pub const SCOPE_INCOMING_INTERNET: &str = "II";
pub const SCOPE_INCOMING_INVALID: &str = "IX";
pub const SCOPE_PEER_HOST: &str = "PH";
pub const SCOPE_PEER_LAN: &str = "PL";
pub const SCOPE_PEER_INTERNET: &str = "PI";
pub const SCOPE_PEER_INVALID: &str = "PX";

fn derive_packet_scope(inbound: bool, ip_scope: IpScope) -> &'static str {
    if inbound {
        match ip_scope {
            IpScope::HostLocal => SCOPE_INCOMING_HOST,
            IpScope::LinkLocal | IpScope::SiteLocal | IpScope::LocalMulticast => SCOPE_INCOMING_LAN,
            IpScope::Global | IpScope::GlobalMulticast => SCOPE_INCOMING_INTERNET,
            IpScope::Invalid => SCOPE_INCOMING_INVALID,
        }
    } else {
        match ip_scope {
            IpScope::HostLocal => SCOPE_PEER_HOST,
            IpScope::LinkLocal | IpScope::SiteLocal | IpScope::LocalMulticast => SCOPE_PEER_LAN,
            IpScope::Global | IpScope::GlobalMulticast => SCOPE_PEER_INTERNET,
            IpScope::Invalid => SCOPE_PEER_INVALID,
        }
    }
}

// Justification of a verdict. The context payload is opaque to the core
// and only describable/serializable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reason {
    pub msg: String,
    pub option_key: String,
    pub profile: String,
    pub context: Option<serde_json::Value>,
}

// Finds a verdict for the locked connection. Custom handlers are
// attached per connection while it is being decided on; afterwards the
// registered default handler merely applies the stored verdict.
#[async_trait]
pub trait FirewallHandler: Send + Sync {
    async fn handle(&self, conn: &Connection, state: &mut ConnectionState, pkt: &dyn Packet);
}

lazy_static! {
    static ref DEFAULT_HANDLER: CustomRwLock<Option<Arc<dyn FirewallHandler>>> =
        CustomRwLock::new(None);
    // Cancels every packet worker on daemon shutdown. Workers are
    // spawned with child tokens of this one.
    static ref WORKER_SHUTDOWN: CancellationToken = CancellationToken::new();
}

pub async fn set_default_firewall_handler(handler: Arc<dyn FirewallHandler>) {
    *DEFAULT_HANDLER.write().await = Some(handler);
}

#[cfg(test)]
pub(crate) async fn clear_default_firewall_handler() {
    *DEFAULT_HANDLER.write().await = None;
}

// Cancels all packet workers. Queued packets are not drained.
pub fn cancel_packet_workers() {
    WORKER_SHUTDOWN.cancel();
}

async fn run_default_handler(conn: &Connection, state: &mut ConnectionState, pkt: &dyn Packet) {
    match DEFAULT_HANDLER.read().await.as_ref() {
        Some(handler) => handler.handle(conn, state, pkt).await,
        None => trace!(
            "No default firewall handler registered, ignoring packet {}",
            pkt.describe()
        ),
    }
}

// Some intercept backends emit a metadata-only "info" packet shortly
// after (but not before) the first real packet of a connection. Once one
// has been observed, first packets of outbound connections briefly wait
// for theirs. Set-only.
static INFO_ONLY_PACKETS_ACTIVE: AtomicBool = AtomicBool::new(false);

pub fn info_only_packets_active() -> bool {
    INFO_ONLY_PACKETS_ACTIVE.load(Ordering::Relaxed)
}

#[cfg(test)]
pub(crate) fn reset_info_only_packets_active() {
    INFO_ONLY_PACKETS_ACTIVE.store(false, Ordering::Relaxed);
}

// Mutable portion of a connection, guarded by the per-connection mutex.
pub struct ConnectionState {
    pub scope: String,
    pub inbound: bool,
    pub local_ip: Option<IpAddr>,
    pub local_ip_scope: IpScope,
    pub local_port: u16,
    pub pid: i32,
    pub entity: Option<Entity>,
    pub resolver: Option<ResolverInfo>,
    pub dns_context: Option<DnsRequestContext>,
    pub verdict: VerdictTriple,
    pub reason: Reason,
    pub ended: i64,
    pub verdict_permanent: bool,
    pub inspecting: bool,
    pub process_context: ProcessContext,
    pub history_enabled: bool,
    pub bandwidth_enabled: bool,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub internal: bool,
    pub profile_revision_counter: u64,
    pub meta: RecordMeta,
    tunneled: bool,
    tunnel_opts: Option<TunnelOptions>,
    tunnel_context: Option<Arc<dyn TunnelContext>>,
    process: Option<Arc<Process>>,
    save_when_finished: bool,
    active_inspectors: Vec<bool>,
    inspector_data: HashMap<u8, serde_json::Value>,
    added_to_metrics: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            scope: String::new(),
            inbound: false,
            local_ip: None,
            local_ip_scope: IpScope::Invalid,
            local_port: 0,
            pid: UNDEFINED_PROCESS_ID,
            entity: None,
            resolver: None,
            dns_context: None,
            verdict: VerdictTriple::default(),
            reason: Reason::default(),
            ended: 0,
            verdict_permanent: false,
            inspecting: false,
            tunneled: false,
            tunnel_opts: None,
            tunnel_context: None,
            process_context: ProcessContext::default(),
            history_enabled: false,
            bandwidth_enabled: false,
            bytes_received: 0,
            bytes_sent: 0,
            internal: false,
            profile_revision_counter: 0,
            meta: RecordMeta::default(),
            process: None,
            save_when_finished: false,
            active_inspectors: Vec::new(),
            inspector_data: HashMap::new(),
            added_to_metrics: false,
        }
    }
}

impl ConnectionState {
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.clone()
    }

    pub fn set_local_ip(&mut self, ip: IpAddr) {
        self.local_ip_scope = IpScope::of(&ip);
        self.local_ip = Some(ip);
    }

    // Marks the connection for saving once the firewall handler is done
    // with the current packet.
    pub fn save_when_finished(&mut self) {
        self.save_when_finished = true;
    }

    pub fn active_inspectors(&self) -> &[bool] {
        &self.active_inspectors
    }

    pub fn set_active_inspectors(&mut self, inspectors: Vec<bool>) {
        self.active_inspectors = inspectors;
    }

    pub fn inspector_data(&self) -> &HashMap<u8, serde_json::Value> {
        &self.inspector_data
    }

    pub fn set_inspector_data(&mut self, data: HashMap<u8, serde_json::Value>) {
        self.inspector_data = data;
    }

    // Writes a new verdict: the firewall field always, the worst field
    // monotonically, the active field only when the registered
    // transition predicate allows it. Returns the predicate's decision.
    pub async fn set_verdict(
        &mut self,
        new_verdict: Verdict,
        reason: &str,
        reason_option_key: &str,
        reason_ctx: Option<serde_json::Value>,
    ) -> bool {
        let allowed = transition_allowed(self.verdict.active, new_verdict).await;

        self.set_verdict_directly(new_verdict);
        if allowed {
            self.verdict.active = new_verdict;
        }

        // Replace the reason wholesale.
        self.reason.msg = reason.to_string();
        self.reason.context = reason_ctx;
        self.reason.option_key = String::new();
        self.reason.profile = String::new();
        if !reason_option_key.is_empty() {
            if let Some(proc) = &self.process {
                if let Some(profile) = proc.profile().await {
                    self.reason.option_key = reason_option_key.to_string();
                    self.reason.profile = profile.profile_source(reason_option_key);
                }
            }
        }

        allowed
    }

    // Records the firewall decision without touching the active verdict.
    pub fn set_verdict_directly(&mut self, new_verdict: Verdict) {
        self.verdict.firewall = new_verdict;
        self.verdict.worst = self.verdict.worst.max(new_verdict);
    }

    // The active verdict as a verb, announcing a pending transition when
    // the firewall has decided differently.
    pub fn verdict_verb(&self) -> String {
        if self.verdict.firewall == self.verdict.active {
            return self.verdict.firewall.verb().to_string();
        }
        format!(
            "{} (transitioning to {})",
            self.verdict.active.verb(),
            self.verdict.firewall.verb()
        )
    }

    // Re-checks which gated features apply to this connection.
    pub async fn update_features(&mut self) -> Result<(), AccessError> {
        let user = match get_user().await {
            Ok(user) => Some(user),
            Err(AccessError::NotLoggedIn) => None,
            Err(err) => return Err(err),
        };

        self.history_enabled = false;
        let localhost_only = self
            .entity
            .as_ref()
            .map(|entity| entity.ip_scope.is_localhost())
            .unwrap_or(false);
        if self.internal || localhost_only {
            // Internal and localhost-only connections are of no interest
            // in the history.
        } else if user
            .as_ref()
            .map(|user| user.may_use(Feature::History))
            .unwrap_or(false)
        {
            if let Some(proc) = &self.process {
                if let Some(profile) = proc.profile().await {
                    self.history_enabled = profile.enable_history;
                }
            }
        }

        self.bandwidth_enabled = user
            .map(|user| user.may_use(Feature::BandwidthVisibility))
            .unwrap_or(false);

        Ok(())
    }

    // Routes the connection through the tunnel network. This is the only
    // way to mark a connection tunneled; users without the tunnel
    // feature are refused.
    pub async fn route_through_tunnel(
        &mut self,
        opts: TunnelOptions,
        ctx: Arc<dyn TunnelContext>,
    ) -> bool {
        let allowed = get_user()
            .await
            .map(|user| user.may_use(Feature::Tunnel))
            .unwrap_or(false);
        if !allowed {
            debug!("Tunnel feature not available, not tunneling connection");
            return false;
        }

        self.tunnel_opts = Some(opts);
        self.tunnel_context = Some(ctx);
        self.tunneled = true;
        true
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunneled
    }

    pub fn tunnel_opts(&self) -> Option<&TunnelOptions> {
        self.tunnel_opts.as_ref()
    }

    pub fn tunnel_context(&self) -> Option<Arc<dyn TunnelContext>> {
        self.tunnel_context.clone()
    }

    pub fn describe(&self, id: &str) -> String {
        let entity_ip = |entity: &Entity| {
            entity
                .ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "?".to_string())
        };
        match (&self.process, &self.entity) {
            (Some(proc), Some(entity)) if self.inbound => {
                format!("{} <- {}", proc.describe(), entity_ip(entity))
            }
            (Some(proc), Some(entity)) if !entity.domain.is_empty() => {
                format!("{} to {} ({})", proc.describe(), entity.domain, entity_ip(entity))
            }
            (Some(proc), Some(entity)) => {
                format!("{} -> {}", proc.describe(), entity_ip(entity))
            }
            _ => id.to_string(),
        }
    }
}

// State of the handling queue, guarded by its own lock. Lock order is
// queue lock before connection mutex; never the other way around.
struct PacketQueue {
    active: bool,
    tx: Option<mpsc::Sender<Box<dyn Packet>>>,
    handler: Option<Arc<dyn FirewallHandler>>,
    worker: Option<TaskHandle>,
}

impl PacketQueue {
    fn new() -> Self {
        Self {
            active: false,
            tx: None,
            handler: None,
            worker: None,
        }
    }
}

// A tracked network flow or DNS request with attached process and
// policy context. Identity fields are immutable after creation; the
// mutable remainder is guarded by the per-connection mutex.
pub struct Connection {
    pub id: String,
    pub conn_type: ConnectionType,
    pub external: bool,
    pub ip_version: IpVersion,
    pub ip_protocol: IpProtocol,
    pub started: i64,

    state: AsyncMutex<ConnectionState>,
    // Set once all information is available and a real packet has been
    // seen. Until then the connection is neither evaluated for a verdict
    // nor pushed downstream. Monotonic.
    data_complete: AtomicBool,
    queue: StdMutex<PacketQueue>,
}

impl Connection {
    // Creates a minimal connection from the first packet of a flow and
    // registers it so concurrent packets of the same flow find it.
    // Not propagated downstream until its data is complete.
    pub fn new_incomplete(pkt: &dyn Packet) -> Arc<Self> {
        let info = pkt.info();

        let mut started = info.seen_at.timestamp();
        if started < TOO_OLD_TIMESTAMP {
            started = Utc::now().timestamp();
        }

        let mut state = ConnectionState {
            inbound: info.inbound,
            pid: info.pid,
            ..Default::default()
        };
        state.meta.update();

        let conn = Arc::new(Self {
            id: pkt.connection_id(),
            conn_type: ConnectionType::IpConnection,
            external: false,
            ip_version: info.version,
            ip_protocol: info.protocol,
            started,
            state: AsyncMutex::new(state),
            data_complete: AtomicBool::new(false),
            queue: StdMutex::new(PacketQueue::new()),
        });

        registry::ip_table().add(conn.clone());
        conn
    }

    // Creates a connection for a DNS request of a local process. The
    // querying socket may be pre-registered as a DNS request connection;
    // if that entry is still live its PID and process are inherited, as
    // the PID alone may already be re-used.
    pub async fn from_dns_request(
        fqdn: &str,
        cnames: Vec<String>,
        conn_id: &str,
        local_ip: IpAddr,
        local_port: u16,
    ) -> Arc<Self> {
        let version = if local_ip.is_ipv4() {
            IpVersion::V4
        } else {
            IpVersion::V6
        };

        // Outbound descriptor of the querying socket: we are looking for
        // the process behind the source address, the remote end is not
        // recorded.
        let mut info = PacketInfo {
            version,
            protocol: IpProtocol::UDP,
            inbound: false,
            src_ip: local_ip,
            src_port: local_port,
            dst_ip: None,
            dst_port: 0,
            seen_at: Utc::now(),
            pid: UNDEFINED_PROCESS_ID,
        };

        let mut process: Option<Arc<Process>> = None;
        if let Some(request_conn) = registry::get_dns_request_connection(&info) {
            let request_state = request_conn.lock().await;
            if request_state.pid < 0 {
                // Process is not identified or is special.
            } else if request_state.ended > 0
                && request_state.ended < Utc::now().timestamp() - DNS_REQUEST_LINGER_SECS
            {
                debug!(
                    "Found ended dns request connection {} for dns request for {}",
                    request_conn.id, fqdn
                );
            } else {
                debug!("Found matching dns request connection {}", request_conn.id);
                info.pid = request_state.pid;
                process = request_state.process();
            }
        }

        // Find the process via the OS state tables.
        if info.pid == UNDEFINED_PROCESS_ID {
            if let Ok((pid, _)) = get_pid_of_connection(&info).await {
                info.pid = pid;
            }
        }

        if process.is_none() {
            match get_process_with_profile(info.pid).await {
                Ok(proc) => process = Some(proc),
                Err(err) => trace!("Failed to get process of PID {}: {}", info.pid, err),
            }
        }

        Self::build_dns_connection(fqdn, cnames, conn_id, info.pid, process, false).await
    }

    // Creates a connection for a DNS request of a remote host, as served
    // by the exposed nameserver.
    pub async fn from_external_dns_request(
        fqdn: &str,
        cnames: Vec<String>,
        conn_id: &str,
        remote_ip: IpAddr,
    ) -> Result<Arc<Self>> {
        let remote_host = get_network_host(remote_ip).await?;
        Ok(Self::build_dns_connection(
            fqdn,
            cnames,
            conn_id,
            NETWORK_HOST_PROCESS_ID,
            Some(remote_host),
            true,
        )
        .await)
    }

    async fn build_dns_connection(
        fqdn: &str,
        cnames: Vec<String>,
        conn_id: &str,
        pid: i32,
        process: Option<Arc<Process>>,
        external: bool,
    ) -> Arc<Self> {
        let timestamp = Utc::now().timestamp();

        let mut state = ConnectionState {
            scope: fqdn.to_string(),
            pid,
            entity: Some(Entity::from_domain(fqdn, cnames)),
            ended: timestamp,
            ..Default::default()
        };

        if let Some(proc) = &process {
            state.process_context = get_process_context(proc).await;
            if let Some(profile) = proc.profile().await {
                state.internal = profile.internal;
            }
        }
        state.process = process;

        if let Err(err) = state.update_features().await {
            warn!("Failed to check for enabled features: {}", err);
        }

        state.meta.update();

        // DNS requests are saved by the nameserver depending on the
        // result of the query, so the connection is not registered here.
        Arc::new(Self {
            id: conn_id.to_string(),
            conn_type: ConnectionType::DnsRequest,
            external,
            ip_version: IpVersion::default(),
            ip_protocol: IpProtocol::UDP,
            started: timestamp,
            state: AsyncMutex::new(state),
            // DNS requests do not require a packet to be complete.
            data_complete: AtomicBool::new(true),
            queue: StdMutex::new(PacketQueue::new()),
        })
    }

    pub async fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().await
    }

    pub fn data_is_complete(&self) -> bool {
        self.data_complete.load(Ordering::Acquire)
    }

    // Gathers information on the process and remote entity. Called for
    // every packet of the flow until the data is complete. Lookup
    // failures are informational; the connection simply stays incomplete
    // until the next packet.
    pub async fn gather_connection_info(&self, pkt: &dyn Packet) {
        let mut state = self.state.lock().await;
        self.gather_connection_info_locked(&mut state, pkt).await;
    }

    pub async fn gather_connection_info_locked(
        &self,
        state: &mut ConnectionState,
        pkt: &dyn Packet,
    ) {
        let info = pkt.info();

        // Create the remote entity.
        if state.entity.is_none() {
            state.entity = Some(Entity::new(
                info.remote_ip(),
                info.remote_port(),
                info.protocol.number(),
            ));
            if let Some(local_ip) = info.local_ip() {
                state.set_local_ip(local_ip);
            }
            state.local_port = info.local_port();

            let ip_scope = state
                .entity
                .as_ref()
                .map(|entity| entity.ip_scope)
                .unwrap_or(IpScope::Invalid);
            state.scope = derive_packet_scope(state.inbound, ip_scope).to_string();
        }

        // Get the PID from the OS state tables if not yet available,
        // applying the direction as reported by them.
        if state.pid == UNDEFINED_PROCESS_ID {
            match get_pid_of_connection(info).await {
                Ok((pid, inbound)) => {
                    state.pid = pid;
                    state.inbound = inbound;
                }
                Err(err) => trace!("Failed to find PID of connection {}: {}", self.id, err),
            }
        }

        // Only get process and profile with the first real packet.
        if pkt.is_info_only() {
            return;
        }

        if state.process.is_none() {
            match get_process_with_profile(state.pid).await {
                Ok(proc) => state.process = Some(proc),
                Err(err) => debug!(
                    "Failed to get process and profile of PID {}: {}",
                    state.pid, err
                ),
            }
        }

        // Apply process and profile info on first successful resolution.
        if state.profile_revision_counter == 0 {
            if let Some(proc) = state.process.clone() {
                state.process_context = get_process_context(&proc).await;
                if let Some(profile) = proc.profile().await {
                    state.profile_revision_counter = profile.revision();
                    state.internal = profile.internal;
                    if let Err(err) = state.update_features().await {
                        warn!(
                            "Connection {} failed to check for enabled features: {}",
                            self.id, err
                        );
                    }
                }
            }
        }

        // Find the domain and DNS context of the entity, first in the
        // scope of the profile, then in the global scope in case DNS
        // went through the system resolver.
        let needs_domain = state
            .entity
            .as_ref()
            .map(|entity| entity.domain.is_empty())
            .unwrap_or(false);
        if needs_domain {
            let profile_id = match state.process.clone() {
                Some(proc) => proc.profile().await.map(|profile| profile.id.clone()),
                None => None,
            };
            if let (Some(profile_id), Some(remote_ip)) = (profile_id, info.remote_ip()) {
                let ipinfo = match get_ip_info(&profile_id, remote_ip).await {
                    Some(ipinfo) => Some(ipinfo),
                    None => get_ip_info(PROFILE_SCOPE_GLOBAL, remote_ip).await,
                };
                if let Some(resolved) = ipinfo.as_ref().and_then(|ipinfo| ipinfo.most_recent_domain())
                {
                    state.scope = resolved.domain.clone();
                    if let Some(entity) = state.entity.as_mut() {
                        entity.domain = resolved.domain.clone();
                        entity.cnames = resolved.cnames.clone();
                    }
                    state.dns_context = Some(resolved.dns_request_context.clone());
                    state.resolver = Some(resolved.resolver.clone());
                    remove_open_dns_request(state.pid, &resolved.domain).await;
                }
            }
        }

        // Fall back to the captive portal domain when the destination is
        // the captive portal's IP.
        let still_no_domain = state
            .entity
            .as_ref()
            .map(|entity| entity.domain.is_empty())
            .unwrap_or(false);
        if still_no_domain {
            let portal = get_captive_portal().await;
            if let (Some(portal_ip), Some(remote_ip)) = (portal.ip, info.remote_ip()) {
                if portal_ip == remote_ip {
                    state.scope = portal.domain.clone();
                    if let Some(entity) = state.entity.as_mut() {
                        entity.domain = portal.domain.clone();
                    }
                }
            }
        }

        // Check whether all required data is available.
        let has_profile = match state.process.clone() {
            Some(proc) => proc.profile().await.is_some(),
            None => false,
        };
        if !pkt.is_info_only() && has_profile && state.entity.is_some() {
            self.data_complete.store(true, Ordering::Release);
        }
    }

    pub async fn accept(self: &Arc<Self>, reason: &str, reason_option_key: &str) {
        self.accept_with_context(reason, reason_option_key, None).await;
    }

    pub async fn accept_with_context(
        self: &Arc<Self>,
        reason: &str,
        reason_option_key: &str,
        ctx: Option<serde_json::Value>,
    ) {
        let mut state = self.state.lock().await;
        self.apply_verdict(&mut state, Verdict::Accept, reason, reason_option_key, ctx)
            .await;
    }

    pub async fn block(self: &Arc<Self>, reason: &str, reason_option_key: &str) {
        let mut state = self.state.lock().await;
        self.apply_verdict(&mut state, Verdict::Block, reason, reason_option_key, None)
            .await;
    }

    pub async fn drop_conn(self: &Arc<Self>, reason: &str, reason_option_key: &str) {
        let mut state = self.state.lock().await;
        self.apply_verdict(&mut state, Verdict::Drop, reason, reason_option_key, None)
            .await;
    }

    // Blocks outbound and drops inbound connections: an inbound flow has
    // already reached the host, rejecting it politely leaks liveness.
    pub async fn deny(self: &Arc<Self>, reason: &str, reason_option_key: &str) {
        let mut state = self.state.lock().await;
        let verdict = if state.inbound {
            Verdict::Drop
        } else {
            Verdict::Block
        };
        self.apply_verdict(&mut state, verdict, reason, reason_option_key, None)
            .await;
    }

    pub async fn failed(self: &Arc<Self>, reason: &str, reason_option_key: &str) {
        let mut state = self.state.lock().await;
        self.apply_verdict(&mut state, Verdict::Failed, reason, reason_option_key, None)
            .await;
    }

    // Locked variants for use from within a firewall handler.
    pub async fn apply_verdict(
        &self,
        state: &mut ConnectionState,
        verdict: Verdict,
        reason: &str,
        reason_option_key: &str,
        ctx: Option<serde_json::Value>,
    ) {
        if !state.set_verdict(verdict, reason, reason_option_key, ctx).await {
            warn!(
                "Tried to set {} on {}, but current verdict {} does not allow the transition",
                verdict.verb(),
                state.describe(&self.id),
                state.verdict.active
            );
        }
    }

    // Attaches the firewall handler and starts the packet worker. Use
    // stop_firewall_handler to detach; there is no null handler.
    pub fn set_firewall_handler(self: &Arc<Self>, handler: Arc<dyn FirewallHandler>) {
        let mut queue = self.queue.lock().unwrap();

        if !queue.active {
            let (tx, rx) = mpsc::channel(PACKET_QUEUE_SIZE);
            queue.tx = Some(tx);
            queue.active = true;

            // Start the worker when a new handler is set.
            if queue.handler.is_none() {
                let cancel = WORKER_SHUTDOWN.child_token();
                let worker_cancel = cancel.clone();
                let conn = self.clone();
                let handle = async_spawn(async move {
                    conn.packet_handler_worker(rx, worker_cancel).await;
                });
                queue.worker = Some(TaskHandle { handle, cancel });
            }
        }

        queue.handler = Some(handler);
    }

    // Replaces the firewall handler, but only when one is already set.
    pub fn update_firewall_handler(&self, handler: Arc<dyn FirewallHandler>) {
        let mut queue = self.queue.lock().unwrap();
        if queue.handler.is_some() {
            queue.handler = Some(handler);
        }
    }

    // Detaches the firewall handler and closes the queue, reverting the
    // connection to the default handler. The worker observes the closed
    // queue and exits; the returned handle lets the owner await that
    // exit.
    pub fn stop_firewall_handler(&self) -> Option<TaskHandle> {
        let mut queue = self.queue.lock().unwrap();
        queue.handler = None;
        queue.tx = None;
        queue.active = false;
        queue.worker.take()
    }

    pub fn has_firewall_handler(&self) -> bool {
        self.queue.lock().unwrap().handler.is_some()
    }

    #[cfg(test)]
    pub(crate) fn worker_cancel_token(&self) -> Option<CancellationToken> {
        self.queue
            .lock()
            .unwrap()
            .worker
            .as_ref()
            .map(|worker| worker.cancel.clone())
    }

    // Queues the packet for handling. Never blocks the caller: a full
    // queue drops the packet, and without an active queue the default
    // handler runs synchronously.
    pub async fn handle_packet(self: &Arc<Self>, pkt: Box<dyn Packet>) {
        enum Dispatch {
            Queued,
            Overflow(Box<dyn Packet>),
            Default(Box<dyn Packet>),
        }

        let dispatch = {
            let queue = self.queue.lock().unwrap();
            match (&queue.tx, queue.active) {
                (Some(tx), true) => match tx.try_send(pkt) {
                    Ok(()) => Dispatch::Queued,
                    Err(TrySendError::Full(pkt)) => Dispatch::Overflow(pkt),
                    Err(TrySendError::Closed(pkt)) => Dispatch::Default(pkt),
                },
                _ => Dispatch::Default(pkt),
            }
        };

        match dispatch {
            Dispatch::Queued => {}
            Dispatch::Overflow(pkt) => {
                debug!(
                    "Dropping packet {}, no space in the connection's handling queue",
                    pkt.describe()
                );
                metrics::count_dropped_packet();
                pkt.drop_packet();
            }
            Dispatch::Default(pkt) => {
                let seen_at = pkt.info().seen_at;
                let mut state = self.state.lock().await;
                run_default_handler(self, &mut state, pkt.as_ref()).await;
                drop(state);
                metrics::record_packet_handling(seen_at);
            }
        }
    }

    // Sequentially handles queued packets until the queue is closed or
    // the worker is cancelled. Handling order is FIFO, except that the
    // first packet may yield to an immediately following info-only
    // packet for correct process attribution.
    async fn packet_handler_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Box<dyn Packet>>,
        cancel: CancellationToken,
    ) {
        let mut pkt_seq: u64 = 0;

        loop {
            let pkt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                maybe_pkt = rx.recv() => match maybe_pkt {
                    Some(pkt) => pkt,
                    None => return,
                },
            };
            pkt_seq += 1;

            // Order correction is only for the first packet.
            if pkt_seq == 1 {
                if pkt.is_info_only() {
                    // Info-only packets are active and working.
                    INFO_ONLY_PACKETS_ACTIVE.store(true, Ordering::Relaxed);
                } else if pkt.expects_info()
                    || (INFO_ONLY_PACKETS_ACTIVE.load(Ordering::Relaxed) && pkt.is_outbound())
                {
                    // Pull an expected info-only packet forward.
                    if let Ok(Some(info_pkt)) =
                        timeout(Duration::from_millis(INFO_PACKET_WAIT_MS), rx.recv()).await
                    {
                        pkt_seq += 1;
                        self.handle_queued_packet(info_pkt).await;
                    }
                }
            }

            self.handle_queued_packet(pkt).await;
        }
    }

    async fn handle_queued_packet(self: &Arc<Self>, pkt: Box<dyn Packet>) {
        // Read the handler before taking the connection mutex; lock
        // order is queue before connection.
        let handler = self.queue.lock().unwrap().handler.clone();
        let seen_at = pkt.info().seen_at;

        let mut state = self.state.lock().await;
        match handler {
            None => {
                // The handler was detached concurrently; the default
                // handler just applies the stored verdict.
                run_default_handler(self, &mut state, pkt.as_ref()).await;
            }
            Some(handler) => {
                let span = tracing::debug_span!("firewall_handler", conn = %self.id);
                pkt.set_span(span.clone());
                handler
                    .handle(self, &mut state, pkt.as_ref())
                    .instrument(span)
                    .await;

                if self.data_is_complete() {
                    debug!(
                        "Connection {} {}: {}",
                        state.describe(&self.id),
                        state.verdict_verb(),
                        state.reason.msg
                    );
                } else if state.verdict.firewall != Verdict::Undecided {
                    debug!("Connection {} fast-tracked", self.id);
                } else {
                    trace!("Gathered data on connection {}", self.id);
                }
            }
        }

        metrics::record_packet_handling(seen_at);

        if state.save_when_finished {
            state.save_when_finished = false;
            self.save_locked(&mut state).await;
        }
    }

    // Persists the connection and propagates the change downstream. Does
    // nothing until the data is complete. On first save the storage key
    // is computed and the connection is indexed in the matching table.
    pub async fn save(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        self.save_locked(&mut state).await;
    }

    pub async fn save_locked(self: &Arc<Self>, state: &mut ConnectionState) {
        state.meta.update();

        if !self.data_is_complete() {
            return;
        }

        if !state.meta.is_key_set() {
            if self.conn_type == ConnectionType::DnsRequest {
                state.meta.set_key(make_key(state.pid, DB_SCOPE_DNS, &self.id));
                registry::dns_table().add(self.clone());
            } else {
                state.meta.set_key(make_key(state.pid, DB_SCOPE_IP, &self.id));
                registry::ip_table().add(self.clone());
            }
        }

        if !state.added_to_metrics {
            state.added_to_metrics = true;
            match self.conn_type {
                ConnectionType::DnsRequest => metrics::count_dns_request(),
                _ => metrics::count_ip_connection(),
            }
        }

        push_update(self).await;
    }

    // Removes the connection from its table and propagates the deletion,
    // but only when the connection had been exposed before.
    pub async fn delete(self: &Arc<Self>) {
        let mut state = self.state.lock().await;

        if self.conn_type == ConnectionType::DnsRequest {
            registry::dns_table().remove(&self.id);
        } else {
            registry::ip_table().remove(&self.id);
        }

        state.meta.mark_deleted();

        if self.data_is_complete() {
            push_update(self).await;
        }
    }

    pub async fn describe(&self) -> String {
        let state = self.state.lock().await;
        state.describe(&self.id)
    }
}
