use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use strum_macros::Display;
use tracing::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Default)]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Default)]
pub enum IpProtocol {
    ICMP,
    ICMP6,
    TCP,
    #[default]
    UDP,
}

impl IpProtocol {
    // IANA protocol number, used in connection IDs.
    pub fn number(&self) -> u8 {
        match self {
            IpProtocol::ICMP => 1,
            IpProtocol::TCP => 6,
            IpProtocol::UDP => 17,
            IpProtocol::ICMP6 => 58,
        }
    }
}

// Header metadata of an intercepted packet as reported by the kernel
// intercept layer. The remote endpoint is unset for the synthetic
// descriptors built for DNS requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    pub version: IpVersion,
    pub protocol: IpProtocol,
    pub inbound: bool,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
    pub seen_at: DateTime<Utc>,
    pub pid: i32,
}

impl PacketInfo {
    pub fn local_ip(&self) -> Option<IpAddr> {
        if self.inbound {
            self.dst_ip
        } else {
            Some(self.src_ip)
        }
    }

    pub fn local_port(&self) -> u16 {
        if self.inbound {
            self.dst_port
        } else {
            self.src_port
        }
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        if self.inbound {
            Some(self.src_ip)
        } else {
            self.dst_ip
        }
    }

    pub fn remote_port(&self) -> u16 {
        if self.inbound {
            self.src_port
        } else {
            self.dst_port
        }
    }

    // Canonical flow identifier. Descriptors without a remote endpoint
    // (DNS requests) identify the querying socket only, which is what
    // lets a later DNS request find its pre-registered connection.
    pub fn connection_id(&self) -> String {
        match (self.local_ip(), self.remote_ip()) {
            (Some(local), Some(remote)) => format!(
                "{}-{}-{}-{}-{}",
                self.protocol.number(),
                local,
                self.local_port(),
                remote,
                self.remote_port()
            ),
            (Some(local), None) => {
                format!("{}-{}-{}", self.protocol.number(), local, self.local_port())
            }
            _ => format!("{}-unknown-{}", self.protocol.number(), self.local_port()),
        }
    }
}

// Contract of the kernel intercept layer. Implementations carry the raw
// packet and apply side effects (dropping on queue overflow) on the
// kernel object they wrap.
pub trait Packet: Send + Sync {
    fn info(&self) -> &PacketInfo;

    // Metadata-only event: carries PID and header fields but no payload.
    fn is_info_only(&self) -> bool;

    // The intercept backend announced that an info-only packet for this
    // flow will follow shortly.
    fn expects_info(&self) -> bool;

    // Tracing context attached while the packet is being handled.
    fn span(&self) -> Span;
    fn set_span(&self, span: Span);

    // Reject the packet at the intercept layer. Called when the
    // connection's handling queue is full.
    fn drop_packet(&self);

    fn connection_id(&self) -> String {
        self.info().connection_id()
    }

    fn is_outbound(&self) -> bool {
        !self.info().inbound
    }

    fn describe(&self) -> String {
        let info = self.info();
        let direction = if info.inbound { "<" } else { ">" };
        format!(
            "{} {}:{} {} {}:{}",
            info.protocol,
            info.src_ip,
            info.src_port,
            direction,
            info.dst_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "?".to_string()),
            info.dst_port
        )
    }
}
