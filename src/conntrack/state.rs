use crate::conntrack::packet::{IpProtocol, PacketInfo};
use crate::conntrack::process::{Process, ProcessResolver, Profile, NETWORK_HOST_PROCESS_ID};
use crate::rwlock::CustomRwLock;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use netstat2::{get_sockets_info, AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo};
use std::net::IpAddr;
use std::sync::Arc;
use sysinfo::{Pid, System};
use tracing::trace;

// Process resolver backed by the OS socket and process tables. Owns the
// process table; connections hold Arc handles into it that survive
// process exit.
pub struct SystemStateResolver {
    system: CustomRwLock<System>,
    processes: DashMap<i32, Arc<Process>>,
    profiles: DashMap<String, Arc<Profile>>,
    network_hosts: DashMap<IpAddr, Arc<Process>>,
}

impl SystemStateResolver {
    pub fn new() -> Self {
        Self {
            system: CustomRwLock::new(System::new()),
            processes: DashMap::new(),
            profiles: DashMap::new(),
            network_hosts: DashMap::new(),
        }
    }

    // Matches a socket table entry against the packet descriptor.
    // Returns the corrected direction: a socket whose local endpoint is
    // the packet's destination belongs to an inbound connection.
    fn match_socket(info: &PacketInfo, socket: &ProtocolSocketInfo) -> Option<bool> {
        let local = (info.local_ip()?, info.local_port());
        let remote = (info.remote_ip(), info.remote_port());

        match socket {
            ProtocolSocketInfo::Tcp(tcp) => {
                if info.protocol != IpProtocol::TCP {
                    return None;
                }
                match remote {
                    (Some(remote_ip), remote_port) => {
                        if (tcp.local_addr, tcp.local_port) == local
                            && (tcp.remote_addr, tcp.remote_port) == (remote_ip, remote_port)
                        {
                            Some(false)
                        } else if (tcp.local_addr, tcp.local_port) == (remote_ip, remote_port)
                            && (tcp.remote_addr, tcp.remote_port) == local
                        {
                            Some(true)
                        } else {
                            None
                        }
                    }
                    _ => None,
                }
            }
            ProtocolSocketInfo::Udp(udp) => {
                if info.protocol != IpProtocol::UDP {
                    return None;
                }
                if (udp.local_addr, udp.local_port) == local {
                    Some(false)
                } else if let (Some(remote_ip), remote_port) = remote {
                    if (udp.local_addr, udp.local_port) == (remote_ip, remote_port) {
                        Some(true)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        }
    }

    // One profile per binary, derived on first sight. Profile settings
    // are filled in by the profile module once the user touches them.
    fn profile_for(&self, path: &str, name: &str) -> Arc<Profile> {
        let key = if path.is_empty() { name } else { path };
        self.profiles
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Profile::new(&format!("local/{}", key), name, "local")))
            .value()
            .clone()
    }
}

impl Default for SystemStateResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessResolver for SystemStateResolver {
    async fn pid_of_connection(&self, info: &PacketInfo) -> Result<(i32, bool)> {
        let sockets = get_sockets_info(
            AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6,
            ProtocolFlags::TCP | ProtocolFlags::UDP,
        )
        .map_err(|err| anyhow!("failed to get socket info: {:?}", err))?;

        for socket in &sockets {
            if let Some(inbound) = Self::match_socket(info, &socket.protocol_socket_info) {
                if let Some(pid) = socket.associated_pids.first() {
                    trace!(
                        "Socket table match for {}: PID {} inbound={}",
                        info.connection_id(),
                        pid,
                        inbound
                    );
                    return Ok((*pid as i32, inbound));
                }
            }
        }

        Err(anyhow!("no socket table entry for {}", info.connection_id()))
    }

    async fn process_with_profile(&self, pid: i32) -> Result<Arc<Process>> {
        if pid < 0 {
            return Err(anyhow!("process is not identified"));
        }

        if let Some(proc) = self.processes.get(&pid) {
            return Ok(proc.value().clone());
        }

        let (name, path, cmd_line, created_at) = {
            let mut system = self.system.write().await;
            system.refresh_all();
            let proc = system
                .process(Pid::from_u32(pid as u32))
                .ok_or_else(|| anyhow!("process {} not found", pid))?;
            (
                proc.name().to_string_lossy().to_string(),
                proc.exe()
                    .map(|path| path.to_string_lossy().to_string())
                    .unwrap_or_default(),
                proc.cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join(" "),
                proc.start_time() as i64,
            )
        };

        let process = Arc::new(Process::new(pid, &name, &path, &cmd_line, created_at));
        process.set_profile(self.profile_for(&path, &name)).await;
        self.processes.insert(pid, process.clone());
        Ok(process)
    }

    async fn network_host(&self, ip: IpAddr) -> Result<Arc<Process>> {
        if let Some(host) = self.network_hosts.get(&ip) {
            return Ok(host.value().clone());
        }

        let host = Arc::new(Process::new(
            NETWORK_HOST_PROCESS_ID,
            &format!("Network Host {}", ip),
            "",
            "",
            Utc::now().timestamp(),
        ));
        host.set_profile(self.profile_for("special/network-host", "Network Host"))
            .await;
        self.network_hosts.insert(ip, host.clone());
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::packet::IpVersion;
    use netstat2::{TcpSocketInfo, TcpState, UdpSocketInfo};
    use std::net::Ipv4Addr;

    fn packet_info(protocol: IpProtocol, inbound: bool) -> PacketInfo {
        PacketInfo {
            version: IpVersion::V4,
            protocol,
            inbound,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 44321,
            dst_ip: Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))),
            dst_port: 443,
            seen_at: Utc::now(),
            pid: -1,
        }
    }

    fn tcp_socket(local: (IpAddr, u16), remote: (IpAddr, u16)) -> ProtocolSocketInfo {
        ProtocolSocketInfo::Tcp(TcpSocketInfo {
            local_addr: local.0,
            local_port: local.1,
            remote_addr: remote.0,
            remote_port: remote.1,
            state: TcpState::Established,
        })
    }

    #[test]
    fn test_tcp_socket_match_outbound() {
        let info = packet_info(IpProtocol::TCP, false);
        let socket = tcp_socket(
            ("10.0.0.2".parse().unwrap(), 44321),
            ("93.184.216.34".parse().unwrap(), 443),
        );
        assert_eq!(SystemStateResolver::match_socket(&info, &socket), Some(false));
    }

    #[test]
    fn test_tcp_socket_match_corrects_direction() {
        // The packet was guessed outbound, but the socket table shows the
        // local endpoint as the packet's destination.
        let mut info = packet_info(IpProtocol::TCP, false);
        info.src_ip = "93.184.216.34".parse().unwrap();
        info.src_port = 443;
        info.dst_ip = Some("10.0.0.2".parse().unwrap());
        info.dst_port = 44321;
        let socket = tcp_socket(
            ("93.184.216.34".parse().unwrap(), 443),
            ("10.0.0.2".parse().unwrap(), 44321),
        );
        assert_eq!(SystemStateResolver::match_socket(&info, &socket), Some(false));
    }

    #[test]
    fn test_tcp_socket_no_match() {
        let info = packet_info(IpProtocol::TCP, false);
        let socket = tcp_socket(
            ("10.0.0.2".parse().unwrap(), 9999),
            ("93.184.216.34".parse().unwrap(), 443),
        );
        assert_eq!(SystemStateResolver::match_socket(&info, &socket), None);
    }

    #[test]
    fn test_udp_socket_match_on_local_endpoint() {
        let info = PacketInfo {
            protocol: IpProtocol::UDP,
            dst_ip: None,
            dst_port: 0,
            src_port: 55000,
            ..packet_info(IpProtocol::UDP, false)
        };
        let socket = ProtocolSocketInfo::Udp(UdpSocketInfo {
            local_addr: "10.0.0.2".parse().unwrap(),
            local_port: 55000,
        });
        assert_eq!(SystemStateResolver::match_socket(&info, &socket), Some(false));
    }

    #[test]
    fn test_protocol_mismatch() {
        let info = packet_info(IpProtocol::UDP, false);
        let socket = tcp_socket(
            ("10.0.0.2".parse().unwrap(), 44321),
            ("93.184.216.34".parse().unwrap(), 443),
        );
        assert_eq!(SystemStateResolver::match_socket(&info, &socket), None);
    }

    #[tokio::test]
    async fn test_network_host_is_cached() {
        let resolver = SystemStateResolver::new();
        let ip: IpAddr = "203.0.113.7".parse().unwrap();

        let first = resolver.network_host(ip).await.unwrap();
        let second = resolver.network_host(ip).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.pid, NETWORK_HOST_PROCESS_ID);
        assert!(first.profile().await.is_some());
    }

    #[tokio::test]
    async fn test_profile_per_binary() {
        let resolver = SystemStateResolver::new();
        let one = resolver.profile_for("/usr/bin/curl", "curl");
        let two = resolver.profile_for("/usr/bin/curl", "curl");
        let other = resolver.profile_for("/usr/bin/wget", "wget");
        assert!(Arc::ptr_eq(&one, &two));
        assert_ne!(one.id, other.id);
        assert_eq!(one.source, "local");
    }
}
