//! Host-level view of TCP listeners.
//!
//! The registry only knows about bridges this supervisor started. These
//! helpers ask the OS who is listening on a port, for the optional pre-start
//! check and for readiness polling. Probing is passive: connecting to a
//! non-forking socat would consume its single accept and make it exit.

use netstat2::{
    AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, TcpState, get_sockets_info,
};
use std::net::{IpAddr, ToSocketAddrs};
use tracing::debug;

use crate::config::is_wildcard_host;

/// A TCP socket in `LISTEN` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub local_addr: IpAddr,
    pub port: u16,
    pub pids: Vec<u32>,
}

impl Listener {
    /// ` by <name> (PID <pid>)`, or as much of it as is known.
    pub fn describe(&self) -> String {
        let Some(&pid) = self.pids.first() else {
            return String::new();
        };
        #[cfg(target_os = "linux")]
        if let Ok(name) = std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
            return format!(" by {} (PID {})", name.trim(), pid);
        }
        format!(" (PID {})", pid)
    }
}

/// Every socket listening on `port`.
///
/// Blocking: walks the OS socket tables.
pub fn listeners(port: u16) -> Vec<Listener> {
    let af_flags = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
    let sockets = match get_sockets_info(af_flags, ProtocolFlags::TCP) {
        Ok(sockets) => sockets,
        Err(e) => {
            debug!("Failed to read socket table: {}", e);
            return Vec::new();
        }
    };

    sockets
        .into_iter()
        .filter_map(|socket| match socket.protocol_socket_info {
            ProtocolSocketInfo::Tcp(tcp)
                if tcp.state == TcpState::Listen && tcp.local_port == port =>
            {
                Some(Listener {
                    local_addr: tcp.local_addr,
                    port,
                    pids: socket.associated_pids,
                })
            }
            _ => None,
        })
        .collect()
}

/// First listener on `port` whose address collides with `host`.
pub fn listener_on(host: &str, port: u16) -> Option<Listener> {
    listeners(port)
        .into_iter()
        .find(|listener| host_matches(host, listener.local_addr))
}

/// Whether `pid` is listening on `port`.
///
/// Falls back to any listener on `port` when the OS does not report owners,
/// which happens for sockets of other users.
pub fn pid_listening(pid: u32, port: u16) -> bool {
    listeners(port)
        .iter()
        .any(|listener| listener.pids.is_empty() || listener.pids.contains(&pid))
}

/// Whether a listener bound to `addr` would clash with a bridge on `host`.
fn host_matches(host: &str, addr: IpAddr) -> bool {
    if is_wildcard_host(host) || addr.is_unspecified() {
        return true;
    }
    if let Ok(ip) = host.trim().trim_matches(['[', ']']).parse::<IpAddr>() {
        return ip == addr;
    }
    match (host.trim(), 0).to_socket_addrs() {
        Ok(mut resolved) => resolved.any(|candidate| candidate.ip() == addr),
        // Unresolvable name: assume the worst
        Err(_) => true,
    }
}
