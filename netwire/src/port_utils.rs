//! Idle UDP port discovery by bind probing.

use std::net::{Ipv4Addr, SocketAddrV4};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

/// First port probed by [`get_idle_udp_port`].
pub const UDP_PORT_START: u16 = 10000;

const PROBE_RANGE: u16 = 100;

static NEXT_PORT: Mutex<u16> = Mutex::new(UDP_PORT_START);

/// Find an idle UDP port by probing consecutive ports with a bind attempt.
///
/// The probe cursor advances across calls so repeated lookups hand out
/// distinct ports.
pub fn get_idle_udp_port() -> Option<u16> {
    let mut next = NEXT_PORT.lock();
    let start = *next;
    for port in start..start.saturating_add(PROBE_RANGE) {
        if bind_probe(port) {
            *next = port + 1;
            return Some(port);
        }
    }
    warn!(start, "no idle udp port found");
    None
}

/// Find two consecutive idle UDP ports and return the first.
pub fn get_idle_udp_port_pair() -> Option<u16> {
    let mut first = get_idle_udp_port()?;
    loop {
        let second = get_idle_udp_port()?;
        if first + 1 == second {
            return Some(first);
        }
        first = second;
    }
}

fn bind_probe(port: u16) -> bool {
    let Ok(socket) = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) else {
        return false;
    };
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
        .is_ok()
}
