// Loopback multicast kickstart.
//
// The host stack does not hand multicast traffic to the loopback path for
// a group until at least one ordinary datagram socket has bound a port and
// joined that group. A throwaway socket does exactly that: it joins every
// tracked group and sends one empty datagram to each, then goes away.
// Everything here is best-effort; failures are logged and ignored.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};

const KICKSTART_PORT: u16 = 62000;

pub(crate) fn kickstart_loopback_multicast(groups: &BTreeSet<Ipv4Addr>) {
    let socket = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) {
        Ok(socket) => socket,
        Err(e) => {
            log::debug!("failed to open kickstart socket: {e}");
            return;
        }
    };

    if let Err(e) = socket.set_reuse_address(true) {
        log::debug!("failed to set address reuse on kickstart socket: {e}");
        return;
    }

    let listen = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, KICKSTART_PORT));
    if let Err(e) = socket.bind(&listen.into()) {
        log::debug!("failed to bind kickstart socket: {e}");
        return;
    }

    if let Err(e) = socket.set_multicast_loop_v4(true) {
        log::debug!("failed to set multicast loopback on kickstart socket: {e}");
        return;
    }

    // Hop limit 0: the kickstart datagrams must never leave the host.
    if let Err(e) = socket.set_multicast_ttl_v4(0) {
        log::debug!("failed to set multicast hop limit on kickstart socket: {e}");
        return;
    }

    for group in groups {
        if let Err(e) = socket.join_multicast_v4(group, &Ipv4Addr::UNSPECIFIED) {
            log::debug!("failed to join {group} with kickstart socket: {e}");
        }
    }

    for group in groups {
        let target = SocketAddr::V4(SocketAddrV4::new(*group, KICKSTART_PORT));
        log::debug!("sending loopback kickstart packet to {target}");
        if let Err(e) = socket.send_to(&[], &target.into()) {
            log::debug!("failed to send kickstart packet to {target}: {e}");
        }
    }
}
