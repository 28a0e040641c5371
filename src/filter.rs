// BPF capture-filter synthesis.
//
// Produces the filter expression installed on every capture handle. The
// expression is the conjunction of: self-frame suppression by source MAC
// (Ethernet devices only), `ip and udp`, the bound port or any IPv4
// fragment (fragments hide the UDP port), and a unicast/multicast group
// matching the bound address and the joined groups.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// The socket-side inputs of the filter expression.
pub(crate) struct FilterConfig<'a> {
    pub bound_address: Ipv4Addr,
    pub bound_port: u16,
    pub multicast_groups: &'a BTreeSet<Ipv4Addr>,
    pub multicast_loopback: bool,
}

pub(crate) fn build_filter(
    config: &FilterConfig<'_>,
    device_is_loopback: bool,
    device_mac: Option<&str>,
) -> String {
    let mut filter = String::new();

    // Outgoing frames carry our own MAC; loopback frames have no Ethernet
    // header at all.
    if !device_is_loopback {
        if let Some(mac) = device_mac {
            filter.push_str(&format!("not ether src {mac} and "));
        }
    }

    filter.push_str("ip and udp");

    // The fragment disjunct: in non-first fragments the UDP port is not
    // visible, so every fragment must pass the kernel filter.
    filter.push_str(&format!(
        " and (udp port {} or (ip[6:2] & 0x3fff != 0))",
        config.bound_port
    ));

    // Unicast traffic, pinned to the bound address unless binding to any
    // or broadcast.
    filter.push_str(" and (((not ip multicast)");
    if !config.bound_address.is_unspecified() && !config.bound_address.is_broadcast() {
        filter.push_str(&format!(" and (ip dst {})", config.bound_address));
    }
    filter.push(')');

    // Multicast traffic for the joined groups. Loopback devices only see
    // it when multicast loopback is enabled.
    if !config.multicast_groups.is_empty() && (!device_is_loopback || config.multicast_loopback) {
        filter.push_str(" or (ip multicast and (");
        for (i, group) in config.multicast_groups.iter().enumerate() {
            if i > 0 {
                filter.push_str(" or ");
            }
            filter.push_str(&format!("dst {group}"));
        }
        filter.push_str("))");
    }

    filter.push(')');
    filter
}

/// MAC address of a network device, for the self-frame suppression clause.
///
/// Only meaningful for Ethernet devices; callers check the link type.
#[cfg(target_os = "linux")]
pub(crate) fn device_mac(device_name: &str) -> Option<String> {
    let path = format!("/sys/class/net/{device_name}/address");
    let mac = std::fs::read_to_string(path).ok()?;
    let mac = mac.trim();
    if mac.is_empty() || mac == "00:00:00:00:00:00" {
        return None;
    }
    Some(mac.to_string())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn device_mac(_device_name: &str) -> Option<String> {
    None
}
