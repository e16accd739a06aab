use std::net::Ipv4Addr;
use std::process::Command;
use std::process::Stdio;

use nix::net::if_::if_nametoindex;
use nix::unistd::Pid;

use crate::bytes_of;
use crate::ifaddrmsg;
use crate::ifinfomsg;
use crate::rtmsg;
use crate::ContainerSpec;
use crate::Error;
use crate::MessageBuilder;
use crate::Netlink;
use crate::NsCursor;
use crate::NsKind;
use crate::Result;
use crate::IFA_ADDRESS;
use crate::IFA_LOCAL;
use crate::IFLA_IFNAME;
use crate::IFLA_INFO_DATA;
use crate::IFLA_INFO_KIND;
use crate::IFLA_LINKINFO;
use crate::IFLA_NET_NS_PID;
use crate::IFLA_VETH_INFO_PEER;
use crate::RTN_UNICAST;
use crate::RTPROT_STATIC;
use crate::RT_SCOPE_UNIVERSE;

const LOOPBACK_IFNAME: &str = "lo";
const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

const ACK_FLAGS: u16 = (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16;
const CREATE_FLAGS: u16 =
    (libc::NLM_F_REQUEST | libc::NLM_F_ACK | libc::NLM_F_CREATE | libc::NLM_F_EXCL) as u16;
const REPLACE_FLAGS: u16 =
    (libc::NLM_F_REQUEST | libc::NLM_F_ACK | libc::NLM_F_CREATE | libc::NLM_F_REPLACE) as u16;

/// Provision the container's network, host side first.
///
/// Creates the veth pair in the host namespace, pushes the container end into
/// the child's network namespace, configures both ends and the container's
/// default route, then turns on forwarding and NAT. A failure at any step
/// removes everything this call had created before the error is returned.
pub fn setup_networking(spec: &ContainerSpec, child_pid: Pid) -> Result<()> {
    log::info!(
        "setting up {} <-> {} for pid {}",
        spec.host_veth,
        spec.container_veth,
        child_pid
    );
    create_veth_pair(&spec.host_veth, &spec.container_veth)?;
    if let Err(e) = configure_veth_pair(spec, child_pid) {
        teardown_networking(spec);
        return Err(e);
    }
    log::info!("network setup complete");
    Ok(())
}

/// Reverse [`setup_networking`]: drop the NAT rule, then the veth pair.
/// Idempotent; resources that are already gone are skipped with a debug log.
pub fn teardown_networking(spec: &ContainerSpec) {
    remove_masquerade(spec);
    if let Err(e) = delete_link(&spec.host_veth) {
        log::debug!("veth {} not deleted: {}", spec.host_veth, e);
    }
}

/// Everything that runs after the pair exists; split out so the caller can
/// unwind the pair on failure.
fn configure_veth_pair(spec: &ContainerSpec, child_pid: Pid) -> Result<()> {
    move_to_namespace(&spec.container_veth, child_pid)?;
    set_link_up(&spec.host_veth)?;
    assign_ipv4(&spec.host_veth, spec.host_ip, spec.prefix_len)?;
    configure_container_side(spec, child_pid)?;
    enable_ip_forwarding()?;
    install_masquerade(spec)?;
    Ok(())
}

/// Configure the container end from inside the child's network namespace.
///
/// The cursor restores the host namespace on every path out of here; the
/// netlink sockets are opened after the switch so name lookups resolve in the
/// child's namespace.
fn configure_container_side(spec: &ContainerSpec, child_pid: Pid) -> Result<()> {
    let cursor = NsCursor::enter(child_pid, NsKind::Net)?;
    let result = (|| {
        set_link_up(LOOPBACK_IFNAME)?;
        set_link_up(&spec.container_veth)?;
        assign_ipv4(&spec.container_veth, spec.container_ip, spec.prefix_len)?;
        add_default_route(spec.host_ip, &spec.container_veth)
    })();
    let restored = cursor.restore();
    result.and(restored)
}

/// Create a veth pair with both ends in the current network namespace.
pub(crate) fn create_veth_pair(host: &str, peer: &str) -> Result<()> {
    let netlink = Netlink::open()?;
    let message = veth_pair_message(netlink.seq(), host, peer);
    netlink.request("create veth pair", &message)
}

/// Move `ifname` into the network namespace of `pid`.
pub(crate) fn move_to_namespace(ifname: &str, pid: Pid) -> Result<()> {
    let netlink = Netlink::open()?;
    let message = move_message(netlink.seq(), ifname, pid.as_raw() as u32);
    netlink.request("move link to namespace", &message)
}

/// Set IFF_UP on `ifname` in the current namespace.
pub(crate) fn set_link_up(ifname: &str) -> Result<()> {
    let index = link_index(ifname)?;
    let netlink = Netlink::open()?;
    let message = link_up_message(netlink.seq(), index, ifname);
    netlink.request("set link up", &message)
}

/// Assign `ip/prefix_len` to `ifname` in the current namespace.
pub(crate) fn assign_ipv4(ifname: &str, ip: Ipv4Addr, prefix_len: u8) -> Result<()> {
    let index = link_index(ifname)?;
    let netlink = Netlink::open()?;
    let message = address_message(netlink.seq(), index, ip, prefix_len);
    netlink.request("assign address", &message)
}

/// Install a default route through `gateway` out of `ifname`.
pub(crate) fn add_default_route(gateway: Ipv4Addr, ifname: &str) -> Result<()> {
    let index = link_index(ifname)?;
    let netlink = Netlink::open()?;
    let message = route_message(netlink.seq(), index, gateway);
    netlink.request("add default route", &message)
}

/// Delete `ifname`; for a veth this takes the peer with it.
pub(crate) fn delete_link(ifname: &str) -> Result<()> {
    let netlink = Netlink::open()?;
    let message = delete_message(netlink.seq(), ifname);
    netlink.request("delete link", &message)
}

/// Turn on IPv4 forwarding host-wide so replies can travel back through the
/// veth.
pub(crate) fn enable_ip_forwarding() -> Result<()> {
    std::fs::write(IP_FORWARD, "1").map_err(|source| Error::Filesystem {
        operation: "write",
        path: IP_FORWARD.into(),
        source,
    })
}

/// Masquerade container traffic leaving through any interface but the veth.
///
/// Netfilter configuration has no place in this runtime's netlink code, so
/// this shells out to iptables. A stale rule from a crashed run is removed
/// first.
pub(crate) fn install_masquerade(spec: &ContainerSpec) -> Result<()> {
    let _ = iptables_masquerade("-D", spec, true);
    match iptables_masquerade("-A", spec, false) {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(Error::Nat {
            operation: "install rule",
            detail: format!("iptables exited with {status}"),
        }),
        Err(e) => Err(Error::Nat {
            operation: "install rule",
            detail: e.to_string(),
        }),
    }
}

/// Drop the masquerade rule. Missing rules are fine.
pub(crate) fn remove_masquerade(spec: &ContainerSpec) {
    match iptables_masquerade("-D", spec, true) {
        Ok(status) if !status.success() => {
            log::debug!("masquerade rule for {} not removed", spec.container_network);
        }
        Ok(_) => {}
        Err(e) => log::warn!("failed to run iptables: {e}"),
    }
}

fn iptables_masquerade(
    action: &str,
    spec: &ContainerSpec,
    quiet: bool,
) -> std::io::Result<std::process::ExitStatus> {
    let mut command = Command::new("iptables");
    command.args([
        "-t",
        "nat",
        action,
        "POSTROUTING",
        "-s",
        &spec.container_network.to_string(),
        "!",
        "-o",
        &spec.host_veth,
        "-j",
        "MASQUERADE",
    ]);
    if quiet {
        command.stderr(Stdio::null());
    }
    command.status()
}

fn link_index(ifname: &str) -> Result<u32> {
    if_nametoindex(ifname).map_err(|errno| Error::Netlink {
        operation: "resolve interface index",
        errno,
    })
}

// Message assembly, split from the socket calls so the wire layout is
// checkable without privileges.

/// RTM_NEWLINK creating both ends of a veth pair at once.
///
/// The peer is described inside IFLA_LINKINFO / IFLA_INFO_DATA /
/// IFLA_VETH_INFO_PEER; the nest starts with a bare `ifinfomsg` for the peer
/// followed by the peer's own attributes.
fn veth_pair_message(seq: u32, host: &str, peer: &str) -> MessageBuilder {
    let mut message = MessageBuilder::new(libc::RTM_NEWLINK, CREATE_FLAGS, seq);
    message.put_extra_header(&ifinfomsg::default());
    message.put_str_attr(IFLA_IFNAME, host);
    let linkinfo = message.begin_nest(IFLA_LINKINFO);
    message.put_str_attr(IFLA_INFO_KIND, "veth");
    let infodata = message.begin_nest(IFLA_INFO_DATA);
    let peerinfo = message.begin_nest(IFLA_VETH_INFO_PEER);
    message.put_raw_payload(bytes_of(&ifinfomsg::default()));
    message.put_str_attr(IFLA_IFNAME, peer);
    message.end_nest(peerinfo);
    message.end_nest(infodata);
    message.end_nest(linkinfo);
    message
}

fn move_message(seq: u32, ifname: &str, pid: u32) -> MessageBuilder {
    let mut message = MessageBuilder::new(libc::RTM_SETLINK, ACK_FLAGS, seq);
    message.put_extra_header(&ifinfomsg::default());
    message.put_str_attr(IFLA_IFNAME, ifname);
    message.put_u32_attr(IFLA_NET_NS_PID, pid);
    message
}

fn link_up_message(seq: u32, index: u32, ifname: &str) -> MessageBuilder {
    let mut message = MessageBuilder::new(libc::RTM_NEWLINK, ACK_FLAGS, seq);
    message.put_extra_header(&ifinfomsg {
        ifi_index: index as i32,
        ifi_flags: libc::IFF_UP as u32,
        ifi_change: libc::IFF_UP as u32,
        ..Default::default()
    });
    message.put_str_attr(IFLA_IFNAME, ifname);
    message
}

fn address_message(seq: u32, index: u32, ip: Ipv4Addr, prefix_len: u8) -> MessageBuilder {
    let mut message = MessageBuilder::new(libc::RTM_NEWADDR, REPLACE_FLAGS, seq);
    message.put_extra_header(&ifaddrmsg {
        ifa_family: libc::AF_INET as u8,
        ifa_prefixlen: prefix_len,
        ifa_flags: 0,
        ifa_scope: RT_SCOPE_UNIVERSE,
        ifa_index: index,
    });
    message.put_attr(IFA_LOCAL, &ip.octets());
    message.put_attr(IFA_ADDRESS, &ip.octets());
    message
}

fn route_message(seq: u32, index: u32, gateway: Ipv4Addr) -> MessageBuilder {
    let mut message = MessageBuilder::new(libc::RTM_NEWROUTE, CREATE_FLAGS, seq);
    message.put_extra_header(&rtmsg {
        rtm_family: libc::AF_INET as u8,
        rtm_dst_len: 0,
        rtm_src_len: 0,
        rtm_tos: 0,
        rtm_table: libc::RT_TABLE_MAIN as u8,
        rtm_protocol: RTPROT_STATIC,
        rtm_scope: RT_SCOPE_UNIVERSE,
        rtm_type: RTN_UNICAST,
        rtm_flags: 0,
    });
    message.put_attr(libc::RTA_GATEWAY as u16, &gateway.octets());
    message.put_u32_attr(libc::RTA_OIF as u16, index);
    message
}

fn delete_message(seq: u32, ifname: &str) -> MessageBuilder {
    let mut message = MessageBuilder::new(libc::RTM_DELLINK, ACK_FLAGS, seq);
    message.put_extra_header(&ifinfomsg::default());
    message.put_str_attr(IFLA_IFNAME, ifname);
    message
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use std::mem;
    use std::ptr;

    use super::*;
    use crate::nlmsg_align;
    use crate::NLA_F_NESTED;

    const NLMSG_HDR_LEN: usize = mem::size_of::<libc::nlmsghdr>();

    fn header(bytes: &[u8]) -> libc::nlmsghdr {
        // SAFETY: every message starts with a full netlink header.
        unsafe { ptr::read_unaligned(bytes.as_ptr().cast::<libc::nlmsghdr>()) }
    }

    /// Walk a run of rtattrs, returning (type, payload) pairs.
    fn attrs(mut bytes: &[u8]) -> Vec<(u16, Vec<u8>)> {
        let mut out = Vec::new();
        while bytes.len() >= 4 {
            let rta_len = u16::from_ne_bytes([bytes[0], bytes[1]]) as usize;
            let rta_type = u16::from_ne_bytes([bytes[2], bytes[3]]);
            assert!(rta_len >= 4 && rta_len <= bytes.len(), "corrupt attribute");
            out.push((rta_type, bytes[4..rta_len].to_vec()));
            let next = nlmsg_align(rta_len);
            if next >= bytes.len() {
                break;
            }
            bytes = &bytes[next..];
        }
        out
    }

    fn find(attrs: &[(u16, Vec<u8>)], ty: u16) -> Vec<u8> {
        attrs
            .iter()
            .find(|(t, _)| *t == ty || *t == (ty | NLA_F_NESTED))
            .map(|(_, payload)| payload.clone())
            .unwrap_or_else(|| panic!("attribute {ty} missing"))
    }

    #[test]
    fn veth_create_message_layout() {
        let message = veth_pair_message(7, "veth0", "ceth0");
        let bytes = message.as_bytes();

        let hdr = header(bytes);
        assert_eq!(hdr.nlmsg_type, libc::RTM_NEWLINK);
        assert_eq!(hdr.nlmsg_len as usize, bytes.len());
        assert_eq!(hdr.nlmsg_seq, 7);
        assert_eq!(
            hdr.nlmsg_flags & (libc::NLM_F_CREATE | libc::NLM_F_EXCL) as u16,
            (libc::NLM_F_CREATE | libc::NLM_F_EXCL) as u16
        );

        let body = &bytes[NLMSG_HDR_LEN + mem::size_of::<ifinfomsg>()..];
        let outer = attrs(body);
        assert_eq!(find(&outer, IFLA_IFNAME), b"veth0\0");

        let linkinfo = attrs(&find(&outer, IFLA_LINKINFO));
        assert_eq!(find(&linkinfo, IFLA_INFO_KIND), b"veth\0");

        let infodata = attrs(&find(&linkinfo, IFLA_INFO_DATA));
        let peer = find(&infodata, IFLA_VETH_INFO_PEER);

        // The nest opens with a bare ifinfomsg, not another attribute: the
        // first four bytes would otherwise read as an rta header.
        let embedded = &peer[..mem::size_of::<ifinfomsg>()];
        assert!(embedded.iter().all(|byte| *byte == 0));
        let peer_attrs = attrs(&peer[mem::size_of::<ifinfomsg>()..]);
        assert_eq!(find(&peer_attrs, IFLA_IFNAME), b"ceth0\0");
    }

    #[test]
    fn move_message_carries_name_and_pid() {
        let message = move_message(1, "ceth0", 4321);
        let bytes = message.as_bytes();
        assert_eq!(header(bytes).nlmsg_type, libc::RTM_SETLINK);
        let body = attrs(&bytes[NLMSG_HDR_LEN + mem::size_of::<ifinfomsg>()..]);
        assert_eq!(find(&body, IFLA_IFNAME), b"ceth0\0");
        assert_eq!(find(&body, IFLA_NET_NS_PID), 4321_u32.to_ne_bytes());
    }

    #[test]
    fn link_up_message_sets_and_masks_iff_up() {
        let message = link_up_message(1, 5, "veth0");
        let bytes = message.as_bytes();
        assert_eq!(header(bytes).nlmsg_type, libc::RTM_NEWLINK);
        // SAFETY: the extra header directly follows the netlink header.
        let info = unsafe {
            ptr::read_unaligned(bytes[NLMSG_HDR_LEN..].as_ptr().cast::<ifinfomsg>())
        };
        assert_eq!(info.ifi_index, 5);
        assert_eq!(info.ifi_flags, libc::IFF_UP as u32);
        assert_eq!(info.ifi_change, libc::IFF_UP as u32);
    }

    #[test]
    fn address_message_uses_network_byte_order() {
        let ip = Ipv4Addr::new(172, 18, 0, 1);
        let message = address_message(1, 3, ip, 16);
        let bytes = message.as_bytes();
        assert_eq!(header(bytes).nlmsg_type, libc::RTM_NEWADDR);
        // SAFETY: the extra header directly follows the netlink header.
        let addr = unsafe {
            ptr::read_unaligned(bytes[NLMSG_HDR_LEN..].as_ptr().cast::<ifaddrmsg>())
        };
        assert_eq!(addr.ifa_family, libc::AF_INET as u8);
        assert_eq!(addr.ifa_prefixlen, 16);
        assert_eq!(addr.ifa_index, 3);
        let body = attrs(&bytes[NLMSG_HDR_LEN + mem::size_of::<ifaddrmsg>()..]);
        assert_eq!(find(&body, IFA_LOCAL), [172, 18, 0, 1]);
        assert_eq!(find(&body, IFA_ADDRESS), [172, 18, 0, 1]);
    }

    #[test]
    fn route_message_is_a_static_default_route() {
        let gateway = Ipv4Addr::new(172, 18, 0, 1);
        let message = route_message(1, 9, gateway);
        let bytes = message.as_bytes();
        assert_eq!(header(bytes).nlmsg_type, libc::RTM_NEWROUTE);
        // SAFETY: the extra header directly follows the netlink header.
        let route = unsafe {
            ptr::read_unaligned(bytes[NLMSG_HDR_LEN..].as_ptr().cast::<rtmsg>())
        };
        assert_eq!(route.rtm_family, libc::AF_INET as u8);
        assert_eq!(route.rtm_dst_len, 0);
        assert_eq!(route.rtm_table, libc::RT_TABLE_MAIN as u8);
        assert_eq!(route.rtm_protocol, RTPROT_STATIC);
        assert_eq!(route.rtm_type, RTN_UNICAST);
        let body = attrs(&bytes[NLMSG_HDR_LEN + mem::size_of::<rtmsg>()..]);
        assert_eq!(find(&body, libc::RTA_GATEWAY as u16), [172, 18, 0, 1]);
        assert_eq!(find(&body, libc::RTA_OIF as u16), 9_u32.to_ne_bytes());
    }

    #[test]
    fn delete_message_identifies_by_name() {
        let message = delete_message(1, "veth0");
        let bytes = message.as_bytes();
        assert_eq!(header(bytes).nlmsg_type, libc::RTM_DELLINK);
        let body = attrs(&bytes[NLMSG_HDR_LEN + mem::size_of::<ifinfomsg>()..]);
        assert_eq!(find(&body, IFLA_IFNAME), b"veth0\0");
    }
}
