use std::mem;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::ptr;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use nix::errno::Errno;
use nix::sys::socket::bind;
use nix::sys::socket::recv;
use nix::sys::socket::send;
use nix::sys::socket::socket;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::MsgFlags;
use nix::sys::socket::NetlinkAddr;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockProtocol;
use nix::sys::socket::SockType;

use crate::Error;
use crate::Result;

pub const NLMSG_ALIGNTO: usize = 4;
pub const RTA_ALIGNTO: usize = 4;
const RTA_HDR_LEN: usize = 4;

// Attribute ids from linux/if_link.h and linux/if_addr.h that libc does not
// export.
pub const IFLA_IFNAME: u16 = 3;
pub const IFLA_LINKINFO: u16 = 18;
pub const IFLA_NET_NS_PID: u16 = 19;
pub const IFLA_INFO_KIND: u16 = 1;
pub const IFLA_INFO_DATA: u16 = 2;
pub const IFLA_VETH_INFO_PEER: u16 = 1;
pub const IFA_ADDRESS: u16 = 1;
pub const IFA_LOCAL: u16 = 2;
pub const NLA_F_NESTED: u16 = 1 << 15;

// Route message constants from linux/rtnetlink.h.
pub const RT_SCOPE_UNIVERSE: u8 = 0;
pub const RTPROT_STATIC: u8 = 4;
pub const RTN_UNICAST: u8 = 1;

/// One datagram is ample for the requests this runtime sends; responses are
/// at most an NLMSG_ERROR echoing the request header.
const BUFFER_SIZE: usize = 8192;

// rtnetlink extra headers libc has no bindings for.

/// linux/rtnetlink.h `struct ifinfomsg`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(non_camel_case_types)]
pub struct ifinfomsg {
    pub ifi_family: u8,
    pub ifi_pad: u8,
    pub ifi_type: u16,
    pub ifi_index: i32,
    pub ifi_flags: u32,
    pub ifi_change: u32,
}

/// linux/if_addr.h `struct ifaddrmsg`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(non_camel_case_types)]
pub struct ifaddrmsg {
    pub ifa_family: u8,
    pub ifa_prefixlen: u8,
    pub ifa_flags: u8,
    pub ifa_scope: u8,
    pub ifa_index: u32,
}

/// linux/rtnetlink.h `struct rtmsg`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(non_camel_case_types)]
pub struct rtmsg {
    pub rtm_family: u8,
    pub rtm_dst_len: u8,
    pub rtm_src_len: u8,
    pub rtm_tos: u8,
    pub rtm_table: u8,
    pub rtm_protocol: u8,
    pub rtm_scope: u8,
    pub rtm_type: u8,
    pub rtm_flags: u32,
}

/// View a C struct as its wire bytes.
pub fn bytes_of<T>(value: &T) -> &[u8] {
    // SAFETY: T is a #[repr(C)] plain-old-data struct and the slice does not
    // outlive the borrow.
    unsafe { std::slice::from_raw_parts(ptr::from_ref(value).cast::<u8>(), mem::size_of::<T>()) }
}

pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Incremental builder for one netlink request.
///
/// Owns the message buffer and keeps `nlmsg_len` up to date as payload and
/// attributes are appended. Nested attributes record their start offset on
/// `begin_nest` and get their `rta_len` patched on `end_nest`.
pub struct MessageBuilder {
    buf: Vec<u8>,
}

/// Token for an open nested attribute.
#[must_use]
pub struct Nest {
    offset: usize,
}

impl MessageBuilder {
    /// Start a message with the given type, flags and sequence number.
    pub fn new(ty: u16, flags: u16, seq: u32) -> Self {
        let mut buf = Vec::with_capacity(BUFFER_SIZE);
        let header = libc::nlmsghdr {
            nlmsg_len: 0,
            nlmsg_type: ty,
            nlmsg_flags: flags,
            nlmsg_seq: seq,
            nlmsg_pid: 0,
        };
        buf.extend_from_slice(bytes_of(&header));
        let mut message = Self { buf };
        message.patch_len();
        message
    }

    /// Append an extra header (`ifinfomsg`, `ifaddrmsg`, `rtmsg`) directly
    /// after the netlink header.
    pub fn put_extra_header<T: Copy>(&mut self, extra: &T) {
        self.buf.extend_from_slice(bytes_of(extra));
        self.pad_to(NLMSG_ALIGNTO);
        self.patch_len();
    }

    /// Append a type-length-value attribute, RTA_ALIGN padded.
    pub fn put_attr(&mut self, ty: u16, value: &[u8]) {
        let rta_len = (RTA_HDR_LEN + value.len()) as u16;
        self.buf.extend_from_slice(&rta_len.to_ne_bytes());
        self.buf.extend_from_slice(&ty.to_ne_bytes());
        self.buf.extend_from_slice(value);
        self.pad_to(RTA_ALIGNTO);
        self.patch_len();
    }

    /// Append a string attribute, zero-terminated on the wire.
    pub fn put_str_attr(&mut self, ty: u16, value: &str) {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.put_attr(ty, &bytes);
    }

    /// Append a native-endian u32 attribute.
    pub fn put_u32_attr(&mut self, ty: u16, value: u32) {
        self.put_attr(ty, &value.to_ne_bytes());
    }

    /// Open a nested attribute and return the token `end_nest` patches.
    pub fn begin_nest(&mut self, ty: u16) -> Nest {
        let offset = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf
            .extend_from_slice(&(ty | NLA_F_NESTED).to_ne_bytes());
        self.patch_len();
        Nest { offset }
    }

    /// Close a nested attribute: its `rta_len` spans from the opening header
    /// to the current tail.
    pub fn end_nest(&mut self, nest: Nest) {
        let rta_len = (self.buf.len() - nest.offset) as u16;
        self.buf[nest.offset..nest.offset + 2].copy_from_slice(&rta_len.to_ne_bytes());
    }

    /// Append raw bytes with no attribute framing, NLMSG_ALIGN padded.
    ///
    /// The veth peer `ifinfomsg` inside IFLA_VETH_INFO_PEER is embedded this
    /// way: the kernel expects a bare struct there, not a nested netlink
    /// message.
    pub fn put_raw_payload(&mut self, payload: &[u8]) {
        self.buf.extend_from_slice(payload);
        self.pad_to(NLMSG_ALIGNTO);
        self.patch_len();
    }

    /// Finished wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn pad_to(&mut self, align: usize) {
        while self.buf.len() % align != 0 {
            self.buf.push(0);
        }
    }

    fn patch_len(&mut self) {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
    }
}

/// A NETLINK_ROUTE request socket.
///
/// One socket serves exactly one operation; the fd closes when the value
/// drops, so every exit path, success or not, releases it.
pub struct Netlink {
    fd: OwnedFd,
    seq: u32,
}

impl Netlink {
    /// Open and bind an AF_NETLINK route socket with a fresh sequence number.
    pub fn open() -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )
        .map_err(|errno| Error::Netlink {
            operation: "socket",
            errno,
        })?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0)).map_err(|errno| Error::Netlink {
            operation: "bind",
            errno,
        })?;
        let seq = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as u32)
            .unwrap_or(0);
        Ok(Self { fd, seq })
    }

    /// Sequence number requests on this socket must carry.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Send one request and drain responses until the kernel acknowledges or
    /// rejects it.
    ///
    /// The caller owns retry policy; this never retries.
    pub fn request(&self, operation: &'static str, message: &MessageBuilder) -> Result<()> {
        send(self.fd.as_raw_fd(), message.as_bytes(), MsgFlags::empty()).map_err(|errno| {
            Error::Netlink { operation, errno }
        })?;
        self.receive_ack(operation)
    }

    /// Read datagrams until an ACK (success), an error (failure with the
    /// kernel's errno) or NLMSG_DONE. EAGAIN and a zero-byte read both end
    /// the stream cleanly. Responses with a foreign sequence number are
    /// skipped.
    fn receive_ack(&self, operation: &'static str) -> Result<()> {
        let mut buf = [0_u8; BUFFER_SIZE];
        loop {
            let len = match recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(0) => return Ok(()),
                Ok(len) => len,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(errno) => return Err(Error::Netlink { operation, errno }),
            };
            let mut offset = 0;
            while offset + mem::size_of::<libc::nlmsghdr>() <= len {
                // SAFETY: the bounds check above guarantees a full header.
                let header = unsafe {
                    ptr::read_unaligned(buf[offset..].as_ptr().cast::<libc::nlmsghdr>())
                };
                if (header.nlmsg_len as usize) < mem::size_of::<libc::nlmsghdr>() {
                    break;
                }
                if header.nlmsg_seq == self.seq {
                    match i32::from(header.nlmsg_type) {
                        libc::NLMSG_ERROR => {
                            let payload = offset + mem::size_of::<libc::nlmsghdr>();
                            if payload + mem::size_of::<libc::nlmsgerr>() > len {
                                break;
                            }
                            // SAFETY: bounds checked just above.
                            let err = unsafe {
                                ptr::read_unaligned(
                                    buf[payload..].as_ptr().cast::<libc::nlmsgerr>(),
                                )
                            };
                            if err.error == 0 {
                                return Ok(());
                            }
                            return Err(Error::Netlink {
                                operation,
                                errno: Errno::from_raw(-err.error),
                            });
                        }
                        libc::NLMSG_DONE => return Ok(()),
                        _ => {}
                    }
                }
                offset += nlmsg_align(header.nlmsg_len as usize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn header_of(message: &MessageBuilder) -> libc::nlmsghdr {
        // SAFETY: a builder always starts with a full header.
        unsafe { ptr::read_unaligned(message.as_bytes().as_ptr().cast::<libc::nlmsghdr>()) }
    }

    #[test]
    fn header_only_message() {
        let message = MessageBuilder::new(libc::RTM_NEWLINK, libc::NLM_F_REQUEST as u16, 42);
        let header = header_of(&message);
        assert_eq!(header.nlmsg_len as usize, mem::size_of::<libc::nlmsghdr>());
        assert_eq!(header.nlmsg_type, libc::RTM_NEWLINK);
        assert_eq!(header.nlmsg_flags, libc::NLM_F_REQUEST as u16);
        assert_eq!(header.nlmsg_seq, 42);
        assert_eq!(header.nlmsg_pid, 0);
    }

    #[test]
    fn extra_header_extends_length() {
        let mut message = MessageBuilder::new(libc::RTM_NEWLINK, 0, 1);
        message.put_extra_header(&ifinfomsg::default());
        assert_eq!(
            header_of(&message).nlmsg_len as usize,
            mem::size_of::<libc::nlmsghdr>() + mem::size_of::<ifinfomsg>()
        );
    }

    #[test]
    fn attribute_is_padded_but_reports_payload_length() {
        let mut message = MessageBuilder::new(libc::RTM_NEWLINK, 0, 1);
        message.put_attr(7, &[0xAA]);
        let bytes = message.as_bytes();
        let attr = &bytes[16..];
        assert_eq!(u16::from_ne_bytes([attr[0], attr[1]]), 5);
        assert_eq!(u16::from_ne_bytes([attr[2], attr[3]]), 7);
        assert_eq!(attr[4], 0xAA);
        // tail padded to the next 4-byte boundary, included in nlmsg_len
        assert_eq!(bytes.len(), 24);
        assert_eq!(header_of(&message).nlmsg_len, 24);
    }

    #[test]
    fn string_attribute_is_zero_terminated() {
        let mut message = MessageBuilder::new(libc::RTM_NEWLINK, 0, 1);
        message.put_str_attr(IFLA_IFNAME, "veth0");
        let bytes = message.as_bytes();
        let attr = &bytes[16..];
        assert_eq!(u16::from_ne_bytes([attr[0], attr[1]]), 10);
        assert_eq!(&attr[4..10], b"veth0\0");
    }

    #[test]
    fn u32_attribute_needs_no_padding() {
        let mut message = MessageBuilder::new(libc::RTM_NEWLINK, 0, 1);
        message.put_u32_attr(IFLA_NET_NS_PID, 4321);
        let bytes = message.as_bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(
            u32::from_ne_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
            4321
        );
    }

    #[test]
    fn nest_length_spans_to_the_tail() {
        let mut message = MessageBuilder::new(libc::RTM_NEWLINK, 0, 1);
        let nest = message.begin_nest(IFLA_LINKINFO);
        message.put_str_attr(IFLA_INFO_KIND, "veth");
        message.end_nest(nest);
        let bytes = message.as_bytes();
        let nest_header = &bytes[16..20];
        assert_eq!(
            u16::from_ne_bytes([nest_header[0], nest_header[1]]),
            // nest header + inner attribute header + "veth\0" padded to 8
            (4 + 4 + 8) as u16
        );
        assert_eq!(
            u16::from_ne_bytes([nest_header[2], nest_header[3]]),
            IFLA_LINKINFO | NLA_F_NESTED
        );
        assert_eq!(header_of(&message).nlmsg_len as usize, bytes.len());
    }

    #[test]
    fn raw_payload_has_no_attribute_framing() {
        let mut message = MessageBuilder::new(libc::RTM_NEWLINK, 0, 1);
        message.put_raw_payload(bytes_of(&ifinfomsg::default()));
        let bytes = message.as_bytes();
        assert_eq!(bytes.len(), 16 + mem::size_of::<ifinfomsg>());
        assert!(bytes[16..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn alignment_rounds_up_to_four() {
        assert_eq!(nlmsg_align(0), 0);
        assert_eq!(nlmsg_align(1), 4);
        assert_eq!(nlmsg_align(4), 4);
        assert_eq!(nlmsg_align(17), 20);
    }
}
