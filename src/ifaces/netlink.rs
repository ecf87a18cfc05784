//! Route-netlink plumbing: link dumps, address dumps, and the link
//! multicast subscription.

use std::ffi::CStr;
use std::net::IpAddr;

use anyhow::{Context, Result};
use neli::consts::nl::{NlmF, NlmFFlags};
use neli::consts::rtnl::{Arphrd, Ifa, IffFlags, Ifla, RtAddrFamily, Rtm};
use neli::consts::socket::NlFamily;
use neli::nl::{NlPayload, Nlmsghdr};
use neli::rtnl::{Ifaddrmsg, Ifinfomsg};
use neli::socket::NlSocketHandle;
use neli::types::RtBuffer;

use super::{Interface, NetNs};

pub(crate) const RTM_NEWLINK: u16 = 16;
pub(crate) const RTM_DELLINK: u16 = 17;

/// rtnetlink multicast group carrying link add/remove notifications.
pub(crate) const RTNLGRP_LINK: u32 = 1;

/// Numeric message type of a received netlink header. neli resolves
/// type codes against several const families, so the enum variant a
/// link message lands in is not reliable; the raw code is.
pub(crate) fn msg_type(nl_type: &neli::consts::nl::NlTypeWrapper) -> u16 {
    use neli::consts::nl::NlTypeWrapper;
    match nl_type {
        NlTypeWrapper::Nlmsg(t) => u16::from(*t),
        NlTypeWrapper::GenlId(t) => u16::from(*t),
        NlTypeWrapper::Rtm(t) => u16::from(*t),
        NlTypeWrapper::UnrecognizedConst(v) => *v,
        // Link messages never arrive under another const family.
        _ => 0,
    }
}

/// Enumerate all links in the current network namespace.
pub fn link_dump() -> Result<Vec<Interface>> {
    let msg = Ifinfomsg::new(
        RtAddrFamily::Unspecified,
        Arphrd::None,
        0,
        IffFlags::empty(),
        IffFlags::empty(),
        RtBuffer::new(),
    );
    let req = Nlmsghdr::new(
        None,
        Rtm::Getlink,
        NlmFFlags::new(&[NlmF::Request, NlmF::Dump]),
        None,
        None,
        NlPayload::Payload(msg),
    );

    let mut socket = NlSocketHandle::connect(NlFamily::Route, None, &[])
        .context("opening rtnetlink socket")?;
    socket.send(req).context("sending link dump request")?;

    let netns = NetNs::current();
    let mut links = Vec::new();
    for m in socket.iter::<neli::consts::nl::NlTypeWrapper, Ifinfomsg>(false) {
        let m = m.context("reading link dump response")?;
        if msg_type(&m.nl_type) != RTM_NEWLINK {
            continue;
        }
        let payload = m.get_payload().context("link dump payload")?;
        if let Some(iface) = interface_from_payload(payload, netns) {
            links.push(iface);
        }
    }

    Ok(links)
}

/// Enumerate all addresses as `(interface index, address)` pairs.
pub fn addr_dump() -> Result<Vec<(u32, IpAddr)>> {
    let msg = Ifaddrmsg {
        ifa_family: RtAddrFamily::Unspecified,
        ifa_prefixlen: 0,
        ifa_flags: neli::consts::rtnl::IfaFFlags::empty(),
        ifa_scope: 0,
        ifa_index: 0,
        rtattrs: RtBuffer::new(),
    };
    let req = Nlmsghdr::new(
        None,
        Rtm::Getaddr,
        NlmFFlags::new(&[NlmF::Request, NlmF::Dump]),
        None,
        None,
        NlPayload::Payload(msg),
    );

    let mut socket = NlSocketHandle::connect(NlFamily::Route, None, &[])
        .context("opening rtnetlink socket")?;
    socket.send(req).context("sending address dump request")?;

    let mut addrs = Vec::new();
    for m in socket.iter::<neli::consts::nl::NlTypeWrapper, Ifaddrmsg>(false) {
        let m = m.context("reading address dump response")?;
        if m.nl_type != Rtm::Newaddr.into() {
            continue;
        }
        let payload = m.get_payload().context("address dump payload")?;

        for attr in payload.rtattrs.iter() {
            if attr.rta_type == Ifa::Address {
                if let Some(ip) = parse_ip_slice(attr.rta_payload.as_ref()) {
                    addrs.push((payload.ifa_index as u32, ip));
                }
            }
        }
    }

    Ok(addrs)
}

/// Open a socket subscribed to link add/remove notifications.
pub(crate) fn subscribe_links() -> Result<NlSocketHandle> {
    NlSocketHandle::connect(NlFamily::Route, None, &[RTNLGRP_LINK])
        .context("subscribing to rtnetlink link notifications")
}

/// Extract the interface described by a link message payload.
pub(crate) fn interface_from_payload(payload: &Ifinfomsg, netns: NetNs) -> Option<Interface> {
    let mut name = None;
    for attr in payload.rtattrs.iter() {
        if attr.rta_type == Ifla::Ifname {
            name = CStr::from_bytes_with_nul(attr.rta_payload.as_ref())
                .ok()
                .and_then(|c| c.to_str().ok())
                .map(String::from);
        }
    }

    Some(Interface {
        name: name?,
        index: payload.ifi_index as u32,
        netns,
    })
}

pub(crate) fn parse_ip_slice(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <&[u8; 4]>::try_from(raw).ok().map(|b| IpAddr::from(*b)),
        16 => <&[u8; 16]>::try_from(raw).ok().map(|b| IpAddr::from(*b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_resolves_link_codes() {
        use neli::consts::nl::{Nlmsg, NlTypeWrapper};

        assert_eq!(msg_type(&NlTypeWrapper::Rtm(Rtm::Newlink)), RTM_NEWLINK);
        assert_eq!(msg_type(&NlTypeWrapper::Rtm(Rtm::Dellink)), RTM_DELLINK);
        assert_eq!(
            msg_type(&NlTypeWrapper::UnrecognizedConst(RTM_DELLINK)),
            RTM_DELLINK
        );
        // NLMSG_DONE terminates a dump.
        assert_eq!(msg_type(&NlTypeWrapper::Nlmsg(Nlmsg::Done)), 3);
    }

    #[test]
    fn test_parse_ip_slice() {
        assert_eq!(
            parse_ip_slice(&[10, 0, 0, 1]),
            Some("10.0.0.1".parse().unwrap())
        );
        let v6 = "2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap();
        assert_eq!(parse_ip_slice(&v6.octets()), Some(IpAddr::V6(v6)));
        assert_eq!(parse_ip_slice(&[1, 2, 3]), None);
    }
}
