//! DHCP/BOOTP wire format
//!
//! Fixed 240-byte header (including the magic cookie) followed by TLV
//! options. Only the options the client sends or understands are
//! modelled; unknown option types are skipped on parse.

use std::net::Ipv4Addr;

pub const DHCP_MAGIC: u32 = 0x6382_5363;
pub const OP_BOOTREQUEST: u8 = 1;
pub const OP_BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;

/// Fixed header including the magic cookie
pub const HEADER_LEN: usize = 240;

/// DNS servers kept from an ACK; extra entries are dropped
pub const MAX_DNS_SERVERS: usize = 16;

pub const OPT_PAD: u8 = 0;
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS: u8 = 6;
pub const OPT_HOST_NAME: u8 = 12;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAM_REQUEST_LIST: u8 = 55;
pub const OPT_MAX_MESSAGE_SIZE: u8 = 57;
pub const OPT_VENDOR_CLASS_ID: u8 = 60;
pub const OPT_CLIENT_ID: u8 = 61;
pub const OPT_END: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            4 => Some(Self::Decline),
            5 => Some(Self::Ack),
            6 => Some(Self::Nak),
            7 => Some(Self::Release),
            8 => Some(Self::Inform),
            _ => None,
        }
    }
}

/// Everything that goes into an outgoing DISCOVER or REQUEST
#[derive(Debug, Clone, Copy)]
pub struct RequestParams<'a> {
    pub kind: MessageType,
    pub xid: u32,
    pub client_mac: [u8; 6],
    /// MTU of the conduit plus the 28 IP/UDP header bytes
    pub max_message_size: u16,
    pub requested_ip: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
    pub hostname: Option<&'a str>,
    pub vendor_class_id: Option<&'a str>,
    pub client_id: Option<&'a [u8]>,
}

/// Validated fields of an incoming BOOTREPLY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: MessageType,
    pub yiaddr: Ipv4Addr,
    pub server_id: Ipv4Addr,
    pub lease_time: Option<u32>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
}

fn push_option(out: &mut Vec<u8>, code: u8, payload: &[u8]) {
    debug_assert!(payload.len() <= u8::MAX as usize);
    out.push(code);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
}

/// Serialise a client message. Option order follows the reference
/// client: message type, requested IP, server id, maximum message
/// size, parameter request list, then the configured identity options.
pub fn build_request(params: &RequestParams<'_>) -> Vec<u8> {
    debug_assert!(matches!(params.kind, MessageType::Discover | MessageType::Request));

    let mut out = vec![0u8; HEADER_LEN];
    out[0] = OP_BOOTREQUEST;
    out[1] = HTYPE_ETHERNET;
    out[2] = 6;
    out[4..8].copy_from_slice(&params.xid.to_be_bytes());
    out[28..34].copy_from_slice(&params.client_mac);
    out[236..240].copy_from_slice(&DHCP_MAGIC.to_be_bytes());

    push_option(&mut out, OPT_MESSAGE_TYPE, &[params.kind as u8]);

    if let Some(addr) = params.requested_ip {
        push_option(&mut out, OPT_REQUESTED_IP, &addr.octets());
    }
    if let Some(addr) = params.server_id {
        push_option(&mut out, OPT_SERVER_ID, &addr.octets());
    }

    push_option(&mut out, OPT_MAX_MESSAGE_SIZE, &params.max_message_size.to_be_bytes());
    push_option(
        &mut out,
        OPT_PARAM_REQUEST_LIST,
        &[OPT_SUBNET_MASK, OPT_ROUTER, OPT_DNS, OPT_LEASE_TIME],
    );

    if let Some(hostname) = params.hostname {
        push_option(&mut out, OPT_HOST_NAME, hostname.as_bytes());
    }
    if let Some(id) = params.vendor_class_id {
        push_option(&mut out, OPT_VENDOR_CLASS_ID, id.as_bytes());
    }
    if let Some(id) = params.client_id {
        push_option(&mut out, OPT_CLIENT_ID, id);
    }

    out.push(OPT_END);
    out
}

fn opt_ipv4(payload: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = payload.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// Parse and validate a reply against the transaction in flight.
///
/// `None` means the datagram is not for us or is malformed and must be
/// dropped: wrong op/htype/hlen, foreign xid or chaddr, missing magic,
/// bad option framing, data after END, missing END, unexpected message
/// type, or no server identifier.
pub fn parse_reply(buf: &[u8], xid: u32, client_mac: &[u8; 6]) -> Option<Reply> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    if buf[0] != OP_BOOTREPLY || buf[1] != HTYPE_ETHERNET || buf[2] != 6 {
        return None;
    }
    if buf[4..8] != xid.to_be_bytes() {
        return None;
    }
    if buf[28..34] != *client_mac {
        return None;
    }
    if buf[236..240] != DHCP_MAGIC.to_be_bytes() {
        return None;
    }

    let yiaddr = Ipv4Addr::from([buf[16], buf[17], buf[18], buf[19]]);

    let mut pos = HEADER_LEN;
    let mut have_end = false;
    let mut kind = None;
    let mut server_id = None;
    let mut lease_time = None;
    let mut subnet_mask = None;
    let mut router = None;
    let mut dns_servers = Vec::new();

    while pos < buf.len() {
        if buf[pos] == OPT_PAD {
            pos += 1;
            continue;
        }
        if have_end {
            // anything but padding after END is malformed
            return None;
        }
        if buf[pos] == OPT_END {
            pos += 1;
            have_end = true;
            continue;
        }

        if buf.len() - pos < 2 {
            return None;
        }
        let code = buf[pos];
        let len = buf[pos + 1] as usize;
        pos += 2;
        if buf.len() - pos < len {
            return None;
        }
        let payload = &buf[pos..pos + len];
        pos += len;

        match code {
            OPT_MESSAGE_TYPE => {
                if len != 1 {
                    return None;
                }
                kind = Some(payload[0]);
            }
            OPT_SERVER_ID => {
                server_id = Some(opt_ipv4(payload)?);
            }
            OPT_LEASE_TIME => {
                let raw: [u8; 4] = payload.try_into().ok()?;
                lease_time = Some(u32::from_be_bytes(raw));
            }
            OPT_SUBNET_MASK => {
                subnet_mask = Some(opt_ipv4(payload)?);
            }
            OPT_ROUTER => {
                router = Some(opt_ipv4(payload)?);
            }
            OPT_DNS => {
                if len % 4 != 0 {
                    return None;
                }
                for chunk in payload.chunks_exact(4) {
                    if dns_servers.len() == MAX_DNS_SERVERS {
                        break;
                    }
                    dns_servers.push(opt_ipv4(chunk)?);
                }
            }
            _ => {} // unknown options are skipped
        }
    }

    if !have_end {
        return None;
    }

    let kind = MessageType::from_u8(kind?)?;
    if !matches!(kind, MessageType::Offer | MessageType::Ack | MessageType::Nak) {
        return None;
    }

    Some(Reply {
        kind,
        yiaddr,
        server_id: server_id?,
        lease_time,
        subnet_mask,
        router,
        dns_servers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> RequestParams<'static> {
        RequestParams {
            kind: MessageType::Discover,
            xid: 0xdead_beef,
            client_mac: [2, 0, 0, 0, 0, 1],
            max_message_size: 1500 + 28,
            requested_ip: None,
            server_id: None,
            hostname: None,
            vendor_class_id: None,
            client_id: None,
        }
    }

    fn option_payload<'a>(msg: &'a [u8], code: u8) -> Option<&'a [u8]> {
        let mut pos = HEADER_LEN;
        while pos < msg.len() && msg[pos] != OPT_END {
            if msg[pos] == OPT_PAD {
                pos += 1;
                continue;
            }
            let (c, len) = (msg[pos], msg[pos + 1] as usize);
            if c == code {
                return Some(&msg[pos + 2..pos + 2 + len]);
            }
            pos += 2 + len;
        }
        None
    }

    #[test]
    fn discover_layout() {
        let msg = build_request(&base_params());
        assert_eq!(msg[0], OP_BOOTREQUEST);
        assert_eq!(msg[1], HTYPE_ETHERNET);
        assert_eq!(msg[2], 6);
        assert_eq!(&msg[4..8], &0xdead_beefu32.to_be_bytes());
        assert_eq!(&msg[28..34], &[2, 0, 0, 0, 0, 1]);
        assert_eq!(&msg[236..240], &DHCP_MAGIC.to_be_bytes());
        assert_eq!(*msg.last().unwrap(), OPT_END);

        assert_eq!(option_payload(&msg, OPT_MESSAGE_TYPE), Some(&[1u8][..]));
        assert_eq!(
            option_payload(&msg, OPT_PARAM_REQUEST_LIST),
            Some(&[OPT_SUBNET_MASK, OPT_ROUTER, OPT_DNS, OPT_LEASE_TIME][..])
        );
        assert!(option_payload(&msg, OPT_REQUESTED_IP).is_none());
        assert!(option_payload(&msg, OPT_SERVER_ID).is_none());
    }

    #[test]
    fn request_carries_offer_snapshot() {
        let mut params = base_params();
        params.kind = MessageType::Request;
        params.requested_ip = Some(Ipv4Addr::new(10, 0, 0, 5));
        params.server_id = Some(Ipv4Addr::new(10, 0, 0, 1));
        params.hostname = Some("burrow");

        let msg = build_request(&params);
        assert_eq!(option_payload(&msg, OPT_MESSAGE_TYPE), Some(&[3u8][..]));
        assert_eq!(option_payload(&msg, OPT_REQUESTED_IP), Some(&[10, 0, 0, 5][..]));
        assert_eq!(option_payload(&msg, OPT_SERVER_ID), Some(&[10, 0, 0, 1][..]));
        assert_eq!(option_payload(&msg, OPT_HOST_NAME), Some("burrow".as_bytes()));
    }

    #[test]
    fn reply_requires_end_option() {
        let mut msg = vec![0u8; HEADER_LEN];
        msg[0] = OP_BOOTREPLY;
        msg[1] = HTYPE_ETHERNET;
        msg[2] = 6;
        msg[236..240].copy_from_slice(&DHCP_MAGIC.to_be_bytes());
        push_option(&mut msg, OPT_MESSAGE_TYPE, &[MessageType::Ack as u8]);
        push_option(&mut msg, OPT_SERVER_ID, &[10, 0, 0, 1]);

        assert!(parse_reply(&msg, 0, &[0; 6]).is_none());
        msg.push(OPT_END);
        assert!(parse_reply(&msg, 0, &[0; 6]).is_some());
        // trailing garbage after END
        msg.push(OPT_MESSAGE_TYPE);
        assert!(parse_reply(&msg, 0, &[0; 6]).is_none());
    }

    #[test]
    fn reply_rejects_foreign_xid_and_mac() {
        let mut msg = vec![0u8; HEADER_LEN];
        msg[0] = OP_BOOTREPLY;
        msg[1] = HTYPE_ETHERNET;
        msg[2] = 6;
        msg[4..8].copy_from_slice(&7u32.to_be_bytes());
        msg[28..34].copy_from_slice(&[2, 0, 0, 0, 0, 1]);
        msg[236..240].copy_from_slice(&DHCP_MAGIC.to_be_bytes());
        push_option(&mut msg, OPT_MESSAGE_TYPE, &[MessageType::Ack as u8]);
        push_option(&mut msg, OPT_SERVER_ID, &[10, 0, 0, 1]);
        msg.push(OPT_END);

        assert!(parse_reply(&msg, 7, &[2, 0, 0, 0, 0, 1]).is_some());
        assert!(parse_reply(&msg, 8, &[2, 0, 0, 0, 0, 1]).is_none());
        assert!(parse_reply(&msg, 7, &[2, 0, 0, 0, 0, 2]).is_none());
    }

    #[test]
    fn reply_truncates_dns_list() {
        let mut msg = vec![0u8; HEADER_LEN];
        msg[0] = OP_BOOTREPLY;
        msg[1] = HTYPE_ETHERNET;
        msg[2] = 6;
        msg[236..240].copy_from_slice(&DHCP_MAGIC.to_be_bytes());
        push_option(&mut msg, OPT_MESSAGE_TYPE, &[MessageType::Ack as u8]);
        push_option(&mut msg, OPT_SERVER_ID, &[10, 0, 0, 1]);
        let mut dns = Vec::new();
        for i in 0..(MAX_DNS_SERVERS as u8 + 4) {
            dns.extend_from_slice(&[10, 0, 1, i]);
        }
        push_option(&mut msg, OPT_DNS, &dns);
        msg.push(OPT_END);

        let reply = parse_reply(&msg, 0, &[0; 6]).unwrap();
        assert_eq!(reply.dns_servers.len(), MAX_DNS_SERVERS);
        assert_eq!(reply.dns_servers[0], Ipv4Addr::new(10, 0, 1, 0));
    }
}
