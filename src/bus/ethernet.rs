//! Ethernet and IPv4 header parsing for the frame bus

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const ETHERTYPE_IPV4: u16 = 0x0800;

pub const BROADCAST_MAC: [u8; 6] = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff];

/// OUI prefix of Ethernet MACs that carry IPv4 multicast
pub const MULTICAST_MAC_PREFIX: [u8; 3] = [0x01, 0x00, 0x5e];

/// IPv4 protocol number for IGMP
pub const IPV4_PROTOCOL_IGMP: u8 = 2;

const IPV4_HEADER_MIN_LEN: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct EthernetHeader {
    pub dest: [u8; 6],
    pub source: [u8; 6],
    pub ethertype: u16,
}

/// Split an Ethernet frame into header and payload.
/// Returns `None` when the frame is shorter than the header.
pub fn parse_ethernet(frame: &[u8]) -> Option<(EthernetHeader, &[u8])> {
    if frame.len() < ETHERNET_HEADER_LEN {
        return None;
    }

    let mut dest = [0u8; 6];
    let mut source = [0u8; 6];
    dest.copy_from_slice(&frame[0..6]);
    source.copy_from_slice(&frame[6..12]);
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);

    Some((
        EthernetHeader { dest, source, ethertype },
        &frame[ETHERNET_HEADER_LEN..],
    ))
}

/// Validate an IPv4 packet and return `(protocol, payload)`.
///
/// Checks version, IHL bounds and the total-length field against the
/// buffer. Trailing bytes beyond total length are ignored, matching
/// what link layers commonly deliver (minimum frame padding).
pub fn parse_ipv4(data: &[u8]) -> Option<(u8, &[u8])> {
    if data.len() < IPV4_HEADER_MIN_LEN {
        return None;
    }

    let version = data[0] >> 4;
    let ihl = (data[0] & 0x0f) as usize * 4;
    if version != 4 || ihl < IPV4_HEADER_MIN_LEN {
        return None;
    }

    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if total_len < ihl || total_len > data.len() || ihl > data.len() {
        return None;
    }

    let protocol = data[9];
    Some((protocol, &data[ihl..total_len]))
}

/// `aa:bb:cc:dd:ee:ff` rendering for logs
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
