//! Frame decider scenarios: learning, flooding, multicast delivery,
//! membership expiry.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use burrow::bus::{FrameDecider, PeerId, BROADCAST_MAC};

const GMI: Duration = Duration::from_secs(260);
const LMQT: Duration = Duration::from_secs(2);

fn decider() -> FrameDecider {
    FrameDecider::new(16, 16, GMI, LMQT)
}

fn eth(dest: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&dest);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn ipv4(protocol: u8, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut pkt = vec![0u8; 20];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 1; // ttl
    pkt[9] = protocol;
    pkt.extend_from_slice(payload);
    pkt
}

fn igmp_v2_report(group: [u8; 4]) -> Vec<u8> {
    let mut msg = vec![0x16, 0, 0, 0];
    msg.extend_from_slice(&group);
    msg
}

fn igmp_v2_query(group: [u8; 4]) -> Vec<u8> {
    let mut msg = vec![0x11, 100, 0, 0];
    msg.extend_from_slice(&group);
    msg
}

fn report_frame(src: [u8; 6], group: [u8; 4]) -> Vec<u8> {
    eth([0x01, 0, 0x5e, 0, 0, 1], src, 0x0800, &ipv4(2, &igmp_v2_report(group)))
}

fn query_frame(group: [u8; 4]) -> Vec<u8> {
    eth([0x01, 0, 0x5e, 0, 0, 1], [2, 0, 0, 0, 0, 99], 0x0800, &ipv4(2, &igmp_v2_query(group)))
}

fn multicast_frame(mac: [u8; 6]) -> Vec<u8> {
    eth(mac, [2, 0, 0, 0, 0, 50], 0x0800, &ipv4(17, b"data"))
}

fn drain(d: &mut FrameDecider) -> Vec<PeerId> {
    let mut out = Vec::new();
    while let Some(peer) = d.next_destination() {
        out.push(peer);
    }
    out
}

#[test]
fn broadcast_floods_all_peers_in_order() {
    let mut d = decider();
    let now = Instant::now();
    let p1 = d.add_peer();
    let p2 = d.add_peer();
    let p3 = d.add_peer();

    let src = [0x02, 0, 0, 0, 0, 0x01];
    let frame = eth(BROADCAST_MAC, src, 0x0800, &ipv4(17, b"hello"));

    d.analyze_ingress(p1, &frame, now);

    d.analyze_and_decide(&frame, now);
    assert_eq!(d.next_destination(), Some(p1));
    assert_eq!(d.next_destination(), Some(p2));
    assert_eq!(d.next_destination(), Some(p3));
    assert_eq!(d.next_destination(), None);

    assert_eq!(d.mac_owner(&src), Some(p1));
}

#[test]
fn igmp_join_then_multicast_delivery() {
    let mut d = decider();
    let now = Instant::now();
    let p1 = d.add_peer();
    let p2 = d.add_peer();
    let _p3 = d.add_peer();

    // 224.1.2.3 and 225.129.2.3 collide in the low 23 bits
    d.analyze_ingress(p1, &report_frame([2, 0, 0, 0, 0, 1], [224, 1, 2, 3]), now);
    d.analyze_ingress(p2, &report_frame([2, 0, 0, 0, 0, 2], [225, 129, 2, 3]), now);
    assert!(d.has_group(p1, [224, 1, 2, 3].into()));
    assert!(d.has_group(p2, [225, 129, 2, 3].into()));

    d.analyze_and_decide(&multicast_frame([0x01, 0x00, 0x5e, 0x01, 0x02, 0x03]), now);
    let destinations: HashSet<PeerId> = drain(&mut d).into_iter().collect();
    assert_eq!(destinations, HashSet::from([p1, p2]));

    // different sig, no listeners
    d.analyze_and_decide(&multicast_frame([0x01, 0x00, 0x5e, 0x00, 0x02, 0x03]), now);
    assert_eq!(drain(&mut d), vec![]);
}

#[test]
fn igmp_frames_are_flooded() {
    let mut d = decider();
    let now = Instant::now();
    let p1 = d.add_peer();
    let p2 = d.add_peer();

    d.analyze_and_decide(&report_frame([2, 0, 0, 0, 0, 1], [224, 1, 2, 3]), now);
    assert_eq!(drain(&mut d), vec![p1, p2]);
}

#[test]
fn single_mac_slot_keeps_most_recent() {
    let mut d = FrameDecider::new(1, 1, GMI, LMQT);
    let now = Instant::now();
    let p1 = d.add_peer();
    let mac_a = [2, 0, 0, 0, 0, 0xaa];
    let mac_b = [2, 0, 0, 0, 0, 0xbb];

    d.analyze_ingress(p1, &eth([9; 6], mac_a, 0x0800, &ipv4(17, b"x")), now);
    d.analyze_ingress(p1, &eth([9; 6], mac_b, 0x0800, &ipv4(17, b"x")), now);

    assert_eq!(d.mac_owner(&mac_a), None);
    assert_eq!(d.mac_owner(&mac_b), Some(p1));
    assert_eq!(d.mac_count(), 1);
}

#[test]
fn membership_expires_after_interval() {
    let mut d = decider();
    let t0 = Instant::now();
    let p1 = d.add_peer();

    d.analyze_ingress(p1, &report_frame([2, 0, 0, 0, 0, 1], [224, 1, 2, 3]), t0);

    // still delivered shortly before the interval elapses
    d.analyze_and_decide(&multicast_frame([0x01, 0x00, 0x5e, 0x01, 0x02, 0x03]), t0 + GMI / 2);
    assert_eq!(drain(&mut d), vec![p1]);

    d.analyze_and_decide(
        &multicast_frame([0x01, 0x00, 0x5e, 0x01, 0x02, 0x03]),
        t0 + GMI + Duration::from_secs(1),
    );
    assert_eq!(drain(&mut d), vec![]);
    assert!(!d.has_group(p1, [224, 1, 2, 3].into()));
}

#[test]
fn report_refreshes_expiry() {
    let mut d = decider();
    let t0 = Instant::now();
    let p1 = d.add_peer();
    let group_mac = [0x01, 0x00, 0x5e, 0x01, 0x02, 0x03];

    d.analyze_ingress(p1, &report_frame([2, 0, 0, 0, 0, 1], [224, 1, 2, 3]), t0);
    // rejoin half-way through the interval
    d.analyze_ingress(p1, &report_frame([2, 0, 0, 0, 0, 1], [224, 1, 2, 3]), t0 + GMI / 2);

    d.analyze_and_decide(&multicast_frame(group_mac), t0 + GMI + Duration::from_secs(1));
    assert_eq!(drain(&mut d), vec![p1]);
}

#[test]
fn group_specific_query_lowers_expiry() {
    let mut d = decider();
    let t0 = Instant::now();
    let p1 = d.add_peer();
    let p2 = d.add_peer();
    let group_mac = [0x01, 0x00, 0x5e, 0x01, 0x02, 0x03];

    // same sig, different groups: only the queried group is lowered
    d.analyze_ingress(p1, &report_frame([2, 0, 0, 0, 0, 1], [224, 1, 2, 3]), t0);
    d.analyze_ingress(p2, &report_frame([2, 0, 0, 0, 0, 2], [225, 129, 2, 3]), t0);

    d.analyze_and_decide(&query_frame([224, 1, 2, 3]), t0);
    drain(&mut d); // queries flood like any IGMP frame

    d.analyze_and_decide(&multicast_frame(group_mac), t0 + LMQT + Duration::from_secs(1));
    assert_eq!(drain(&mut d), vec![p2]);
    assert!(!d.has_group(p1, [224, 1, 2, 3].into()));
    assert!(d.has_group(p2, [225, 129, 2, 3].into()));
}

#[test]
fn group_slot_exhaustion_evicts_oldest() {
    let mut d = FrameDecider::new(4, 2, GMI, LMQT);
    let now = Instant::now();
    let p1 = d.add_peer();

    d.analyze_ingress(p1, &report_frame([2, 0, 0, 0, 0, 1], [224, 0, 0, 1]), now);
    d.analyze_ingress(p1, &report_frame([2, 0, 0, 0, 0, 1], [224, 0, 0, 2]), now);
    d.analyze_ingress(p1, &report_frame([2, 0, 0, 0, 0, 1], [224, 0, 0, 3]), now);

    assert!(!d.has_group(p1, [224, 0, 0, 1].into()));
    assert!(d.has_group(p1, [224, 0, 0, 2].into()));
    assert!(d.has_group(p1, [224, 0, 0, 3].into()));
}

#[test]
fn removing_peer_drops_its_groups() {
    let mut d = decider();
    let now = Instant::now();
    let p1 = d.add_peer();
    let p2 = d.add_peer();
    let group_mac = [0x01, 0x00, 0x5e, 0x01, 0x02, 0x03];

    d.analyze_ingress(p1, &report_frame([2, 0, 0, 0, 0, 1], [224, 1, 2, 3]), now);
    d.analyze_ingress(p2, &report_frame([2, 0, 0, 0, 0, 2], [225, 129, 2, 3]), now);

    // p1 held the sig master; p2 must still be reachable afterwards
    d.remove_peer(p1);
    d.analyze_and_decide(&multicast_frame(group_mac), now);
    assert_eq!(drain(&mut d), vec![p2]);
}

#[test]
fn malformed_igmp_is_ignored() {
    let mut d = decider();
    let now = Instant::now();
    let p1 = d.add_peer();

    // IGMP report truncated to its base header
    let frame = eth([9; 6], [2, 0, 0, 0, 0, 1], 0x0800, &ipv4(2, &[0x16, 0, 0, 0]));
    d.analyze_ingress(p1, &frame, now);
    assert!(!d.has_group(p1, [224, 1, 2, 3].into()));
    // the source MAC is still learned
    assert_eq!(d.mac_owner(&[2, 0, 0, 0, 0, 1]), Some(p1));
}
