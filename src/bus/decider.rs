//! Frame forwarding oracle for the VPN bus
//!
//! Learns which peer owns which MAC address and which IPv4 multicast
//! groups each peer listens to, then classifies outgoing frames into
//! unicast, multicast or flood deliveries. Pure computation: the caller
//! supplies the clock and drives iteration.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::debug;

use super::ethernet::{
    self, format_mac, BROADCAST_MAC, ETHERTYPE_IPV4, IPV4_PROTOCOL_IGMP, MULTICAST_MAC_PREFIX,
};
use super::igmp;

/// Low 23 bits of an IPv4 multicast address survive the mapping onto
/// the Ethernet multicast MAC; this is the per-sig aggregation key.
const SIG_MASK: u32 = 0x7f_ffff;

/// Handle to a peer registered with the decider. Generation-checked so
/// a stale handle never aliases a slot that was reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    index: u32,
    generation: u32,
}

/// `(peer, slot)` reference to one group entry
type EntryRef = (PeerId, usize);

struct MacSlot {
    mac: [u8; 6],
}

struct GroupSlot {
    group: u32,
    expires_at: Instant,
}

struct PeerState {
    mac_slots: Vec<MacSlot>,
    mac_free: Vec<usize>,
    /// front = least recently used
    mac_used: Vec<usize>,
    group_slots: Vec<GroupSlot>,
    group_free: Vec<usize>,
    group_used: Vec<usize>,
    groups_by_addr: BTreeMap<u32, usize>,
}

struct PeerSlot {
    generation: u32,
    state: Option<PeerState>,
}

enum Decision {
    None,
    Unicast(PeerId),
    Flood { cursor: usize },
    Multicast { owners: Vec<PeerId>, next: usize },
}

pub struct FrameDecider {
    max_peer_macs: usize,
    max_peer_groups: usize,
    /// IGMP Group Membership Interval
    gmi: Duration,
    /// IGMP Last Member Query Time
    lmqt: Duration,
    peers: Vec<PeerSlot>,
    free_peer_slots: Vec<usize>,
    /// insertion order; flood iteration follows it
    peer_order: Vec<PeerId>,
    /// MAC -> owning peer and slot; at most one owner per MAC
    macs: BTreeMap<[u8; 6], (PeerId, usize)>,
    /// sig -> group entries with that sig; the first member is the master
    multicast: BTreeMap<u32, Vec<EntryRef>>,
    decision: Decision,
}

impl FrameDecider {
    pub fn new(
        max_peer_macs: usize,
        max_peer_groups: usize,
        gmi: Duration,
        lmqt: Duration,
    ) -> Self {
        assert!(max_peer_macs > 0);
        assert!(max_peer_groups > 0);

        Self {
            max_peer_macs,
            max_peer_groups,
            gmi,
            lmqt,
            peers: Vec::new(),
            free_peer_slots: Vec::new(),
            peer_order: Vec::new(),
            macs: BTreeMap::new(),
            multicast: BTreeMap::new(),
            decision: Decision::None,
        }
    }

    /// Register a new peer. Its arenas are sized by the decider-wide
    /// `max_peer_macs` / `max_peer_groups` limits.
    pub fn add_peer(&mut self) -> PeerId {
        let state = PeerState {
            mac_slots: (0..self.max_peer_macs).map(|_| MacSlot { mac: [0; 6] }).collect(),
            mac_free: (0..self.max_peer_macs).collect(),
            mac_used: Vec::new(),
            group_slots: (0..self.max_peer_groups)
                .map(|_| GroupSlot { group: 0, expires_at: Instant::now() })
                .collect(),
            group_free: (0..self.max_peer_groups).collect(),
            group_used: Vec::new(),
            groups_by_addr: BTreeMap::new(),
        };

        let id = match self.free_peer_slots.pop() {
            Some(index) => {
                let slot = &mut self.peers[index];
                slot.state = Some(state);
                PeerId { index: index as u32, generation: slot.generation }
            }
            None => {
                self.peers.push(PeerSlot { generation: 0, state: Some(state) });
                PeerId { index: (self.peers.len() - 1) as u32, generation: 0 }
            }
        };

        self.peer_order.push(id);
        id
    }

    /// Drop a peer and everything it learned. An in-progress decide
    /// iteration is repaired: a flood cursor pointing at the peer moves
    /// on, a unicast decision for the peer is cancelled.
    pub fn remove_peer(&mut self, peer: PeerId) {
        if !self.is_alive(peer) {
            return;
        }

        // unlink learned entries from the global indexes
        let used_groups: Vec<usize> = self.peer_state(peer).group_used.clone();
        for slot in used_groups {
            let group = self.peer_state(peer).group_slots[slot].group;
            self.remove_from_multicast(peer, slot, group);
        }
        let used_macs: Vec<usize> = self.peer_state(peer).mac_used.clone();
        for slot in used_macs {
            let mac = self.peer_state(peer).mac_slots[slot].mac;
            self.macs.remove(&mac);
        }

        // repair the in-progress decision
        if let Decision::Unicast(p) = self.decision {
            if p == peer {
                self.decision = Decision::None;
            }
        }
        let pos = self.peer_order.iter().position(|&p| p == peer);
        if let (Some(pos), Decision::Flood { cursor }) = (pos, &mut self.decision) {
            if pos < *cursor {
                *cursor -= 1;
            }
        }
        if let Some(pos) = pos {
            self.peer_order.remove(pos);
        }

        let slot = &mut self.peers[peer.index as usize];
        slot.state = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_peer_slots.push(peer.index as usize);
    }

    pub fn peer_count(&self) -> usize {
        self.peer_order.len()
    }

    /// Which peer, if any, currently owns a MAC.
    pub fn mac_owner(&self, mac: &[u8; 6]) -> Option<PeerId> {
        self.macs.get(mac).map(|&(peer, _)| peer)
    }

    /// Number of MACs mapped across all peers.
    pub fn mac_count(&self) -> usize {
        self.macs.len()
    }

    /// Whether `peer` currently has a live membership for `group`.
    pub fn has_group(&self, peer: PeerId, group: Ipv4Addr) -> bool {
        self.is_alive(peer)
            && self.peer_state(peer).groups_by_addr.contains_key(&u32::from(group))
    }

    /// Inspect a frame received from `peer`: learn its source MAC and,
    /// for IGMP Membership Reports, its group memberships. Malformed
    /// frames are dropped without error.
    pub fn analyze_ingress(&mut self, peer: PeerId, frame: &[u8], now: Instant) {
        if !self.is_alive(peer) {
            return;
        }
        self.purge_expired(now);

        let Some((eh, payload)) = ethernet::parse_ethernet(frame) else {
            return;
        };

        self.learn_mac(peer, eh.source);

        if eh.ethertype != ETHERTYPE_IPV4 {
            return;
        }
        let Some((protocol, ip_payload)) = ethernet::parse_ipv4(payload) else {
            debug!("peer {}: analyze: bad IPv4 packet", peer.index);
            return;
        };
        if protocol != IPV4_PROTOCOL_IGMP {
            return;
        }

        for group in igmp::report_groups(ip_payload) {
            self.add_group(peer, group, now);
        }
    }

    /// Classify a frame from the local device and arm the destination
    /// iterator. Calling again before the iterator is drained cancels
    /// the previous iteration and restarts.
    pub fn analyze_and_decide(&mut self, frame: &[u8], now: Instant) {
        self.decision = Decision::None;
        self.purge_expired(now);

        let Some((eh, payload)) = ethernet::parse_ethernet(frame) else {
            return;
        };

        let mut is_igmp = false;
        if eh.ethertype == ETHERTYPE_IPV4 {
            match ethernet::parse_ipv4(payload) {
                Some((protocol, ip_payload)) => {
                    if protocol == IPV4_PROTOCOL_IGMP {
                        // IGMP frames are flooded so every peer can track them
                        is_igmp = true;
                        if let Some(group) = igmp::query_group(ip_payload) {
                            self.lower_group_timers(group, now);
                        }
                    }
                }
                None => debug!("decide: bad IPv4 packet"),
            }
        }

        if is_igmp || eh.dest == BROADCAST_MAC {
            self.decision = Decision::Flood { cursor: 0 };
            return;
        }

        if eh.dest[0..3] == MULTICAST_MAC_PREFIX {
            let sig =
                u32::from_be_bytes([eh.dest[2], eh.dest[3], eh.dest[4], eh.dest[5]]) & SIG_MASK;
            if let Some(members) = self.multicast.get(&sig) {
                debug_assert!(!members.is_empty());
                let owners = members.iter().map(|&(p, _)| p).collect();
                self.decision = Decision::Multicast { owners, next: 0 };
            }
            return;
        }

        if let Some(&(owner, _)) = self.macs.get(&eh.dest) {
            self.decision = Decision::Unicast(owner);
            return;
        }

        // unknown destination: flood
        self.decision = Decision::Flood { cursor: 0 };
    }

    /// Next peer the last classified frame must be delivered to, or
    /// `None` when the iteration is exhausted.
    pub fn next_destination(&mut self) -> Option<PeerId> {
        match std::mem::replace(&mut self.decision, Decision::None) {
            Decision::None => None,
            Decision::Unicast(peer) => Some(peer),
            Decision::Flood { cursor } => {
                if cursor < self.peer_order.len() {
                    let peer = self.peer_order[cursor];
                    self.decision = Decision::Flood { cursor: cursor + 1 };
                    Some(peer)
                } else {
                    None
                }
            }
            Decision::Multicast { owners, mut next } => {
                while next < owners.len() {
                    let peer = owners[next];
                    next += 1;
                    if self.is_alive(peer) {
                        self.decision = Decision::Multicast { owners, next };
                        return Some(peer);
                    }
                }
                None
            }
        }
    }

    /// Drop group memberships whose interval has elapsed. Runs lazily
    /// at the top of every analyze call; exposed so a runtime can also
    /// drive it from a timer.
    pub fn purge_expired(&mut self, now: Instant) {
        let peers: Vec<PeerId> = self.peer_order.clone();
        for peer in peers {
            let expired: Vec<usize> = self
                .peer_state(peer)
                .group_used
                .iter()
                .copied()
                .filter(|&slot| self.peer_state(peer).group_slots[slot].expires_at <= now)
                .collect();
            for slot in expired {
                self.remove_group_entry(peer, slot);
            }
        }
    }

    fn is_alive(&self, peer: PeerId) -> bool {
        self.peers
            .get(peer.index as usize)
            .map(|s| s.generation == peer.generation && s.state.is_some())
            .unwrap_or(false)
    }

    fn peer_state(&self, peer: PeerId) -> &PeerState {
        self.peers[peer.index as usize]
            .state
            .as_ref()
            .expect("stale peer handle")
    }

    fn peer_state_mut(&mut self, peer: PeerId) -> &mut PeerState {
        self.peers[peer.index as usize]
            .state
            .as_mut()
            .expect("stale peer handle")
    }

    /// Claim `mac` for `peer`: refresh if already owned, steal from
    /// another peer otherwise, evicting this peer's oldest MAC when its
    /// arena is full.
    fn learn_mac(&mut self, peer: PeerId, mac: [u8; 6]) {
        if let Some(&(owner, slot)) = self.macs.get(&mac) {
            if owner == peer {
                // already ours, refresh LRU position
                let st = self.peer_state_mut(peer);
                move_to_back(&mut st.mac_used, slot);
                return;
            }

            // another peer had this MAC; it moved
            self.macs.remove(&mac);
            let prev = self.peer_state_mut(owner);
            remove_value(&mut prev.mac_used, slot);
            prev.mac_free.push(slot);
        }

        let (slot, evicted) = {
            let st = self.peer_state_mut(peer);
            match st.mac_free.pop() {
                Some(slot) => (slot, None),
                None => {
                    let slot = st.mac_used.remove(0);
                    (slot, Some(st.mac_slots[slot].mac))
                }
            }
        };
        if let Some(old) = evicted {
            self.macs.remove(&old);
        }

        debug!("peer {}: adding MAC {}", peer.index, format_mac(&mac));

        let st = self.peer_state_mut(peer);
        st.mac_slots[slot].mac = mac;
        st.mac_used.push(slot);
        self.macs.insert(mac, (peer, slot));
    }

    /// Add or refresh a group membership for `peer` with expiry
    /// `now + GMI`, evicting the peer's oldest membership if needed.
    fn add_group(&mut self, peer: PeerId, group: u32, now: Instant) {
        let expires_at = now + self.gmi;

        if let Some(&slot) = self.peer_state(peer).groups_by_addr.get(&group) {
            let st = self.peer_state_mut(peer);
            move_to_back(&mut st.group_used, slot);
            st.group_slots[slot].expires_at = expires_at;
            return;
        }

        debug!("peer {}: joined group {}", peer.index, Ipv4Addr::from(group));

        let (slot, evicted) = {
            let st = self.peer_state_mut(peer);
            match st.group_free.pop() {
                Some(slot) => (slot, None),
                None => {
                    let slot = st.group_used.remove(0);
                    (slot, Some(st.group_slots[slot].group))
                }
            }
        };
        if let Some(old) = evicted {
            self.remove_from_multicast(peer, slot, old);
            self.peer_state_mut(peer).groups_by_addr.remove(&old);
        }

        let st = self.peer_state_mut(peer);
        st.group_slots[slot] = GroupSlot { group, expires_at };
        st.group_used.push(slot);
        st.groups_by_addr.insert(group, slot);
        self.add_to_multicast(peer, slot, group);
    }

    fn remove_group_entry(&mut self, peer: PeerId, slot: usize) {
        let group = self.peer_state(peer).group_slots[slot].group;
        debug!("peer {}: left group {}", peer.index, Ipv4Addr::from(group));

        self.remove_from_multicast(peer, slot, group);
        let st = self.peer_state_mut(peer);
        st.groups_by_addr.remove(&group);
        remove_value(&mut st.group_used, slot);
        st.group_free.push(slot);
    }

    fn add_to_multicast(&mut self, peer: PeerId, slot: usize, group: u32) {
        // first member of a sig becomes its master
        self.multicast.entry(group & SIG_MASK).or_default().push((peer, slot));
    }

    /// Unlink one group entry from its sig. Removing the master
    /// promotes the next member; which member becomes master is
    /// unspecified.
    fn remove_from_multicast(&mut self, peer: PeerId, slot: usize, group: u32) {
        let sig = group & SIG_MASK;
        let members = self.multicast.get_mut(&sig).expect("sig index out of sync");
        let pos = members
            .iter()
            .position(|&(p, s)| p == peer && s == slot)
            .expect("sig index out of sync");
        members.remove(pos);
        if members.is_empty() {
            self.multicast.remove(&sig);
        }
    }

    /// Group-Specific Query: cap the expiry of every entry for `group`
    /// at `now + LMQT` unless already earlier.
    fn lower_group_timers(&mut self, group: u32, now: Instant) {
        let cap = now + self.lmqt;
        let Some(members) = self.multicast.get(&(group & SIG_MASK)) else {
            return;
        };
        let members: Vec<EntryRef> = members.clone();
        for (peer, slot) in members {
            let entry = &mut self.peer_state_mut(peer).group_slots[slot];
            if entry.group != group {
                continue;
            }
            if entry.expires_at > cap {
                entry.expires_at = cap;
            }
        }
    }
}

fn move_to_back(list: &mut Vec<usize>, value: usize) {
    remove_value(list, value);
    list.push(value);
}

fn remove_value(list: &mut Vec<usize>, value: usize) {
    if let Some(pos) = list.iter().position(|&v| v == value) {
        list.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decider() -> FrameDecider {
        FrameDecider::new(4, 4, Duration::from_secs(260), Duration::from_secs(2))
    }

    fn frame(dest: [u8; 6], source: [u8; 6]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&dest);
        f.extend_from_slice(&source);
        f.extend_from_slice(&[0x08, 0x06]); // ARP, not inspected further
        f.extend_from_slice(&[0u8; 28]);
        f
    }

    #[test]
    fn unicast_after_learning() {
        let mut d = decider();
        let now = Instant::now();
        let p1 = d.add_peer();
        let p2 = d.add_peer();

        let src = [2, 0, 0, 0, 0, 1];
        d.analyze_ingress(p1, &frame([9; 6], src), now);
        assert_eq!(d.mac_owner(&src), Some(p1));

        d.analyze_and_decide(&frame(src, [2, 0, 0, 0, 0, 2]), now);
        assert_eq!(d.next_destination(), Some(p1));
        assert_eq!(d.next_destination(), None);
        assert_eq!(d.next_destination(), None);

        // the same MAC seen from p2 moves over
        d.analyze_ingress(p2, &frame([9; 6], src), now);
        assert_eq!(d.mac_owner(&src), Some(p2));
        assert_eq!(d.mac_count(), 1);
    }

    #[test]
    fn unknown_destination_floods_in_order() {
        let mut d = decider();
        let now = Instant::now();
        let p1 = d.add_peer();
        let p2 = d.add_peer();

        d.analyze_and_decide(&frame([7; 6], [2, 0, 0, 0, 0, 9]), now);
        assert_eq!(d.next_destination(), Some(p1));
        assert_eq!(d.next_destination(), Some(p2));
        assert_eq!(d.next_destination(), None);
    }

    #[test]
    fn short_frame_decides_nothing() {
        let mut d = decider();
        d.add_peer();
        d.analyze_and_decide(&[0u8; 10], Instant::now());
        assert_eq!(d.next_destination(), None);
    }

    #[test]
    fn removing_peer_mid_flood_advances_cursor() {
        let mut d = decider();
        let now = Instant::now();
        let p1 = d.add_peer();
        let p2 = d.add_peer();
        let p3 = d.add_peer();

        d.analyze_and_decide(&frame(BROADCAST_MAC, [2, 0, 0, 0, 0, 1]), now);
        assert_eq!(d.next_destination(), Some(p1));
        d.remove_peer(p2);
        assert_eq!(d.next_destination(), Some(p3));
        assert_eq!(d.next_destination(), None);
    }

    #[test]
    fn removing_unicast_target_cancels_decision() {
        let mut d = decider();
        let now = Instant::now();
        let p1 = d.add_peer();
        let src = [2, 0, 0, 0, 0, 1];
        d.analyze_ingress(p1, &frame([9; 6], src), now);

        d.analyze_and_decide(&frame(src, [2, 0, 0, 0, 0, 2]), now);
        d.remove_peer(p1);
        assert_eq!(d.next_destination(), None);
        assert_eq!(d.mac_count(), 0);
    }
}
