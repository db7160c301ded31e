//! VPN bus frame classification

pub mod decider;
pub mod ethernet;
pub mod igmp;

pub use decider::{FrameDecider, PeerId};
pub use ethernet::{format_mac, BROADCAST_MAC, MULTICAST_MAC_PREFIX};
