//! Encrypted UDP relay

pub mod cache;
pub mod socks;
pub mod udp;

pub use cache::{ConnCache, ConnKey, Family};
pub use socks::TargetAddr;
pub use udp::{
    RelayError, RelayMode, RelayOptions, RelayPool, UdpRelay, MAX_REMOTE_NUM,
    MAX_UDP_CONN_NUM_LOCAL, MAX_UDP_CONN_NUM_SERVER, MIN_UDP_TIMEOUT,
};
