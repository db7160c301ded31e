//! DHCPv4 client core

pub mod client;
pub mod msg;

pub use client::{
    DhcpClient, DhcpError, DhcpEvent, DhcpHandle, DhcpOptions, FrameSink, FrameSource, Lease,
};
pub use msg::{MessageType, MAX_DNS_SERVERS};
