pub mod bus;
pub mod cipher;
pub mod config;
pub mod dhcp;
pub mod relay;
pub mod resolver;

pub use bus::{FrameDecider, PeerId};
pub use cipher::{ChaChaPacketCipher, CipherError, PacketCipher, PlainCipher};
pub use config::{ConfigError, RelayConfig};
pub use dhcp::{DhcpClient, DhcpEvent, DhcpHandle, DhcpOptions, Lease};
pub use relay::{RelayMode, RelayOptions, RelayPool, TargetAddr, UdpRelay};
pub use resolver::{Resolver, SystemResolver};
