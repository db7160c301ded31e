//! Encrypted UDP relay datapaths
//!
//! A relay instance owns one listening socket and a bounded cache of
//! per-client upstream sockets. The local side strips the SOCKS5-UDP
//! prefix and forwards the encrypted inner packet to the relay server;
//! the server side decrypts, resolves the target and talks to the open
//! internet. Replies travel the same road backwards, re-addressed with
//! the sender of the reply.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::cache::{ConnCache, ConnKey, Family};
use super::socks::{TargetAddr, SOCKS_UDP_PREFIX_LEN};
use crate::cipher::PacketCipher;
use crate::resolver::Resolver;

/// Connection cache bound, client side
pub const MAX_UDP_CONN_NUM_LOCAL: usize = 256;
/// Connection cache bound, server side
pub const MAX_UDP_CONN_NUM_SERVER: usize = 512;

/// Idle timers never fire earlier than this
pub const MIN_UDP_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay instances sharing one runtime
pub const MAX_REMOTE_NUM: usize = 10;

/// ATYP + IP/UDP headers + port + hostname allowance
pub const PACKET_HEADER_SIZE: usize = 1 + 28 + 2 + 64;

/// Payload budget for a 1492-byte link MTU
pub const DEFAULT_PACKET_SIZE: usize = 1397;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("mtu {0} leaves no room for the relay header")]
    MtuTooSmall(u16),

    #[error("relay limit of {MAX_REMOTE_NUM} instances reached")]
    TooManyRelays,
}

/// Which side of the tunnel this instance is.
pub enum RelayMode {
    /// SOCKS5-UDP front end: encrypt everything toward `remote_addr`.
    /// With `tunnel_addr` set, datagrams are taken verbatim and forced
    /// to that destination instead of carrying SOCKS5 headers.
    Local {
        remote_addr: SocketAddr,
        tunnel_addr: Option<TargetAddr>,
    },
    /// Decrypting back end talking to the destinations themselves.
    Server,
}

pub struct RelayOptions {
    pub listen: SocketAddr,
    pub mode: RelayMode,
    pub cipher: Arc<dyn PacketCipher>,
    /// Idle eviction timeout, floored at [`MIN_UDP_TIMEOUT`]
    pub timeout: Duration,
    /// Link MTU; `None` assumes a 1492-byte link
    pub mtu: Option<u16>,
    pub reuse_port: bool,
    /// Source addresses for upstream sockets (server side)
    pub bind_local_addr4: Option<Ipv4Addr>,
    pub bind_local_addr6: Option<Ipv6Addr>,
    /// Network device upstream sockets are pinned to (Linux only)
    pub bind_interface: Option<String>,
    pub resolver: Arc<dyn Resolver>,
}

/// One cached client endpoint: its upstream socket, activity stamp,
/// reply pump and (server side) an in-flight resolve, if any.
struct Association {
    socket: Arc<UdpSocket>,
    last_active: Arc<Mutex<Instant>>,
    pump: JoinHandle<()>,
    resolving: Mutex<Option<JoinHandle<()>>>,
}

impl Association {
    fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        self.pump.abort();
        if let Some(resolve) = self.resolving.get_mut().unwrap().take() {
            resolve.abort();
        }
    }
}

struct RelayCtx {
    listen: Arc<UdpSocket>,
    cipher: Arc<dyn PacketCipher>,
    cache: Mutex<ConnCache<Association>>,
    timeout: Duration,
    packet_size: usize,
    buf_size: usize,
    bind_local_addr4: Option<Ipv4Addr>,
    bind_local_addr6: Option<Ipv6Addr>,
    bind_interface: Option<String>,
    resolver: Arc<dyn Resolver>,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
}

/// Running relay instance. Dropping it (or calling [`shutdown`]) stops
/// the listener and tears down every cached connection.
///
/// [`shutdown`]: UdpRelay::shutdown
pub struct UdpRelay {
    local_addr: SocketAddr,
    listener: JoinHandle<()>,
    ctx: Arc<RelayCtx>,
}

impl UdpRelay {
    pub async fn spawn(options: RelayOptions) -> Result<UdpRelay, RelayError> {
        let packet_size = match options.mtu {
            Some(mtu) if mtu as usize > PACKET_HEADER_SIZE => mtu as usize - PACKET_HEADER_SIZE,
            Some(mtu) => return Err(RelayError::MtuTooSmall(mtu)),
            None => DEFAULT_PACKET_SIZE,
        };

        let listen = bind_udp(options.listen, true, options.reuse_port)?;
        let local_addr = listen.local_addr()?;

        let capacity = match options.mode {
            RelayMode::Local { .. } => MAX_UDP_CONN_NUM_LOCAL,
            RelayMode::Server => MAX_UDP_CONN_NUM_SERVER,
        };

        let ctx = Arc::new(RelayCtx {
            listen: Arc::new(listen),
            cipher: options.cipher,
            cache: Mutex::new(ConnCache::new(capacity)),
            timeout: options.timeout.max(MIN_UDP_TIMEOUT),
            packet_size,
            buf_size: packet_size * 2,
            bind_local_addr4: options.bind_local_addr4,
            bind_local_addr6: options.bind_local_addr6,
            bind_interface: options.bind_interface,
            resolver: options.resolver,
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
        });

        let listener = match options.mode {
            RelayMode::Local { remote_addr, tunnel_addr } => {
                info!("udp relay (local) listening on {}, server {}", local_addr, remote_addr);
                tokio::spawn(run_local(ctx.clone(), remote_addr, tunnel_addr))
            }
            RelayMode::Server => {
                info!("udp relay (server) listening on {}", local_addr);
                tokio::spawn(run_server(ctx.clone()))
            }
        };

        Ok(UdpRelay { local_addr, listener, ctx })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bytes accepted from clients.
    pub fn tx_bytes(&self) -> u64 {
        self.ctx.tx_bytes.load(Ordering::Relaxed)
    }

    /// Bytes relayed back to clients.
    pub fn rx_bytes(&self) -> u64 {
        self.ctx.rx_bytes.load(Ordering::Relaxed)
    }

    /// Number of live cached connections.
    pub fn connection_count(&self) -> usize {
        self.ctx.cache.lock().unwrap().len()
    }

    /// Stop the listener and drop every cached connection.
    pub fn shutdown(&self) {
        self.listener.abort();
        let connections = self.ctx.cache.lock().unwrap().drain();
        if !connections.is_empty() {
            debug!("dropping {} cached connections", connections.len());
        }
        drop(connections);
        info!("udp relay on {} stopped", self.local_addr);
    }
}

impl Drop for UdpRelay {
    fn drop(&mut self) {
        self.listener.abort();
        let connections = self.ctx.cache.lock().unwrap().drain();
        drop(connections);
    }
}

/// Group of relay instances sharing the runtime, bounded by
/// [`MAX_REMOTE_NUM`].
#[derive(Default)]
pub struct RelayPool {
    relays: Vec<UdpRelay>,
}

impl RelayPool {
    pub fn new() -> Self {
        Self { relays: Vec::new() }
    }

    /// Spawn another relay; returns its bound address.
    pub async fn add(&mut self, options: RelayOptions) -> Result<SocketAddr, RelayError> {
        if self.relays.len() == MAX_REMOTE_NUM {
            return Err(RelayError::TooManyRelays);
        }
        let relay = UdpRelay::spawn(options).await?;
        let addr = relay.local_addr();
        self.relays.push(relay);
        Ok(addr)
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn relays(&self) -> &[UdpRelay] {
        &self.relays
    }

    pub fn shutdown_all(&mut self) {
        for relay in self.relays.drain(..) {
            relay.shutdown();
        }
    }
}

fn bind_udp(addr: SocketAddr, reuse_addr: bool, reuse_port: bool) -> io::Result<UdpSocket> {
    let sockaddr = socket2::SockAddr::from(addr);
    let socket =
        socket2::Socket::new(sockaddr.domain(), socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    if reuse_addr {
        socket.set_reuse_address(true)?;
    }
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&sockaddr)?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Ephemeral upstream socket in the right family, honouring the
/// configured local bind addresses and device.
fn bind_upstream(family: Family, ctx: &RelayCtx) -> io::Result<UdpSocket> {
    let addr: SocketAddr = match family {
        Family::V6 => (ctx.bind_local_addr6.unwrap_or(Ipv6Addr::UNSPECIFIED), 0).into(),
        _ => (ctx.bind_local_addr4.unwrap_or(Ipv4Addr::UNSPECIFIED), 0).into(),
    };

    let sockaddr = socket2::SockAddr::from(addr);
    let socket =
        socket2::Socket::new(sockaddr.domain(), socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(device) = &ctx.bind_interface {
        socket.bind_device(Some(device.as_bytes()))?;
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    if ctx.bind_interface.is_some() {
        debug!("device binding is not supported on this platform");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&sockaddr)?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

#[derive(Clone, Copy)]
enum PumpMode {
    /// Replies are encrypted relay packets: decrypt, validate, then
    /// restore the SOCKS5-UDP prefix. A tunnel client speaks raw
    /// datagrams instead, so the address header is stripped for it.
    Local { tunnel: bool },
    /// Replies are raw datagrams: prepend the sender's address header
    /// and encrypt.
    Server,
}

fn insert_association(
    ctx: &Arc<RelayCtx>,
    key: ConnKey,
    client: SocketAddr,
    upstream: Arc<UdpSocket>,
    mode: PumpMode,
) {
    let last_active = Arc::new(Mutex::new(Instant::now()));
    let pump = tokio::spawn(reply_pump(
        ctx.clone(),
        key,
        client,
        upstream.clone(),
        last_active.clone(),
        mode,
    ));
    let association =
        Association { socket: upstream, last_active, pump, resolving: Mutex::new(None) };

    let evicted = ctx.cache.lock().unwrap().insert(key, association);
    if let Some((evicted_key, connection)) = evicted {
        debug!("[udp] cache full, evicting {}", evicted_key.client);
        drop(connection);
    }
}

/// Per-connection reply loop: shuttle upstream datagrams back to the
/// client until the connection idles out or the socket fails.
async fn reply_pump(
    ctx: Arc<RelayCtx>,
    key: ConnKey,
    client: SocketAddr,
    upstream: Arc<UdpSocket>,
    last_active: Arc<Mutex<Instant>>,
    mode: PumpMode,
) {
    let mut buf = vec![0u8; ctx.buf_size];

    loop {
        let deadline = *last_active.lock().unwrap() + ctx.timeout;
        tokio::select! {
            _ = time::sleep_until(deadline) => {
                if Instant::now() >= *last_active.lock().unwrap() + ctx.timeout {
                    debug!("[udp] connection timeout for {}", client);
                    let removed = ctx.cache.lock().unwrap().remove(&key);
                    drop(removed);
                    return;
                }
            }
            received = upstream.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("[udp] upstream receive error for {}: {}", client, e);
                        let removed = ctx.cache.lock().unwrap().remove(&key);
                        drop(removed);
                        return;
                    }
                };

                ctx.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);
                if len > ctx.packet_size {
                    debug!("reply needs MTU of at least {}", len + PACKET_HEADER_SIZE);
                }

                let mut pkt;
                match mode {
                    PumpMode::Local { tunnel } => {
                        pkt = buf[..len].to_vec();
                        if ctx.cipher.decrypt_all(&mut pkt, ctx.buf_size).is_err() {
                            debug!("[udp] reply failed authentication, dropping");
                            continue;
                        }
                        let Some((_, header_len)) = TargetAddr::parse(&pkt) else {
                            debug!("[udp] invalid reply header, dropping");
                            continue;
                        };
                        if tunnel {
                            pkt.drain(..header_len);
                        } else {
                            pkt.splice(0..0, [0u8; SOCKS_UDP_PREFIX_LEN]);
                        }
                    }
                    PumpMode::Server => {
                        // re-address with the actual sender of the reply
                        pkt = Vec::with_capacity(len + super::socks::MAX_ADDR_HEADER_SIZE);
                        TargetAddr::from(from).write(&mut pkt);
                        pkt.extend_from_slice(&buf[..len]);
                        if let Err(e) = ctx.cipher.encrypt_all(&mut pkt, ctx.buf_size) {
                            debug!("[udp] reply encryption failed: {}", e);
                            continue;
                        }
                    }
                }

                if pkt.len() > ctx.packet_size {
                    debug!("reply needs MTU of at least {}", pkt.len() + PACKET_HEADER_SIZE);
                }
                if let Err(e) = ctx.listen.send_to(&pkt, client).await {
                    debug!("[udp] reply to {} failed: {}", client, e);
                    continue;
                }
                *last_active.lock().unwrap() = Instant::now();
            }
        }
    }
}

/// Local-side listener: SOCKS5-UDP (or raw tunnel payloads) in,
/// encrypted relay packets out.
async fn run_local(
    ctx: Arc<RelayCtx>,
    remote_addr: SocketAddr,
    tunnel_addr: Option<TargetAddr>,
) {
    let mut buf = vec![0u8; ctx.buf_size];

    loop {
        let (len, src) = match ctx.listen.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!("[udp] listen receive error: {}", e);
                continue;
            }
        };
        ctx.tx_bytes.fetch_add(len as u64, Ordering::Relaxed);
        if len > ctx.packet_size {
            debug!("datagram needs MTU of at least {}", len + PACKET_HEADER_SIZE);
        }

        let mut pkt;
        match &tunnel_addr {
            Some(target) => {
                // forced destination, datagram is the bare payload
                pkt = Vec::with_capacity(len + super::socks::MAX_ADDR_HEADER_SIZE);
                target.write(&mut pkt);
                pkt.extend_from_slice(&buf[..len]);
            }
            None => {
                if len < SOCKS_UDP_PREFIX_LEN {
                    debug!("[udp] short datagram from {}", src);
                    continue;
                }
                let frag = buf[2];
                if frag != 0 {
                    warn!("[udp] dropping datagram from {}: frag is {}, not 0", src, frag);
                    continue;
                }
                if TargetAddr::parse(&buf[SOCKS_UDP_PREFIX_LEN..len]).is_none() {
                    debug!("[udp] invalid SOCKS5-UDP header from {}", src);
                    continue;
                }
                pkt = buf[SOCKS_UDP_PREFIX_LEN..len].to_vec();
            }
        }

        let key = ConnKey { family: Family::from(remote_addr), client: src };
        let socket = {
            let cached = {
                let mut cache = ctx.cache.lock().unwrap();
                cache.get(&key).map(|a| {
                    a.touch();
                    a.socket.clone()
                })
            };
            match cached {
                Some(socket) => {
                    debug!("[udp] cache hit: {}", src);
                    socket
                }
                None => {
                    debug!("[udp] cache miss: {}", src);
                    let upstream = match bind_upstream(key.family, &ctx) {
                        Ok(s) => Arc::new(s),
                        Err(e) => {
                            warn!("[udp] upstream bind failed: {}", e);
                            continue;
                        }
                    };
                    insert_association(
                        &ctx,
                        key,
                        src,
                        upstream.clone(),
                        PumpMode::Local { tunnel: tunnel_addr.is_some() },
                    );
                    upstream
                }
            }
        };

        if let Err(e) = ctx.cipher.encrypt_all(&mut pkt, ctx.buf_size) {
            debug!("[udp] encryption failed: {}", e);
            continue;
        }
        if pkt.len() > ctx.packet_size {
            debug!("datagram needs MTU of at least {}", pkt.len() + PACKET_HEADER_SIZE);
        }

        if let Err(e) = socket.send_to(&pkt, remote_addr).await {
            warn!("[udp] send to relay server failed: {}", e);
            let removed = ctx.cache.lock().unwrap().remove(&key);
            drop(removed);
        }
    }
}

/// Server-side listener: encrypted relay packets in, raw datagrams to
/// the destinations out.
async fn run_server(ctx: Arc<RelayCtx>) {
    let mut buf = vec![0u8; ctx.buf_size];

    loop {
        let (len, src) = match ctx.listen.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!("[udp] listen receive error: {}", e);
                continue;
            }
        };
        ctx.tx_bytes.fetch_add(len as u64, Ordering::Relaxed);

        let mut pkt = buf[..len].to_vec();
        if ctx.cipher.decrypt_all(&mut pkt, ctx.buf_size).is_err() {
            debug!("[udp] datagram from {} failed authentication, dropping", src);
            continue;
        }
        let Some((target, header_len)) = TargetAddr::parse(&pkt) else {
            debug!("[udp] invalid relay header from {}", src);
            continue;
        };
        let payload = pkt[header_len..].to_vec();
        if payload.len() > ctx.packet_size {
            debug!("datagram needs MTU of at least {}", payload.len() + PACKET_HEADER_SIZE);
        }

        match target {
            TargetAddr::Ip(dst) => {
                forward_to_ip(&ctx, src, dst, payload).await;
            }
            TargetAddr::Domain(host, port) => {
                // the payload rides along with the in-flight query
                let key = ConnKey { family: Family::Unspec, client: src };
                let resolve = tokio::spawn(resolve_and_forward(
                    ctx.clone(),
                    key,
                    src,
                    host,
                    port,
                    payload,
                ));

                let mut cache = ctx.cache.lock().unwrap();
                if let Some(association) = cache.get(&key) {
                    association.touch();
                    *association.resolving.lock().unwrap() = Some(resolve);
                }
            }
        }
    }
}

/// Send `payload` upstream for `client`, creating and caching the
/// upstream socket on first use. Fresh sockets that fail their first
/// send are discarded; cached ones are evicted on failure.
async fn forward_to_ip(ctx: &Arc<RelayCtx>, client: SocketAddr, dst: SocketAddr, payload: Vec<u8>) {
    let key = ConnKey { family: Family::from(dst), client };

    let cached = {
        let mut cache = ctx.cache.lock().unwrap();
        cache.get(&key).map(|a| {
            a.touch();
            a.socket.clone()
        })
    };

    match cached {
        Some(socket) => {
            debug!("[udp] cache hit: {} <-> {}", dst, client);
            if let Err(e) = socket.send_to(&payload, dst).await {
                warn!("[udp] send to {} failed: {}", dst, e);
                let removed = ctx.cache.lock().unwrap().remove(&key);
                drop(removed);
            }
        }
        None => {
            debug!("[udp] cache miss: {} <-> {}", dst, client);
            let upstream = match bind_upstream(key.family, ctx) {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    warn!("[udp] upstream bind failed: {}", e);
                    return;
                }
            };
            if let Err(e) = upstream.send_to(&payload, dst).await {
                warn!("[udp] send to {} failed: {}", dst, e);
                return;
            }
            insert_association(ctx, key, client, upstream, PumpMode::Server);
        }
    }
}

/// Server side, domain target: resolve first, then forward through the
/// `(Unspec, client)` cache slot.
async fn resolve_and_forward(
    ctx: Arc<RelayCtx>,
    key: ConnKey,
    client: SocketAddr,
    host: String,
    port: u16,
    payload: Vec<u8>,
) {
    let dst = match ctx.resolver.resolve(host.clone(), port).await {
        Ok(addr) => addr,
        Err(e) => {
            warn!("[udp] unable to resolve {}: {}", host, e);
            return;
        }
    };

    let cached = {
        let mut cache = ctx.cache.lock().unwrap();
        cache.get(&key).map(|a| {
            a.touch();
            a.socket.clone()
        })
    };

    match cached {
        Some(socket) => {
            if let Err(e) = socket.send_to(&payload, dst).await {
                warn!("[udp] send to {} ({}) failed: {}", dst, host, e);
                let removed = ctx.cache.lock().unwrap().remove(&key);
                drop(removed);
            }
        }
        None => {
            let upstream = match bind_upstream(Family::from(dst), &ctx) {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    warn!("[udp] upstream bind failed: {}", e);
                    return;
                }
            };
            if let Err(e) = upstream.send_to(&payload, dst).await {
                warn!("[udp] send to {} ({}) failed: {}", dst, host, e);
                return;
            }
            insert_association(&ctx, key, client, upstream, PumpMode::Server);
        }
    }
}
