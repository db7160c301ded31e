//! DHCPv4 client lease state machine
//!
//! Drives DISCOVER/REQUEST acquisition, renewal and loss over a frame
//! conduit the owner provides. The whole machine runs inside one task
//! (`DhcpClient::run`), so sends are single-flight by construction and
//! all state is confined to the loop. Lease changes are published
//! through a watch channel, UP/DOWN transitions through an event
//! channel.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::msg::{self, MessageType, RequestParams};

pub const RESET_TIMEOUT: Duration = Duration::from_secs(4);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
pub const RENEW_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
pub const MAX_REQUESTS: u32 = 4;
pub const XID_REUSE_MAX: u32 = 8;

/// IP + UDP header bytes in front of the DHCP payload
const IP_UDP_HEADERS_SIZE: usize = 28;

/// RFC 1122 minimum reassembly size minus the IP/UDP headers
pub const MIN_MTU: usize = 576 - IP_UDP_HEADERS_SIZE;

/// Identity options must fit this together
const MAX_IDENTITY_OPTIONS_LEN: usize = 100;

/// Used when the random source fails; nonzero so replies still match
const XID_FALLBACK: u32 = 3_416_960_072;

/// Sending side of the frame conduit. `send` completes when the frame
/// has been handed to the link; at most one send is in flight.
pub trait FrameSink: Send {
    fn mtu(&self) -> usize;
    fn send(&mut self, frame: &[u8]) -> impl std::future::Future<Output = io::Result<()>> + Send;
}

/// Receiving side of the frame conduit. `buf` must hold `mtu` bytes.
pub trait FrameSource: Send {
    fn mtu(&self) -> usize;
    fn recv(
        &mut self,
        buf: &mut [u8],
    ) -> impl std::future::Future<Output = io::Result<usize>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct DhcpOptions {
    pub hostname: Option<String>,
    pub vendor_class_id: Option<String>,
    pub client_id: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpEvent {
    /// A lease was acquired; the lease watch holds its parameters.
    Up,
    /// The lease was lost (NAK or expiry); the watch is empty again.
    Down,
}

/// Parameters of a bound lease, valid from ACK until the next Down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub addr: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub server_mac: [u8; 6],
    pub lease_time_secs: u32,
}

/// Observer half handed out by [`DhcpClient::new`].
pub struct DhcpHandle {
    pub events: mpsc::UnboundedReceiver<DhcpEvent>,
    pub lease: watch::Receiver<Option<Lease>>,
}

#[derive(Debug, thiserror::Error)]
pub enum DhcpError {
    #[error("conduit MTU {0} below the DHCP minimum {MIN_MTU}")]
    MtuTooSmall(usize),

    #[error("send and receive MTUs differ")]
    MtuMismatch,

    #[error("identity options exceed {MAX_IDENTITY_OPTIONS_LEN} bytes together")]
    OptionsTooLong,

    #[error("identity option longer than 255 bytes")]
    OptionTooLong,
}

#[derive(Debug, Clone, Copy)]
struct Offered {
    yiaddr: Ipv4Addr,
    server_id: Ipv4Addr,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Resetting { reset_at: Instant },
    SentDiscover { reset_at: Instant },
    SentRequest { retry_at: Instant, attempts: u32 },
    Finished { renew_at: Instant },
    Renewing { retry_at: Instant, lease_expires_at: Instant },
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Reset,
    RequestRetry,
    Renew,
    RenewRetry,
    LeaseExpired,
}

fn renew_timeout(lease_secs: u32) -> Duration {
    Duration::from_millis(500 * u64::from(lease_secs))
}

fn lease_timeout(lease_secs: u32) -> Duration {
    Duration::from_millis(1000 * u64::from(lease_secs)) - renew_timeout(lease_secs)
}

struct Machine<M, G> {
    client_mac: [u8; 6],
    options: DhcpOptions,
    max_message_size: u16,
    mac_source: M,
    rng: G,
    xid: u32,
    xid_reuse_count: u32,
    offered: Option<Offered>,
    lease_secs: u32,
    state: State,
    events: mpsc::UnboundedSender<DhcpEvent>,
    lease_tx: watch::Sender<Option<Lease>>,
}

pub struct DhcpClient<S, R, M, G> {
    sink: S,
    source: R,
    machine: Machine<M, G>,
}

impl<S, R, M, G> DhcpClient<S, R, M, G>
where
    S: FrameSink,
    R: FrameSource,
    M: Fn() -> [u8; 6] + Send,
    G: RngCore + Send,
{
    /// Validate options and build the client plus its observer handle.
    /// `mac_source` reports the MAC of the sender of the most recently
    /// received frame; it is sampled at ACK time.
    pub fn new(
        sink: S,
        source: R,
        client_mac: [u8; 6],
        options: DhcpOptions,
        mac_source: M,
        rng: G,
    ) -> Result<(Self, DhcpHandle), DhcpError> {
        if sink.mtu() != source.mtu() {
            return Err(DhcpError::MtuMismatch);
        }
        let mtu = sink.mtu();
        if mtu < MIN_MTU {
            return Err(DhcpError::MtuTooSmall(mtu));
        }

        let hostname_len = options.hostname.as_deref().map_or(0, str::len);
        let vendor_len = options.vendor_class_id.as_deref().map_or(0, str::len);
        let client_id_len = options.client_id.as_deref().map_or(0, <[u8]>::len);
        if hostname_len > 255 || vendor_len > 255 || client_id_len > 255 {
            return Err(DhcpError::OptionTooLong);
        }
        if hostname_len + vendor_len + client_id_len > MAX_IDENTITY_OPTIONS_LEN {
            return Err(DhcpError::OptionsTooLong);
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (lease_tx, lease_rx) = watch::channel(None);

        let machine = Machine {
            client_mac,
            options,
            max_message_size: u16::try_from(mtu + IP_UDP_HEADERS_SIZE).unwrap_or(u16::MAX),
            mac_source,
            rng,
            xid: 0,
            xid_reuse_count: 0,
            offered: None,
            lease_secs: 0,
            state: State::Resetting { reset_at: Instant::now() },
            events: event_tx,
            lease_tx,
        };

        Ok((
            Self { sink, source, machine },
            DhcpHandle { events: event_rx, lease: lease_rx },
        ))
    }

    /// Drive acquisition forever. Drop the task to stop the client;
    /// stop the underlying conduit first if a send may be in flight.
    pub async fn run(mut self) {
        let mut buf = vec![0u8; self.source.mtu()];

        self.machine.start_process(&mut self.sink, true).await;

        loop {
            let (deadline, kind) = self.machine.next_deadline();
            tokio::select! {
                received = self.source.recv(&mut buf) => match received {
                    Ok(len) => self.machine.handle_frame(&buf[..len], &mut self.sink).await,
                    Err(e) => debug!("conduit receive error: {}", e),
                },
                _ = time::sleep_until(deadline) => {
                    self.machine.handle_timer(kind, &mut self.sink).await;
                }
            }
        }
    }
}

impl<M, G> Machine<M, G>
where
    M: Fn() -> [u8; 6] + Send,
    G: RngCore + Send,
{
    fn next_deadline(&self) -> (Instant, TimerKind) {
        match self.state {
            State::Resetting { reset_at } | State::SentDiscover { reset_at } => {
                (reset_at, TimerKind::Reset)
            }
            State::SentRequest { retry_at, .. } => (retry_at, TimerKind::RequestRetry),
            State::Finished { renew_at } => (renew_at, TimerKind::Renew),
            State::Renewing { retry_at, lease_expires_at } => {
                if retry_at <= lease_expires_at {
                    (retry_at, TimerKind::RenewRetry)
                } else {
                    (lease_expires_at, TimerKind::LeaseExpired)
                }
            }
        }
    }

    fn generate_xid(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        match self.rng.try_fill_bytes(&mut bytes) {
            Ok(()) => u32::from_ne_bytes(bytes),
            Err(e) => {
                warn!("xid generation failed, using fallback: {}", e);
                XID_FALLBACK
            }
        }
    }

    /// Send DISCOVER and arm the reset timer. The xid is regenerated
    /// when forced or after `XID_REUSE_MAX` consecutive uses.
    async fn start_process<S: FrameSink>(&mut self, sink: &mut S, force_new_xid: bool) {
        if force_new_xid || self.xid_reuse_count == XID_REUSE_MAX {
            self.xid = self.generate_xid();
            self.xid_reuse_count = 0;
        }
        self.xid_reuse_count += 1;

        self.send(sink, MessageType::Discover, None, None).await;
        self.state = State::SentDiscover { reset_at: Instant::now() + RESET_TIMEOUT };
    }

    async fn send<S: FrameSink>(
        &mut self,
        sink: &mut S,
        kind: MessageType,
        requested_ip: Option<Ipv4Addr>,
        server_id: Option<Ipv4Addr>,
    ) {
        let frame = msg::build_request(&RequestParams {
            kind,
            xid: self.xid,
            client_mac: self.client_mac,
            max_message_size: self.max_message_size,
            requested_ip,
            server_id,
            hostname: self.options.hostname.as_deref(),
            vendor_class_id: self.options.vendor_class_id.as_deref(),
            client_id: self.options.client_id.as_deref(),
        });

        if let Err(e) = sink.send(&frame).await {
            debug!("conduit send error: {}", e);
        }
    }

    fn report_up(&self) {
        self.events.send(DhcpEvent::Up).ok();
    }

    fn report_down(&self) {
        self.lease_tx.send_replace(None);
        self.events.send(DhcpEvent::Down).ok();
    }

    async fn handle_frame<S: FrameSink>(&mut self, frame: &[u8], sink: &mut S) {
        if matches!(self.state, State::Resetting { .. }) {
            return;
        }
        let Some(reply) = msg::parse_reply(frame, self.xid, &self.client_mac) else {
            return;
        };

        if reply.kind == MessageType::Nak {
            let Some(offered) = self.offered else {
                return;
            };
            if reply.server_id != offered.server_id {
                return;
            }
            match self.state {
                State::SentRequest { .. } => {
                    info!("received NAK (in sent request)");
                    self.state = State::Resetting { reset_at: Instant::now() + RESET_TIMEOUT };
                }
                State::Finished { .. } => {
                    info!("received NAK (in finished)");
                    self.state = State::Resetting { reset_at: Instant::now() + RESET_TIMEOUT };
                    self.report_down();
                }
                State::Renewing { .. } => {
                    info!("received NAK (in renewing)");
                    self.state = State::Resetting { reset_at: Instant::now() + RESET_TIMEOUT };
                    self.report_down();
                }
                _ => {}
            }
            return;
        }

        // OFFER and ACK must carry an address and the base parameters
        if reply.yiaddr.is_unspecified() {
            return;
        }
        let Some(lease_time) = reply.lease_time else {
            return;
        };
        let Some(subnet_mask) = reply.subnet_mask else {
            return;
        };

        match (self.state, reply.kind) {
            (State::SentDiscover { .. }, MessageType::Offer) => {
                info!("received OFFER of {} from {}", reply.yiaddr, reply.server_id);

                let offered = Offered { yiaddr: reply.yiaddr, server_id: reply.server_id };
                self.offered = Some(offered);
                self.send(
                    sink,
                    MessageType::Request,
                    Some(offered.yiaddr),
                    Some(offered.server_id),
                )
                .await;
                self.state = State::SentRequest {
                    retry_at: Instant::now() + REQUEST_TIMEOUT,
                    attempts: 1,
                };
            }
            (State::SentRequest { .. }, MessageType::Ack) => {
                let Some(offered) = self.offered else {
                    return;
                };
                if reply.yiaddr != offered.yiaddr || reply.server_id != offered.server_id {
                    return;
                }

                info!("received ACK, bound to {} for {}s", reply.yiaddr, lease_time);

                self.lease_secs = lease_time;
                self.lease_tx.send_replace(Some(Lease {
                    addr: reply.yiaddr,
                    subnet_mask,
                    router: reply.router,
                    dns_servers: reply.dns_servers,
                    server_mac: (self.mac_source)(),
                    lease_time_secs: lease_time,
                }));
                self.state =
                    State::Finished { renew_at: Instant::now() + renew_timeout(lease_time) };
                self.report_up();
            }
            (State::Renewing { .. }, MessageType::Ack) => {
                let Some(offered) = self.offered else {
                    return;
                };
                if reply.yiaddr != offered.yiaddr || reply.server_id != offered.server_id {
                    return;
                }

                info!("received ACK (renewed), lease {}s", lease_time);

                self.lease_secs = lease_time;
                self.lease_tx.send_modify(|lease| {
                    if let Some(lease) = lease {
                        lease.lease_time_secs = lease_time;
                    }
                });
                self.state =
                    State::Finished { renew_at: Instant::now() + renew_timeout(lease_time) };
            }
            _ => {}
        }
    }

    async fn handle_timer<S: FrameSink>(&mut self, kind: TimerKind, sink: &mut S) {
        match kind {
            TimerKind::Reset => {
                debug!("reset timer");
                let force = matches!(self.state, State::Resetting { .. });
                self.start_process(sink, force).await;
            }
            TimerKind::RequestRetry => {
                let State::SentRequest { attempts, .. } = self.state else {
                    return;
                };
                if attempts == MAX_REQUESTS {
                    debug!("request timer, giving up and rediscovering");
                    self.start_process(sink, false).await;
                    return;
                }
                debug!("request timer, retrying");
                let Some(offered) = self.offered else {
                    return;
                };
                self.send(
                    sink,
                    MessageType::Request,
                    Some(offered.yiaddr),
                    Some(offered.server_id),
                )
                .await;
                self.state = State::SentRequest {
                    retry_at: Instant::now() + REQUEST_TIMEOUT,
                    attempts: attempts + 1,
                };
            }
            TimerKind::Renew => {
                debug!("renew timer");
                let Some(offered) = self.offered else {
                    return;
                };
                // no server id during renewal
                self.send(sink, MessageType::Request, Some(offered.yiaddr), None).await;
                let now = Instant::now();
                self.state = State::Renewing {
                    retry_at: now + RENEW_REQUEST_TIMEOUT,
                    lease_expires_at: now + lease_timeout(self.lease_secs),
                };
            }
            TimerKind::RenewRetry => {
                debug!("renew request timer");
                let State::Renewing { lease_expires_at, .. } = self.state else {
                    return;
                };
                let Some(offered) = self.offered else {
                    return;
                };
                self.send(sink, MessageType::Request, Some(offered.yiaddr), None).await;
                self.state = State::Renewing {
                    retry_at: Instant::now() + RENEW_REQUEST_TIMEOUT,
                    lease_expires_at,
                };
            }
            TimerKind::LeaseExpired => {
                info!("lease expired");
                self.start_process(sink, true).await;
                self.report_down();
            }
        }
    }
}
