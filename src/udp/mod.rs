//! Transparent UDP relay.
//!
//! Every configured pairing becomes a [`UdpConnection`] holding four
//! sockets: a receive and a send socket facing each entity. One thread
//! per receive socket reads a datagram, works out where it has to go,
//! mutates it and sends it out of the opposite send socket.
//!
//! Peers whose port is [`PortBinding::Dynamic`] are learned from traffic:
//! the source port seen on one side is queued and consumed the next time
//! something has to reach that side.

mod socket;


pub use socket::{recv_with_original_destination, Datagram};

use crate::config::{PortBinding, UdpConnectionConfig};
use crate::error::Result;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::mutation::UDP_PAYLOAD_CEILING;
use crate::registry::{RegistryBuilder, RegistryEntry, SocketId, SocketRole};
use crate::telemetry::{RelayDirection, RelayEvent, RelayProtocol};
use crate::RelayContext;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

const RECV_BUFFER_SIZE: usize = 65_536;

#[derive(Clone, Debug)]
pub struct RelayOptions {
    /// Bind the send sockets with `IP_TRANSPARENT`. Requires
    /// `CAP_NET_ADMIN`; turn off for single-host runs.
    pub transparent: bool,
    pub bind_ip: Ipv4Addr,
    pub poll_interval: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            transparent: true,
            bind_ip: Ipv4Addr::UNSPECIFIED,
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    fn direction(self) -> RelayDirection {
        match self {
            Side::A => RelayDirection::Forward,
            Side::B => RelayDirection::Reverse,
        }
    }
}

/// One entity as seen by the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: PortBinding,
    /// proxy port receiving this entity's traffic
    pub proxy_recv: u16,
    /// proxy port sending traffic to this entity
    pub proxy_send: u16,
}

/// Ports learned from traffic, consumed oldest first.
#[derive(Debug, Default)]
pub struct DynamicPorts {
    queue: Mutex<VecDeque<u16>>,
}

impl DynamicPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, port: u16) {
        self.queue.lock().push_back(port);
    }

    pub fn pop(&self) -> Option<u16> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a datagram received from one side has to be sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Forward {
    pub side_to_send: Side,
    pub destination: SocketAddrV4,
}

/// Resolves the destination of a datagram that arrived from `from` with
/// source port `observed_src_port`.
///
/// A dynamic peer takes the oldest learned port. With nothing learned yet
/// the datagram goes to `observed_src_port` itself. A dynamic local side
/// queues `observed_src_port` for the reverse direction.
pub fn resolve_forward(
    a: &Endpoint,
    b: &Endpoint,
    learned: &DynamicPorts,
    from: Side,
    observed_src_port: u16,
) -> Forward {
    let (local, peer) = match from {
        Side::A => (a, b),
        Side::B => (b, a),
    };
    let port = match peer.port {
        PortBinding::Static(port) => port,
        PortBinding::Dynamic => learned.pop().unwrap_or(observed_src_port),
    };
    if local.port.is_dynamic() {
        learned.push(observed_src_port);
    }
    Forward {
        side_to_send: from.peer(),
        destination: SocketAddrV4::new(peer.ip, port),
    }
}

/// Receive socket owned by the connection until its relay thread takes
/// it. The thread closes it when it exits.
struct ReceiveSlot {
    id: SocketId,
    socket: Mutex<Option<UdpSocket>>,
}

impl ReceiveSlot {
    fn new(socket: UdpSocket) -> Self {
        Self {
            id: socket.as_raw_fd(),
            socket: Mutex::new(Some(socket)),
        }
    }
}

/// A fully bound A/B pairing. Never exists with fewer than four sockets.
pub struct UdpConnection {
    name: String,
    a: Endpoint,
    b: Endpoint,
    recv_from_a: ReceiveSlot,
    send_to_b: UdpSocket,
    recv_from_b: ReceiveSlot,
    send_to_a: UdpSocket,
    learned: DynamicPorts,
}

impl UdpConnection {
    pub fn bind(config: &UdpConnectionConfig, options: &RelayOptions) -> Result<Self> {
        let a = Endpoint {
            ip: config.entity_a_ip,
            port: config.entity_a_port,
            proxy_recv: config.entity_a_proxy_port_recv,
            proxy_send: config.entity_a_proxy_port_send,
        };
        let b = Endpoint {
            ip: config.entity_b_ip,
            port: config.entity_b_port,
            proxy_recv: config.entity_b_proxy_port_recv,
            proxy_send: config.entity_b_proxy_port_send,
        };
        // Sockets bound so far are closed on early return.
        let recv_from_a = socket::bind_receive_socket(a.proxy_recv, options)?;
        let send_to_b = socket::bind_send_socket(b.proxy_send, options)?;
        let recv_from_b = socket::bind_receive_socket(b.proxy_recv, options)?;
        let send_to_a = socket::bind_send_socket(a.proxy_send, options)?;
        Ok(Self {
            name: format!("{}:{}<->{}:{}", a.ip, a.port, b.ip, b.port),
            a,
            b,
            recv_from_a: ReceiveSlot::new(recv_from_a),
            send_to_b,
            recv_from_b: ReceiveSlot::new(recv_from_b),
            send_to_a,
            learned: DynamicPorts::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }

    fn receive_slot(&self, side: Side) -> &ReceiveSlot {
        match side {
            Side::A => &self.recv_from_a,
            Side::B => &self.recv_from_b,
        }
    }

    /// Id of the socket receiving traffic that comes from `side`.
    pub fn receive_socket_id(&self, side: Side) -> SocketId {
        self.receive_slot(side).id
    }

    /// Hands out the socket receiving traffic from `side`. Only the first
    /// call gets it; dropping it closes the socket.
    pub fn take_receive_socket(&self, side: Side) -> Option<UdpSocket> {
        self.receive_slot(side).socket.lock().take()
    }

    /// Socket sending traffic towards `side`.
    pub fn send_socket(&self, side: Side) -> &UdpSocket {
        match side {
            Side::A => &self.send_to_a,
            Side::B => &self.send_to_b,
        }
    }

    pub fn learned_ports(&self) -> &DynamicPorts {
        &self.learned
    }

    pub fn resolve_forward(&self, from: Side, observed_src_port: u16) -> Forward {
        resolve_forward(&self.a, &self.b, &self.learned, from, observed_src_port)
    }

    pub fn socket_ids(&self) -> SmallVec<[(SocketId, Side, SocketRole); 4]> {
        let mut ids = SmallVec::new();
        for side in [Side::A, Side::B] {
            ids.push((self.receive_socket_id(side), side, SocketRole::Receive));
            ids.push((self.send_socket(side).as_raw_fd(), side, SocketRole::Send));
        }
        ids
    }

    /// Mutates one datagram received from `from` and sends it on. Returns
    /// the number of bytes sent.
    fn relay(
        &self,
        from: Side,
        payload: &[u8],
        source: SocketAddrV4,
        ctx: &RelayContext,
    ) -> io::Result<usize> {
        let forward = self.resolve_forward(from, source.port());
        let mut mutated = ctx.engine.post_fuzzing(payload);
        mutated.truncate(UDP_PAYLOAD_CEILING);
        let sent = self
            .send_socket(forward.side_to_send)
            .send_to(&mutated, forward.destination)?;
        logger::breadcrumb(
            BreadcrumbFlags::UDP,
            format!(
                "{}: {} bytes from {} -> {} bytes to {}",
                self.name,
                payload.len(),
                source,
                sent,
                forward.destination
            ),
        );
        ctx.telemetry.record(RelayEvent::new(
            RelayProtocol::Udp,
            from.direction(),
            self.endpoint(from).proxy_recv,
            payload.len(),
            sent,
        ));
        Ok(sent)
    }
}

/// All UDP connections that bound successfully.
pub struct UdpRelay {
    connections: Vec<Arc<UdpConnection>>,
}

impl UdpRelay {
    /// Binds every connection and registers its sockets. A connection
    /// that fails to bind any of its sockets is left out entirely.
    pub fn build(
        configs: &[UdpConnectionConfig],
        options: &RelayOptions,
        registry: &mut RegistryBuilder,
    ) -> Self {
        let mut connections = Vec::with_capacity(configs.len());
        'configs: for config in configs {
            let connection = match UdpConnection::bind(config, options) {
                Ok(connection) => Arc::new(connection),
                Err(err) => {
                    logger::rate_limited_error(
                        ErrorCategory::SocketSetup,
                        format!(
                            "dropping udp connection {}<->{}: {err}",
                            config.entity_a_ip, config.entity_b_ip
                        ),
                    );
                    continue;
                }
            };
            for (id, side, role) in connection.socket_ids() {
                let entry = RegistryEntry::Udp {
                    connection: Arc::clone(&connection),
                    side,
                    role,
                };
                if let Err(err) = registry.insert(id, entry) {
                    logger::error(format!("dropping udp connection {}: {err}", connection.name()));
                    continue 'configs;
                }
            }
            logger::info(format!("udp connection {} ready", connection.name()));
            connections.push(connection);
        }
        Self { connections }
    }

    pub fn connections(&self) -> &[Arc<UdpConnection>] {
        &self.connections
    }

    /// Starts one receive thread per receive socket. The registry in
    /// `ctx` must already hold every socket of this relay.
    pub fn start(&self, ctx: &RelayContext) -> io::Result<usize> {
        let mut started = 0;
        for connection in &self.connections {
            for side in [Side::A, Side::B] {
                let id = connection.receive_socket_id(side);
                let port = connection.endpoint(side).proxy_recv;
                let thread_ctx = ctx.clone();
                ctx.tasks
                    .spawn(format!("udp-recv-{port}"), move || receive_loop(id, thread_ctx))?;
                started += 1;
            }
        }
        Ok(started)
    }
}

fn receive_loop(id: SocketId, ctx: RelayContext) {
    let (connection, from) = match ctx.registry.lookup(id) {
        Some(RegistryEntry::Udp {
            connection,
            side,
            role: SocketRole::Receive,
        }) => (Arc::clone(connection), *side),
        _ => {
            logger::error(format!("udp socket {id} is not a registered receive socket"));
            return;
        }
    };
    let Some(socket) = connection.take_receive_socket(from) else {
        logger::error(format!("{}: receive socket {id} already in use", connection.name()));
        return;
    };
    let stop = ctx.tasks.shutdown_token();
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    logger::breadcrumb(
        BreadcrumbFlags::UDP,
        format!("{}: receiving from {:?} on socket {id}", connection.name(), from),
    );

    while !stop.is_triggered() {
        let datagram = match recv_with_original_destination(&socket, &mut buf) {
            Ok(datagram) => datagram,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(err) => {
                logger::rate_limited_error(
                    ErrorCategory::Receive,
                    format!(
                        "{}: receive from {:?} failed, closing socket {id}: {err}",
                        connection.name(),
                        from
                    ),
                );
                break;
            }
        };
        if datagram.original_destination.is_none() {
            logger::debug(format!(
                "{}: no original destination for datagram from {}",
                connection.name(),
                datagram.source
            ));
        }
        if let Err(err) = connection.relay(from, &buf[..datagram.len], datagram.source, &ctx) {
            logger::rate_limited_error(
                ErrorCategory::Send,
                format!("{}: forward to {:?} failed: {err}", connection.name(), from.peer()),
            );
        }
    }
    drop(socket);
    logger::breadcrumb(
        BreadcrumbFlags::UDP,
        format!("{}: receive thread for {:?} exiting", connection.name(), from),
    );
}
