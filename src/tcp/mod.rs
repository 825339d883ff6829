//! TCP redirection relay.
//!
//! Each configured redirection gets a listener on `proxy_port`. Every
//! accepted client is paired with a fresh connection to the configured
//! server and two pump threads copy bytes across, mutating every chunk.


use crate::config::TcpRedirection;
use crate::error::{ProxyError, Result};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::registry::{RegistryBuilder, RegistryEntry, SocketId};
use crate::task::Shutdown;
use crate::telemetry::{RelayDirection, RelayEvent, RelayProtocol};
use crate::RelayContext;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown as HalfClose, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const LISTEN_BACKLOG: i32 = 10;
const PUMP_BUFFER_SIZE: usize = 65_536;

#[derive(Clone, Debug)]
pub struct TcpOptions {
    pub listen_ip: Ipv4Addr,
    /// Pause between accepting a client and dialing the server.
    pub connect_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            listen_ip: Ipv4Addr::UNSPECIFIED,
            connect_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// A bound listener and the redirection it serves.
pub struct TcpListenerSlot {
    redirection: TcpRedirection,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpListenerSlot {
    pub fn bind(redirection: &TcpRedirection, options: &TcpOptions) -> Result<Self> {
        let addr = SocketAddr::V4(SocketAddrV4::new(options.listen_ip, redirection.proxy_port));
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| ProxyError::io("create tcp listener", err))?;
        socket
            .set_reuse_address(true)
            .map_err(|source| ProxyError::SocketOption {
                option: "SO_REUSEADDR",
                source,
            })?;
        socket
            .bind(&addr.into())
            .map_err(|source| ProxyError::Bind { addr, source })?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|err| ProxyError::io(format!("listen on {addr}"), err))?;
        // Accept is polled so the loop can notice shutdown.
        socket
            .set_nonblocking(true)
            .map_err(|err| ProxyError::io(format!("nonblocking listener {addr}"), err))?;
        let listener: TcpListener = socket.into();
        let local_addr = listener
            .local_addr()
            .map_err(|err| ProxyError::io(format!("local address of {addr}"), err))?;
        Ok(Self {
            redirection: redirection.clone(),
            listener,
            local_addr,
        })
    }

    pub fn redirection(&self) -> &TcpRedirection {
        &self.redirection
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket_id(&self) -> SocketId {
        self.listener.as_raw_fd()
    }

    pub fn upstream(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(
            self.redirection.server_ip,
            self.redirection.server_port,
        ))
    }

    pub(crate) fn describe(&self) -> String {
        format!("{} -> {}", self.local_addr, self.upstream())
    }
}

pub struct TcpRelay {
    listeners: Vec<Arc<TcpListenerSlot>>,
    options: TcpOptions,
}

impl TcpRelay {
    /// Binds one listener per redirection. A listener that cannot be set
    /// up is skipped; the others still serve.
    pub fn build(
        redirections: &[TcpRedirection],
        options: &TcpOptions,
        registry: &mut RegistryBuilder,
    ) -> Self {
        let mut listeners = Vec::with_capacity(redirections.len());
        for redirection in redirections {
            let slot = match TcpListenerSlot::bind(redirection, options) {
                Ok(slot) => Arc::new(slot),
                Err(err) => {
                    logger::rate_limited_error(
                        ErrorCategory::SocketSetup,
                        format!("skipping tcp redirection on port {}: {err}", redirection.proxy_port),
                    );
                    continue;
                }
            };
            let entry = RegistryEntry::TcpListener {
                listener: Arc::clone(&slot),
            };
            if let Err(err) = registry.insert(slot.socket_id(), entry) {
                logger::error(format!("skipping tcp listener {}: {err}", slot.describe()));
                continue;
            }
            logger::info(format!("tcp redirection {} ready", slot.describe()));
            listeners.push(slot);
        }
        Self {
            listeners,
            options: options.clone(),
        }
    }

    pub fn listeners(&self) -> &[Arc<TcpListenerSlot>] {
        &self.listeners
    }

    /// Starts one accept thread per listener.
    pub fn start(&self, ctx: &RelayContext) -> io::Result<usize> {
        for slot in &self.listeners {
            let id = slot.socket_id();
            let thread_ctx = ctx.clone();
            let options = self.options.clone();
            ctx.tasks.spawn(
                format!("tcp-accept-{}", slot.local_addr().port()),
                move || accept_loop(id, thread_ctx, options),
            )?;
        }
        Ok(self.listeners.len())
    }
}

fn accept_loop(id: SocketId, ctx: RelayContext, options: TcpOptions) {
    let slot = match ctx.registry.lookup(id) {
        Some(RegistryEntry::TcpListener { listener }) => Arc::clone(listener),
        _ => {
            logger::error(format!("tcp socket {id} is not a registered listener"));
            return;
        }
    };
    let stop = ctx.tasks.shutdown_token();
    logger::breadcrumb(BreadcrumbFlags::TCP, format!("accepting on {}", slot.describe()));

    while !stop.is_triggered() {
        match slot.listener.accept() {
            Ok((client, peer)) => {
                logger::breadcrumb(
                    BreadcrumbFlags::TCP,
                    format!("client {peer} on {}", slot.local_addr()),
                );
                if let Err(err) = handle_client(client, &slot, &ctx, &options, &stop) {
                    if matches!(err, ProxyError::UpstreamConnect { .. }) {
                        ctx.tasks.fatal_reporter().report(err);
                        break;
                    }
                    logger::rate_limited_error(
                        ErrorCategory::SocketSetup,
                        format!("client {peer} on {}: {err}", slot.local_addr()),
                    );
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(options.poll_interval);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                logger::rate_limited_error(
                    ErrorCategory::Receive,
                    format!("accept on {} failed: {err}", slot.local_addr()),
                );
                thread::sleep(options.poll_interval);
            }
        }
    }
    logger::breadcrumb(
        BreadcrumbFlags::TCP,
        format!("accept thread for {} exiting", slot.local_addr()),
    );
}

fn handle_client(
    client: TcpStream,
    slot: &TcpListenerSlot,
    ctx: &RelayContext,
    options: &TcpOptions,
    stop: &Shutdown,
) -> Result<()> {
    client
        .set_nonblocking(false)
        .map_err(|err| ProxyError::io("blocking client socket", err))?;
    if !settle(options.connect_delay, options.poll_interval, stop) {
        return Ok(());
    }
    let upstream = slot.upstream();
    let server = TcpStream::connect(upstream).map_err(|source| ProxyError::UpstreamConnect {
        addr: upstream,
        source,
    })?;
    logger::breadcrumb(
        BreadcrumbFlags::TCP,
        format!("paired client with {upstream} on {}", slot.local_addr()),
    );
    ChannelPair { client, server }.start(ctx, slot.local_addr().port(), options.poll_interval)
}

/// Sleeps for `delay` unless shutdown is requested first.
fn settle(delay: Duration, poll: Duration, stop: &Shutdown) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if stop.is_triggered() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(poll));
    }
}

/// An accepted client and its server connection.
pub struct ChannelPair {
    pub client: TcpStream,
    pub server: TcpStream,
}

impl ChannelPair {
    /// Spawns the `client -> server` and `server -> client` pumps.
    pub fn start(self, ctx: &RelayContext, proxy_port: u16, poll: Duration) -> Result<()> {
        let pumps = [
            (&self.client, &self.server, RelayDirection::Forward, "c2s"),
            (&self.server, &self.client, RelayDirection::Reverse, "s2c"),
        ];
        for (source, destination, direction, label) in pumps {
            let reader = source
                .try_clone()
                .map_err(|err| ProxyError::io("clone tcp stream", err))?;
            let writer = destination
                .try_clone()
                .map_err(|err| ProxyError::io("clone tcp stream", err))?;
            reader
                .set_read_timeout(Some(poll))
                .map_err(|err| ProxyError::io("tcp read timeout", err))?;
            writer
                .set_write_timeout(Some(poll))
                .map_err(|err| ProxyError::io("tcp write timeout", err))?;
            let pump = Pump {
                reader,
                writer,
                direction,
                proxy_port,
                ctx: ctx.clone(),
            };
            ctx.tasks
                .spawn(format!("tcp-{label}-{proxy_port}"), move || pump.run())
                .map_err(|err| ProxyError::io("spawn tcp pump", err))?;
        }
        Ok(())
    }
}

struct Pump {
    reader: TcpStream,
    writer: TcpStream,
    direction: RelayDirection,
    proxy_port: u16,
    ctx: RelayContext,
}

impl Pump {
    fn run(mut self) {
        let stop = self.ctx.tasks.shutdown_token();
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
        while !stop.is_triggered() {
            let received = match self.reader.read(&mut buf) {
                Ok(0) => {
                    // Pass the close on so the opposite pump sees EOF too.
                    let _ = self.writer.shutdown(HalfClose::Write);
                    break;
                }
                Ok(received) => received,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(err) => {
                    logger::rate_limited_error(
                        ErrorCategory::Receive,
                        format!("tcp {:?} read on port {}: {err}", self.direction, self.proxy_port),
                    );
                    break;
                }
            };
            let mutated = self.ctx.engine.post_fuzzing(&buf[..received]);
            match write_until_stopped(&mut self.writer, &mutated, &stop) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    logger::rate_limited_error(
                        ErrorCategory::Send,
                        format!("tcp {:?} write on port {}: {err}", self.direction, self.proxy_port),
                    );
                    break;
                }
            }
            self.ctx.telemetry.record(RelayEvent::new(
                RelayProtocol::Tcp,
                self.direction,
                self.proxy_port,
                received,
                mutated.len(),
            ));
        }
        logger::breadcrumb(
            BreadcrumbFlags::TCP,
            format!("tcp {:?} pump on port {} exiting", self.direction, self.proxy_port),
        );
    }
}

/// `write_all` that gives up once `stop` fires. The writer needs a write
/// timeout so a peer that stops reading cannot park the thread forever.
/// Returns `Ok(false)` when interrupted by shutdown.
fn write_until_stopped(
    writer: &mut impl Write,
    mut data: &[u8],
    stop: &Shutdown,
) -> io::Result<bool> {
    while !data.is_empty() {
        if stop.is_triggered() {
            return Ok(false);
        }
        match writer.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(written) => data = &data[written..],
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}
