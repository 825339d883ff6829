use super::RelayOptions;
use crate::error::{ProxyError, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};

/// One datagram read by [`recv_with_original_destination`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub len: usize,
    pub source: SocketAddrV4,
    /// Destination the sender addressed before NAT redirected it here.
    pub original_destination: Option<SocketAddrV4>,
}

/// Receive socket: reports the pre-NAT destination of every datagram and
/// wakes up every `poll_interval` so the relay can notice shutdown.
pub(crate) fn bind_receive_socket(port: u16, options: &RelayOptions) -> Result<UdpSocket> {
    let socket = new_udp_socket()?;
    set_ip_option(&socket, IpOption::RecvOrigDstAddr)?;
    let socket = bind(socket, port, options)?;
    socket
        .set_read_timeout(Some(options.poll_interval))
        .map_err(|err| ProxyError::io(format!("read timeout on udp port {port}"), err))?;
    Ok(socket)
}

/// Send socket: transparent unless the relay runs on a single host.
pub(crate) fn bind_send_socket(port: u16, options: &RelayOptions) -> Result<UdpSocket> {
    let socket = new_udp_socket()?;
    if options.transparent {
        set_ip_option(&socket, IpOption::Transparent)?;
    }
    bind(socket, port, options)
}

fn new_udp_socket() -> Result<Socket> {
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|err| ProxyError::io("create udp socket", err))
}

fn bind(socket: Socket, port: u16, options: &RelayOptions) -> Result<UdpSocket> {
    let addr = SocketAddr::V4(SocketAddrV4::new(options.bind_ip, port));
    socket
        .bind(&addr.into())
        .map_err(|source| ProxyError::Bind { addr, source })?;
    Ok(socket.into())
}

#[derive(Clone, Copy, Debug)]
enum IpOption {
    Transparent,
    RecvOrigDstAddr,
}

impl IpOption {
    fn label(self) -> &'static str {
        match self {
            IpOption::Transparent => "IP_TRANSPARENT",
            IpOption::RecvOrigDstAddr => "IP_RECVORIGDSTADDR",
        }
    }
}

#[cfg(target_os = "linux")]
fn set_ip_option(socket: &Socket, option: IpOption) -> Result<()> {
    use std::os::fd::AsRawFd;

    let name = match option {
        IpOption::Transparent => libc::IP_TRANSPARENT,
        IpOption::RecvOrigDstAddr => libc::IP_RECVORIGDSTADDR,
    };
    let enabled: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_IP,
            name,
            &enabled as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(ProxyError::SocketOption {
            option: option.label(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_ip_option(_socket: &Socket, option: IpOption) -> Result<()> {
    Err(ProxyError::SocketOption {
        option: option.label(),
        source: io::Error::new(io::ErrorKind::Unsupported, "linux only"),
    })
}

/// Room for one `IP_ORIGDSTADDR` control message, aligned for `cmsghdr`.
#[cfg(target_os = "linux")]
const CONTROL_WORDS: usize = 16;

/// Reads one datagram together with its original destination.
///
/// A read timeout surfaces as `WouldBlock`/`TimedOut`, like `recv_from`.
#[cfg(target_os = "linux")]
pub fn recv_with_original_destination(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Datagram> {
    use std::mem;
    use std::os::fd::AsRawFd;

    let mut source: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut control = [0u64; CONTROL_WORDS];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut source as *mut libc::sockaddr_in as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let received = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut original_destination = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::SOL_IP && header.cmsg_type == libc::IP_ORIGDSTADDR {
            let addr = unsafe {
                std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::sockaddr_in)
            };
            original_destination = Some(to_socket_addr(&addr));
            break;
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    Ok(Datagram {
        len: received as usize,
        source: to_socket_addr(&source),
        original_destination,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn recv_with_original_destination(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Datagram> {
    let (len, source) = socket.recv_from(buf)?;
    match source {
        SocketAddr::V4(source) => Ok(Datagram {
            len,
            source,
            original_destination: None,
        }),
        SocketAddr::V6(_) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected ipv6 sender",
        )),
    }
}

#[cfg(target_os = "linux")]
fn to_socket_addr(addr: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        u32::from_be(addr.sin_addr.s_addr).into(),
        u16::from_be(addr.sin_port),
    )
}
