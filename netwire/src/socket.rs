//! Socket setup and non-blocking syscall helpers shared by the endpoints.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use crate::error::Error;

/// Sentinel for a missing or closed descriptor.
pub const INVALID_SOCKET: RawFd = -1;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

pub(crate) fn parse_ipv4(ip: &str) -> Result<Ipv4Addr, Error> {
    ip.parse().map_err(|_| Error::InvalidAddress(ip.to_string()))
}

pub(crate) fn tcp_listener(addr: SocketAddrV4, backlog: i32) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket)
}

pub(crate) fn tcp_socket(local: Option<SocketAddrV4>) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if let Some(addr) = local {
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
    }
    Ok(socket)
}

pub(crate) fn udp_socket(local: Option<SocketAddrV4>) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if let Some(addr) = local {
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
    }
    Ok(socket)
}

#[cfg(unix)]
pub(crate) fn unix_listener(path: &str, backlog: i32) -> io::Result<Socket> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::unix(path)?)?;
    socket.listen(backlog)?;
    Ok(socket)
}

#[cfg(unix)]
pub(crate) fn unix_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Clamp a socket path to what fits in `sun_path` (107 bytes plus the NUL),
/// respecting UTF-8 boundaries.
#[cfg(unix)]
pub(crate) fn clamp_unix_path(path: &str) -> &str {
    const SUN_PATH_MAX: usize = 107;
    if path.len() <= SUN_PATH_MAX {
        return path;
    }
    let mut end = SUN_PATH_MAX;
    while end > 0 && !path.is_char_boundary(end) {
        end -= 1;
    }
    &path[..end]
}

/// TCP keepalive for accepted connections: probe after 3 s idle, every 1 s,
/// twice.
pub(crate) fn enable_keepalive(socket: &Socket) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(3))
        .with_interval(Duration::from_secs(1))
        .with_retries(2);
    socket.set_tcp_keepalive(&keepalive)
}

/// Wait for `fd` to become writable, used to complete a non-blocking
/// connect.
pub(crate) fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis() as libc::c_int;
    loop {
        let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ret > 0 {
            return Ok(());
        }
        if ret == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

pub(crate) fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub(crate) fn send_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            SEND_FLAGS,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub(crate) fn recv_from_nonblocking(
    fd: RawFd,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddrV4)> {
    let mut storage: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let ip = Ipv4Addr::from(u32::from_be(storage.sin_addr.s_addr));
    let port = u16::from_be(storage.sin_port);
    Ok((n as usize, SocketAddrV4::new(ip, port)))
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
    let dest = sockaddr_in(addr);
    let n = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            SEND_FLAGS,
            &dest as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sa
}
