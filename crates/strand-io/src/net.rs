//! TCP types over the hook layer
//!
//! `TcpListener` and `TcpStream` look like their std counterparts but
//! route every call through the interception layer: on a reactor worker
//! the calling fiber parks instead of the thread blocking, while on a
//! plain thread they degrade to ordinary blocking sockets.

use crate::fd_manager::TimeoutKind;
use crate::hook;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {}", other),
        )),
    }
}

fn domain_of(addr: &SocketAddr) -> i32 {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

fn local_addr_of(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to(&storage)
}

fn timeout_timeval(ms: u64) -> libc::timeval {
    libc::timeval {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
    }
}

/// Listening TCP socket.
pub struct TcpListener {
    fd: RawFd,
}

impl TcpListener {
    /// Bind and listen. `SO_REUSEADDR` is always set.
    pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
        let fd = hook::socket(domain_of(&addr), libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let listener = TcpListener { fd };

        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let (storage, len) = sockaddr_from(&addr);
        let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::listen(fd, 1024) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(listener)
    }

    /// Accept one connection; inside a fiber this parks instead of
    /// blocking the worker.
    pub fn accept(&self) -> io::Result<TcpStream> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            hook::accept(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(TcpStream { fd })
    }

    /// The bound address, useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        local_addr_of(self.fd)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

/// Connected TCP socket.
pub struct TcpStream {
    fd: RawFd,
}

impl TcpStream {
    /// Connect under the process-wide `tcp.connect.timeout` deadline.
    pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
        Self::connect_inner(addr, Some(hook::connect_timeout_ms()))
    }

    /// Connect under an explicit deadline in milliseconds.
    pub fn connect_timeout(addr: SocketAddr, timeout_ms: u64) -> io::Result<TcpStream> {
        Self::connect_inner(addr, Some(timeout_ms))
    }

    fn connect_inner(addr: SocketAddr, timeout_ms: Option<u64>) -> io::Result<TcpStream> {
        let fd = hook::socket(domain_of(&addr), libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let stream = TcpStream { fd };

        let (storage, len) = sockaddr_from(&addr);
        let rc = unsafe {
            hook::connect_with_timeout(
                fd,
                &storage as *const _ as *const libc::sockaddr,
                len,
                timeout_ms,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(stream)
    }

    /// Wrap an already-connected fd.
    pub fn from_raw(fd: RawFd) -> TcpStream {
        TcpStream { fd }
    }

    /// Read some bytes; 0 means the peer closed.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = hook::recv(self.fd, buf, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Send some bytes, returning how many went out.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = hook::send(self.fd, buf, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Send the whole buffer, retrying partial writes.
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted no bytes",
                ));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Receive timeout in milliseconds, enforced by the reactor's timers
    /// rather than the kernel. `None` clears it.
    pub fn set_recv_timeout(&self, ms: Option<u64>) {
        match ms {
            Some(ms) => {
                let tv = timeout_timeval(ms);
                unsafe {
                    hook::setsockopt(
                        self.fd,
                        libc::SOL_SOCKET,
                        libc::SO_RCVTIMEO,
                        &tv as *const _ as *const libc::c_void,
                        std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                    );
                }
            }
            None => hook::set_socket_timeout(self.fd, TimeoutKind::Recv, None),
        }
    }

    /// Send timeout in milliseconds; see [`TcpStream::set_recv_timeout`].
    pub fn set_send_timeout(&self, ms: Option<u64>) {
        match ms {
            Some(ms) => {
                let tv = timeout_timeval(ms);
                unsafe {
                    hook::setsockopt(
                        self.fd,
                        libc::SOL_SOCKET,
                        libc::SO_SNDTIMEO,
                        &tv as *const _ as *const libc::c_void,
                        std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                    );
                }
            }
            None => hook::set_socket_timeout(self.fd, TimeoutKind::Send, None),
        }
    }

    /// Shut down the write side, signalling EOF to the peer.
    pub fn shutdown_write(&self) -> io::Result<()> {
        if unsafe { libc::shutdown(self.fd, libc::SHUT_WR) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        local_addr_of(self.fd)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage).unwrap(), addr);
    }

    #[test]
    fn test_sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:9090".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage).unwrap(), addr);
    }

    #[test]
    fn test_bind_ephemeral_and_local_addr() {
        // outside a reactor thread this is a plain blocking socket
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_timeval_conversion() {
        let tv = timeout_timeval(1234);
        assert_eq!(tv.tv_sec, 1);
        assert_eq!(tv.tv_usec, 234_000);
    }
}
