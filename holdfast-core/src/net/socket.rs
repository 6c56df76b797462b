use std::{
    io, mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::PathBuf,
};

use super::{ListenAddress, SocketType};
use crate::config::LiteralSocketOption;

// Missing from the libc crate on some targets.
const IPV6_TRANSPARENT: libc::c_int = 75;
const IPV6_FREEBIND: libc::c_int = 78;

const DEFAULT_BACKLOG: libc::c_int = 1024;

/// Lifecycle point at which a socket option is applied.
///
/// `Bound` options are set right after bind (before listen) on the thread
/// that created the socket; `Listening` options are set by a worker after it
/// starts the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOptionState {
    Bound,
    Listening,
}

/// A single `setsockopt` to run at a given lifecycle point.
#[derive(Debug, Clone, Copy)]
pub struct SocketOption {
    pub level: libc::c_int,
    pub name: libc::c_int,
    pub value: libc::c_int,
    pub state: SocketOptionState,
}

impl SocketOption {
    pub fn transparent(v6: bool) -> SocketOption {
        if v6 {
            SocketOption {
                level: libc::IPPROTO_IPV6,
                name: IPV6_TRANSPARENT,
                value: 1,
                state: SocketOptionState::Bound,
            }
        } else {
            SocketOption {
                level: libc::IPPROTO_IP,
                name: libc::IP_TRANSPARENT,
                value: 1,
                state: SocketOptionState::Bound,
            }
        }
    }

    pub fn freebind(v6: bool) -> SocketOption {
        if v6 {
            SocketOption {
                level: libc::IPPROTO_IPV6,
                name: IPV6_FREEBIND,
                value: 1,
                state: SocketOptionState::Bound,
            }
        } else {
            SocketOption {
                level: libc::IPPROTO_IP,
                name: libc::IP_FREEBIND,
                value: 1,
                state: SocketOptionState::Bound,
            }
        }
    }

    /// TCP fast-open queue length; takes effect once the socket listens.
    pub fn tcp_fast_open(queue_length: u32) -> SocketOption {
        SocketOption {
            level: libc::IPPROTO_TCP,
            name: libc::TCP_FASTOPEN,
            value: queue_length as libc::c_int,
            state: SocketOptionState::Listening,
        }
    }

    /// Needed for recvmsg to return the destination address in the IP header.
    pub fn ip_packet_info(v6: bool) -> SocketOption {
        if v6 {
            SocketOption {
                level: libc::IPPROTO_IPV6,
                name: libc::IPV6_RECVPKTINFO,
                value: 1,
                state: SocketOptionState::Bound,
            }
        } else {
            SocketOption {
                level: libc::IPPROTO_IP,
                name: libc::IP_PKTINFO,
                value: 1,
                state: SocketOptionState::Bound,
            }
        }
    }

    /// Needed to return the receive-buffer overflow indicator.
    pub fn rx_queue_overflow() -> SocketOption {
        SocketOption {
            level: libc::SOL_SOCKET,
            name: libc::SO_RXQ_OVFL,
            value: 1,
            state: SocketOptionState::Bound,
        }
    }

    pub fn literal(config: &LiteralSocketOption) -> SocketOption {
        SocketOption {
            level: config.level as libc::c_int,
            name: config.name as libc::c_int,
            value: config.int_value as libc::c_int,
            state: match config.state {
                crate::config::SocketOptionStateConfig::Bound => SocketOptionState::Bound,
                crate::config::SocketOptionStateConfig::Listening => SocketOptionState::Listening,
            },
        }
    }
}

/// An OS socket bound to a [`ListenAddress`], carrying the option list that
/// still has to be applied at later lifecycle points.
///
/// Exclusively owned by the socket factory until handed to a worker; workers
/// in the reuse-port configuration own one each.
#[derive(Debug)]
pub struct ListenSocket {
    fd: OwnedFd,
    local_address: ListenAddress,
    socket_type: SocketType,
    options: Vec<SocketOption>,
}

impl ListenSocket {
    /// Create and bind a fresh socket. `reuse_port` is set before bind so the
    /// kernel accepts sibling sockets on the same address.
    pub fn bind(
        address: &ListenAddress,
        socket_type: SocketType,
        reuse_port: bool,
        bind_to_port: bool,
    ) -> io::Result<ListenSocket> {
        let domain = match address {
            ListenAddress::Ip(SocketAddr::V4(_)) => libc::AF_INET,
            ListenAddress::Ip(SocketAddr::V6(_)) => libc::AF_INET6,
            ListenAddress::Pipe(_) => libc::AF_UNIX,
        };
        let ty = match socket_type {
            SocketType::Stream => libc::SOCK_STREAM,
            SocketType::Datagram => libc::SOCK_DGRAM,
        };

        let raw = unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if reuse_port && !address.is_pipe() {
            set_option(raw, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        }

        let mut local_address = address.clone();
        if bind_to_port {
            match address {
                ListenAddress::Ip(addr) => {
                    let (storage, len) = sockaddr_from_ip(addr);
                    let rc = unsafe {
                        libc::bind(raw, &storage as *const _ as *const libc::sockaddr, len)
                    };
                    if rc != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    // Refresh so a port-0 request reports the resolved port.
                    local_address = ListenAddress::Ip(local_ip_addr(raw)?);
                }
                ListenAddress::Pipe(path) => {
                    // Try remove file first
                    let _ = std::fs::remove_file(path);
                    let (storage, len) = sockaddr_from_path(path)?;
                    let rc = unsafe {
                        libc::bind(raw, &storage as *const _ as *const libc::sockaddr, len)
                    };
                    if rc != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
            }
        }

        Ok(ListenSocket {
            fd,
            local_address,
            socket_type,
            options: Vec::new(),
        })
    }

    /// Adopt a file descriptor duplicated from a previous process generation.
    ///
    /// The fd must be a socket already bound to `address`; anything else is a
    /// protocol violation by the peer and is reported as an error, not
    /// adopted.
    pub fn from_duplicated_fd(
        fd: OwnedFd,
        address: ListenAddress,
        socket_type: SocketType,
    ) -> io::Result<ListenSocket> {
        if !is_socket_fd(fd.as_raw_fd()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("duplicated fd for '{address}' is not a socket"),
            ));
        }
        let local_address = match &address {
            ListenAddress::Ip(_) => ListenAddress::Ip(local_ip_addr(fd.as_raw_fd())?),
            ListenAddress::Pipe(path) => ListenAddress::Pipe(path.clone()),
        };
        Ok(ListenSocket {
            fd,
            local_address,
            socket_type,
            options: Vec::new(),
        })
    }

    /// Remember options so the `Listening` subset can be applied later by the
    /// worker that starts the socket.
    pub fn add_options(&mut self, options: &[SocketOption]) {
        self.options.extend_from_slice(options);
    }

    /// Run every retained option tagged with `state`. Any failure fails the
    /// whole operation that requested it.
    pub fn apply_options(&self, state: SocketOptionState) -> io::Result<()> {
        for opt in self.options.iter().filter(|o| o.state == state) {
            set_option(self.fd.as_raw_fd(), opt.level, opt.name, opt.value).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!(
                        "setsockopt(level={}, name={}) on '{}': {e}",
                        opt.level, opt.name, self.local_address
                    ),
                )
            })?;
        }
        Ok(())
    }

    pub fn listen(&self) -> io::Result<()> {
        debug_assert_eq!(self.socket_type, SocketType::Stream);
        let rc = unsafe { libc::listen(self.fd.as_raw_fd(), DEFAULT_BACKLOG) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Duplicate the underlying fd, e.g. to hand it to the next process
    /// generation. Both descriptors refer to the same open socket.
    pub fn duplicate(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    pub fn local_address(&self) -> &ListenAddress {
        &self.local_address
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    /// Clone into a std TCP listener for handing to a per-worker runtime.
    pub fn to_std_tcp_listener(&self) -> io::Result<std::net::TcpListener> {
        let dup = self.fd.try_clone()?;
        let listener = std::net::TcpListener::from(dup);
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Clone into a std unix listener for handing to a per-worker runtime.
    pub fn to_std_unix_listener(&self) -> io::Result<std::os::unix::net::UnixListener> {
        let dup = self.fd.try_clone()?;
        let listener = std::os::unix::net::UnixListener::from(dup);
        listener.set_nonblocking(true)?;
        Ok(listener)
    }
}

impl AsRawFd for ListenSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn set_option(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn is_socket_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    rc == 0 && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

fn sockaddr_from_ip(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
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
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
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
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_from_path(path: &PathBuf) -> io::Result<(libc::sockaddr_storage, libc::socklen_t)> {
    use std::os::unix::ffi::OsStrExt;
    let bytes = path.as_os_str().as_bytes();
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let sun = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_un) };
    if bytes.len() >= sun.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "uds path too long",
        ));
    }
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((storage, len as libc::socklen_t))
}

fn local_ip_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected socket family {family}"),
        )),
    }
}
