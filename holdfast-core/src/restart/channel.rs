//! Restart-lifetime control channel between process generations.
//!
//! Unix datagram sockets in the abstract namespace, addressed by base id,
//! epoch and role, so no filesystem cleanup is ever needed. Listen-socket
//! fds ride in `SCM_RIGHTS` ancillary data.

use std::{
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

use super::message::HotRestartMessage;

const CONTROL_SOCKET_PREFIX: &str = "holdfast_domain_socket";

/// Bounded wait for a reply; silence past this is treated as "no parent"
/// rather than blocking start-up forever.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Parent,
    Child,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Parent => "parent",
            Role::Child => "child",
        }
    }
}

/// Peer address captured at receive time so a reply can be routed back.
pub struct PeerAddr {
    addr: libc::sockaddr_un,
    len: libc::socklen_t,
}

pub struct DomainSocket {
    fd: OwnedFd,
}

impl DomainSocket {
    /// Bind the control socket for one role of one generation.
    pub fn bind(base_id: u64, epoch: u64, role: Role) -> io::Result<DomainSocket> {
        let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let (addr, len) = control_socket_addr(base_id, epoch, role);
        let rc = unsafe { libc::bind(raw, &addr as *const _ as *const libc::sockaddr, len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(DomainSocket { fd })
    }

    /// Send to the control socket of another generation's role.
    pub fn send_to_role(
        &self,
        base_id: u64,
        epoch: u64,
        role: Role,
        message: &HotRestartMessage,
        fd: Option<RawFd>,
    ) -> io::Result<()> {
        let (addr, len) = control_socket_addr(base_id, epoch, role);
        self.send_impl(&addr, len, message, fd)
    }

    /// Reply to the peer a request was received from.
    pub fn send_to_peer(
        &self,
        peer: &PeerAddr,
        message: &HotRestartMessage,
        fd: Option<RawFd>,
    ) -> io::Result<()> {
        self.send_impl(&peer.addr, peer.len, message, fd)
    }

    fn send_impl(
        &self,
        addr: &libc::sockaddr_un,
        addr_len: libc::socklen_t,
        message: &HotRestartMessage,
        fd: Option<RawFd>,
    ) -> io::Result<()> {
        let payload = message.encode()?;
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut cmsg_buf = [0u8; 64];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = addr as *const _ as *mut libc::c_void;
        msg.msg_namelen = addr_len;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if let Some(fd) = fd {
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen =
                unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
                std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
            }
        }
        let rc = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &msg, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Receive one message, waiting at most `timeout` (forever if `None`).
    /// `Ok(None)` means the wait elapsed with nothing to read.
    pub fn recv(
        &self,
        timeout: Option<Duration>,
    ) -> io::Result<Option<(HotRestartMessage, Option<OwnedFd>, PeerAddr)>> {
        if let Some(timeout) = timeout {
            let mut pfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
            if rc < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    return Ok(None);
                }
                return Err(e);
            }
            if rc == 0 {
                return Ok(None);
            }
        }

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut peer: libc::sockaddr_un = unsafe { mem::zeroed() };
        let mut cmsg_buf = [0u8; 64];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut peer as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len();

        let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut received_fd = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let fd = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd);
                    received_fd = Some(OwnedFd::from_raw_fd(fd));
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        let message = HotRestartMessage::decode(&buf[..n as usize])?;
        Ok(Some((
            message,
            received_fd,
            PeerAddr {
                addr: peer,
                len: msg.msg_namelen,
            },
        )))
    }
}

fn control_socket_addr(base_id: u64, epoch: u64, role: Role) -> (libc::sockaddr_un, libc::socklen_t) {
    let name = format!("{CONTROL_SOCKET_PREFIX}_{}_{base_id}_{epoch}", role.as_str());
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    // Abstract namespace: leading NUL, no filesystem presence.
    for (dst, src) in addr.sun_path[1..].iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + 1 + name.len();
    (addr, len as libc::socklen_t)
}
