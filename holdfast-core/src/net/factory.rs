use std::{
    os::fd::OwnedFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use tracing::{debug, warn};

use super::{ListenAddress, ListenSocket, SocketOption, SocketOptionState, SocketType};
use crate::ConfigError;

/// Decides, per listener, whether one shared OS socket is created up front or
/// whether each worker creates its own reuse-port socket, and arbitrates which
/// worker receives a pre-reserved socket.
///
/// Sharing policy:
/// - `reuse_port == false` (or a pipe address): one socket, created eagerly,
///   cloned to every worker.
/// - `reuse_port == true` with port 0: a socket is created eagerly to reserve
///   a real port number before the listener becomes externally visible, then
///   handed over to exactly one worker; the rest bind their own.
/// - `reuse_port == true` with a fixed port: every worker binds its own.
///
/// A socket inherited from a previous process generation always enters the
/// eager slot: it is already bound and receiving, so it must be handed to a
/// worker rather than closed and re-created.
pub struct ListenSocketFactory {
    listener_name: String,
    local_address: ListenAddress,
    socket_type: SocketType,
    options: Vec<SocketOption>,
    bind_to_port: bool,
    reuse_port: bool,
    /// Cloned to every caller when the listener shares a single socket.
    shared: Option<Arc<ListenSocket>>,
    /// Reserved socket awaiting its single winner; guarded by `claimed`.
    reserved: Mutex<Option<ListenSocket>>,
    claimed: AtomicBool,
}

impl ListenSocketFactory {
    pub fn new(
        address: ListenAddress,
        socket_type: SocketType,
        options: Vec<SocketOption>,
        bind_to_port: bool,
        listener_name: String,
        reuse_port: bool,
        inherited: Option<OwnedFd>,
    ) -> Result<Self, ConfigError> {
        let share_socket = !reuse_port || address.is_pipe();
        // Port 0 needs an eager socket so every worker observes the same
        // resolved port.
        let reserve_socket =
            !share_socket && (address.port() == Some(0) || inherited.is_some());

        let mut local_address = address;
        let mut shared = None;
        let mut reserved = None;
        if share_socket || reserve_socket {
            let socket = create_listen_socket(
                &local_address,
                socket_type,
                &options,
                bind_to_port,
                reuse_port,
                inherited,
                &listener_name,
            )?;
            if local_address.port() == Some(0) {
                local_address = socket.local_address().clone();
            }
            if share_socket {
                shared = Some(Arc::new(socket));
            } else {
                reserved = Some(socket);
            }
        }
        debug!(
            "set listener {listener_name} socket factory local address to {local_address}"
        );

        Ok(ListenSocketFactory {
            listener_name,
            local_address,
            socket_type,
            options,
            bind_to_port,
            reuse_port,
            shared,
            reserved: Mutex::new(reserved),
            claimed: AtomicBool::new(false),
        })
    }

    /// Called by each worker when it starts the listener; safe to call
    /// concurrently from any number of worker threads.
    pub fn get_listen_socket(&self) -> Result<Arc<ListenSocket>, ConfigError> {
        if let Some(shared) = &self.shared {
            return Ok(shared.clone());
        }

        // One-shot hand-off: the first caller that finds a reserved socket
        // takes ownership; everyone else falls through and binds its own.
        // A bound UDP socket is already receiving packets, so it can neither
        // sit unused nor be closed and reopened.
        if !self.claimed.swap(true, Ordering::AcqRel) {
            let taken = self
                .reserved
                .lock()
                .expect("reserved listen socket lock poisoned")
                .take();
            if let Some(socket) = taken {
                return Ok(Arc::new(socket));
            }
        }

        let socket = create_listen_socket(
            &self.local_address,
            self.socket_type,
            &self.options,
            self.bind_to_port,
            self.reuse_port,
            None,
            &self.listener_name,
        )?;
        Ok(Arc::new(socket))
    }

    /// The listener's resolved bind address; reflects the real port when the
    /// configuration requested port 0.
    pub fn local_address(&self) -> &ListenAddress {
        &self.local_address
    }

    pub fn listener_name(&self) -> &str {
        &self.listener_name
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn reuse_port(&self) -> bool {
        self.reuse_port
    }

    /// Duplicate the eagerly created socket, if any, for handing to the next
    /// process generation.
    pub fn duplicate_reserved(&self) -> Option<OwnedFd> {
        if let Some(shared) = &self.shared {
            return shared.duplicate().ok();
        }
        self.reserved
            .lock()
            .expect("reserved listen socket lock poisoned")
            .as_ref()
            .and_then(|s| s.duplicate().ok())
    }
}

fn create_listen_socket(
    address: &ListenAddress,
    socket_type: SocketType,
    options: &[SocketOption],
    bind_to_port: bool,
    reuse_port: bool,
    inherited: Option<OwnedFd>,
    listener_name: &str,
) -> Result<ListenSocket, ConfigError> {
    let mut socket = match inherited {
        Some(fd) => {
            debug!("adopting duplicated listen socket for listener {listener_name} on {address}");
            ListenSocket::from_duplicated_fd(fd, address.clone(), socket_type)
        }
        None => {
            debug!("create listen socket for listener {listener_name} on address {address}");
            ListenSocket::bind(address, socket_type, reuse_port, bind_to_port)
        }
    }
    .map_err(|e| ConfigError::listener(address, format!("cannot create listen socket: {e}")))?;

    socket.add_options(options);
    if let Err(e) = socket.apply_options(SocketOptionState::Bound) {
        let message = format!("{listener_name}: setting socket options failed: {e}");
        warn!("{message}");
        return Err(ConfigError::listener(address, message));
    }
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    fn make_factory(reuse_port: bool, addr: &str) -> Arc<ListenSocketFactory> {
        Arc::new(
            ListenSocketFactory::new(
                ListenAddress::Ip(addr.parse().unwrap()),
                SocketType::Stream,
                Vec::new(),
                true,
                "test".to_string(),
                reuse_port,
                None,
            )
            .unwrap(),
        )
    }

    fn collect_from_workers(
        factory: &Arc<ListenSocketFactory>,
        workers: usize,
    ) -> Vec<Arc<ListenSocket>> {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let factory = factory.clone();
                std::thread::spawn(move || factory.get_listen_socket().unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn shared_socket_is_identical_across_workers() {
        let factory = make_factory(false, "127.0.0.1:0");
        let sockets = collect_from_workers(&factory, 4);
        let first = sockets[0].as_raw_fd();
        for socket in &sockets {
            assert!(Arc::ptr_eq(socket, &sockets[0]));
            assert_eq!(socket.as_raw_fd(), first);
        }
    }

    #[test]
    fn reuse_port_with_port_zero_hands_reservation_to_one_worker() {
        let factory = make_factory(true, "127.0.0.1:0");
        let resolved = factory.local_address().port().unwrap();
        assert_ne!(resolved, 0);

        let sockets = collect_from_workers(&factory, 4);
        // Every worker observes the reserved port, and every worker holds a
        // distinct socket (the reservation is delivered exactly once).
        let mut fds: Vec<_> = sockets.iter().map(|s| s.as_raw_fd()).collect();
        fds.sort_unstable();
        fds.dedup();
        assert_eq!(fds.len(), sockets.len());
        for socket in &sockets {
            assert_eq!(socket.local_address().port(), Some(resolved));
        }
    }

    #[test]
    fn reuse_port_with_fixed_port_creates_independent_sockets() {
        // Reserve a port with reuse-port semantics so sibling binds succeed.
        let reserver = make_factory(true, "127.0.0.1:0");
        let port = reserver.local_address().port().unwrap();

        let factory = make_factory(true, &format!("127.0.0.1:{port}"));
        let sockets = collect_from_workers(&factory, 3);
        let mut fds: Vec<_> = sockets.iter().map(|s| s.as_raw_fd()).collect();
        fds.sort_unstable();
        fds.dedup();
        assert_eq!(fds.len(), 3);
        for socket in &sockets {
            assert_eq!(socket.local_address().port(), Some(port));
        }
    }

    #[test]
    fn inherited_fd_enters_the_handoff_slot() {
        let origin = make_factory(true, "127.0.0.1:0");
        let origin_socket = origin.get_listen_socket().unwrap();
        let inherited = origin_socket.duplicate().unwrap();
        let addr = origin.local_address().clone();

        let factory = ListenSocketFactory::new(
            addr.clone(),
            SocketType::Stream,
            Vec::new(),
            true,
            "adopted".to_string(),
            true,
            Some(inherited),
        )
        .unwrap();
        let first = factory.get_listen_socket().unwrap();
        // The adopted socket keeps the original address and is handed over
        // rather than re-bound.
        assert_eq!(first.local_address(), &addr);
        let second = factory.get_listen_socket().unwrap();
        assert_ne!(first.as_raw_fd(), second.as_raw_fd());
    }
}
