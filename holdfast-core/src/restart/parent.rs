//! The parent side of the hot-restart protocol: a serving loop answering a
//! child generation's requests against this generation's live state.

use std::{
    collections::HashMap,
    io,
    os::fd::{AsRawFd, OwnedFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use tracing::{debug, info, warn};

use super::{
    channel::{DomainSocket, PeerAddr, Role},
    message::{HotRestartMessage, Reply, Request},
};
use crate::stats::StatsSnapshot;

/// Listen sockets this generation is willing to duplicate for a successor,
/// keyed by the display form of their addresses. Shared with the serving
/// thread; the control thread registers and unregisters entries.
pub type SocketRegistry = Arc<Mutex<HashMap<String, OwnedFd>>>;

/// Hooks into the running server, invoked from the serving thread.
#[derive(Clone)]
pub struct ParentCallbacks {
    pub stats: Arc<dyn Fn() -> StatsSnapshot + Send + Sync>,
    pub drain: Arc<dyn Fn() + Send + Sync>,
    /// Sheds the admin endpoint and returns the original start time.
    pub shutdown_admin: Arc<dyn Fn() -> u64 + Send + Sync>,
    pub terminate: Arc<dyn Fn() + Send + Sync>,
}

pub struct HotRestartingParent {
    socket: Option<Arc<DomainSocket>>,
    registry: SocketRegistry,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotRestartingParent {
    pub fn new(base_id: u64, epoch: u64) -> io::Result<Self> {
        let socket = DomainSocket::bind(base_id, epoch, Role::Parent)?;
        Ok(Self {
            socket: Some(Arc::new(socket)),
            registry: Arc::new(Mutex::new(HashMap::new())),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    pub fn registry(&self) -> SocketRegistry {
        self.registry.clone()
    }

    /// Start answering a future child generation. Idempotent.
    pub fn initialize(&mut self, callbacks: ParentCallbacks) {
        if self.thread.is_some() {
            return;
        }
        let Some(socket) = self.socket.clone() else {
            return;
        };
        let registry = self.registry.clone();
        let stop = self.stop.clone();
        let handle = std::thread::Builder::new()
            .name("holdfast-hot-restart".to_string())
            .spawn(move || serve_loop(socket, registry, stop, callbacks))
            .expect("start hot restart serving thread failed");
        self.thread = Some(handle);
    }

    /// Stop serving as a potential parent. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.socket = None;
    }
}

impl Drop for HotRestartingParent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve_loop(
    socket: Arc<DomainSocket>,
    registry: SocketRegistry,
    stop: Arc<AtomicBool>,
    callbacks: ParentCallbacks,
) {
    debug!("hot restart parent role serving");
    while !stop.load(Ordering::SeqCst) {
        let received = match socket.recv(Some(Duration::from_millis(100))) {
            Ok(None) => continue,
            Ok(Some(received)) => received,
            Err(e) => {
                warn!("hot restart control channel receive failed: {e}");
                continue;
            }
        };
        let (message, _fd, peer) = received;
        let request = match message {
            HotRestartMessage::Request(request) => request,
            HotRestartMessage::Reply(_) => {
                warn!("reply received on the parent control socket; dropped");
                continue;
            }
        };
        if let Err(e) = handle_request(&socket, &registry, &stop, &callbacks, request, &peer) {
            warn!("hot restart request handling failed: {e}");
        }
    }
    debug!("hot restart parent role stopped");
}

fn handle_request(
    socket: &DomainSocket,
    registry: &SocketRegistry,
    stop: &AtomicBool,
    callbacks: &ParentCallbacks,
    request: Request,
    peer: &PeerAddr,
) -> io::Result<()> {
    match request {
        Request::DuplicateListenSocket { address } => {
            let guard = registry.lock().expect("socket registry lock poisoned");
            let fd = guard.get(&address).map(|fd| fd.as_raw_fd());
            debug!(
                "child requested listen socket for '{address}': {}",
                if fd.is_some() { "passing" } else { "not bound here" }
            );
            socket.send_to_peer(
                peer,
                &HotRestartMessage::Reply(Reply::DuplicatedListenSocket {
                    found: fd.is_some(),
                }),
                fd,
            )
        }
        Request::GetStats => {
            let snapshot = (callbacks.stats)();
            socket.send_to_peer(peer, &HotRestartMessage::Reply(Reply::Stats(snapshot)), None)
        }
        Request::DrainListeners => {
            info!("child generation is up; draining listeners");
            (callbacks.drain)();
            socket.send_to_peer(peer, &HotRestartMessage::Reply(Reply::DrainedListeners), None)
        }
        Request::ShutdownAdmin => {
            let original_start_time = (callbacks.shutdown_admin)();
            socket.send_to_peer(
                peer,
                &HotRestartMessage::Reply(Reply::ShutdownAdmin {
                    original_start_time,
                }),
                None,
            )
        }
        Request::Terminate => {
            info!("child generation requested termination");
            // Reply before tearing down so the child never waits out its
            // timeout on a process that is already gone.
            let result =
                socket.send_to_peer(peer, &HotRestartMessage::Reply(Reply::Terminated), None);
            stop.store(true, Ordering::SeqCst);
            (callbacks.terminate)();
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::restart::child::HotRestartingChild;
    use crate::stats::StatsStore;

    fn base_id(offset: u64) -> u64 {
        4_000_000 + std::process::id() as u64 * 100 + offset
    }

    fn noop_callbacks() -> ParentCallbacks {
        ParentCallbacks {
            stats: Arc::new(StatsSnapshot::default),
            drain: Arc::new(|| {}),
            shutdown_admin: Arc::new(|| 0),
            terminate: Arc::new(|| {}),
        }
    }

    #[test]
    fn child_duplicates_a_registered_socket() {
        let id = base_id(0);
        let mut parent = HotRestartingParent::new(id, 0).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        parent
            .registry()
            .lock()
            .unwrap()
            .insert(addr.to_string(), OwnedFd::from(listener));
        parent.initialize(noop_callbacks());

        let child = HotRestartingChild::new(id, 1).unwrap();
        let fd = child
            .duplicate_parent_listen_socket(&addr.to_string())
            .unwrap()
            .expect("parent owns this address");
        let adopted = std::net::TcpListener::from(fd);
        assert_eq!(adopted.local_addr().unwrap(), addr);

        assert!(child
            .duplicate_parent_listen_socket("10.0.0.1:1")
            .unwrap()
            .is_none());
        parent.shutdown();
    }

    #[test]
    fn stats_drain_shutdown_and_terminate_round_trip() {
        let id = base_id(1);
        let mut parent = HotRestartingParent::new(id, 0).unwrap();

        let store = Arc::new(StatsStore::new());
        store.inc_counter("listener.accepts", 3);
        let drained = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));
        let start_time = Arc::new(AtomicU64::new(777));

        let callbacks = ParentCallbacks {
            stats: {
                let store = store.clone();
                Arc::new(move || store.snapshot())
            },
            drain: {
                let drained = drained.clone();
                Arc::new(move || drained.store(true, Ordering::SeqCst))
            },
            shutdown_admin: {
                let start_time = start_time.clone();
                Arc::new(move || start_time.load(Ordering::SeqCst))
            },
            terminate: {
                let terminated = terminated.clone();
                Arc::new(move || terminated.store(true, Ordering::SeqCst))
            },
        };
        parent.initialize(callbacks);

        let child = HotRestartingChild::new(id, 1).unwrap();
        let snapshot = child.get_parent_stats().unwrap().unwrap();
        assert_eq!(snapshot.counters["listener.accepts"], 3);

        child.drain_parent_listeners().unwrap();
        assert!(drained.load(Ordering::SeqCst));

        assert_eq!(child.send_parent_admin_shutdown_request().unwrap(), Some(777));

        child.send_parent_terminate_request().unwrap();
        assert!(terminated.load(Ordering::SeqCst));
        parent.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let id = base_id(2);
        let mut parent = HotRestartingParent::new(id, 0).unwrap();
        parent.initialize(noop_callbacks());
        parent.shutdown();
        parent.shutdown();
    }
}
