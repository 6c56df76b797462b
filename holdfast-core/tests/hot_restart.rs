//! Cross-generation hand-off: three process generations (simulated in one
//! process) chain the same listen socket through two hot restarts with no
//! observable bind gap.

use std::{
    ffi::CString,
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use holdfast_core::{
    config::Config,
    init,
    listener::{DefaultFilterChainBuilder, ListenerManager},
    net::{ListenAddress, ListenSocket, SocketType},
    restart::{HotRestart, ParentCallbacks, SharedMemoryRegion},
    stats::{StatsSnapshot, StatsStore},
};

fn callbacks(stats: Arc<StatsStore>, drained: Arc<AtomicBool>) -> ParentCallbacks {
    ParentCallbacks {
        stats: Arc::new(move || stats.snapshot()),
        drain: {
            let drained = drained.clone();
            Arc::new(move || drained.store(true, Ordering::SeqCst))
        },
        shutdown_admin: Arc::new(|| 42),
        terminate: Arc::new(|| {}),
    }
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
fn listen_sockets_survive_two_hot_restarts() {
    let base_id = 5_000_000 + std::process::id() as u64;

    // Generation 0: cold start. No parent anywhere; binds the listener.
    let mut gen0 = HotRestart::new(base_id, 0).unwrap();
    assert!(gen0
        .duplicate_parent_listen_socket("127.0.0.1:80")
        .unwrap()
        .is_none());
    let socket0 = ListenSocket::bind(
        &ListenAddress::Ip("127.0.0.1:0".parse().unwrap()),
        SocketType::Stream,
        false,
        true,
    )
    .unwrap();
    socket0.listen().unwrap();
    let address = socket0.local_address().clone();

    gen0.drain_parent_listeners().unwrap();
    gen0.register_parent_socket(address.to_string(), socket0.duplicate().unwrap());
    let gen0_stats = Arc::new(StatsStore::new());
    gen0_stats.inc_counter("listener.accepts", 10);
    let gen0_drained = Arc::new(AtomicBool::new(false));
    gen0.initialize(callbacks(gen0_stats, gen0_drained.clone()));

    // Generation 1: duplicates the socket instead of re-binding, folds the
    // old generation's stats in, then asks it to drain.
    let mut gen1 = HotRestart::new(base_id, 1).unwrap();
    let fd1 = gen1
        .duplicate_parent_listen_socket(&address.to_string())
        .unwrap()
        .expect("generation 0 owns the address");
    let socket1 = ListenSocket::from_duplicated_fd(fd1, address.clone(), SocketType::Stream).unwrap();
    assert_eq!(socket1.local_address(), &address);

    let gen1_stats = StatsStore::new();
    gen1.merge_parent_stats_if_any(&gen1_stats).unwrap();
    assert_eq!(gen1_stats.counter("listener.accepts"), 10);

    gen1.drain_parent_listeners().unwrap();
    assert!(gen0_drained.load(Ordering::SeqCst));
    assert_eq!(gen1.send_parent_admin_shutdown_request().unwrap(), Some(42));

    gen1.register_parent_socket(address.to_string(), socket1.duplicate().unwrap());
    gen1.initialize(noop_callbacks());
    gen1.send_parent_terminate_request().unwrap();

    // Generation 0 exits; its descriptors close.
    gen0.shutdown();
    drop(gen0);
    drop(socket0);

    // Generation 2: chains the duplication one step further.
    let mut gen2 = HotRestart::new(base_id, 2).unwrap();
    let fd2 = gen2
        .duplicate_parent_listen_socket(&address.to_string())
        .unwrap()
        .expect("generation 1 owns the address");
    let socket2 = ListenSocket::from_duplicated_fd(fd2, address.clone(), SocketType::Stream).unwrap();
    gen2.drain_parent_listeners().unwrap();

    // Generation 1 exits too; only generation 2 keeps the socket alive.
    gen1.shutdown();
    drop(gen1);
    drop(socket1);

    // The address generation 0 originally bound still accepts connections
    // through generation 2's descriptor.
    let client = TcpStream::connect(address.socket_addr().unwrap()).unwrap();
    let listener = socket2.to_std_tcp_listener().unwrap();
    listener.set_nonblocking(false).unwrap();
    let (_conn, peer) = listener.accept().unwrap();
    assert_eq!(peer, client.local_addr().unwrap());

    gen2.shutdown();
    let name = CString::new(SharedMemoryRegion::shmem_name(base_id)).unwrap();
    unsafe { libc::shm_unlink(name.as_ptr()) };
}

fn listener_config(addr: &str) -> holdfast_core::config::ListenerConfig {
    let raw = format!(
        r#"{{ "listeners": {{ "web": {{
            "address": {{"socket_addr": "{addr}"}},
            "filter_chains": [{{ "filters": [{{"name": "tcp_proxy"}}] }}]
        }} }} }}"#
    );
    Config::from_slice(raw.as_bytes()).unwrap().listeners["web"].clone()
}

#[test]
fn listener_manager_adopts_the_parent_generation_socket() {
    let base_id = 6_000_000 + std::process::id() as u64;

    // Generation 0 builds its listener from scratch.
    let mut gen0 = HotRestart::new(base_id, 0).unwrap();
    let gen0_manager = ListenerManager::new(init::Manager::new("gen0-init"), 1);
    gen0_manager
        .add_or_update_listener(
            "web",
            &listener_config("127.0.0.1:0"),
            false,
            &DefaultFilterChainBuilder,
            None,
        )
        .unwrap();
    let (_, address) = gen0_manager.listener_addresses().pop().unwrap();
    assert_ne!(address.port(), Some(0));

    gen0.drain_parent_listeners().unwrap();
    for (key, fd) in gen0_manager.sockets_for_handoff() {
        gen0.register_parent_socket(key, fd);
    }
    gen0.initialize(ParentCallbacks {
        stats: Arc::new(StatsSnapshot::default),
        drain: Arc::new(|| {}),
        shutdown_admin: Arc::new(|| 0),
        terminate: Arc::new(|| {}),
    });

    // Generation 1 asks for the socket by address instead of re-binding.
    let gen1 = HotRestart::new(base_id, 1).unwrap();
    let inherited = gen1
        .duplicate_parent_listen_socket(&address.to_string())
        .unwrap()
        .expect("generation 0 registered the listener socket");

    let gen1_manager = ListenerManager::new(init::Manager::new("gen1-init"), 1);
    gen1_manager
        .add_or_update_listener(
            "web",
            &listener_config(&address.to_string()),
            false,
            &DefaultFilterChainBuilder,
            Some(inherited),
        )
        .unwrap();
    let (_, gen1_address) = gen1_manager.listener_addresses().pop().unwrap();
    assert_eq!(gen1_address, address);
    gen1.drain_parent_listeners().unwrap();

    // Generation 0 exits; the socket stays bound through generation 1.
    gen0.shutdown();
    drop(gen0);
    drop(gen0_manager);

    let gen1_listener = gen1_manager.active_listener("web").unwrap();
    let socket = gen1_listener.socket_factory().get_listen_socket().unwrap();
    socket.listen().unwrap();
    let client = TcpStream::connect(address.socket_addr().unwrap()).unwrap();
    let listener = socket.to_std_tcp_listener().unwrap();
    listener.set_nonblocking(false).unwrap();
    let (_conn, peer) = listener.accept().unwrap();
    assert_eq!(peer, client.local_addr().unwrap());

    let name = CString::new(SharedMemoryRegion::shmem_name(base_id)).unwrap();
    unsafe { libc::shm_unlink(name.as_ptr()) };
}
