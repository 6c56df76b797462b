use std::{
    convert::Infallible,
    io,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use clap::Parser;
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::StreamExt;
use holdfast_core::{
    config::Config,
    init,
    listener::{DefaultFilterChainBuilder, ListenerManager},
    net::ListenAddress,
    orchestrator::{Accepted, ServiceCommand, WorkerManager},
    restart::{HotRestart, ParentCallbacks},
    stats::StatsStore,
};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use service_async::{AsyncMakeService, MakeService, Service};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

/// Exit code telling the supervisor to back off and retry with the same
/// epoch (a previous generation was still initializing).
const EXIT_RETRYABLE: i32 = 75;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: String,
    /// Base id shared by every generation of this proxy on the host
    #[clap(long, default_value_t = 0)]
    base_id: u64,
    /// Hot restart epoch of this process generation
    #[clap(long, default_value_t = 0)]
    restart_epoch: u64,
    /// Seconds after take-over before the previous generation is asked to
    /// exit
    #[clap(long, default_value_t = 10)]
    parent_shutdown_time_s: u64,
}

/// Events funneled from the hot-restart serving thread (and timers) into the
/// control loop.
enum ControlEvent {
    /// A successor generation confirmed its listeners are up.
    DrainRequested,
    /// A successor generation is taking over entirely.
    TerminateRequested,
    /// Our grace period for the previous generation elapsed.
    ParentTeardownDue,
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
    let args = Args::parse();

    let mut hot_restart = match HotRestart::new(args.base_id, args.restart_epoch) {
        Ok(hot_restart) => hot_restart,
        Err(e) if e.is_retryable() => {
            error!("{e}; exiting for a supervised retry");
            std::process::exit(EXIT_RETRYABLE);
        }
        Err(e) => return Err(e.into()),
    };
    info!(
        "starting generation {} (hot restart version {})",
        args.restart_epoch,
        HotRestart::version()
    );

    let config = Config::load(&args.config).await?;
    let stats = Arc::new(StatsStore::new());
    let from_parent = hot_restart.merge_parent_stats_if_any(&stats)?;
    if from_parent.parent_connections > 0 {
        info!(
            "previous generation still serving {} connections",
            from_parent.parent_connections
        );
    }

    // Start workers
    let mut worker_manager = WorkerManager::<EchoFactory>::new(config.runtime.clone());
    let join_handles = worker_manager.spawn_workers();
    info!("{} workers started", join_handles.len());

    // Construct listeners, reusing the previous generation's sockets where
    // it still holds them.
    let global_init = init::Manager::new("server-global-init");
    let listener_manager = ListenerManager::new(global_init.clone(), config.runtime.worker_threads);
    for (name, listener_config) in &config.listeners {
        let (address, _) = ListenAddress::from_config(&listener_config.address);
        let inherited = hot_restart.duplicate_parent_listen_socket(&address.to_string())?;
        if inherited.is_some() {
            info!("listener {name}: adopted socket from previous generation");
        }
        match listener_manager.add_or_update_listener(
            name,
            listener_config,
            false,
            &DefaultFilterChainBuilder,
            inherited,
        ) {
            Ok(_) => {}
            Err(e) => {
                // Reject this listener only; the rest of the config stands.
                error!("{e}");
                stats.inc_counter("listener_manager.listener_create_failure", 1);
            }
        }
    }

    // Broadcast accept loops to the worker fleet.
    for (name, _) in listener_manager.listener_addresses() {
        let Some(listener) = listener_manager.active_listener(&name) else {
            continue;
        };
        let cmd = ServiceCommand::Start(
            Arc::new(name.clone()),
            EchoFactory::default(),
            listener.socket_factory(),
        );
        if let Err(e) = worker_manager.dispatch_service_command(cmd).await.err() {
            error!("deploying listener {name} to workers failed: {e}");
            listener_manager.remove_listener(&name);
        }
    }
    listener_manager.start_workers();

    // Wait until every listener of this generation warmed up.
    let (init_tx, init_rx) = futures_channel::oneshot::channel::<()>();
    global_init.initialize(init::Watcher::new("server-global-watcher", move || {
        let _ = init_tx.send(());
    }));
    let _ = init_rx.await;
    info!("all listeners warmed");

    // Confirmed up: the previous generation can stop accepting, and any
    // generation after us may begin initializing.
    hot_restart.drain_parent_listeners()?;

    // The previous generation sheds its admin endpoint so ours could bind,
    // and hands back its original start time for continuous uptime reporting.
    let original_start_time = match hot_restart.send_parent_admin_shutdown_request()? {
        Some(parent_start_time) => parent_start_time,
        None => SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs(),
    };

    // Become a potential parent for the next generation.
    for (address, fd) in listener_manager.sockets_for_handoff() {
        hot_restart.register_parent_socket(address, fd);
    }
    let (event_tx, mut event_rx) = unbounded::<ControlEvent>();
    hot_restart.initialize(ParentCallbacks {
        stats: {
            let stats = stats.clone();
            Arc::new(move || stats.snapshot())
        },
        drain: event_sender(&event_tx, || ControlEvent::DrainRequested),
        shutdown_admin: Arc::new(move || original_start_time),
        terminate: event_sender(&event_tx, || ControlEvent::TerminateRequested),
    });

    if args.restart_epoch > 0 {
        let event_tx = event_tx.clone();
        let grace = Duration::from_secs(args.parent_shutdown_time_s);
        monoio::spawn(async move {
            monoio::time::sleep(grace).await;
            let _ = event_tx.unbounded_send(ControlEvent::ParentTeardownDue);
        });
    }

    // Control loop: everything that mutates listener state runs here, on the
    // main thread.
    while let Some(event) = event_rx.next().await {
        match event {
            ControlEvent::ParentTeardownDue => {
                hot_restart.send_parent_terminate_request()?;
                info!("previous generation asked to terminate");
            }
            ControlEvent::DrainRequested => {
                for name in listener_manager.drain_listeners() {
                    let results = worker_manager
                        .dispatch_service_command(ServiceCommand::Drain(Arc::new(name.clone())))
                        .await;
                    if let Err(e) = results.err() {
                        warn!("draining listener {name} on workers failed: {e}");
                    }
                }
            }
            ControlEvent::TerminateRequested => {
                info!("successor generation took over; exiting");
                break;
            }
        }
    }

    hot_restart.shutdown();
    drop(worker_manager);
    join_handles.into_iter().for_each(|(handle, _stop)| {
        let _ = handle.join();
    });
    Ok(())
}

fn event_sender(
    tx: &UnboundedSender<ControlEvent>,
    event: impl Fn() -> ControlEvent + Send + Sync + 'static,
) -> Arc<dyn Fn() + Send + Sync> {
    let tx = tx.clone();
    Arc::new(move || {
        let _ = tx.unbounded_send(event());
    })
}

/// Placeholder connection service deployed behind every filter chain while
/// the protocol services live out of tree.
#[derive(Debug, Clone)]
struct EchoFactory {
    buffer_size: usize,
}

impl Default for EchoFactory {
    fn default() -> Self {
        Self { buffer_size: 4096 }
    }
}

struct EchoService {
    buffer_size: usize,
}

impl Service<Accepted> for EchoService {
    type Response = ();
    type Error = io::Error;

    async fn call(&self, (mut stream, addr): Accepted) -> Result<Self::Response, Self::Error> {
        tracing::debug!("accepted connection from {addr:?}");
        let mut buffer = Vec::with_capacity(self.buffer_size);
        loop {
            let (mut r, buf) = stream.read(buffer).await;
            if r? == 0 {
                break;
            }
            (r, buffer) = stream.write_all(buf).await;
            r?;
        }
        Ok(())
    }
}

impl MakeService for EchoFactory {
    type Service = EchoService;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(EchoService {
            buffer_size: self.buffer_size,
        })
    }
}

impl AsyncMakeService for EchoFactory {
    type Service = EchoService;
    type Error = Infallible;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(EchoService {
            buffer_size: self.buffer_size,
        })
    }
}
