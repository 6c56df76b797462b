//! Per-listener lifecycle: validation, filter-chain construction, warm-up.
//!
//! A [`Listener`] is immutable once built; a config change constructs a new
//! instance and the old one drains, it is never mutated in place.

use std::{cell::Cell, os::fd::OwnedFd, rc::Rc, sync::Arc, time::SystemTime};

use tracing::{debug, warn};

use crate::{
    config::{FilterChainConfig, FilterChainMatch, ListenerConfig},
    init,
    net::{ListenAddress, ListenSocketFactory, SocketOption, SocketType},
    ConfigError,
};

pub mod filters;
mod manager;

pub use filters::ListenerFilterFactory;
pub use manager::ListenerManager;

/// A single materialized filter chain. The per-connection filter objects are
/// instantiated on the accept path; the lifecycle core carries the selection
/// criteria and the component names.
#[derive(Debug, Clone)]
pub struct FilterChain {
    pub matcher: FilterChainMatch,
    pub transport_socket: Option<String>,
    pub filters: Vec<String>,
}

/// Immutable set of filter chains for one listener. Selection against a
/// match context happens elsewhere; no locking is needed at accept time.
#[derive(Debug, Default)]
pub struct FilterChainSet {
    chains: Vec<FilterChain>,
}

impl FilterChainSet {
    pub fn new(chains: Vec<FilterChain>) -> Self {
        Self { chains }
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn chains(&self) -> &[FilterChain] {
        &self.chains
    }
}

/// Builds the filter-chain set for a listener. Chain-local dependencies
/// (e.g. certificate providers) may register their own targets with the
/// passed per-listener init manager.
pub trait FilterChainBuilder {
    fn build_filter_chains(
        &self,
        chains: &[FilterChainConfig],
        init_manager: &init::Manager,
    ) -> Result<FilterChainSet, ConfigError>;
}

/// Materializes chains straight from the configuration without registering
/// any chain-local dependency.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFilterChainBuilder;

impl FilterChainBuilder for DefaultFilterChainBuilder {
    fn build_filter_chains(
        &self,
        chains: &[FilterChainConfig],
        _init_manager: &init::Manager,
    ) -> Result<FilterChainSet, ConfigError> {
        Ok(FilterChainSet::new(
            chains
                .iter()
                .map(|c| FilterChain {
                    matcher: c.filter_chain_match.clone(),
                    transport_socket: c.transport_socket.as_ref().map(|t| t.name.clone()),
                    filters: c.filters.iter().map(|f| f.name.clone()).collect(),
                })
                .collect(),
        ))
    }
}

/// Everything the owning manager injects into a listener at construction.
pub struct ListenerContext {
    pub workers_started: bool,
    pub concurrency: usize,
    pub global_init: init::Manager,
    pub on_warmed: Rc<dyn Fn(&str)>,
    pub inherited_socket: Option<OwnedFd>,
    pub tag: u64,
    pub added_via_api: bool,
}

pub struct Listener {
    name: String,
    hash: String,
    tag: u64,
    address: ListenAddress,
    socket_type: SocketType,
    socket_factory: Arc<ListenSocketFactory>,
    listener_filters: Vec<ListenerFilterFactory>,
    filter_chains: FilterChainSet,
    local_init_manager: init::Manager,
    /// Present iff the listener registered with the global init tracker
    /// (workers had not started when it was built).
    init_target: Option<init::Target>,
    added_via_api: bool,
    workers_started: bool,
    on_warmed: Rc<dyn Fn(&str)>,
    last_updated: Cell<Option<SystemTime>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .field("tag", &self.tag)
            .field("address", &self.address)
            .field("socket_type", &self.socket_type)
            .field("added_via_api", &self.added_via_api)
            .field("workers_started", &self.workers_started)
            .field("last_updated", &self.last_updated)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Validate the configuration and build the listener. Any error rejects
    /// this listener only; nothing shared has been touched yet when one is
    /// returned.
    pub fn new(
        name: String,
        config: &ListenerConfig,
        ctx: ListenerContext,
        builder: &dyn FilterChainBuilder,
    ) -> Result<Listener, ConfigError> {
        let (address, socket_type) = ListenAddress::from_config(&config.address);
        let hash = config.hash();

        let v6 = matches!(
            address,
            ListenAddress::Ip(std::net::SocketAddr::V6(_))
        );
        let mut options = Vec::new();
        if config.transparent {
            options.push(SocketOption::transparent(v6));
        }
        if config.freebind {
            options.push(SocketOption::freebind(v6));
        }
        for literal in &config.socket_options {
            options.push(SocketOption::literal(literal));
        }
        if socket_type == SocketType::Datagram {
            if !config.reuse_port && ctx.concurrency > 1 {
                warn!(
                    "listening on UDP without the reuse_port option may result in unstable \
                     packet proxying; consider configuring it for listener {name}"
                );
            }
            // Needed for recvmsg to return the destination address and the
            // receive-queue overflow indicator.
            options.push(SocketOption::ip_packet_info(v6));
            options.push(SocketOption::rx_queue_overflow());
        } else if let Some(queue_length) = config.tcp_fast_open_queue_length {
            options.push(SocketOption::tcp_fast_open(queue_length));
        }

        let mut listener_filters = Vec::with_capacity(config.listener_filters.len());
        if socket_type == SocketType::Datagram && config.listener_filters.len() > 1 {
            return Err(ConfigError::listener(
                &address,
                "only 1 UDP listener filter per listener supported",
            ));
        }
        for filter in &config.listener_filters {
            listener_filters.push(filters::resolve(&filter.name)?);
        }

        let connectionless = socket_type == SocketType::Datagram
            && config.udp.mode.is_transport_connectionless();

        if config.filter_chains.is_empty()
            && (socket_type == SocketType::Stream
                || (socket_type == SocketType::Datagram && !connectionless))
        {
            return Err(ConfigError::listener(
                &address,
                "no filter chains specified",
            ));
        }
        if socket_type == SocketType::Datagram && !connectionless {
            // Early fail before any socket exists.
            for chain in &config.filter_chains {
                if chain.transport_socket.is_none() {
                    return Err(ConfigError::listener(
                        &address,
                        "no transport socket specified for connection oriented UDP listener",
                    ));
                }
            }
        }

        if socket_type == SocketType::Stream {
            if config.use_original_dst {
                listener_filters.push(filters::resolve(filters::name::ORIGINAL_DST)?);
            }
            let need_tls_inspector = config
                .filter_chains
                .iter()
                .any(|c| c.filter_chain_match.requires_tls_inspection())
                && !config
                    .listener_filters
                    .iter()
                    .any(|f| filters::is_tls_inspector(&f.name));
            if need_tls_inspector {
                warn!(
                    "adding listener '{address}': filter chain match rules require the TLS \
                     inspection listener filter, but it isn't configured, injecting it"
                );
                listener_filters.push(filters::resolve(filters::name::TLS_INSPECTOR)?);
            }
            // Proxy protocol must stay the last listener filter added: the
            // filters behind it assume the connection has already been
            // unwrapped.
            if config.use_proxy_proto {
                listener_filters.push(filters::resolve(filters::name::PROXY_PROTOCOL)?);
            }
        }

        let local_init_manager =
            init::Manager::new(format!("listener-local-init-manager {name} {hash}"));
        let filter_chains =
            builder.build_filter_chains(&config.filter_chains, &local_init_manager)?;

        let socket_factory = Arc::new(ListenSocketFactory::new(
            address,
            socket_type,
            options,
            config.bind_to_port,
            name.clone(),
            config.reuse_port,
            ctx.inherited_socket,
        )?);
        let address = socket_factory.local_address().clone();

        // Readiness is wired exactly one of two ways, decided here and never
        // revisited: before workers start, warm-up reports through a target
        // on the global init tracker; afterwards it notifies the owning
        // manager directly.
        let init_target = if !ctx.workers_started {
            let local = local_init_manager.clone();
            let listener_name = name.clone();
            let target = init::Target::new(
                format!("listener-init-target {name}"),
                move |target| {
                    local.initialize(init::Watcher::new(
                        format!("listener-local-init-watcher {listener_name}"),
                        move || target.ready(),
                    ));
                },
            );
            ctx.global_init.add(&target);
            Some(target)
        } else {
            None
        };

        Ok(Listener {
            name,
            hash,
            tag: ctx.tag,
            address,
            socket_type,
            socket_factory,
            listener_filters,
            filter_chains,
            local_init_manager,
            init_target,
            added_via_api: ctx.added_via_api,
            workers_started: ctx.workers_started,
            on_warmed: ctx.on_warmed,
            last_updated: Cell::new(None),
        })
    }

    /// Start warm-up. When workers are already serving traffic the local
    /// tracker reports straight to the owning manager; otherwise the global
    /// init tracker drives this listener through its target.
    pub fn initialize(&self) {
        self.last_updated.set(Some(SystemTime::now()));
        if self.workers_started {
            debug!("initialize listener {} local init manager", self.name);
            let on_warmed = self.on_warmed.clone();
            let listener_name = self.name.clone();
            self.local_init_manager.initialize(init::Watcher::new(
                format!("listener-local-init-watcher {}", self.name),
                move || on_warmed(&listener_name),
            ));
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Resolved bind address (reflects the real port for port-0 requests).
    pub fn address(&self) -> &ListenAddress {
        &self.address
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn socket_factory(&self) -> Arc<ListenSocketFactory> {
        self.socket_factory.clone()
    }

    pub fn filter_chains(&self) -> &FilterChainSet {
        &self.filter_chains
    }

    pub fn listener_filter_names(&self) -> Vec<&'static str> {
        self.listener_filters.iter().map(|f| f.name()).collect()
    }

    pub fn local_init_manager(&self) -> &init::Manager {
        &self.local_init_manager
    }

    pub fn added_via_api(&self) -> bool {
        self.added_via_api
    }

    pub fn last_updated(&self) -> Option<SystemTime> {
        self.last_updated.get()
    }

    pub fn debug_log(&self, message: &str) {
        debug!(
            "{message}: name={}, hash={}, address={}",
            self.name, self.hash, self.address
        );
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(target) = &self.init_target {
            // A listener removed mid-warm-up must not wedge the global
            // tracker; force its target ready (no-op if it already fired).
            target.ready();
        }
    }
}
