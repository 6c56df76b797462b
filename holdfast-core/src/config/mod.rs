use std::{
    collections::HashMap,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::util::sha256;

// MAX configuration file size: 16 MB
const MAX_CONFIG_FILE_SIZE: usize = 16 * 1024 * 1024;
// Read buffer size: 8 KB
const READ_BUFFER_SIZE: usize = 8 * 1024;
// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

pub const MIN_SQPOLL_IDLE_TIME: u32 = 1000; // 1s idle time.
pub const FALLBACK_PARALLELISM: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(1) };

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub listeners: HashMap<String, ListenerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub worker_threads: usize,
    #[serde(default = "default_entries")]
    pub entries: u32,
    pub sqpoll_idle: Option<u32>,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
    pub thread_pool: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_workers(),
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
            thread_pool: None,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .unwrap_or(FALLBACK_PARALLELISM)
        .into()
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_cpu_affinity, true, bool);
define_const!(default_true, true, bool);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

/// One listener as materialized from the config source.
///
/// The listener manager treats each entry atomically: a validation failure
/// rejects this listener only and leaves the rest of the generation intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub address: ListenerAddressConfig,
    #[serde(default = "default_true")]
    pub bind_to_port: bool,
    #[serde(default)]
    pub reuse_port: bool,
    #[serde(default)]
    pub transparent: bool,
    #[serde(default)]
    pub freebind: bool,
    pub tcp_fast_open_queue_length: Option<u32>,
    #[serde(default)]
    pub socket_options: Vec<LiteralSocketOption>,
    #[serde(default)]
    pub listener_filters: Vec<ListenerFilterConfig>,
    #[serde(default)]
    pub filter_chains: Vec<FilterChainConfig>,
    #[serde(default)]
    pub udp: UdpListenerConfig,
    /// Deprecated; injects the original-destination listener filter.
    #[serde(default)]
    pub use_original_dst: bool,
    /// Deprecated; injects the proxy-protocol listener filter.
    #[serde(default)]
    pub use_proxy_proto: bool,
}

impl ListenerConfig {
    /// Stable hash of the materialized configuration, used for warm-swap
    /// detection across config reloads: same name + same hash means nothing
    /// to do.
    pub fn hash(&self) -> String {
        let serialized = serde_json::to_string(self).expect("listener config is serializable");
        sha256(&serialized)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ListenerAddressConfig {
    SocketAddress(SocketAddress),
    Uds(Uds),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SocketAddress {
    pub socket_addr: std::net::SocketAddr,
    #[serde(default)]
    pub transport_protocol: TransportProtocol,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Uds {
    pub uds_path: PathBuf,
    #[serde(default)]
    pub transport_protocol: TransportProtocol,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Udp,
}

/// Datagram listener flavor. `Raw` listeners hand each packet off without
/// per-peer state; `Connected` listeners pin a session per peer and therefore
/// require a transport socket on every filter chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UdpListenerConfig {
    #[serde(default)]
    pub mode: UdpMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UdpMode {
    #[default]
    Raw,
    Connected,
}

impl UdpMode {
    pub fn is_transport_connectionless(&self) -> bool {
        matches!(self, Self::Raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenerFilterConfig {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FilterChainConfig {
    #[serde(default)]
    pub filter_chain_match: FilterChainMatch,
    pub transport_socket: Option<TransportSocketConfig>,
    #[serde(default)]
    pub filters: Vec<NetworkFilterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FilterChainMatch {
    #[serde(default)]
    pub transport_protocol: String,
    #[serde(default)]
    pub server_names: Vec<String>,
    #[serde(default)]
    pub application_protocols: Vec<String>,
}

impl FilterChainMatch {
    /// Whether selecting this chain requires a transport-protocol/SNI/ALPN
    /// decision on the accepted connection.
    pub fn requires_tls_inspection(&self) -> bool {
        self.transport_protocol == "tls"
            || (self.transport_protocol.is_empty()
                && (!self.server_names.is_empty() || !self.application_protocols.is_empty()))
    }
}

/// Opaque to the core; consumed by the filter chain builder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportSocketConfig {
    pub name: String,
}

/// Opaque to the core; consumed by the filter chain builder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkFilterConfig {
    pub name: String,
}

/// A raw `setsockopt` triple from the config source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiteralSocketOption {
    pub level: i32,
    pub name: i32,
    pub int_value: i64,
    #[serde(default)]
    pub state: SocketOptionStateConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SocketOptionStateConfig {
    #[default]
    Bound,
    Listening,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::from_slice(&Self::read_file(path).await?)
    }

    pub fn from_slice(content: &[u8]) -> anyhow::Result<Self> {
        // read first non-space u8
        let is_json = match content
            .iter()
            .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
        {
            Some(first) => *first == b'{',
            None => false,
        };
        match is_json {
            true => serde_json::from_slice::<Self>(content).map_err(Into::into),
            false => toml::from_str::<Self>(&String::from_utf8_lossy(content)).map_err(Into::into),
        }
    }

    async fn read_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        let file = match monoio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) => bail!("Config: error open file: {:?}", e),
        };

        let mut data = Vec::new();
        let mut buffer = Vec::with_capacity(READ_BUFFER_SIZE);

        loop {
            let (res, buf) = file.read_at(buffer, data.len() as u64).await;
            let n = res?;
            buffer = buf;
            if n == 0 {
                break;
            }

            if data.len() + n > MAX_CONFIG_FILE_SIZE {
                bail!("Config: max file size: {}", MAX_CONFIG_FILE_SIZE);
            }
            data.extend_from_slice(&buffer);
        }

        Ok(data)
    }
}
