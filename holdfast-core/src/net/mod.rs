use std::{fmt, net::SocketAddr, path::PathBuf};

use derive_more::From;

use crate::config::{ListenerAddressConfig, TransportProtocol};

mod factory;
mod socket;

pub use factory::ListenSocketFactory;
pub use socket::{ListenSocket, SocketOption, SocketOptionState};

/// Address a listener binds to: an IP socket address or a filesystem path.
///
/// The display form doubles as the lookup key when asking a previous process
/// generation to duplicate its listen socket, so it must stay stable across
/// releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, From)]
pub enum ListenAddress {
    Ip(SocketAddr),
    Pipe(PathBuf),
}

impl ListenAddress {
    pub fn port(&self) -> Option<u16> {
        match self {
            ListenAddress::Ip(addr) => Some(addr.port()),
            ListenAddress::Pipe(_) => None,
        }
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self, ListenAddress::Pipe(_))
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            ListenAddress::Ip(addr) => Some(*addr),
            ListenAddress::Pipe(_) => None,
        }
    }

    /// Split a configured address into the bind address and the socket type.
    pub fn from_config(config: &ListenerAddressConfig) -> (Self, SocketType) {
        match config {
            ListenerAddressConfig::SocketAddress(sa) => (
                ListenAddress::Ip(sa.socket_addr),
                SocketType::from(sa.transport_protocol),
            ),
            ListenerAddressConfig::Uds(uds) => (
                ListenAddress::Pipe(uds.uds_path.clone()),
                SocketType::from(uds.transport_protocol),
            ),
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Ip(addr) => write!(f, "{addr}"),
            ListenAddress::Pipe(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

impl From<TransportProtocol> for SocketType {
    fn from(value: TransportProtocol) -> Self {
        match value {
            TransportProtocol::Tcp => SocketType::Stream,
            TransportProtocol::Udp => SocketType::Datagram,
        }
    }
}
