use std::{io, net::SocketAddr, sync::Arc};

use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{stream::Stream, AsyncReadRent, AsyncWriteRent, Split},
    net::{TcpListener, TcpStream},
    BufResult,
};

use crate::net::{ListenAddress, ListenSocket, ListenSocketFactory, SocketOptionState, SocketType};

/// What one worker serves for one listener.
///
/// Stream sockets become accept sources on this worker's runtime. Datagram
/// sockets are held open so the kernel keeps delivering to them; packet
/// processing is owned by the datagram path, not the accept loop.
pub enum WorkerListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(monoio::net::UnixListener),
    Datagram(Arc<ListenSocket>),
}

impl WorkerListener {
    /// Acquire this worker's socket from the listener's shared factory and
    /// start it: stream sockets listen and get their listening-state options
    /// applied here, on the worker that will accept from them.
    pub fn build(factory: &ListenSocketFactory) -> Result<WorkerListener, crate::ConfigError> {
        let socket = factory.get_listen_socket()?;
        if socket.socket_type() == SocketType::Datagram {
            socket.apply_options(SocketOptionState::Listening)?;
            return Ok(WorkerListener::Datagram(socket));
        }

        socket.listen()?;
        socket.apply_options(SocketOptionState::Listening)?;
        match socket.local_address() {
            ListenAddress::Ip(_) => {
                let std_listener = socket.to_std_tcp_listener()?;
                Ok(WorkerListener::Tcp(TcpListener::from_std(std_listener)?))
            }
            ListenAddress::Pipe(_) => {
                let std_listener = socket.to_std_unix_listener()?;
                Ok(WorkerListener::Unix(monoio::net::UnixListener::from_std(
                    std_listener,
                )?))
            }
        }
    }
}

pub type Accepted = (AcceptedStream, AcceptedAddr);

impl Stream for WorkerListener {
    type Item = io::Result<Accepted>;

    async fn next(&mut self) -> Option<Self::Item> {
        match self {
            WorkerListener::Tcp(l) => match l.next().await {
                Some(Ok(accepted)) => Some(Ok((
                    AcceptedStream::Tcp(accepted.0),
                    AcceptedAddr::Tcp(accepted.1),
                ))),
                Some(Err(e)) => Some(Err(e)),
                None => None,
            },
            #[cfg(unix)]
            WorkerListener::Unix(l) => match l.next().await {
                Some(Ok(accepted)) => Some(Ok((
                    AcceptedStream::Unix(accepted.0),
                    AcceptedAddr::Unix(accepted.1),
                ))),
                Some(Err(e)) => Some(Err(e)),
                None => None,
            },
            // The socket only has to stay open and receiving here.
            WorkerListener::Datagram(_) => std::future::pending().await,
        }
    }
}

pub enum AcceptedStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(monoio::net::UnixStream),
}

unsafe impl Split for AcceptedStream {}

#[derive(Debug, Clone)]
pub enum AcceptedAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(monoio::net::unix::SocketAddr),
}

impl From<SocketAddr> for AcceptedAddr {
    fn from(value: SocketAddr) -> Self {
        Self::Tcp(value)
    }
}

#[cfg(unix)]
impl From<monoio::net::unix::SocketAddr> for AcceptedAddr {
    fn from(value: monoio::net::unix::SocketAddr) -> Self {
        Self::Unix(value)
    }
}

impl AsyncReadRent for AcceptedStream {
    async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            AcceptedStream::Tcp(inner) => inner.read(buf).await,
            AcceptedStream::Unix(inner) => inner.read(buf).await,
        }
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            AcceptedStream::Tcp(inner) => inner.readv(buf).await,
            AcceptedStream::Unix(inner) => inner.readv(buf).await,
        }
    }
}

impl AsyncWriteRent for AcceptedStream {
    #[inline]
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            AcceptedStream::Tcp(inner) => inner.write(buf).await,
            AcceptedStream::Unix(inner) => inner.write(buf).await,
        }
    }

    #[inline]
    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        match self {
            AcceptedStream::Tcp(inner) => inner.writev(buf_vec).await,
            AcceptedStream::Unix(inner) => inner.writev(buf_vec).await,
        }
    }

    #[inline]
    async fn flush(&mut self) -> io::Result<()> {
        match self {
            AcceptedStream::Tcp(inner) => inner.flush().await,
            AcceptedStream::Unix(inner) => inner.flush().await,
        }
    }

    #[inline]
    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            AcceptedStream::Tcp(inner) => inner.shutdown().await,
            AcceptedStream::Unix(inner) => inner.shutdown().await,
        }
    }
}
