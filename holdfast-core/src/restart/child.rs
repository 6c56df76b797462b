//! The child side of the hot-restart protocol: synchronous request/reply
//! RPCs issued by a newly started generation against its predecessor.
//!
//! All calls run on the control thread; one request is in flight at a time.
//! A generation without a predecessor (epoch 0, a peer that is gone, or a
//! peer that never answers within the bounded wait) is the normal cold-start
//! case and surfaces as `None`, never as an error.

use std::{
    io,
    os::fd::OwnedFd,
};

use tracing::debug;

use super::{
    channel::{DomainSocket, Role, DEFAULT_RPC_TIMEOUT},
    message::{HotRestartMessage, Reply, Request},
};
use crate::stats::StatsSnapshot;

pub struct HotRestartingChild {
    /// Absent at epoch 0: there is nobody to talk to.
    socket: Option<DomainSocket>,
    base_id: u64,
    epoch: u64,
}

impl HotRestartingChild {
    pub fn new(base_id: u64, epoch: u64) -> io::Result<Self> {
        let socket = if epoch == 0 {
            None
        } else {
            Some(DomainSocket::bind(base_id, epoch, Role::Child)?)
        };
        Ok(Self {
            socket,
            base_id,
            epoch,
        })
    }

    /// Ask the parent for the fd of its listen socket bound to `address`.
    pub fn duplicate_parent_listen_socket(&self, address: &str) -> io::Result<Option<OwnedFd>> {
        let reply = self.round_trip(Request::DuplicateListenSocket {
            address: address.to_string(),
        })?;
        match reply {
            Some((Reply::DuplicatedListenSocket { found: true }, Some(fd))) => Ok(Some(fd)),
            Some((Reply::DuplicatedListenSocket { .. }, _)) => Ok(None),
            Some((other, _)) => Err(unexpected_reply("DuplicateListenSocket", &other)),
            None => Ok(None),
        }
    }

    pub fn get_parent_stats(&self) -> io::Result<Option<StatsSnapshot>> {
        match self.round_trip(Request::GetStats)? {
            Some((Reply::Stats(snapshot), _)) => Ok(Some(snapshot)),
            Some((other, _)) => Err(unexpected_reply("GetStats", &other)),
            None => Ok(None),
        }
    }

    pub fn drain_parent_listeners(&self) -> io::Result<()> {
        match self.round_trip(Request::DrainListeners)? {
            Some((Reply::DrainedListeners, _)) | None => Ok(()),
            Some((other, _)) => Err(unexpected_reply("DrainListeners", &other)),
        }
    }

    /// Returns the parent's original start time so uptime reporting stays
    /// continuous; `None` when there is no parent.
    pub fn send_parent_admin_shutdown_request(&self) -> io::Result<Option<u64>> {
        match self.round_trip(Request::ShutdownAdmin)? {
            Some((Reply::ShutdownAdmin {
                original_start_time,
            }, _)) => Ok(Some(original_start_time)),
            Some((other, _)) => Err(unexpected_reply("ShutdownAdmin", &other)),
            None => Ok(None),
        }
    }

    pub fn send_parent_terminate_request(&self) -> io::Result<()> {
        match self.round_trip(Request::Terminate)? {
            Some((Reply::Terminated, _)) | None => Ok(()),
            Some((other, _)) => Err(unexpected_reply("Terminate", &other)),
        }
    }

    fn round_trip(&self, request: Request) -> io::Result<Option<(Reply, Option<OwnedFd>)>> {
        let Some(socket) = &self.socket else {
            return Ok(None);
        };
        let message = HotRestartMessage::Request(request);
        match socket.send_to_role(self.base_id, self.epoch - 1, Role::Parent, &message, None) {
            Ok(()) => {}
            Err(e) if absent_peer(&e) => {
                debug!("no parent control socket bound; treating as cold start");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        match socket.recv(Some(DEFAULT_RPC_TIMEOUT))? {
            Some((HotRestartMessage::Reply(reply), fd, _)) => Ok(Some((reply, fd))),
            Some((HotRestartMessage::Request(_), _, _)) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request received on the child control socket",
            )),
            None => {
                debug!("parent did not answer within the bounded wait; treating as absent");
                Ok(None)
            }
        }
    }
}

fn absent_peer(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
    )
}

fn unexpected_reply(request: &str, reply: &Reply) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("mismatched reply to {request}: {reply:?}"),
    )
}
