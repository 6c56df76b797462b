//! Wire envelope of the hot-restart control-channel RPC.
//!
//! One serialized message per datagram; a duplicated listen socket travels
//! as ancillary data next to its reply rather than in the body.

use std::io;

use serde::{Deserialize, Serialize};

use crate::stats::StatsSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HotRestartMessage {
    Request(Request),
    Reply(Reply),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Ask the previous generation to pass the fd of its listen socket bound
    /// to `address` (display form of the listen address).
    DuplicateListenSocket { address: String },
    GetStats,
    DrainListeners,
    ShutdownAdmin,
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// `found == false` is the valid "no such socket" answer, not an error.
    DuplicatedListenSocket { found: bool },
    Stats(StatsSnapshot),
    DrainedListeners,
    /// Carries the parent's original start time so uptime stays continuous
    /// across the restart.
    ShutdownAdmin { original_start_time: u64 },
    Terminated,
}

impl HotRestartMessage {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_reply_round_trip() {
        let request = HotRestartMessage::Request(Request::DuplicateListenSocket {
            address: "127.0.0.1:8080".to_string(),
        });
        let decoded = HotRestartMessage::decode(&request.encode().unwrap()).unwrap();
        assert!(matches!(
            decoded,
            HotRestartMessage::Request(Request::DuplicateListenSocket { address }) if address == "127.0.0.1:8080"
        ));

        let reply = HotRestartMessage::Reply(Reply::ShutdownAdmin {
            original_start_time: 1234,
        });
        let decoded = HotRestartMessage::decode(&reply.encode().unwrap()).unwrap();
        assert!(matches!(
            decoded,
            HotRestartMessage::Reply(Reply::ShutdownAdmin { original_start_time: 1234 })
        ));
    }
}
