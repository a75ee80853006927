use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{event, Level};

use super::state::ProtocolRole;

/// Number of segments buffered per direction by the loopback muxer.
pub const MEMORY_MUXER_CAPACITY: usize = 64;

/// One framed chunk of mini-protocol data. A message may span several
/// segments and a segment may carry several messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub protocol_id: u16,
    /// Set when sent by the responder (server) side of the mini-protocol.
    pub is_response: bool,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(protocol_id: u16, is_response: bool, payload: Vec<u8>) -> Self {
        Segment {
            protocol_id,
            is_response,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxerError {
    #[error("protocol {protocol_id} is already registered as {role}")]
    AlreadyRegistered { protocol_id: u16, role: ProtocolRole },
    #[error("muxer is closed")]
    Closed,
}

///
/// The connection-level multiplexer. Mini-protocol instances register once
/// and then exchange segments for their protocol id through the returned
/// channels. The muxer guarantees that segments from concurrent senders are
/// never interleaved and that arrival order per protocol id is preserved.
///
pub trait Muxer: Send + Sync {
    fn register_protocol(
        &self,
        protocol_id: u16,
        role: ProtocolRole,
    ) -> Result<(mpsc::Sender<Segment>, mpsc::Receiver<Segment>), MuxerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Side {
    A,
    B,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

struct Direction {
    sender: mpsc::Sender<Segment>,
    receiver: Option<mpsc::Receiver<Segment>>,
}

impl Direction {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel(MEMORY_MUXER_CAPACITY);
        Direction {
            sender,
            receiver: Some(receiver),
        }
    }
}

// one mini-protocol conversation: the initiator (client) on one side and the
// responder (server) on the other
struct Link {
    to_initiator: Direction,
    to_responder: Direction,
}

///
/// Both ends of an in-process connection. Used by tests and the loopback
/// node to run mini-protocol pairs without a bearer.
///
#[derive(Clone)]
pub struct MemoryMuxer {
    side: Side,
    links: Arc<Mutex<HashMap<(u16, Side), Link>>>,
}

impl MemoryMuxer {
    pub fn pair() -> (MemoryMuxer, MemoryMuxer) {
        let links = Arc::new(Mutex::new(HashMap::new()));
        (
            MemoryMuxer {
                side: Side::A,
                links: links.clone(),
            },
            MemoryMuxer {
                side: Side::B,
                links,
            },
        )
    }
}

impl Muxer for MemoryMuxer {
    fn register_protocol(
        &self,
        protocol_id: u16,
        role: ProtocolRole,
    ) -> Result<(mpsc::Sender<Segment>, mpsc::Receiver<Segment>), MuxerError> {
        let initiator = match role {
            ProtocolRole::Client => self.side,
            ProtocolRole::Server => self.side.other(),
        };
        let mut links = self.links.lock().map_err(|_| MuxerError::Closed)?;
        let link = links.entry((protocol_id, initiator)).or_insert_with(|| Link {
            to_initiator: Direction::new(),
            to_responder: Direction::new(),
        });
        let (outbound, inbound) = match role {
            ProtocolRole::Client => (&link.to_responder, &mut link.to_initiator),
            ProtocolRole::Server => (&link.to_initiator, &mut link.to_responder),
        };
        let receiver = inbound
            .receiver
            .take()
            .ok_or(MuxerError::AlreadyRegistered { protocol_id, role })?;
        event!(
            Level::DEBUG,
            "registered protocol {} as {} on side {:?}",
            protocol_id,
            role,
            self.side
        );
        Ok((outbound.sender.clone(), receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_routes_by_protocol_and_role() {
        let (a, b) = MemoryMuxer::pair();
        let (client_tx, mut client_rx) = a.register_protocol(8, ProtocolRole::Client).unwrap();
        let (server_tx, mut server_rx) = b.register_protocol(8, ProtocolRole::Server).unwrap();

        client_tx.send(Segment::new(8, false, vec![1])).await.unwrap();
        assert_eq!(server_rx.recv().await.unwrap().payload, vec![1]);

        server_tx.send(Segment::new(8, true, vec![2])).await.unwrap();
        assert_eq!(client_rx.recv().await.unwrap().payload, vec![2]);
    }

    #[tokio::test]
    async fn duplex_instances_do_not_share_channels() {
        let (a, b) = MemoryMuxer::pair();
        // a is client and b is server of protocol 8, and the other way round
        let (a_client_tx, _a_client_rx) = a.register_protocol(8, ProtocolRole::Client).unwrap();
        let (_b_server_tx, mut b_server_rx) = b.register_protocol(8, ProtocolRole::Server).unwrap();
        let (b_client_tx, _b_client_rx) = b.register_protocol(8, ProtocolRole::Client).unwrap();
        let (_a_server_tx, mut a_server_rx) = a.register_protocol(8, ProtocolRole::Server).unwrap();

        a_client_tx.send(Segment::new(8, false, vec![1])).await.unwrap();
        b_client_tx.send(Segment::new(8, false, vec![2])).await.unwrap();
        assert_eq!(b_server_rx.recv().await.unwrap().payload, vec![1]);
        assert_eq!(a_server_rx.recv().await.unwrap().payload, vec![2]);
    }

    #[test]
    fn double_registration_is_rejected() {
        let (a, _b) = MemoryMuxer::pair();
        assert!(a.register_protocol(7, ProtocolRole::Server).is_ok());
        assert_eq!(
            a.register_protocol(7, ProtocolRole::Server).err(),
            Some(MuxerError::AlreadyRegistered {
                protocol_id: 7,
                role: ProtocolRole::Server
            })
        );
    }
}
