use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{event, Level};

use super::queries::{self, BlockQuery, Features, Query, SystemStart};
use super::{
    protocol_config, AcquireFailure, LocalStateQueryConfig, LocalStateQueryMessage, PROTOCOL_NAME,
    STATE_ACQUIRED, STATE_IDLE,
};
use crate::cbor::CodecError;
use crate::protocol::common::Point;
use crate::protocol::state::ProtocolRole;
use crate::protocol::{Message, MessageHandlerFn, Protocol, ProtocolError, ProtocolOptions};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("local-state-query: acquire failed: {0}")]
    AcquireFailed(AcquireFailure),
    #[error("local-state-query: cannot decode query result: {0}")]
    Result(#[from] CodecError),
}

type PendingReply = Arc<Mutex<Option<oneshot::Sender<LocalStateQueryMessage>>>>;

///
/// The local-state-query client. Each request waits for the server's reply
/// before the next one is sent.
///
pub struct LocalStateQueryClient {
    protocol: Protocol<LocalStateQueryMessage>,
    features: Features,
    pending: PendingReply,
    busy: AsyncMutex<()>,
}

impl LocalStateQueryClient {
    pub fn new(options: ProtocolOptions, config: LocalStateQueryConfig) -> Result<Self, ProtocolError> {
        let features = Features::for_version(options.version);
        let pending: PendingReply = Arc::new(Mutex::new(None));
        let handler_pending = pending.clone();
        let handler: MessageHandlerFn<LocalStateQueryMessage> = Arc::new(
            move |message: LocalStateQueryMessage| -> Result<Option<LocalStateQueryMessage>, ProtocolError> {
                match message {
                    LocalStateQueryMessage::Acquired
                    | LocalStateQueryMessage::Failure { .. }
                    | LocalStateQueryMessage::Result { .. } => {}
                    other => {
                        return Err(ProtocolError::UnhandledMessage {
                            protocol: PROTOCOL_NAME,
                            message: other.name(),
                        })
                    }
                }
                let waiter = match handler_pending.lock() {
                    Ok(mut pending) => pending.take(),
                    Err(_) => None,
                };
                match waiter {
                    Some(waiter) => {
                        if waiter.send(message).is_err() {
                            event!(Level::DEBUG, "{}: reply dropped by caller", PROTOCOL_NAME);
                        }
                        Ok(None)
                    }
                    None => Err(ProtocolError::UnhandledMessage {
                        protocol: PROTOCOL_NAME,
                        message: message.name(),
                    }),
                }
            },
        );
        let protocol = Protocol::new(protocol_config(ProtocolRole::Client, &config, handler), options)?;
        Ok(LocalStateQueryClient {
            protocol,
            features,
            pending,
            busy: AsyncMutex::new(()),
        })
    }

    pub fn start(&self) {
        self.protocol.start();
    }

    pub fn protocol(&self) -> &Protocol<LocalStateQueryMessage> {
        &self.protocol
    }

    async fn request(&self, message: LocalStateQueryMessage) -> Result<LocalStateQueryMessage, ProtocolError> {
        let (sender, receiver) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(sender);
        }
        self.protocol.send_message(message).await?;
        tokio::select! {
            reply = receiver => reply.map_err(|_| ProtocolError::Stopped { protocol: PROTOCOL_NAME }),
            _ = self.protocol.done() => Err(ProtocolError::Stopped { protocol: PROTOCOL_NAME }),
        }
    }

    ///
    /// Acquire `point`, or the current tip when `None`. When a point is
    /// already held it is replaced through ReAcquire.
    ///
    pub async fn acquire(&self, point: Option<Point>) -> Result<(), QueryError> {
        let _busy = self.busy.lock().await;
        self.acquire_locked(point).await
    }

    async fn acquire_locked(&self, point: Option<Point>) -> Result<(), QueryError> {
        let reacquire = self.protocol.current_state() == STATE_ACQUIRED;
        let message = match (point, reacquire) {
            (Some(point), false) => LocalStateQueryMessage::Acquire { point },
            (None, false) => LocalStateQueryMessage::AcquireNoPoint,
            (Some(point), true) => LocalStateQueryMessage::ReAcquire { point },
            (None, true) => LocalStateQueryMessage::ReAcquireNoPoint,
        };
        match self.request(message).await? {
            LocalStateQueryMessage::Acquired => Ok(()),
            LocalStateQueryMessage::Failure { failure } => Err(QueryError::AcquireFailed(failure)),
            other => Err(unexpected(&other)),
        }
    }

    /// Run one query against the acquired point, acquiring the tip first when
    /// nothing is held.
    pub async fn query(&self, query: Query) -> Result<Vec<u8>, QueryError> {
        if !self.features.permits(&query) {
            return Err(ProtocolError::UnsupportedFeature {
                protocol: PROTOCOL_NAME,
                feature: query.name(),
                required_version: query.required_version().unwrap_or_default(),
                negotiated_version: self.features.version,
            }
            .into());
        }
        let _busy = self.busy.lock().await;
        if self.protocol.current_state() == STATE_IDLE {
            self.acquire_locked(None).await?;
        }
        match self.request(LocalStateQueryMessage::Query { query }).await? {
            LocalStateQueryMessage::Result { result } => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn release(&self) -> Result<(), QueryError> {
        let _busy = self.busy.lock().await;
        self.protocol
            .send_message(LocalStateQueryMessage::Release)
            .await?;
        Ok(())
    }

    /// End the conversation. Releases the acquired point first.
    pub async fn done(&self) -> Result<(), QueryError> {
        let _busy = self.busy.lock().await;
        if self.protocol.current_state() == STATE_ACQUIRED {
            self.protocol
                .send_message(LocalStateQueryMessage::Release)
                .await?;
        }
        self.protocol.send_message(LocalStateQueryMessage::Done).await?;
        Ok(())
    }

    pub async fn get_system_start(&self) -> Result<SystemStart, QueryError> {
        let result = self.query(Query::GetSystemStart).await?;
        Ok(SystemStart::from_cbor(&result)?)
    }

    /// `None` while the chain is still at its origin.
    pub async fn get_chain_block_no(&self) -> Result<Option<u64>, QueryError> {
        let result = self.query(Query::GetChainBlockNo).await?;
        Ok(queries::chain_block_no_from_cbor(&result)?)
    }

    pub async fn get_chain_point(&self) -> Result<Point, QueryError> {
        let result = self.query(Query::GetChainPoint).await?;
        Ok(queries::chain_point_from_cbor(&result)?)
    }

    pub async fn get_current_era(&self) -> Result<u64, QueryError> {
        let result = self.query(Query::Block(BlockQuery::current_era())).await?;
        Ok(minicbor::Decoder::new(&result).u64().map_err(CodecError::from)?)
    }
}

fn unexpected(message: &LocalStateQueryMessage) -> QueryError {
    QueryError::Protocol(ProtocolError::UnhandledMessage {
        protocol: PROTOCOL_NAME,
        message: message.name(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::queries::{chain_block_no_to_cbor, chain_point_to_cbor};
    use super::super::{AcquireOutcome, LocalStateQueryServer, STATE_DONE};
    use super::*;
    use crate::protocol::muxer::MemoryMuxer;
    use tokio::sync::{broadcast, mpsc};

    const TIP: u64 = 4492800;

    fn tip() -> Point {
        Point::new(TIP, vec![0x5a; 32])
    }

    fn server_config() -> LocalStateQueryConfig {
        LocalStateQueryConfig::default()
            .with_acquire(Arc::new(|point: Option<Point>| -> crate::Result<AcquireOutcome> {
                match point {
                    Some(point) if point.slot > TIP => {
                        Ok(AcquireOutcome::Failure(AcquireFailure::PointNotOnChain))
                    }
                    _ => Ok(AcquireOutcome::Acquired),
                }
            }))
            .with_reacquire(Arc::new(|_point: Option<Point>| -> crate::Result<AcquireOutcome> {
                Ok(AcquireOutcome::Acquired)
            }))
            .with_query(Arc::new(|query: Query| -> crate::Result<Vec<u8>> {
                let result = match query {
                    Query::GetSystemStart => SystemStart {
                        year: 2017,
                        day: 266,
                        picoseconds: 0,
                    }
                    .to_cbor()?,
                    Query::GetChainBlockNo => chain_block_no_to_cbor(Some(7_000_000))?,
                    Query::GetChainPoint => chain_point_to_cbor(&tip())?,
                    Query::Block(_) => vec![0x05],
                };
                Ok(result)
            }))
            .with_release(Arc::new(|| -> crate::Result<()> { Ok(()) }))
            .with_done(Arc::new(|| -> crate::Result<()> { Ok(()) }))
    }

    fn pair(version: u16) -> (
        LocalStateQueryClient,
        LocalStateQueryServer,
        mpsc::UnboundedReceiver<ProtocolError>,
    ) {
        let (a, b) = MemoryMuxer::pair();
        let (error_sender, errors) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let client = LocalStateQueryClient::new(
            ProtocolOptions::new(Arc::new(a), error_sender.clone(), shutdown.clone(), version),
            LocalStateQueryConfig::default(),
        )
        .unwrap();
        let server = LocalStateQueryServer::new(
            ProtocolOptions::new(Arc::new(b), error_sender, shutdown, version),
            server_config(),
        )
        .unwrap();
        client.start();
        server.start();
        (client, server, errors)
    }

    #[tokio::test]
    async fn queries_over_loopback() {
        let (client, server, mut errors) = pair(11);
        assert_eq!(client.get_chain_block_no().await, Ok(Some(7_000_000)));
        assert_eq!(client.protocol().current_state(), STATE_ACQUIRED);
        assert_eq!(client.get_chain_point().await, Ok(tip()));
        assert_eq!(
            client.get_system_start().await.map(|start| start.year),
            Ok(2017)
        );
        assert_eq!(client.get_current_era().await, Ok(5));

        client.acquire(Some(tip())).await.unwrap();
        client.done().await.unwrap();
        client.protocol().done().await;
        server.protocol().done().await;
        assert_eq!(server.protocol().current_state(), STATE_DONE);
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn acquire_failure_is_reported_to_caller() {
        let (client, _server, _errors) = pair(10);
        assert_eq!(
            client.acquire(Some(Point::new(TIP + 1, vec![1; 32]))).await,
            Err(QueryError::AcquireFailed(AcquireFailure::PointNotOnChain))
        );
        assert_eq!(client.protocol().current_state(), STATE_IDLE);
        client.acquire(None).await.unwrap();
        client.release().await.unwrap();
        assert_eq!(client.protocol().current_state(), STATE_IDLE);
    }

    #[tokio::test]
    async fn client_refuses_queries_above_version() {
        let (client, _server, _errors) = pair(9);
        assert_eq!(
            client.get_chain_point().await,
            Err(QueryError::Protocol(ProtocolError::UnsupportedFeature {
                protocol: PROTOCOL_NAME,
                feature: "GetChainPoint",
                required_version: 10,
                negotiated_version: 9,
            }))
        );
        assert_eq!(client.protocol().current_state(), STATE_IDLE);
        assert!(!client.protocol().is_done());
    }
}
