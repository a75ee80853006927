/*!

# Mini-Protocol Engine

## Introduction

An Ouroboros connection carries several independent mini-protocols over one
multiplexed bearer. Each mini-protocol is a state machine: in every state
exactly one party (the client or the server) has agency and may send, and
each message moves the conversation to a new state.

`Protocol` is the generic driver every mini-protocol instantiates. It owns the
current state, refuses to send messages that are not legal in that state,
refuses to accept messages from the peer that are not legal in that state,
and dispatches accepted messages to the mini-protocol's handler.

## Wire format

Every message is a CBOR tagged variant (see `cbor`):

```bytes
[message_type, field1, field2, ...]
```

A muxer segment may carry part of a message or several messages. The read
pump buffers segment payloads and cuts complete CBOR items out of the buffer.

## Failure

A protocol instance fails on the first illegal send, illegal or undecodable
inbound message, handler error, state timeout or closed transport. The error
is delivered once on the connection-wide error channel and the instance stops.
Other instances on the same connection are unaffected.

*/

pub mod common;
pub mod keepalive;
pub mod localstatequery;
pub mod muxer;
pub mod state;

use std::fmt;
use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::time::{self, Instant};
use tracing::{event, Level};

use crate::cbor::{self, CodecError, TaggedVariant};
use muxer::{Muxer, MuxerError, Segment};
use state::{Agency, ProtocolRole, ProtocolState, StateMap};

/// A message of one mini-protocol's closed catalog.
pub trait Message: TaggedVariant + fmt::Debug + Send + Sync + 'static {
    fn message_type(&self) -> u64 {
        self.discriminant()
    }

    fn name(&self) -> &'static str;

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        cbor::encode(self)
    }
}

/// Builds a message from its discriminant and complete encoding.
pub type MessageFromBytesFn<M> = fn(u64, &[u8]) -> Result<M, CodecError>;

/// Called for every accepted inbound message. A returned message is sent as
/// the reply.
pub type MessageHandlerFn<M> = Arc<dyn Fn(M) -> Result<Option<M>, ProtocolError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("{protocol}: {source}")]
    Codec {
        protocol: &'static str,
        #[source]
        source: CodecError,
    },
    #[error("{protocol}: cannot send message type {message_type} in state {state} (agency: {agency})")]
    ProtocolViolation {
        protocol: &'static str,
        state: ProtocolState,
        message_type: u64,
        agency: Agency,
    },
    #[error("{protocol}: received unexpected message type {message_type} in state {state} (agency: {agency})")]
    UnexpectedMessage {
        protocol: &'static str,
        state: ProtocolState,
        message_type: u64,
        agency: Agency,
    },
    #[error("{protocol}: received unexpected message {message}")]
    UnhandledMessage {
        protocol: &'static str,
        message: &'static str,
    },
    #[error("{protocol}: received {message} message but no callback function is defined")]
    MissingHandler {
        protocol: &'static str,
        message: &'static str,
    },
    #[error("{protocol}: timed out after {timeout:?} in state {state}")]
    Timeout {
        protocol: &'static str,
        state: ProtocolState,
        timeout: Duration,
    },
    #[error("{protocol}: {feature} requires protocol version {required_version} (negotiated {negotiated_version})")]
    UnsupportedFeature {
        protocol: &'static str,
        feature: &'static str,
        required_version: u16,
        negotiated_version: u16,
    },
    #[error("{protocol}: cookie mismatch, sent {expected} but received {received}")]
    CookieMismatch {
        protocol: &'static str,
        expected: u16,
        received: u16,
    },
    #[error("{protocol}: callback failed: {reason}")]
    Callback {
        protocol: &'static str,
        reason: String,
    },
    #[error("{protocol}: {source}")]
    Muxer {
        protocol: &'static str,
        #[source]
        source: MuxerError,
    },
    #[error("{protocol}: transport closed")]
    TransportClosed { protocol: &'static str },
    #[error("{protocol}: protocol stopped")]
    Stopped { protocol: &'static str },
}

impl ProtocolError {
    pub fn protocol(&self) -> &'static str {
        match self {
            ProtocolError::Codec { protocol, .. }
            | ProtocolError::ProtocolViolation { protocol, .. }
            | ProtocolError::UnexpectedMessage { protocol, .. }
            | ProtocolError::UnhandledMessage { protocol, .. }
            | ProtocolError::MissingHandler { protocol, .. }
            | ProtocolError::Timeout { protocol, .. }
            | ProtocolError::UnsupportedFeature { protocol, .. }
            | ProtocolError::CookieMismatch { protocol, .. }
            | ProtocolError::Callback { protocol, .. }
            | ProtocolError::Muxer { protocol, .. }
            | ProtocolError::TransportClosed { protocol }
            | ProtocolError::Stopped { protocol } => protocol,
        }
    }

    pub fn callback(protocol: &'static str, err: crate::Error) -> Self {
        ProtocolError::Callback {
            protocol,
            reason: err.to_string(),
        }
    }
}

/// Default limit on bytes held while waiting for the rest of a message.
pub const DEFAULT_MAX_BUFFERED: usize = 2 * 1024 * 1024;

/// Static description of one mini-protocol instance.
pub struct ProtocolConfig<M: Message> {
    pub name: &'static str,
    pub protocol_id: u16,
    pub role: ProtocolRole,
    pub state_map: StateMap,
    pub initial_state: ProtocolState,
    pub message_from_bytes: MessageFromBytesFn<M>,
    pub message_handler: MessageHandlerFn<M>,
    /// An incomplete inbound message longer than this fails the instance.
    pub max_buffered: usize,
}

/// Connection-wide resources shared by every mini-protocol instance.
#[derive(Clone)]
pub struct ProtocolOptions {
    pub muxer: Arc<dyn Muxer>,
    pub error_sender: mpsc::UnboundedSender<ProtocolError>,
    /// Broadcast once when the whole connection shuts down.
    pub shutdown: broadcast::Sender<()>,
    /// Negotiated protocol version.
    pub version: u16,
}

impl ProtocolOptions {
    pub fn new(
        muxer: Arc<dyn Muxer>,
        error_sender: mpsc::UnboundedSender<ProtocolError>,
        shutdown: broadcast::Sender<()>,
        version: u16,
    ) -> Self {
        ProtocolOptions {
            muxer,
            error_sender,
            shutdown,
            version,
        }
    }
}

struct ProtocolInner<M: Message> {
    name: &'static str,
    protocol_id: u16,
    role: ProtocolRole,
    state_map: StateMap,
    message_from_bytes: MessageFromBytesFn<M>,
    message_handler: MessageHandlerFn<M>,
    max_buffered: usize,
    // held across check, write and advance so transitions are atomic
    state: AsyncMutex<ProtocolState>,
    state_watch: watch::Sender<ProtocolState>,
    done: watch::Sender<bool>,
    sender: mpsc::Sender<Segment>,
    receiver: Mutex<Option<mpsc::Receiver<Segment>>>,
    error_sender: mpsc::UnboundedSender<ProtocolError>,
    shutdown: broadcast::Sender<()>,
    // subscribed at construction so a shutdown sent before start is seen
    shutdown_seen: Mutex<broadcast::Receiver<()>>,
    closing: AtomicBool,
    start: Once,
    failed: AtomicBool,
}

///
/// A running mini-protocol instance. Cloning gives another handle to the same
/// instance.
///
pub struct Protocol<M: Message> {
    inner: Arc<ProtocolInner<M>>,
}

impl<M: Message> Clone for Protocol<M> {
    fn clone(&self) -> Self {
        Protocol {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Message> Protocol<M> {
    /// Register with the muxer. Nothing is read until `start`.
    pub fn new(config: ProtocolConfig<M>, options: ProtocolOptions) -> Result<Self, ProtocolError> {
        let (sender, receiver) = options
            .muxer
            .register_protocol(config.protocol_id, config.role)
            .map_err(|source| ProtocolError::Muxer {
                protocol: config.name,
                source,
            })?;
        let (state_watch, _) = watch::channel(config.initial_state);
        let (done, _) = watch::channel(false);
        Ok(Protocol {
            inner: Arc::new(ProtocolInner {
                name: config.name,
                protocol_id: config.protocol_id,
                role: config.role,
                state_map: config.state_map,
                message_from_bytes: config.message_from_bytes,
                message_handler: config.message_handler,
                max_buffered: config.max_buffered,
                state: AsyncMutex::new(config.initial_state),
                state_watch,
                done,
                sender,
                receiver: Mutex::new(Some(receiver)),
                error_sender: options.error_sender,
                shutdown_seen: Mutex::new(options.shutdown.subscribe()),
                shutdown: options.shutdown,
                closing: AtomicBool::new(false),
                start: Once::new(),
                failed: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn protocol_id(&self) -> u16 {
        self.inner.protocol_id
    }

    pub fn role(&self) -> ProtocolRole {
        self.inner.role
    }

    pub fn current_state(&self) -> ProtocolState {
        *self.inner.state_watch.borrow()
    }

    pub fn state_map(&self) -> &StateMap {
        &self.inner.state_map
    }

    /// Start the read pump. Calls after the first have no effect.
    pub fn start(&self) {
        let inner = self.inner.clone();
        self.inner.start.call_once(move || {
            let receiver = match inner.receiver.lock() {
                Ok(mut receiver) => receiver.take(),
                Err(_) => None,
            };
            match receiver {
                Some(receiver) => {
                    event!(
                        Level::DEBUG,
                        "{}: starting {} in state {}",
                        inner.name,
                        inner.role,
                        inner.current_state()
                    );
                    let shutdown = inner.shutdown.subscribe();
                    tokio::spawn(read_loop(inner, receiver, shutdown));
                }
                None => inner.fail(ProtocolError::TransportClosed {
                    protocol: inner.name,
                }),
            }
        });
    }

    /// Send a message. Fails the instance if the message is not legal in the
    /// current state or cannot be written.
    pub async fn send_message(&self, message: M) -> Result<(), ProtocolError> {
        let result = self.inner.send(message).await;
        match &result {
            Err(ProtocolError::Stopped { .. }) | Ok(()) => {}
            Err(ProtocolError::TransportClosed { .. }) if self.inner.shutting_down() => {
                self.inner.finish()
            }
            Err(err) => self.inner.fail(err.clone()),
        }
        result
    }

    /// Report an error on behalf of the mini-protocol and stop the instance.
    pub fn send_error(&self, err: ProtocolError) {
        self.inner.fail(err);
    }

    /// Stop the instance without reporting an error.
    pub fn stop(&self) {
        self.inner.finish();
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// Resolves once the instance has stopped, whatever the reason.
    pub async fn done(&self) {
        let mut done = self.inner.done.subscribe();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}

impl<M: Message> ProtocolInner<M> {
    fn current_state(&self) -> ProtocolState {
        *self.state_watch.borrow()
    }

    fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// True once the connection-wide shutdown has been broadcast.
    fn shutting_down(&self) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            return true;
        }
        let seen = match self.shutdown_seen.lock() {
            Ok(mut receiver) => matches!(
                receiver.try_recv(),
                Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_))
            ),
            Err(_) => false,
        };
        if seen {
            self.closing.store(true, Ordering::SeqCst);
        }
        seen
    }

    fn finish(&self) {
        self.done.send_replace(true);
    }

    fn fail(&self, err: ProtocolError) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        event!(Level::ERROR, "{}", err);
        if self.error_sender.send(err).is_err() {
            event!(Level::WARN, "{}: connection error channel closed", self.name);
        }
        self.finish();
    }

    fn advance(&self, state: &mut ProtocolState, next: ProtocolState) {
        event!(Level::TRACE, "{}: {} -> {}", self.name, state, next);
        *state = next;
        self.state_watch.send_replace(next);
        if self.state_map.is_terminal(next) {
            event!(Level::DEBUG, "{}: reached terminal state {}", self.name, next);
            self.finish();
        }
    }

    fn codec_error(&self, source: CodecError) -> ProtocolError {
        ProtocolError::Codec {
            protocol: self.name,
            source,
        }
    }

    async fn send(&self, message: M) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().await;
        if self.is_done() {
            return Err(ProtocolError::Stopped {
                protocol: self.name,
            });
        }
        let message_type = message.message_type();
        let next = self
            .state_map
            .legal_transition(self.role, *state, message_type)
            .ok_or_else(|| ProtocolError::ProtocolViolation {
                protocol: self.name,
                state: *state,
                message_type,
                agency: self.state_map.agency_of(*state),
            })?;
        let payload = message.to_bytes().map_err(|err| self.codec_error(err))?;
        let segment = Segment::new(self.protocol_id, self.role == ProtocolRole::Server, payload);
        self.sender
            .send(segment)
            .await
            .map_err(|_| ProtocolError::TransportClosed {
                protocol: self.name,
            })?;
        event!(Level::DEBUG, "{}: sent {}", self.name, message.name());
        self.advance(&mut state, next);
        Ok(())
    }

    // cut complete messages off the front of the buffer and process them
    async fn process_buffer(&self, buffer: &mut Vec<u8>) -> Result<(), ProtocolError> {
        while !buffer.is_empty() && !self.is_done() {
            let length = match cbor::item_length(buffer).map_err(|err| self.codec_error(err))? {
                Some(length) => length,
                None => break,
            };
            let data: Vec<u8> = buffer.drain(..length).collect();
            self.receive(&data).await?;
        }
        if buffer.len() > self.max_buffered {
            return Err(self.codec_error(CodecError::malformed(format!(
                "{} bytes buffered without a complete message (limit {})",
                buffer.len(),
                self.max_buffered
            ))));
        }
        Ok(())
    }

    async fn receive(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let message_type = cbor::decode_discriminant(data).map_err(|err| self.codec_error(err))?;
        let message = {
            let mut state = self.state.lock().await;
            let next = self
                .state_map
                .legal_transition(self.role.peer(), *state, message_type)
                .ok_or_else(|| ProtocolError::UnexpectedMessage {
                    protocol: self.name,
                    state: *state,
                    message_type,
                    agency: self.state_map.agency_of(*state),
                })?;
            let message =
                (self.message_from_bytes)(message_type, data).map_err(|err| self.codec_error(err))?;
            self.advance(&mut state, next);
            message
        };
        event!(Level::DEBUG, "{}: received {}", self.name, message.name());
        if let Some(reply) = (self.message_handler)(message)? {
            self.send(reply).await?;
        }
        Ok(())
    }

    fn deadline(&self, state: ProtocolState) -> Option<(Instant, Duration)> {
        self.state_map
            .timeout_of(state)
            .map(|timeout| (Instant::now() + timeout, timeout))
    }
}

async fn wait_until(deadline: Option<(Instant, Duration)>) {
    match deadline {
        Some((instant, _)) => time::sleep_until(instant).await,
        None => future::pending().await,
    }
}

///
/// The read pump. Runs until the instance is done: terminal state, failure,
/// explicit stop or connection shutdown. The timeout of the current state is
/// re-armed on every state change, including changes made by the send path.
///
async fn read_loop<M: Message>(
    inner: Arc<ProtocolInner<M>>,
    mut receiver: mpsc::Receiver<Segment>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut done = inner.done.subscribe();
    let mut state = inner.state_watch.subscribe();
    let mut deadline = inner.deadline(*state.borrow_and_update());
    let mut buffer: Vec<u8> = vec![];

    loop {
        if *done.borrow_and_update() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                event!(Level::DEBUG, "{}: connection shutdown", inner.name);
                inner.finish();
                break;
            }
            _ = done.changed() => {}
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                deadline = inner.deadline(*state.borrow_and_update());
            }
            _ = wait_until(deadline) => {
                if let Some((_, timeout)) = deadline {
                    inner.fail(ProtocolError::Timeout {
                        protocol: inner.name,
                        state: inner.current_state(),
                        timeout,
                    });
                }
                break;
            }
            segment = receiver.recv() => match segment {
                Some(segment) => {
                    buffer.extend_from_slice(&segment.payload);
                    match inner.process_buffer(&mut buffer).await {
                        Ok(()) => {}
                        // a reply raced the peer going away during shutdown
                        Err(ProtocolError::TransportClosed { .. }) if inner.shutting_down() => {
                            inner.finish();
                            break;
                        }
                        Err(err) => {
                            inner.fail(err);
                            break;
                        }
                    }
                }
                None => {
                    // the peer instance stops first when the whole connection shuts down
                    if inner.is_done() || inner.shutting_down() {
                        event!(Level::DEBUG, "{}: transport closed during shutdown", inner.name);
                        inner.finish();
                    } else {
                        inner.fail(ProtocolError::TransportClosed { protocol: inner.name });
                    }
                    break;
                }
            },
        }
    }
    event!(Level::DEBUG, "{}: read loop stopped", inner.name);
}
