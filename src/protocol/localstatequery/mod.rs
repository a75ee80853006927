/*!
# Local-State-Query

The local-state-query mini-protocol lets a local client read ledger state at
a chosen point of the chain. The client acquires a point (or the current tip),
runs any number of queries against it and then releases it.

```text
   Idle --Acquire/AcquireNoPoint--> Acquiring --Acquired--> Acquired
    ^                                  |                    |  ^
    |<------------Failure--------------+                    |  |
    |<------------------------Release-----------------------+  |
    |                                  Query --> Querying --Result
    |                        ReAcquire/ReAcquireNoPoint --> Acquiring
    +--Done--> Done
```

Queries are version dependent: the state table is the same for every version
but a peer only answers the queries its negotiated version supports.
*/

pub mod client;
pub mod queries;
pub mod server;

pub use client::{LocalStateQueryClient, QueryError};
pub use queries::{BlockQuery, Features, Query, SystemStart};
pub use server::LocalStateQueryServer;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cbor::{self, CborEncoder, CodecError, Fields, TaggedVariant};
use crate::protocol::common::Point;
use crate::protocol::state::{Agency, ProtocolRole, ProtocolState, StateMap, StateMapEntry};
use crate::protocol::{Message, MessageHandlerFn, ProtocolConfig, DEFAULT_MAX_BUFFERED};

pub const PROTOCOL_NAME: &str = "local-state-query";
pub const PROTOCOL_ID: u16 = 7;

pub const MESSAGE_TYPE_ACQUIRE: u64 = 0;
pub const MESSAGE_TYPE_ACQUIRED: u64 = 1;
pub const MESSAGE_TYPE_FAILURE: u64 = 2;
pub const MESSAGE_TYPE_QUERY: u64 = 3;
pub const MESSAGE_TYPE_RESULT: u64 = 4;
pub const MESSAGE_TYPE_RELEASE: u64 = 5;
pub const MESSAGE_TYPE_REACQUIRE: u64 = 6;
pub const MESSAGE_TYPE_DONE: u64 = 7;
pub const MESSAGE_TYPE_ACQUIRE_NO_POINT: u64 = 8;
pub const MESSAGE_TYPE_REACQUIRE_NO_POINT: u64 = 9;

pub const STATE_IDLE: ProtocolState = ProtocolState::new(1, "Idle");
pub const STATE_ACQUIRING: ProtocolState = ProtocolState::new(2, "Acquiring");
pub const STATE_ACQUIRED: ProtocolState = ProtocolState::new(3, "Acquired");
pub const STATE_QUERYING: ProtocolState = ProtocolState::new(4, "Querying");
pub const STATE_DONE: ProtocolState = ProtocolState::new(5, "Done");

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(180);

lazy_static! {
    pub static ref STATE_MAP: StateMap = StateMap::new()
        .with_state(
            STATE_IDLE,
            StateMapEntry::new(Agency::Client)
                .transition(MESSAGE_TYPE_ACQUIRE, STATE_ACQUIRING)
                .transition(MESSAGE_TYPE_ACQUIRE_NO_POINT, STATE_ACQUIRING)
                .transition(MESSAGE_TYPE_DONE, STATE_DONE),
        )
        .with_state(
            STATE_ACQUIRING,
            StateMapEntry::new(Agency::Server)
                .transition(MESSAGE_TYPE_ACQUIRED, STATE_ACQUIRED)
                .transition(MESSAGE_TYPE_FAILURE, STATE_IDLE)
                .timeout(DEFAULT_ACQUIRE_TIMEOUT),
        )
        .with_state(
            STATE_ACQUIRED,
            StateMapEntry::new(Agency::Client)
                .transition(MESSAGE_TYPE_QUERY, STATE_QUERYING)
                .transition(MESSAGE_TYPE_REACQUIRE, STATE_ACQUIRING)
                .transition(MESSAGE_TYPE_REACQUIRE_NO_POINT, STATE_ACQUIRING)
                .transition(MESSAGE_TYPE_RELEASE, STATE_IDLE),
        )
        .with_state(
            STATE_QUERYING,
            StateMapEntry::new(Agency::Server)
                .transition(MESSAGE_TYPE_RESULT, STATE_ACQUIRED)
                .timeout(DEFAULT_QUERY_TIMEOUT),
        )
        .with_state(STATE_DONE, StateMapEntry::new(Agency::None));
}

/// Why the server could not acquire the requested point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireFailure {
    PointTooOld,
    PointNotOnChain,
}

impl AcquireFailure {
    pub fn code(self) -> u64 {
        match self {
            AcquireFailure::PointTooOld => 0,
            AcquireFailure::PointNotOnChain => 1,
        }
    }

    pub fn from_code(code: u64) -> Result<Self, CodecError> {
        match code {
            0 => Ok(AcquireFailure::PointTooOld),
            1 => Ok(AcquireFailure::PointNotOnChain),
            _ => Err(CodecError::UnknownVariant {
                kind: "acquire failure",
                discriminant: code,
            }),
        }
    }
}

impl fmt::Display for AcquireFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireFailure::PointTooOld => write!(f, "point too old"),
            AcquireFailure::PointNotOnChain => write!(f, "point not on chain"),
        }
    }
}

/// What the server's acquire callback decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    Failure(AcquireFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalStateQueryMessage {
    Acquire { point: Point },
    Acquired,
    Failure { failure: AcquireFailure },
    Query { query: Query },
    /// The result is the CBOR produced by the query callback.
    Result { result: Vec<u8> },
    Release,
    ReAcquire { point: Point },
    Done,
    AcquireNoPoint,
    ReAcquireNoPoint,
}

impl TaggedVariant for LocalStateQueryMessage {
    const KIND: &'static str = "local-state-query message";

    fn discriminant(&self) -> u64 {
        match self {
            LocalStateQueryMessage::Acquire { .. } => MESSAGE_TYPE_ACQUIRE,
            LocalStateQueryMessage::Acquired => MESSAGE_TYPE_ACQUIRED,
            LocalStateQueryMessage::Failure { .. } => MESSAGE_TYPE_FAILURE,
            LocalStateQueryMessage::Query { .. } => MESSAGE_TYPE_QUERY,
            LocalStateQueryMessage::Result { .. } => MESSAGE_TYPE_RESULT,
            LocalStateQueryMessage::Release => MESSAGE_TYPE_RELEASE,
            LocalStateQueryMessage::ReAcquire { .. } => MESSAGE_TYPE_REACQUIRE,
            LocalStateQueryMessage::Done => MESSAGE_TYPE_DONE,
            LocalStateQueryMessage::AcquireNoPoint => MESSAGE_TYPE_ACQUIRE_NO_POINT,
            LocalStateQueryMessage::ReAcquireNoPoint => MESSAGE_TYPE_REACQUIRE_NO_POINT,
        }
    }

    fn field_count(&self) -> u64 {
        match self {
            LocalStateQueryMessage::Acquire { .. }
            | LocalStateQueryMessage::Failure { .. }
            | LocalStateQueryMessage::Query { .. }
            | LocalStateQueryMessage::Result { .. }
            | LocalStateQueryMessage::ReAcquire { .. } => 1,
            _ => 0,
        }
    }

    fn encode_fields(&self, encoder: &mut CborEncoder) -> Result<(), CodecError> {
        match self {
            LocalStateQueryMessage::Acquire { point } | LocalStateQueryMessage::ReAcquire { point } => {
                point.encode(encoder)?;
            }
            LocalStateQueryMessage::Failure { failure } => {
                encoder.u64(failure.code())?;
            }
            LocalStateQueryMessage::Query { query } => {
                cbor::encode_into(query, encoder)?;
            }
            LocalStateQueryMessage::Result { result } => {
                cbor::write_raw(encoder, result);
            }
            _ => {}
        }
        Ok(())
    }

    fn decode_fields(discriminant: u64, fields: &mut Fields<'_, '_>) -> Result<Self, CodecError> {
        let message = match discriminant {
            MESSAGE_TYPE_ACQUIRE => {
                fields.expect_len(1)?;
                LocalStateQueryMessage::Acquire {
                    point: fields.decode_with(Point::decode)?,
                }
            }
            MESSAGE_TYPE_FAILURE => {
                fields.expect_len(1)?;
                LocalStateQueryMessage::Failure {
                    failure: AcquireFailure::from_code(fields.u64()?)?,
                }
            }
            MESSAGE_TYPE_QUERY => {
                fields.expect_len(1)?;
                LocalStateQueryMessage::Query {
                    query: fields.tagged()?,
                }
            }
            MESSAGE_TYPE_RESULT => {
                fields.expect_len(1)?;
                LocalStateQueryMessage::Result {
                    result: fields.raw()?,
                }
            }
            MESSAGE_TYPE_REACQUIRE => {
                fields.expect_len(1)?;
                LocalStateQueryMessage::ReAcquire {
                    point: fields.decode_with(Point::decode)?,
                }
            }
            MESSAGE_TYPE_ACQUIRED
            | MESSAGE_TYPE_RELEASE
            | MESSAGE_TYPE_DONE
            | MESSAGE_TYPE_ACQUIRE_NO_POINT
            | MESSAGE_TYPE_REACQUIRE_NO_POINT => {
                fields.expect_len(0)?;
                match discriminant {
                    MESSAGE_TYPE_ACQUIRED => LocalStateQueryMessage::Acquired,
                    MESSAGE_TYPE_RELEASE => LocalStateQueryMessage::Release,
                    MESSAGE_TYPE_DONE => LocalStateQueryMessage::Done,
                    MESSAGE_TYPE_ACQUIRE_NO_POINT => LocalStateQueryMessage::AcquireNoPoint,
                    _ => LocalStateQueryMessage::ReAcquireNoPoint,
                }
            }
            _ => {
                return Err(CodecError::UnknownVariant {
                    kind: Self::KIND,
                    discriminant,
                })
            }
        };
        Ok(message)
    }
}

impl Message for LocalStateQueryMessage {
    fn name(&self) -> &'static str {
        match self {
            LocalStateQueryMessage::Acquire { .. } => "Acquire",
            LocalStateQueryMessage::Acquired => "Acquired",
            LocalStateQueryMessage::Failure { .. } => "Failure",
            LocalStateQueryMessage::Query { .. } => "Query",
            LocalStateQueryMessage::Result { .. } => "Result",
            LocalStateQueryMessage::Release => "Release",
            LocalStateQueryMessage::ReAcquire { .. } => "ReAcquire",
            LocalStateQueryMessage::Done => "Done",
            LocalStateQueryMessage::AcquireNoPoint => "AcquireNoPoint",
            LocalStateQueryMessage::ReAcquireNoPoint => "ReAcquireNoPoint",
        }
    }
}

pub fn message_from_bytes(
    message_type: u64,
    data: &[u8],
) -> Result<LocalStateQueryMessage, CodecError> {
    if message_type > MESSAGE_TYPE_REACQUIRE_NO_POINT {
        return Err(CodecError::UnknownVariant {
            kind: LocalStateQueryMessage::KIND,
            discriminant: message_type,
        });
    }
    cbor::decode(data)
}

/// Called for Acquire (`Some(point)`) and AcquireNoPoint (`None`), and the
/// same for the ReAcquire pair.
pub type AcquireFn = Arc<dyn Fn(Option<Point>) -> Result<AcquireOutcome, crate::Error> + Send + Sync>;
/// Returns the CBOR encoded result of the query.
pub type QueryFn = Arc<dyn Fn(Query) -> Result<Vec<u8>, crate::Error> + Send + Sync>;
pub type ReleaseFn = Arc<dyn Fn() -> Result<(), crate::Error> + Send + Sync>;
pub type DoneFn = Arc<dyn Fn() -> Result<(), crate::Error> + Send + Sync>;

#[derive(Clone)]
pub struct LocalStateQueryConfig {
    pub acquire_callback: Option<AcquireFn>,
    pub query_callback: Option<QueryFn>,
    pub release_callback: Option<ReleaseFn>,
    pub reacquire_callback: Option<AcquireFn>,
    pub done_callback: Option<DoneFn>,
    pub acquire_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for LocalStateQueryConfig {
    fn default() -> Self {
        LocalStateQueryConfig {
            acquire_callback: None,
            query_callback: None,
            release_callback: None,
            reacquire_callback: None,
            done_callback: None,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl LocalStateQueryConfig {
    pub fn with_acquire(mut self, callback: AcquireFn) -> Self {
        self.acquire_callback = Some(callback);
        self
    }

    pub fn with_query(mut self, callback: QueryFn) -> Self {
        self.query_callback = Some(callback);
        self
    }

    pub fn with_release(mut self, callback: ReleaseFn) -> Self {
        self.release_callback = Some(callback);
        self
    }

    pub fn with_reacquire(mut self, callback: AcquireFn) -> Self {
        self.reacquire_callback = Some(callback);
        self
    }

    pub fn with_done(mut self, callback: DoneFn) -> Self {
        self.done_callback = Some(callback);
        self
    }
}

fn protocol_config(
    role: ProtocolRole,
    config: &LocalStateQueryConfig,
    message_handler: MessageHandlerFn<LocalStateQueryMessage>,
) -> ProtocolConfig<LocalStateQueryMessage> {
    ProtocolConfig {
        name: PROTOCOL_NAME,
        protocol_id: PROTOCOL_ID,
        role,
        state_map: STATE_MAP
            .clone()
            .with_timeout(STATE_ACQUIRING, Some(config.acquire_timeout))
            .with_timeout(STATE_QUERYING, Some(config.query_timeout)),
        initial_state: STATE_IDLE,
        message_from_bytes,
        message_handler,
        max_buffered: DEFAULT_MAX_BUFFERED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_map_is_well_formed() {
        assert!(STATE_MAP.validate().is_ok());
        assert_eq!(
            STATE_MAP.legal_transition(ProtocolRole::Client, STATE_IDLE, MESSAGE_TYPE_ACQUIRE_NO_POINT),
            Some(STATE_ACQUIRING)
        );
        assert_eq!(
            STATE_MAP.legal_transition(ProtocolRole::Server, STATE_ACQUIRING, MESSAGE_TYPE_FAILURE),
            Some(STATE_IDLE)
        );
        assert_eq!(
            STATE_MAP.legal_transition(ProtocolRole::Client, STATE_IDLE, MESSAGE_TYPE_QUERY),
            None
        );
        assert!(STATE_MAP.is_terminal(STATE_DONE));
    }

    #[test]
    fn every_legal_message_survives_encoding() {
        let messages = vec![
            LocalStateQueryMessage::Acquire {
                point: Point::new(4492800, vec![0xaa; 32]),
            },
            LocalStateQueryMessage::Acquired,
            LocalStateQueryMessage::Failure {
                failure: AcquireFailure::PointNotOnChain,
            },
            LocalStateQueryMessage::Query {
                query: Query::Block(BlockQuery::current_era()),
            },
            LocalStateQueryMessage::Result {
                result: vec![0x82, 0x01, 0x18, 0x64],
            },
            LocalStateQueryMessage::Release,
            LocalStateQueryMessage::ReAcquire {
                point: Point::origin(),
            },
            LocalStateQueryMessage::Done,
            LocalStateQueryMessage::AcquireNoPoint,
            LocalStateQueryMessage::ReAcquireNoPoint,
        ];
        for message in messages {
            let bytes = message.to_bytes().unwrap();
            assert_eq!(message_from_bytes(message.message_type(), &bytes), Ok(message));
        }
    }

    #[test]
    fn fixtures() {
        assert_eq!(
            LocalStateQueryMessage::Query {
                query: Query::GetSystemStart
            }
            .to_bytes(),
            Ok(vec![0x82, 0x03, 0x81, 0x01])
        );
        assert_eq!(LocalStateQueryMessage::AcquireNoPoint.to_bytes(), Ok(vec![0x81, 0x08]));
        assert_eq!(
            message_from_bytes(MESSAGE_TYPE_FAILURE, &[0x82, 0x02, 0x00]),
            Ok(LocalStateQueryMessage::Failure {
                failure: AcquireFailure::PointTooOld
            })
        );
    }

    #[test]
    fn unknown_discriminants_are_rejected() {
        assert_eq!(
            message_from_bytes(10, &[0x81, 0x0a]),
            Err(CodecError::UnknownVariant {
                kind: LocalStateQueryMessage::KIND,
                discriminant: 10
            })
        );
        assert_eq!(
            message_from_bytes(MESSAGE_TYPE_FAILURE, &[0x82, 0x02, 0x07]),
            Err(CodecError::UnknownVariant {
                kind: "acquire failure",
                discriminant: 7
            })
        );
    }
}
