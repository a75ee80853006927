/*!
# Keep-Alive

The keep-alive mini-protocol lets the client check that the peer is still
responsive. The client sends `KeepAlive` with a cookie, the server answers
with `KeepAliveResponse` carrying the same cookie, and the client repeats this
every period. Either side may end the conversation with `Done`.

```text
            KeepAlive
   Client  ----------->  Server
          <-----------
         KeepAliveResponse
     |
     | Done
     v
    Done
```
*/

pub mod client;
pub mod server;

pub use client::KeepAliveClient;
pub use server::KeepAliveServer;

use std::sync::Arc;
use std::time::Duration;

use crate::cbor::{self, CborEncoder, CodecError, Fields, TaggedVariant};
use crate::protocol::state::{Agency, ProtocolRole, ProtocolState, StateMap, StateMapEntry};
use crate::protocol::{Message, MessageHandlerFn, ProtocolConfig, DEFAULT_MAX_BUFFERED};

pub const PROTOCOL_NAME: &str = "keep-alive";
pub const PROTOCOL_ID: u16 = 8;

pub const MESSAGE_TYPE_KEEP_ALIVE: u64 = 0;
pub const MESSAGE_TYPE_KEEP_ALIVE_RESPONSE: u64 = 1;
pub const MESSAGE_TYPE_DONE: u64 = 2;

pub const STATE_CLIENT: ProtocolState = ProtocolState::new(1, "Client");
pub const STATE_SERVER: ProtocolState = ProtocolState::new(2, "Server");
pub const STATE_DONE: ProtocolState = ProtocolState::new(3, "Done");

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

lazy_static! {
    pub static ref STATE_MAP: StateMap = StateMap::new()
        .with_state(
            STATE_CLIENT,
            StateMapEntry::new(Agency::Client)
                .transition(MESSAGE_TYPE_KEEP_ALIVE, STATE_SERVER)
                .transition(MESSAGE_TYPE_DONE, STATE_DONE),
        )
        .with_state(
            STATE_SERVER,
            StateMapEntry::new(Agency::Server)
                .transition(MESSAGE_TYPE_KEEP_ALIVE_RESPONSE, STATE_CLIENT)
                .timeout(DEFAULT_TIMEOUT),
        )
        .with_state(STATE_DONE, StateMapEntry::new(Agency::None));
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveMessage {
    KeepAlive { cookie: u16 },
    KeepAliveResponse { cookie: u16 },
    Done,
}

impl TaggedVariant for KeepAliveMessage {
    const KIND: &'static str = "keep-alive message";

    fn discriminant(&self) -> u64 {
        match self {
            KeepAliveMessage::KeepAlive { .. } => MESSAGE_TYPE_KEEP_ALIVE,
            KeepAliveMessage::KeepAliveResponse { .. } => MESSAGE_TYPE_KEEP_ALIVE_RESPONSE,
            KeepAliveMessage::Done => MESSAGE_TYPE_DONE,
        }
    }

    fn field_count(&self) -> u64 {
        match self {
            KeepAliveMessage::Done => 0,
            _ => 1,
        }
    }

    fn encode_fields(&self, encoder: &mut CborEncoder) -> Result<(), CodecError> {
        match self {
            KeepAliveMessage::KeepAlive { cookie } | KeepAliveMessage::KeepAliveResponse { cookie } => {
                encoder.u16(*cookie)?;
            }
            KeepAliveMessage::Done => {}
        }
        Ok(())
    }

    fn decode_fields(discriminant: u64, fields: &mut Fields<'_, '_>) -> Result<Self, CodecError> {
        match discriminant {
            MESSAGE_TYPE_KEEP_ALIVE => {
                fields.expect_len(1)?;
                Ok(KeepAliveMessage::KeepAlive {
                    cookie: fields.u16()?,
                })
            }
            MESSAGE_TYPE_KEEP_ALIVE_RESPONSE => {
                fields.expect_len(1)?;
                Ok(KeepAliveMessage::KeepAliveResponse {
                    cookie: fields.u16()?,
                })
            }
            MESSAGE_TYPE_DONE => {
                fields.expect_len(0)?;
                Ok(KeepAliveMessage::Done)
            }
            _ => Err(CodecError::UnknownVariant {
                kind: Self::KIND,
                discriminant,
            }),
        }
    }
}

impl Message for KeepAliveMessage {
    fn name(&self) -> &'static str {
        match self {
            KeepAliveMessage::KeepAlive { .. } => "KeepAlive",
            KeepAliveMessage::KeepAliveResponse { .. } => "KeepAliveResponse",
            KeepAliveMessage::Done => "Done",
        }
    }
}

pub fn message_from_bytes(message_type: u64, data: &[u8]) -> Result<KeepAliveMessage, CodecError> {
    match message_type {
        MESSAGE_TYPE_KEEP_ALIVE | MESSAGE_TYPE_KEEP_ALIVE_RESPONSE | MESSAGE_TYPE_DONE => {
            cbor::decode(data)
        }
        _ => Err(CodecError::UnknownVariant {
            kind: KeepAliveMessage::KIND,
            discriminant: message_type,
        }),
    }
}

/// Receives the cookie of a keep-alive exchange.
pub type CookieCallbackFn = Arc<dyn Fn(u16) -> Result<(), crate::Error> + Send + Sync>;

#[derive(Clone)]
pub struct KeepAliveConfig {
    pub period: Duration,
    /// How long the client waits for a response.
    pub timeout: Duration,
    /// First cookie sent by the client. Random when unset.
    pub cookie: Option<u16>,
    /// Fail when a response does not echo the most recent cookie.
    pub verify_cookie: bool,
    /// Client side, called for each response.
    pub response_callback: Option<CookieCallbackFn>,
    /// Server side, called for each request.
    pub request_callback: Option<CookieCallbackFn>,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        KeepAliveConfig {
            period: DEFAULT_PERIOD,
            timeout: DEFAULT_TIMEOUT,
            cookie: None,
            verify_cookie: true,
            response_callback: None,
            request_callback: None,
        }
    }
}

impl KeepAliveConfig {
    pub fn with_cookie(mut self, cookie: u16) -> Self {
        self.cookie = Some(cookie);
        self
    }

    pub fn with_response_callback(mut self, callback: CookieCallbackFn) -> Self {
        self.response_callback = Some(callback);
        self
    }

    pub fn with_request_callback(mut self, callback: CookieCallbackFn) -> Self {
        self.request_callback = Some(callback);
        self
    }
}

fn protocol_config(
    role: ProtocolRole,
    config: &KeepAliveConfig,
    message_handler: MessageHandlerFn<KeepAliveMessage>,
) -> ProtocolConfig<KeepAliveMessage> {
    ProtocolConfig {
        name: PROTOCOL_NAME,
        protocol_id: PROTOCOL_ID,
        role,
        state_map: STATE_MAP
            .clone()
            .with_timeout(STATE_SERVER, Some(config.timeout)),
        initial_state: STATE_CLIENT,
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
        assert_eq!(STATE_MAP.agency_of(STATE_CLIENT), Agency::Client);
        assert_eq!(STATE_MAP.agency_of(STATE_SERVER), Agency::Server);
        assert!(STATE_MAP.is_terminal(STATE_DONE));
        assert_eq!(STATE_MAP.timeout_of(STATE_SERVER), Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn message_fixtures() {
        // [0, 0x1234]
        let bytes = vec![0x82, 0x00, 0x19, 0x12, 0x34];
        assert_eq!(
            message_from_bytes(MESSAGE_TYPE_KEEP_ALIVE, &bytes),
            Ok(KeepAliveMessage::KeepAlive { cookie: 0x1234 })
        );
        assert_eq!(
            KeepAliveMessage::KeepAlive { cookie: 0x1234 }.to_bytes(),
            Ok(bytes)
        );
        assert_eq!(KeepAliveMessage::Done.to_bytes(), Ok(vec![0x81, 0x02]));
    }

    #[test]
    fn every_legal_message_survives_encoding() {
        let messages = [
            KeepAliveMessage::KeepAlive { cookie: 0 },
            KeepAliveMessage::KeepAliveResponse { cookie: u16::MAX },
            KeepAliveMessage::Done,
        ];
        for message in messages {
            let bytes = message.to_bytes().unwrap();
            assert_eq!(message_from_bytes(message.message_type(), &bytes), Ok(message));
        }
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let expected = Err(CodecError::UnknownVariant {
            kind: KeepAliveMessage::KIND,
            discriminant: 5,
        });
        assert_eq!(message_from_bytes(5, &[0x81, 0x05]), expected);
        assert_eq!(cbor::decode::<KeepAliveMessage>(&[0x81, 0x05]), expected);
    }

    #[test]
    fn cookie_out_of_range_is_malformed() {
        // [1, 65536]
        let bytes = [0x82, 0x01, 0x1a, 0x00, 0x01, 0x00, 0x00];
        assert!(matches!(
            cbor::decode::<KeepAliveMessage>(&bytes),
            Err(CodecError::MalformedEncoding { .. })
        ));
    }
}
