use std::sync::Arc;

use tracing::{event, Level};

use super::{protocol_config, KeepAliveConfig, KeepAliveMessage, PROTOCOL_NAME};
use crate::protocol::state::ProtocolRole;
use crate::protocol::{Message, MessageHandlerFn, Protocol, ProtocolError, ProtocolOptions};

/// Answers every `KeepAlive` with a response echoing its cookie.
pub struct KeepAliveServer {
    protocol: Protocol<KeepAliveMessage>,
}

impl KeepAliveServer {
    pub fn new(options: ProtocolOptions, config: KeepAliveConfig) -> Result<Self, ProtocolError> {
        let request_callback = config.request_callback.clone();
        let handler: MessageHandlerFn<KeepAliveMessage> = Arc::new(
            move |message: KeepAliveMessage| -> Result<Option<KeepAliveMessage>, ProtocolError> {
                match message {
                    KeepAliveMessage::KeepAlive { cookie } => {
                        event!(Level::TRACE, "{}: request with cookie {}", PROTOCOL_NAME, cookie);
                        if let Some(callback) = &request_callback {
                            callback(cookie)
                                .map_err(|err| ProtocolError::callback(PROTOCOL_NAME, err))?;
                        }
                        Ok(Some(KeepAliveMessage::KeepAliveResponse { cookie }))
                    }
                    KeepAliveMessage::Done => Ok(None),
                    other => Err(ProtocolError::UnhandledMessage {
                        protocol: PROTOCOL_NAME,
                        message: other.name(),
                    }),
                }
            },
        );
        let protocol = Protocol::new(protocol_config(ProtocolRole::Server, &config, handler), options)?;
        Ok(KeepAliveServer { protocol })
    }

    pub fn start(&self) {
        self.protocol.start();
    }

    pub fn protocol(&self) -> &Protocol<KeepAliveMessage> {
        &self.protocol
    }
}
