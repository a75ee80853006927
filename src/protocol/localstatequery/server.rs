use std::sync::Arc;

use tracing::{event, Level};

use super::{
    protocol_config, AcquireFn, AcquireOutcome, Features, LocalStateQueryConfig,
    LocalStateQueryMessage, Query, PROTOCOL_NAME,
};
use crate::cbor;
use crate::protocol::common::Point;
use crate::protocol::state::ProtocolRole;
use crate::protocol::{Message, MessageHandlerFn, Protocol, ProtocolError, ProtocolOptions};

///
/// The local-state-query server. It never speaks first: every message it
/// receives is handed to the matching callback and the callback's answer is
/// sent back. A message whose callback is not configured fails the instance.
///
pub struct LocalStateQueryServer {
    protocol: Protocol<LocalStateQueryMessage>,
    features: Features,
}

// dispatches inbound messages to the configured callbacks
struct Dispatcher {
    config: LocalStateQueryConfig,
    features: Features,
}

impl Dispatcher {
    fn handle(&self, message: LocalStateQueryMessage) -> Result<Option<LocalStateQueryMessage>, ProtocolError> {
        match message {
            LocalStateQueryMessage::Acquire { point } => {
                self.acquire(&self.config.acquire_callback, "Acquire", Some(point))
            }
            LocalStateQueryMessage::AcquireNoPoint => {
                self.acquire(&self.config.acquire_callback, "Acquire", None)
            }
            LocalStateQueryMessage::ReAcquire { point } => {
                self.acquire(&self.config.reacquire_callback, "ReAcquire", Some(point))
            }
            LocalStateQueryMessage::ReAcquireNoPoint => {
                self.acquire(&self.config.reacquire_callback, "ReAcquire", None)
            }
            LocalStateQueryMessage::Query { query } => self.query(query),
            LocalStateQueryMessage::Release => {
                let callback = self
                    .config
                    .release_callback
                    .as_ref()
                    .ok_or_else(|| missing_handler("Release"))?;
                callback().map_err(|err| ProtocolError::callback(PROTOCOL_NAME, err))?;
                Ok(None)
            }
            LocalStateQueryMessage::Done => {
                let callback = self
                    .config
                    .done_callback
                    .as_ref()
                    .ok_or_else(|| missing_handler("Done"))?;
                callback().map_err(|err| ProtocolError::callback(PROTOCOL_NAME, err))?;
                Ok(None)
            }
            other => Err(ProtocolError::UnhandledMessage {
                protocol: PROTOCOL_NAME,
                message: other.name(),
            }),
        }
    }

    fn acquire(
        &self,
        callback: &Option<AcquireFn>,
        message: &'static str,
        point: Option<Point>,
    ) -> Result<Option<LocalStateQueryMessage>, ProtocolError> {
        let callback = callback.as_ref().ok_or_else(|| missing_handler(message))?;
        match &point {
            Some(point) => event!(Level::DEBUG, "{}: {} at {}", PROTOCOL_NAME, message, point),
            None => event!(Level::DEBUG, "{}: {} at tip", PROTOCOL_NAME, message),
        }
        let reply = match callback(point).map_err(|err| ProtocolError::callback(PROTOCOL_NAME, err))? {
            AcquireOutcome::Acquired => LocalStateQueryMessage::Acquired,
            AcquireOutcome::Failure(failure) => LocalStateQueryMessage::Failure { failure },
        };
        Ok(Some(reply))
    }

    fn query(&self, query: Query) -> Result<Option<LocalStateQueryMessage>, ProtocolError> {
        let callback = self
            .config
            .query_callback
            .as_ref()
            .ok_or_else(|| missing_handler("Query"))?;
        if !self.features.permits(&query) {
            return Err(ProtocolError::UnsupportedFeature {
                protocol: PROTOCOL_NAME,
                feature: query.name(),
                required_version: query.required_version().unwrap_or_default(),
                negotiated_version: self.features.version,
            });
        }
        event!(Level::DEBUG, "{}: query {}", PROTOCOL_NAME, query.name());
        let result = callback(query).map_err(|err| ProtocolError::callback(PROTOCOL_NAME, err))?;
        match cbor::item_length(&result) {
            Ok(Some(length)) if length == result.len() => {}
            _ => {
                return Err(ProtocolError::Callback {
                    protocol: PROTOCOL_NAME,
                    reason: String::from("query result is not a single CBOR data item"),
                })
            }
        }
        Ok(Some(LocalStateQueryMessage::Result { result }))
    }
}

fn missing_handler(message: &'static str) -> ProtocolError {
    ProtocolError::MissingHandler {
        protocol: PROTOCOL_NAME,
        message,
    }
}

impl LocalStateQueryServer {
    pub fn new(options: ProtocolOptions, config: LocalStateQueryConfig) -> Result<Self, ProtocolError> {
        let features = Features::for_version(options.version);
        event!(Level::DEBUG, "{}: server features {:?}", PROTOCOL_NAME, features);
        let dispatcher = Dispatcher {
            config: config.clone(),
            features,
        };
        let handler: MessageHandlerFn<LocalStateQueryMessage> = Arc::new(
            move |message: LocalStateQueryMessage| -> Result<Option<LocalStateQueryMessage>, ProtocolError> {
                dispatcher.handle(message)
            },
        );
        let protocol = Protocol::new(protocol_config(ProtocolRole::Server, &config, handler), options)?;
        Ok(LocalStateQueryServer { protocol, features })
    }

    pub fn start(&self) {
        self.protocol.start();
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn protocol(&self) -> &Protocol<LocalStateQueryMessage> {
        &self.protocol
    }
}
