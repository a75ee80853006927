use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{event, Level};

use super::{
    protocol_config, KeepAliveConfig, KeepAliveMessage, PROTOCOL_NAME, STATE_CLIENT,
};
use crate::protocol::state::ProtocolRole;
use crate::protocol::{Message, MessageHandlerFn, Protocol, ProtocolError, ProtocolOptions};

// cookies are handed out in sequence starting from the seed; at most one is
// outstanding until its response has been checked
#[derive(Debug)]
struct CookieTracker {
    next: u16,
    outstanding: Option<u16>,
}

impl CookieTracker {
    fn new(seed: u16) -> Self {
        CookieTracker {
            next: seed,
            outstanding: None,
        }
    }

    fn take(&mut self) -> Option<u16> {
        if self.outstanding.is_some() {
            return None;
        }
        let cookie = self.next;
        self.next = self.next.wrapping_add(1);
        self.outstanding = Some(cookie);
        Some(cookie)
    }

    fn settle(&mut self) -> Option<u16> {
        self.outstanding.take()
    }
}

///
/// The keep-alive client. Sends a `KeepAlive` as soon as it is started and
/// then once every period until the instance is done.
///
#[derive(Clone)]
pub struct KeepAliveClient {
    protocol: Protocol<KeepAliveMessage>,
    config: KeepAliveConfig,
    tracker: Arc<Mutex<CookieTracker>>,
    started: Arc<AtomicBool>,
}

impl KeepAliveClient {
    pub fn new(options: ProtocolOptions, config: KeepAliveConfig) -> Result<Self, ProtocolError> {
        let seed = config.cookie.unwrap_or_else(rand::random);
        let tracker = Arc::new(Mutex::new(CookieTracker::new(seed)));

        let handler_tracker = tracker.clone();
        let verify_cookie = config.verify_cookie;
        let response_callback = config.response_callback.clone();
        let handler: MessageHandlerFn<KeepAliveMessage> = Arc::new(
            move |message: KeepAliveMessage| -> Result<Option<KeepAliveMessage>, ProtocolError> {
                let cookie = match message {
                    KeepAliveMessage::KeepAliveResponse { cookie } => cookie,
                    other => {
                        return Err(ProtocolError::UnhandledMessage {
                            protocol: PROTOCOL_NAME,
                            message: other.name(),
                        })
                    }
                };
                let expected = match handler_tracker.lock() {
                    Ok(mut tracker) => tracker.settle(),
                    Err(_) => None,
                };
                if verify_cookie && expected != Some(cookie) {
                    return Err(ProtocolError::CookieMismatch {
                        protocol: PROTOCOL_NAME,
                        expected: expected.unwrap_or_default(),
                        received: cookie,
                    });
                }
                event!(Level::DEBUG, "{}: response with cookie {}", PROTOCOL_NAME, cookie);
                if let Some(callback) = &response_callback {
                    callback(cookie).map_err(|err| ProtocolError::callback(PROTOCOL_NAME, err))?;
                }
                Ok(None)
            },
        );

        let protocol = Protocol::new(protocol_config(ProtocolRole::Client, &config, handler), options)?;
        Ok(KeepAliveClient {
            protocol,
            config,
            tracker,
            started: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn protocol(&self) -> &Protocol<KeepAliveMessage> {
        &self.protocol
    }

    ///
    /// Start the engine, send the first `KeepAlive` and arm the periodic
    /// timer. Calls after the first have no effect.
    ///
    pub async fn start(&self) -> Result<(), ProtocolError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.protocol.start();
        self.send_keep_alive().await?;

        let client = self.clone();
        tokio::spawn(async move {
            client.run_timer().await;
        });
        Ok(())
    }

    /// End the conversation with `Done`. The timer stops with the instance.
    pub async fn stop(&self) -> Result<(), ProtocolError> {
        if self.protocol.is_done() {
            return Ok(());
        }
        if self.protocol.current_state() == STATE_CLIENT {
            self.protocol.send_message(KeepAliveMessage::Done).await
        } else {
            // a response is outstanding, so Done cannot be sent yet
            self.protocol.stop();
            Ok(())
        }
    }

    async fn send_keep_alive(&self) -> Result<(), ProtocolError> {
        let cookie = match self.tracker.lock() {
            Ok(mut tracker) => tracker.take(),
            Err(_) => {
                return Err(ProtocolError::Stopped {
                    protocol: PROTOCOL_NAME,
                })
            }
        };
        // the previous response is still being checked by the handler
        let cookie = match cookie {
            Some(cookie) => cookie,
            None => {
                event!(Level::DEBUG, "{}: cookie outstanding, skipping tick", PROTOCOL_NAME);
                return Ok(());
            }
        };
        event!(Level::DEBUG, "{}: sending cookie {}", PROTOCOL_NAME, cookie);
        self.protocol
            .send_message(KeepAliveMessage::KeepAlive { cookie })
            .await
    }

    async fn run_timer(&self) {
        let period = self.config.period;
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.protocol.done() => break,
                _ = interval.tick() => {
                    if self.protocol.current_state() != STATE_CLIENT {
                        event!(Level::DEBUG, "{}: response outstanding, skipping tick", PROTOCOL_NAME);
                        continue;
                    }
                    if self.send_keep_alive().await.is_err() {
                        break;
                    }
                }
            }
        }
        event!(Level::DEBUG, "{}: timer stopped", PROTOCOL_NAME);
    }
}
