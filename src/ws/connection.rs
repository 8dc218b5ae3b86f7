#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::config::{ClientConfig, DecodePolicy};
use super::diagnostics::Diagnostics;
use super::error::WsError;
use super::traits::FrameHandler;
use super::transport::{self, WsStream};
use crate::Result;
use crate::error::Error;

type WsSink = SplitSink<WsStream, Message>;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting before the next connection attempt
    Reconnecting {
        /// Consecutive failed connection attempts so far
        attempt: u32,
    },
    /// The supervisor has exited and will not reconnect
    Stopped,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// What the client hands over to the supervisor on start, and gets back if starting fails.
pub(crate) struct Parts<H> {
    pub(crate) handler: H,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) sender_rx: mpsc::UnboundedReceiver<String>,
}

/// Owns the socket and runs the connect, pump, reconnect cycle until cancelled.
///
/// Everything the supervisor touches (socket, handler, received payloads) lives on its task.
/// Callers reach it only through the outbound queue, the shared last sent slot and the
/// cancellation token.
pub(crate) struct Supervisor<H: FrameHandler> {
    endpoint: Url,
    config: ClientConfig,
    handler: H,
    diagnostics: Diagnostics,
    sender_rx: mpsc::UnboundedReceiver<String>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl<H: FrameHandler> Supervisor<H> {
    pub(crate) fn new(
        endpoint: Url,
        config: ClientConfig,
        parts: Parts<H>,
        state_tx: watch::Sender<ConnectionState>,
        shutdown: CancellationToken,
    ) -> Self {
        let Parts {
            handler,
            diagnostics,
            sender_rx,
        } = parts;

        Self {
            endpoint,
            config,
            handler,
            diagnostics,
            sender_rx,
            state_tx,
            shutdown,
        }
    }

    /// Give back what [`Supervisor::new`] took, for a supervisor that never ran.
    pub(crate) fn into_parts(self) -> Parts<H> {
        Parts {
            handler: self.handler,
            diagnostics: self.diagnostics,
            sender_rx: self.sender_rx,
        }
    }

    /// Main connection loop with automatic reconnection.
    pub(crate) async fn run(mut self) {
        let mut attempt = 0_u32;
        let mut backoff: ExponentialBackoff = self.config.reconnect.clone().into();

        while !self.shutdown.is_cancelled() {
            _ = self.state_tx.send(ConnectionState::Connecting);

            #[cfg(feature = "tracing")]
            tracing::debug!(endpoint = %self.endpoint, attempt, "Connecting");

            let connected = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                result = transport::connect(&self.config, &self.endpoint) => result,
            };

            match connected {
                Ok(ws_stream) => {
                    attempt = 0;
                    backoff.reset();
                    self.discard_stale_packets();
                    _ = self.state_tx.send(ConnectionState::Connected {
                        since: Instant::now(),
                    });

                    #[cfg(feature = "tracing")]
                    tracing::info!(endpoint = %self.endpoint, "WebSocket connected");

                    let outcome = self.handle_connection(ws_stream).await;
                    _ = self.state_tx.send(ConnectionState::Disconnected);

                    if let Err(e) = outcome {
                        self.report(&e);
                    }

                    #[cfg(feature = "tracing")]
                    tracing::info!(endpoint = %self.endpoint, "WebSocket disconnected");

                    if let Err(e) = self.guard("on_disconnected", H::on_disconnected) {
                        self.report(&e);
                    }
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(endpoint = %self.endpoint, error = %e, "Unable to connect");
                    attempt = attempt.saturating_add(1);
                    self.report(&e);
                }
            }

            // Check if we should stop reconnecting
            if let Some(max) = self.config.reconnect.max_attempts
                && attempt >= max
            {
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, "Giving up after maximum reconnection attempts");
                break;
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            // Update state and wait with exponential backoff
            _ = self.state_tx.send(ConnectionState::Reconnecting { attempt });

            match backoff.next_backoff() {
                Some(delay) if !delay.is_zero() => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(?delay, "Waiting before reconnecting");

                    tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => break,
                        () = sleep(delay) => {}
                    }
                }
                // Keep the scheduler cooperative even when retrying without delay
                _ => tokio::task::yield_now().await,
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, "Supervisor stopped");

        _ = self.state_tx.send(ConnectionState::Stopped);
    }

    /// Handle an established connection until it closes, fails or the client stops.
    async fn handle_connection(&mut self, ws_stream: WsStream) -> Result<()> {
        let (mut write, mut read) = ws_stream.split();

        self.guard("on_connected", H::on_connected)?;

        let ping_interval = self.config.ping_interval;
        let ping_enabled = !ping_interval.is_zero();
        let period = if ping_enabled {
            ping_interval
        } else {
            Duration::from_secs(3600)
        };
        let mut ping = interval_at(tokio::time::Instant::now() + period, period);
        let mut last_seen = tokio::time::Instant::now();

        loop {
            if self.shutdown.is_cancelled() {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.endpoint, "Closing WebSocket connection");

                close(&mut write, &mut read, self.config.write_timeout).await;
                return Ok(());
            }

            // Whatever is queued goes out before the next inbound frame is handled, so a
            // server that never stops talking cannot hold back subscriptions.
            while let Ok(text) = self.sender_rx.try_recv() {
                write_text(&mut write, text, self.config.write_timeout).await?;
            }

            tokio::select! {
                () = self.shutdown.cancelled() => {}

                // Handle incoming messages
                msg = read.next() => {
                    match msg {
                        Some(Ok(message)) => {
                            last_seen = tokio::time::Instant::now();
                            if !self.dispatch(message)? {
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => return Err(WsError::Connection(e).into()),
                        // Stream ended without a close frame
                        None => return Err(WsError::ConnectionClosed.into()),
                    }
                }

                // Handle outgoing packets, in submission order
                Some(text) = self.sender_rx.recv() => {
                    write_text(&mut write, text, self.config.write_timeout).await?;
                }

                _ = ping.tick(), if ping_enabled => {
                    let heartbeat_timeout = self.config.heartbeat_timeout;
                    if !heartbeat_timeout.is_zero()
                        && last_seen.elapsed() > ping_interval.saturating_add(heartbeat_timeout)
                    {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            silent_for = ?last_seen.elapsed(),
                            "Heartbeat timeout: nothing received from the server"
                        );
                        return Err(WsError::Timeout { operation: "heartbeat" }.into());
                    }

                    send(&mut write, Message::Ping(Vec::new().into()), self.config.write_timeout).await?;
                }
            }
        }
    }

    /// Route one inbound message. Returns `false` once the peer closed the connection.
    fn dispatch(&mut self, message: Message) -> Result<bool> {
        match message {
            Message::Text(text) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(text = %text.as_str(), "Received WebSocket text message");

                self.diagnostics.record_received(&text);
                let decoded = self.guard("unpack", |handler| handler.unpack(&text))?;
                self.deliver(decoded)?;
            }
            Message::Binary(data) => {
                self.diagnostics
                    .record_received(&String::from_utf8_lossy(&data));
                let decoded = self.guard("unpack_binary", |handler| handler.unpack_binary(&data))?;
                self.deliver(decoded)?;
            }
            Message::Close(frame) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(?frame, "Server closed the connection");
                #[cfg(not(feature = "tracing"))]
                let _ = &frame;
                return Ok(false);
            }
            // PING replies are queued by tungstenite itself; PONG only refreshes liveness.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }

        Ok(true)
    }

    fn deliver(&mut self, decoded: Result<H::Packet>) -> Result<()> {
        match decoded {
            Ok(packet) => self.guard("on_packet", |handler| handler.on_packet(packet)),
            Err(e) => match self.config.decode_policy {
                DecodePolicy::SkipFrame => {
                    self.report(&e);
                    Ok(())
                }
                DecodePolicy::FailConnection => Err(e),
            },
        }
    }

    /// Packets queued for a previous connection are never written to a new one.
    ///
    /// Only packets accepted in the instant between a failed write and the state leaving
    /// `Connected` end up here; everything else is flushed while the socket is up.
    fn discard_stale_packets(&mut self) {
        let mut discarded = 0_usize;
        while let Ok(stale) = self.sender_rx.try_recv() {
            discarded = discarded.saturating_add(1);

            #[cfg(feature = "tracing")]
            tracing::warn!(text = %stale, "Discarding packet queued for a previous connection");
            #[cfg(not(feature = "tracing"))]
            let _ = &stale;
        }

        if discarded > 0 {
            let error = Error::from(WsError::Discarded { packets: discarded });
            self.report(&error);
        }
    }

    /// Run a handler callback, converting a panic into an error.
    fn guard<R, F>(&mut self, callback: &'static str, f: F) -> Result<R>
    where
        F: FnOnce(&mut H) -> R,
    {
        let handler = &mut self.handler;
        catch_unwind(AssertUnwindSafe(|| f(handler))).map_err(|payload| {
            Error::from(WsError::HandlerPanicked {
                callback,
                message: panic_message(payload.as_ref()),
            })
        })
    }

    /// Hand `error` to the handler. Never panics.
    fn report(&mut self, error: &Error) {
        let handler = &mut self.handler;
        let diagnostics = &self.diagnostics;

        if catch_unwind(AssertUnwindSafe(|| handler.on_error(error, diagnostics))).is_err() {
            #[cfg(feature = "tracing")]
            tracing::error!("Handler panicked in on_error, falling back to the default report");
            diagnostics.report(error);
        }
    }
}

async fn write_text(write: &mut WsSink, text: String, write_timeout: Duration) -> Result<()> {
    #[cfg(feature = "tracing")]
    tracing::trace!(%text, "Sending WebSocket text message");

    send(write, Message::Text(text.into()), write_timeout).await
}

async fn send(write: &mut WsSink, message: Message, write_timeout: Duration) -> Result<()> {
    match timeout(write_timeout, write.send(message)).await {
        Ok(result) => Ok(result?),
        Err(_elapsed) => Err(WsError::Timeout { operation: "write" }.into()),
    }
}

/// Send a close frame and give the peer a chance to acknowledge it.
async fn close(write: &mut WsSink, read: &mut SplitStream<WsStream>, write_timeout: Duration) {
    if send(write, Message::Close(None), write_timeout).await.is_err() {
        return;
    }

    _ = timeout(write_timeout, async {
        while let Some(Ok(_)) = read.next().await {}
    })
    .await;
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
