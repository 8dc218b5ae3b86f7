use std::fmt;
use std::sync::{Mutex, OnceLock, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::config::ClientConfig;
use super::connection::{ConnectionState, Parts, Supervisor};
use super::diagnostics::{Diagnostics, SentRecorder};
use super::error::WsError;
use super::runtime::ExecutionContext;
use super::traits::FrameHandler;
use crate::Result;
use crate::error::Error;

/// Persistent websocket client.
///
/// Owns one connection to [`ClientConfig::host`] and keeps it alive in the background,
/// reconnecting after every failure until [`Client::stop`] is called. Protocol behaviour
/// lives in the [`Handler`](super::Handler) (or [`FrameHandler`]) supplied at construction.
///
/// All methods take `&self` and may be called from any thread; share the client with an
/// [`Arc`](std::sync::Arc) when several threads need it.
///
/// # Example
///
/// ```no_run
/// use resilient_ws::ws::config::ClientConfig;
/// use resilient_ws::ws::{Client, Handler};
/// use serde_json::{Map, Value, json};
///
/// struct Printer;
///
/// impl Handler for Printer {
///     type Packet = Map<String, Value>;
///
///     fn on_packet(&mut self, packet: Self::Packet) {
///         println!("{packet:?}");
///     }
/// }
///
/// # fn main() -> resilient_ws::Result<()> {
/// let config = ClientConfig::builder()
///     .host("wss://stream.example.com/ws")
///     .build();
/// let client = Client::new(config, Printer)?;
///
/// client.start()?;
/// // Wait for `on_connected` before sending
/// client.send_packet(&json!({"op": "subscribe", "args": ["trades"]}))?;
///
/// client.stop();
/// client.join()?;
/// # Ok(())
/// # }
/// ```
pub struct Client<H: FrameHandler> {
    config: ClientConfig,
    endpoint: Url,
    /// Handler, diagnostics and queue receiver, handed to the supervisor on start
    pending: Mutex<Option<Parts<H>>>,
    /// Sender channel for outgoing packets
    sender_tx: mpsc::UnboundedSender<String>,
    /// Last sent slot of the supervisor's diagnostics
    last_sent: SentRecorder,
    /// Watch channel sender for state changes
    state_tx: watch::Sender<ConnectionState>,
    /// Watch channel receiver for checking the current state
    state_rx: watch::Receiver<ConnectionState>,
    /// Cancelled by [`Client::stop`]; the supervisor runs while it is not
    shutdown: CancellationToken,
    context: OnceLock<ExecutionContext>,
}

impl<H: FrameHandler> Client<H> {
    /// Create a client. Nothing connects until [`Client::start`] is called.
    pub fn new(config: ClientConfig, handler: H) -> Result<Self> {
        let endpoint = config.endpoint()?;
        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let diagnostics = Diagnostics::new();
        let last_sent = diagnostics.sent_recorder();

        Ok(Self {
            config,
            endpoint,
            pending: Mutex::new(Some(Parts {
                handler,
                diagnostics,
                sender_rx,
            })),
            sender_tx,
            last_sent,
            state_tx,
            state_rx,
            shutdown: CancellationToken::new(),
            context: OnceLock::new(),
        })
    }

    /// Launch the execution context and start connecting.
    ///
    /// [`Handler::on_connected`](super::Handler::on_connected) fires once the connection is
    /// up; send packets only after it. A client can be started once; later calls, including
    /// after [`Client::stop`], fail. If the execution context cannot be created the client
    /// is left as it was and `start` may be retried.
    pub fn start(&self) -> Result<()> {
        self.launch_with(|supervisor| {
            ExecutionContext::launch(
                &self.config.scheduler,
                &self.config.thread_name,
                supervisor,
                Supervisor::run,
            )
        })
    }

    fn launch_with<L>(&self, launch: L) -> Result<()>
    where
        L: FnOnce(Supervisor<H>) -> std::result::Result<ExecutionContext, (Error, Supervisor<H>)>,
    {
        if self.shutdown.is_cancelled() {
            return Err(Error::validation("client has been stopped"));
        }

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let parts = pending
            .take()
            .ok_or_else(|| Error::validation("client already started"))?;

        let supervisor = Supervisor::new(
            self.endpoint.clone(),
            self.config.clone(),
            parts,
            self.state_tx.clone(),
            self.shutdown.clone(),
        );

        let context = match launch(supervisor) {
            Ok(context) => context,
            Err((e, supervisor)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(endpoint = %self.endpoint, error = %e, "Unable to start WebSocket client");

                *pending = Some(supervisor.into_parts());
                return Err(e);
            }
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, "WebSocket client started");

        self.context
            .set(context)
            .map_err(|_context| Error::validation("client already started"))
    }

    /// Stop reconnecting and close the socket.
    ///
    /// Returns immediately; the close completes in the background. Use [`Client::join`] or
    /// [`Client::stopped`] to wait for it. Safe to call at any time, any number of times.
    pub fn stop(&self) {
        #[cfg(feature = "tracing")]
        if !self.shutdown.is_cancelled() {
            tracing::debug!(endpoint = %self.endpoint, "Stopping WebSocket client");
        }

        self.shutdown.cancel();
    }

    /// Block until the background supervisor has exited.
    ///
    /// Returns immediately if the client was never started. Must not be called from inside
    /// an async runtime or from a handler callback; use [`Client::stopped`] there.
    pub fn join(&self) -> Result<()> {
        match self.context.get() {
            Some(context) => context.join(),
            None => Ok(()),
        }
    }

    /// Resolve once the background supervisor has exited.
    pub async fn stopped(&self) {
        if let Some(context) = self.context.get() {
            context.stopped().await;
        }
    }

    /// Serialize `packet` as JSON, record it as the last sent payload and queue it for
    /// sending.
    ///
    /// Fails with [`WsError::NotConnected`] when no socket is currently connected; the packet
    /// is dropped in that case.
    pub fn send_packet<T: Serialize + ?Sized>(&self, packet: &T) -> Result<()> {
        let text = serde_json::to_string(packet)?;
        self.send_text(text)
    }

    /// Record and queue an already serialized text frame, for non-JSON protocols.
    pub fn send_text(&self, text: String) -> Result<()> {
        if !self.state().is_connected() {
            #[cfg(feature = "tracing")]
            tracing::debug!(%text, "Dropping packet, WebSocket is not connected");
            return Err(WsError::NotConnected.into());
        }

        self.last_sent
            .record_then(text, |text| self.sender_tx.send(text))
            .map_err(|_e| WsError::NotConnected)?;
        Ok(())
    }

    /// Whether the supervisor is running and has not been asked to stop.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.shutdown.is_cancelled()
            && self
                .context
                .get()
                .is_some_and(|context| !context.is_finished())
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl<H: FrameHandler> Drop for Client<H> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<H: FrameHandler> fmt::Debug for Client<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint.as_str())
            .field("state", &self.state())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
