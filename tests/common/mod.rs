#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Each test binary uses a different subset of these helpers"
)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use resilient_ws::error::{Error, Kind};
use resilient_ws::ws::config::ReconnectConfig;
use resilient_ws::ws::{Diagnostics, Handler};
use serde_json::{Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// How long a test waits for any single expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short, bounded backoff so reconnect tests run quickly.
pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig::with_bounds(Duration::from_millis(10), Duration::from_millis(50))
}

/// What the mock server does with each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Forward client frames to the test and push test frames to the client
    Serve,
    /// Complete the handshake and immediately close
    CloseImmediately,
    /// Complete the handshake and then neither read nor write
    Silent,
    /// Push `{"seq":n}` frames as fast as the socket takes them, still forwarding client
    /// frames to the test
    Flood,
}

#[derive(Debug, Clone)]
enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Mock WebSocket server.
pub struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast frames to ALL connected clients
    outbound_tx: broadcast::Sender<Outbound>,
    /// Frames received from clients, except pongs
    inbound_rx: mpsc::UnboundedReceiver<Message>,
    /// Handshake headers, one map per accepted connection
    headers_rx: mpsc::UnboundedReceiver<HashMap<String, String>>,
    connections: Arc<AtomicUsize>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    pub async fn start() -> Self {
        Self::start_with(Behavior::Serve).await
    }

    pub async fn start_with(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (outbound_tx, _) = broadcast::channel::<Outbound>(1024);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (headers_tx, headers_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));

        let broadcast_tx = outbound_tx.clone();
        let accepted = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                // Subscribe before the handshake completes so nothing sent after
                // `on_connected` can be missed.
                let outbound_rx = broadcast_tx.subscribe();
                let headers_tx = headers_tx.clone();
                let capture = move |request: &Request,
                                    response: Response|
                      -> Result<Response, ErrorResponse> {
                    let headers = request
                        .headers()
                        .iter()
                        .map(|(name, value)| {
                            (
                                name.as_str().to_owned(),
                                value.to_str().unwrap_or_default().to_owned(),
                            )
                        })
                        .collect();
                    drop(headers_tx.send(headers));
                    Ok(response)
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, capture).await
                else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                let inbound_tx = inbound_tx.clone();
                tokio::spawn(serve(ws_stream, behavior, outbound_rx, inbound_tx));
            }
        });

        Self {
            addr,
            outbound_tx,
            inbound_rx,
            headers_rx,
            connections,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Push a text frame to every connected client.
    pub fn send(&self, text: &str) {
        drop(self.outbound_tx.send(Outbound::Text(text.to_owned())));
    }

    /// Push a binary frame to every connected client.
    pub fn send_binary(&self, data: &[u8]) {
        drop(self.outbound_tx.send(Outbound::Binary(data.to_vec())));
    }

    /// Close every connected client from the server side.
    pub fn close_all(&self) {
        drop(self.outbound_tx.send(Outbound::Close));
    }

    /// Number of completed handshakes so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn recv_message(&mut self) -> Option<Message> {
        timeout(Duration::from_secs(2), self.inbound_rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn recv_text(&mut self) -> Option<String> {
        match self.recv_message().await? {
            Message::Text(text) => Some(text.as_str().to_owned()),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    pub async fn recv_headers(&mut self) -> Option<HashMap<String, String>> {
        timeout(Duration::from_secs(2), self.headers_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

async fn serve(
    ws_stream: WebSocketStream<TcpStream>,
    behavior: Behavior,
    mut outbound_rx: broadcast::Receiver<Outbound>,
    inbound_tx: mpsc::UnboundedSender<Message>,
) {
    let (mut write, mut read) = ws_stream.split();

    match behavior {
        Behavior::Serve => {}
        Behavior::CloseImmediately => {
            drop(write.send(Message::Close(None)).await);
            return;
        }
        Behavior::Silent => {
            // Hold both halves so the socket stays open but unresponsive
            sleep(Duration::from_secs(30)).await;
            drop((write, read));
            return;
        }
        Behavior::Flood => {
            let mut seq = 0_u64;
            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Pong(_))) => {}
                            Some(Ok(message)) => {
                                let closing = message.is_close();
                                drop(inbound_tx.send(message));
                                if closing {
                                    break;
                                }
                            }
                            _ => break,
                        }
                    }
                    sent = write.send(Message::Text(format!(r#"{{"seq":{seq}}}"#).into())) => {
                        if sent.is_err() {
                            break;
                        }
                        seq += 1;
                    }
                }
            }
            return;
        }
    }

    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(message)) => {
                        let closing = message.is_close();
                        drop(inbound_tx.send(message));
                        if closing {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            // Handle outgoing messages to client
            msg = outbound_rx.recv() => {
                match msg {
                    Ok(Outbound::Text(text)) => {
                        if write.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Outbound::Binary(data)) => {
                        if write.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Outbound::Close) => {
                        drop(write.send(Message::Close(None)).await);
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

/// Everything a [`Recorder`] observed, in callback order.
#[derive(Debug)]
pub enum Event {
    Connected,
    Disconnected,
    Packet(Map<String, Value>),
    Error {
        kind: Kind,
        message: String,
        last_sent: String,
        last_received: String,
        detail: String,
    },
}

impl Event {
    pub fn seq(&self) -> Option<i64> {
        match self {
            Self::Packet(packet) => packet.get("seq").and_then(Value::as_i64),
            _ => None,
        }
    }
}

/// Handler that forwards every callback to the test as an [`Event`].
pub struct Recorder {
    events: mpsc::UnboundedSender<Event>,
    panic_on_seq: Option<i64>,
    connect_delay: Option<Duration>,
}

impl Recorder {
    pub fn new() -> (Self, Events) {
        let (events, rx) = mpsc::unbounded_channel();
        let recorder = Self {
            events,
            panic_on_seq: None,
            connect_delay: None,
        };
        (recorder, Events(rx))
    }

    /// Panic inside `on_packet` when a packet with this `seq` arrives.
    pub fn panicking_on(mut self, seq: i64) -> Self {
        self.panic_on_seq = Some(seq);
        self
    }

    /// Block inside `on_connected` for `delay` after emitting [`Event::Connected`], so
    /// frames pile up unread while the socket is already usable.
    pub fn slow_to_connect(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    fn emit(&self, event: Event) {
        drop(self.events.send(event));
    }
}

impl Handler for Recorder {
    type Packet = Map<String, Value>;

    fn on_connected(&mut self) {
        self.emit(Event::Connected);
        if let Some(delay) = self.connect_delay {
            std::thread::sleep(delay);
        }
    }

    fn on_disconnected(&mut self) {
        self.emit(Event::Disconnected);
    }

    fn on_packet(&mut self, packet: Self::Packet) {
        if let Some(seq) = self.panic_on_seq
            && packet.get("seq").and_then(Value::as_i64) == Some(seq)
        {
            panic!("refusing packet {seq}");
        }
        self.emit(Event::Packet(packet));
    }

    fn on_error(&mut self, error: &Error, diagnostics: &Diagnostics) {
        self.emit(Event::Error {
            kind: error.kind(),
            message: error.to_string(),
            last_sent: diagnostics.last_sent(),
            last_received: diagnostics.last_received().to_owned(),
            detail: diagnostics.exception_detail(error),
        });
    }
}

/// Receiving side of a [`Recorder`].
pub struct Events(mpsc::UnboundedReceiver<Event>);

impl Events {
    /// Wait for the next event, failing the test if none arrives.
    pub async fn next(&mut self) -> Event {
        timeout(EVENT_TIMEOUT, self.0.recv())
            .await
            .expect("timed out waiting for a handler event")
            .expect("handler was dropped")
    }

    /// Skip events until one matches `predicate`.
    pub async fn until(&mut self, predicate: impl Fn(&Event) -> bool) -> Event {
        loop {
            let event = self.next().await;
            if predicate(&event) {
                return event;
            }
        }
    }

    pub async fn connected(&mut self) {
        self.until(|event| matches!(event, Event::Connected)).await;
    }

    /// Events already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.0.try_recv() {
            events.push(event);
        }
        events
    }
}
