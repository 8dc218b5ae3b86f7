//! Callback contract implemented by concrete protocol clients.

use serde::de::DeserializeOwned;

use super::diagnostics::Diagnostics;
use crate::Result;
use crate::error::Error;
use crate::serde_helpers::decode_json;

/// Lifecycle hooks of a [`Client`](crate::ws::Client) speaking JSON.
///
/// Inbound frames are decoded with `serde_json` unless [`Handler::unpack`] is overridden.
/// Protocols whose packets are not [`DeserializeOwned`] implement [`FrameHandler`] instead;
/// every `Handler` is a `FrameHandler` through a blanket implementation.
///
/// The handler is moved into the connection supervisor on
/// [`Client::start`](crate::ws::Client::start), and every hook runs on the supervisor's task,
/// one at a time, so implementations can keep plain mutable state.
///
/// Hooks should return quickly: inbound frames are not read while a hook is running.
/// A panic inside any hook is caught and reported through [`Handler::on_error`], after which
/// the connection is dropped and re-established.
///
/// # Example
///
/// ```
/// use resilient_ws::ws::Handler;
/// use serde_json::{Map, Value};
///
/// struct Ticker {
///     last_price: Option<f64>,
/// }
///
/// impl Handler for Ticker {
///     type Packet = Map<String, Value>;
///
///     fn on_packet(&mut self, packet: Self::Packet) {
///         self.last_price = packet.get("price").and_then(Value::as_f64);
///     }
/// }
/// ```
pub trait Handler: Send + 'static {
    /// Decoded form of an inbound frame.
    type Packet: DeserializeOwned;

    /// Called once per established connection, before any packet is delivered.
    fn on_connected(&mut self) {}

    /// Called once per established connection, after it ends for any reason.
    fn on_disconnected(&mut self) {}

    /// Called for every decoded inbound frame, in wire order.
    fn on_packet(&mut self, packet: Self::Packet);

    /// Called for every connection-level failure.
    ///
    /// The default prints [`Diagnostics::exception_detail`] to standard output.
    fn on_error(&mut self, error: &Error, diagnostics: &Diagnostics) {
        diagnostics.report(error);
    }

    /// Decode a text frame. Defaults to JSON.
    fn unpack(&self, text: &str) -> Result<Self::Packet> {
        decode_json(text.as_bytes())
    }

    /// Decode a binary frame. Defaults to JSON.
    fn unpack_binary(&self, data: &[u8]) -> Result<Self::Packet> {
        decode_json(data)
    }
}

/// Lifecycle hooks of a [`Client`](crate::ws::Client) for any frame encoding.
///
/// Same contract as [`Handler`], except that the packet type is unconstrained and decoding
/// is left to the implementation.
///
/// # Example
///
/// ```
/// use resilient_ws::Result;
/// use resilient_ws::error::Error;
/// use resilient_ws::ws::FrameHandler;
///
/// /// Frames look like `BTC-USD 67012.5`.
/// struct Quotes {
///     last: Option<(String, f64)>,
/// }
///
/// impl FrameHandler for Quotes {
///     type Packet = (String, f64);
///
///     fn on_packet(&mut self, packet: Self::Packet) {
///         self.last = Some(packet);
///     }
///
///     fn unpack(&self, text: &str) -> Result<Self::Packet> {
///         let (symbol, price) = text
///             .split_once(' ')
///             .ok_or_else(|| Error::validation(format!("malformed quote `{text}`")))?;
///         let price = price
///             .parse()
///             .map_err(|_e| Error::validation(format!("malformed price `{price}`")))?;
///         Ok((symbol.to_owned(), price))
///     }
///
///     fn unpack_binary(&self, data: &[u8]) -> Result<Self::Packet> {
///         self.unpack(&String::from_utf8_lossy(data))
///     }
/// }
/// ```
pub trait FrameHandler: Send + 'static {
    /// Decoded form of an inbound frame.
    type Packet;

    /// See [`Handler::on_connected`].
    fn on_connected(&mut self) {}

    /// See [`Handler::on_disconnected`].
    fn on_disconnected(&mut self) {}

    /// See [`Handler::on_packet`].
    fn on_packet(&mut self, packet: Self::Packet);

    /// See [`Handler::on_error`].
    fn on_error(&mut self, error: &Error, diagnostics: &Diagnostics) {
        diagnostics.report(error);
    }

    /// Decode a text frame.
    fn unpack(&self, text: &str) -> Result<Self::Packet>;

    /// Decode a binary frame.
    fn unpack_binary(&self, data: &[u8]) -> Result<Self::Packet>;
}

impl<T: Handler> FrameHandler for T {
    type Packet = T::Packet;

    fn on_connected(&mut self) {
        Handler::on_connected(self);
    }

    fn on_disconnected(&mut self) {
        Handler::on_disconnected(self);
    }

    fn on_packet(&mut self, packet: Self::Packet) {
        Handler::on_packet(self, packet);
    }

    fn on_error(&mut self, error: &Error, diagnostics: &Diagnostics) {
        Handler::on_error(self, error, diagnostics);
    }

    fn unpack(&self, text: &str) -> Result<Self::Packet> {
        Handler::unpack(self, text)
    }

    fn unpack_binary(&self, data: &[u8]) -> Result<Self::Packet> {
        Handler::unpack_binary(self, data)
    }
}
