//! Serde helpers for decoding inbound frames.
//!
//! When the `tracing` feature is enabled, a failed decode is logged together with the JSON
//! path at which deserialization stopped, which makes protocol drift easy to spot.

use serde::de::DeserializeOwned;

use crate::ws::WsError;

/// Deserialize a JSON frame, logging the failing path on error.
#[cfg(feature = "tracing")]
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> crate::Result<T> {
    use std::any::type_name;

    let mut deserializer = serde_json::Deserializer::from_slice(bytes);
    let value: T = serde_path_to_error::deserialize(&mut deserializer).map_err(|path_err| {
        tracing::warn!(
            type_name = %type_name::<T>(),
            path = %path_err.path(),
            error = %path_err.inner(),
            "frame deserialization failed"
        );
        WsError::MessageParse(path_err.into_inner())
    })?;
    deserializer.end().map_err(WsError::MessageParse)?;

    Ok(value)
}

/// Plain deserialization when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> crate::Result<T> {
    Ok(serde_json::from_slice(bytes).map_err(WsError::MessageParse)?)
}
