//! Transport layer for peerlink.
//!
//! A transport moves opaque byte chunks to remote endpoints named by opaque
//! identifier strings and reports back through a [`TransportCallback`]. The
//! session layer above owns framing, chunking and identity; this module also
//! hosts the wire codec and the per-identifier serializer/deserializer pair.

pub mod deserializer;
pub mod loopback;
pub mod protocol;
pub mod serializer;

use crate::utils::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use deserializer::{DeserializerEvent, DeserializerPhase, GrowableBuffer, MessageDeserializer};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use protocol::*;
pub use serializer::{Chunk, DeliveryAck, MessageSerializer};

/// Free-form per-event details reported by a transport
pub type ExtraInfo = serde_json::Map<String, serde_json::Value>;

/// `ExtraInfo` key carrying the signal strength of the remote endpoint
pub const EXTRA_SIGNAL_STRENGTH: &str = "rssi";

/// Connection state of a remote identifier on one transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Link established; bytes can flow
    Connected,
    /// Link being set up
    Connecting,
    /// Link lost
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connected => "connected",
            Self::Connecting => "connecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Signal strength carried in `extra`, if the transport reported one
pub fn signal_strength(extra: &ExtraInfo) -> Option<i32> {
    extra
        .get(EXTRA_SIGNAL_STRENGTH)
        .and_then(serde_json::Value::as_i64)
        .and_then(|rssi| i32::try_from(rssi).ok())
}

/// A byte-moving link technology (radio, socket, in-memory loop).
///
/// Implementations must be callable from any thread and must not invoke their
/// callback while holding locks the callback might need.
pub trait Transport: Send + Sync {
    /// Human-readable name
    fn name(&self) -> &str;

    /// Capability code, unique per transport kind within one session manager
    fn code(&self) -> u32;

    /// Make this endpoint discoverable
    fn advertise(&self);

    /// Look for remote endpoints
    fn scan_for_peers(&self);

    /// Stop all activity and drop the registered callback
    fn stop(&self);

    /// Queue `data` for `identifier`; `false` if the transport refused it.
    ///
    /// Acceptance is followed later by exactly one `data_sent` report.
    fn send_data(&self, data: &[u8], identifier: &str) -> bool;

    /// Largest chunk this transport moves to `identifier` in one operation
    fn mtu_for_identifier(&self, identifier: &str) -> usize;

    /// Register or clear the receiver of this transport's reports
    fn set_callback(&self, callback: Option<Arc<dyn TransportCallback>>);
}

/// Receiver of transport reports
pub trait TransportCallback: Send + Sync {
    /// Bytes arrived from `identifier`
    fn data_received(&self, transport: &dyn Transport, data: &[u8], identifier: &str);

    /// A previously accepted send finished; `error` is set if it failed
    fn data_sent(
        &self,
        transport: &dyn Transport,
        data: &[u8],
        identifier: &str,
        error: Option<TransportError>,
    );

    /// The connection state of `identifier` changed
    fn identifier_updated(
        &self,
        transport: &dyn Transport,
        identifier: &str,
        status: ConnectionStatus,
        extra: &ExtraInfo,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_signal_strength_from_extra() {
        let mut extra = ExtraInfo::new();
        assert_eq!(signal_strength(&extra), None);

        extra.insert(EXTRA_SIGNAL_STRENGTH.to_string(), Value::from(-61));
        assert_eq!(signal_strength(&extra), Some(-61));

        extra.insert(EXTRA_SIGNAL_STRENGTH.to_string(), Value::from("strong"));
        assert_eq!(signal_strength(&extra), None);
    }

    #[test]
    fn test_connection_status_display() {
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Disconnected).unwrap(),
            "\"disconnected\""
        );
    }
}
