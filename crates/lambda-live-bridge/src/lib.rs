//! Transport between the developer machine and deployed stubs.
//!
//! [`Bridge`] owns one broker connection. Outbound envelopes are fragmented
//! (or offloaded to a [`PayloadStore`] when oversized); inbound fragments are
//! reassembled, pointers resolved, self-echoes dropped, and the decoded
//! envelopes handed to the caller over a channel.

pub mod bridge;
pub mod broker;
pub mod error;
pub mod storage;

pub use bridge::{Bridge, BridgeConfig, Echo, Inbound};
pub use broker::memory::{MemoryBroker, MemoryHub};
pub use broker::mqtt::{MqttBroker, MqttConfig};
pub use broker::{Broker, BrokerMessage, Topics};
pub use error::{BridgeError, BrokerError, StorageError};
pub use storage::PayloadStore;

/// Generates the per-process identity stamped on outbound envelopes.
pub fn new_source_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}
