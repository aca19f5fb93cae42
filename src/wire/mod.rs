//! The minimal MQTT driver interface (spec §1/§4.2, design note resolved
//! in `SPEC_FULL.md` §3).
//!
//! The fabric's actual MQTT transport is assumed available and is consumed
//! through [`MqttDriver`], modeled on `mqtt-sync-client::io`'s
//! `Sender`/`Receiver`/`TryClone` split. [`blocking::BlockingDriver`] is the
//! one production implementation: a small QoS 0/1 MQTT v3.1.1 control-packet
//! codec running generically over any `Read + Write + TryClone + Send`
//! transport.

pub mod blocking;
pub mod packet;
pub mod transport;

use std::time::Duration;

use crate::error::DxlError;

/// Something the driver received from the broker and must hand up to the
/// dispatch layer (C6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A PUBLISH arrived for a topic we are subscribed to.
    Publish { topic: String, payload: Vec<u8> },
    /// The broker or transport closed the connection.
    Disconnected,
}

/// The seam between the DXL client and the underlying MQTT connection
/// (spec §4.2). Implementations own one live connection; reconnecting means
/// constructing a new driver.
pub trait MqttDriver: Send {
    /// Send CONNECT and block for CONNACK.
    fn connect(&mut self, client_id: &str, keep_alive: Duration) -> Result<(), DxlError>;

    /// Publish at QoS 0 (events) or QoS 1 (requests/responses, spec §4.5).
    fn publish(&mut self, topic: &str, payload: &[u8], qos1: bool) -> Result<(), DxlError>;

    fn subscribe(&mut self, topic_filter: &str) -> Result<(), DxlError>;

    fn unsubscribe(&mut self, topic_filter: &str) -> Result<(), DxlError>;

    fn ping(&mut self) -> Result<(), DxlError>;

    fn disconnect(&mut self) -> Result<(), DxlError>;

    /// Block until the next broker-originated event, or return `None` if
    /// `timeout` elapses first.
    fn next_event(&mut self, timeout: Duration) -> Result<Option<DriverEvent>, DxlError>;
}
