//! Client library for the Data Exchange Layer (DXL) fabric: an MQTT-based
//! publish/subscribe bus with a request/response overlay and a service
//! registry (spec §1).
//!
//! The public surface is [`DxlClient`], built from a [`ClientConfig`] loaded
//! with [`ClientConfig::load`] or constructed directly. Everything below the
//! facade — the wire codec, the MQTT driver, reconnect/backoff, topic
//! dispatch, and request correlation — is exposed as its own module so it
//! can be exercised independently in tests.

pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod message;
pub mod service;
pub mod topics;
pub mod transport;
pub mod wire;

pub use broker::{Broker, BrokerProtocol, ProxyConfig};
pub use client::{DxlClient, RequestCallback};
pub use config::ClientConfig;
pub use dispatch::EventCallback;
pub use error::{DxlError, Result};
pub use id::UniqueId;
pub use message::{Body, Message, MessageKind};
pub use service::{ServiceRegistrationBody, ServiceUnregistrationBody};
