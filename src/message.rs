//! DXL message data model (spec §3): Event, Request, Response, Error.
//!
//! Modeled as a tagged variant carrying a common [`Header`] and a
//! kind-specific [`Body`] tail, per spec §9's design note — encode/decode
//! (see [`crate::codec`]) dispatch on the `kind` tag the same way.

use std::collections::HashMap;

use crate::error::DxlError;

pub const WIRE_VERSION: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Event = 0,
    Request = 1,
    Response = 2,
    Error = 3,
}

impl MessageKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MessageKind::Event),
            1 => Some(MessageKind::Request),
            2 => Some(MessageKind::Response),
            3 => Some(MessageKind::Error),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Fields common to every message variant (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub message_id: String,
    pub source_client_id: String,
    pub source_client_instance_id: String,
    pub source_broker_id: String,
    pub destination_topic: String,
    pub payload: Vec<u8>,
    pub broker_ids: Vec<String>,
    pub client_ids: Vec<String>,
    pub other_fields: HashMap<String, String>,
    pub source_tenant_id: String,
    pub destination_tenant_ids: Vec<String>,
}

impl Header {
    fn new(source_client_id: impl Into<String>, destination_topic: impl Into<String>) -> Self {
        Header {
            version: WIRE_VERSION,
            message_id: format!("{}", crate::id::UniqueId::new()),
            source_client_id: source_client_id.into(),
            source_client_instance_id: String::new(),
            source_broker_id: String::new(),
            destination_topic: destination_topic.into(),
            payload: Vec::new(),
            broker_ids: Vec::new(),
            client_ids: Vec::new(),
            other_fields: HashMap::new(),
            source_tenant_id: String::new(),
            destination_tenant_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Event,
    Request {
        reply_to_topic: String,
        service_id: String,
    },
    Response {
        request_message_id: String,
        service_id: String,
    },
    Error {
        request_message_id: String,
        service_id: String,
        error_code: i32,
        error_message: String,
    },
}

/// A complete DXL message: common header plus kind-specific tail.
///
/// The in-process back-reference from a `Response` to the `Request` it
/// answers (spec §9) is held alongside, not inside, the wire-visible body —
/// it must never be serialized, and encoding never looks at it.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub body: Body,
    pub in_reply_to: Option<Box<Message>>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.body == other.body
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self.body {
            Body::Event => MessageKind::Event,
            Body::Request { .. } => MessageKind::Request,
            Body::Response { .. } => MessageKind::Response,
            Body::Error { .. } => MessageKind::Error,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.header.message_id
    }

    pub fn destination_topic(&self) -> &str {
        &self.header.destination_topic
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.header.payload = payload.into();
        self
    }

    pub fn with_other_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.other_fields.insert(key.into(), value.into());
        self
    }

    pub fn with_source_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.header.source_tenant_id = tenant_id.into();
        self
    }

    pub fn new_event(source_client_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Message {
            header: Header::new(source_client_id, topic),
            body: Body::Event,
            in_reply_to: None,
        }
    }

    pub fn new_request(
        source_client_id: impl Into<String>,
        topic: impl Into<String>,
        reply_to_topic: impl Into<String>,
    ) -> Self {
        Message {
            header: Header::new(source_client_id, topic),
            body: Body::Request {
                reply_to_topic: reply_to_topic.into(),
                service_id: String::new(),
            },
            in_reply_to: None,
        }
    }

    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        match &mut self.body {
            Body::Request { service_id: s, .. } => *s = service_id.into(),
            _ => panic!("with_service_id is only valid on Request messages"),
        }
        self
    }

    /// Build a Response for `request`, per spec §3 invariant: the
    /// destination is the request's reply-to topic and the routing sets
    /// are `{originating client id}`/`{originating broker id}`.
    pub fn new_response(
        source_client_id: impl Into<String>,
        request: &Message,
    ) -> Result<Self, DxlError> {
        let (reply_to_topic, service_id) = match &request.body {
            Body::Request {
                reply_to_topic,
                service_id,
            } => (reply_to_topic.clone(), service_id.clone()),
            _ => {
                return Err(DxlError::Malformed(
                    "Response can only be built from a Request".into(),
                ))
            }
        };

        let mut header = Header::new(source_client_id, reply_to_topic);
        header.client_ids = vec![request.header.source_client_id.clone()];
        header.broker_ids = vec![request.header.source_broker_id.clone()];

        Ok(Message {
            header,
            body: Body::Response {
                request_message_id: request.header.message_id.clone(),
                service_id,
            },
            in_reply_to: Some(Box::new(request.clone())),
        })
    }

    /// Build a fabric Error in response to `request` (spec §4.4/§6).
    pub fn new_error_response(
        source_client_id: impl Into<String>,
        request: &Message,
        error_code: i32,
        error_message: impl Into<String>,
    ) -> Result<Self, DxlError> {
        let (reply_to_topic, service_id) = match &request.body {
            Body::Request {
                reply_to_topic,
                service_id,
            } => (reply_to_topic.clone(), service_id.clone()),
            _ => {
                return Err(DxlError::Malformed(
                    "Error response can only be built from a Request".into(),
                ))
            }
        };

        let mut header = Header::new(source_client_id, reply_to_topic);
        header.client_ids = vec![request.header.source_client_id.clone()];
        header.broker_ids = vec![request.header.source_broker_id.clone()];

        Ok(Message {
            header,
            body: Body::Error {
                request_message_id: request.header.message_id.clone(),
                service_id,
                error_code,
                error_message: error_message.into(),
            },
            in_reply_to: Some(Box::new(request.clone())),
        })
    }
}
