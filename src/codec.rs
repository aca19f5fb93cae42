//! Versioned binary frame codec for DXL messages (C2, spec §4.1).
//!
//! The wire format is a small self-describing scheme in the spirit of
//! MessagePack: length-prefixed byte arrays and arrays-of-arrays, with
//! lengths written as signed 32-bit big-endian integers (a negative length
//! is how a corrupt frame is told apart from a legitimately empty one).
//! Sections are written/read in version order exactly as spec §4.1
//! describes; `encode` always emits the highest supported version
//! ([`WIRE_VERSION`]), and `decode` gates each extension section on the
//! frame's own version field so older frames decode with default-valued
//! newer fields.

use std::collections::HashMap;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::DxlError;
use crate::message::{Body, Header, Message, MessageKind, WIRE_VERSION};

fn malformed(what: impl Into<String>) -> DxlError {
    DxlError::Malformed(what.into())
}

fn write_len(buf: &mut Vec<u8>, len: usize) -> Result<(), DxlError> {
    let len = i32::try_from(len).map_err(|_| malformed("field too large to encode"))?;
    buf.write_i32::<BigEndian>(len).expect("write to Vec never fails");
    Ok(())
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), DxlError> {
    write_len(buf, bytes.len())?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn write_ascii(buf: &mut Vec<u8>, s: &str) -> Result<(), DxlError> {
    if s.is_empty() {
        return Err(malformed("required ASCII field is null"));
    }
    write_bytes(buf, s.as_bytes())
}

/// Like [`write_ascii`] but the empty string is a legal value (used for
/// fields that may legitimately be unset, e.g. `service_id`).
fn write_ascii_opt(buf: &mut Vec<u8>, s: &str) -> Result<(), DxlError> {
    write_bytes(buf, s.as_bytes())
}

fn write_ascii_array(buf: &mut Vec<u8>, items: &[String]) -> Result<(), DxlError> {
    write_len(buf, items.len())?;
    for item in items {
        write_ascii_opt(buf, item)?;
    }
    Ok(())
}

fn write_other_fields(buf: &mut Vec<u8>, fields: &HashMap<String, String>) -> Result<(), DxlError> {
    write_len(buf, fields.len() * 2)?;
    for (k, v) in fields {
        write_ascii_opt(buf, k)?;
        write_ascii_opt(buf, v)?;
    }
    Ok(())
}

struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader {
            cursor: Cursor::new(data),
        }
    }

    fn has_remaining(&self) -> bool {
        (self.cursor.position() as usize) < self.cursor.get_ref().len()
    }

    fn read_u8(&mut self) -> Result<u8, DxlError> {
        self.cursor
            .read_u8()
            .map_err(|_| malformed("truncated frame reading byte"))
    }

    fn read_len(&mut self) -> Result<usize, DxlError> {
        let n = self
            .cursor
            .read_i32::<BigEndian>()
            .map_err(|_| malformed("truncated frame reading length"))?;
        if n < 0 {
            return Err(malformed("negative array/bytes length"));
        }
        Ok(n as usize)
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, DxlError> {
        let len = self.read_len()?;
        let pos = self.cursor.position() as usize;
        let data = self.cursor.get_ref();
        if pos + len > data.len() {
            return Err(malformed("truncated frame reading bytes"));
        }
        let out = data[pos..pos + len].to_vec();
        self.cursor.set_position((pos + len) as u64);
        Ok(out)
    }

    fn read_ascii(&mut self) -> Result<String, DxlError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| malformed("field is not valid UTF-8/ASCII"))
    }

    fn read_ascii_array(&mut self) -> Result<Vec<String>, DxlError> {
        let len = self.read_len()?;
        let mut out = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            out.push(self.read_ascii()?);
        }
        Ok(out)
    }

    fn read_other_fields(&mut self) -> Result<HashMap<String, String>, DxlError> {
        let flat_len = self.read_len()?;
        if flat_len % 2 != 0 {
            return Err(malformed("other-fields array has odd length"));
        }
        let mut out = HashMap::with_capacity(flat_len / 2);
        for _ in 0..(flat_len / 2) {
            let key = self.read_ascii()?;
            let value = self.read_ascii()?;
            out.insert(key, value);
        }
        Ok(out)
    }

    fn read_i32(&mut self) -> Result<i32, DxlError> {
        self.cursor
            .read_i32::<BigEndian>()
            .map_err(|_| malformed("truncated frame reading int32"))
    }
}

/// Encode `msg` at the highest supported wire version.
pub fn encode(msg: &Message) -> Result<Vec<u8>, DxlError> {
    let mut buf = Vec::with_capacity(128 + msg.header.payload.len());

    buf.write_u32::<BigEndian>(WIRE_VERSION as u32)
        .expect("write to Vec never fails");
    buf.push(msg.kind().as_byte());

    // v0 common section
    write_ascii(&mut buf, &msg.header.message_id)?;
    write_ascii(&mut buf, &msg.header.source_client_id)?;
    write_ascii_opt(&mut buf, &msg.header.source_broker_id)?;
    write_ascii_array(&mut buf, &msg.header.broker_ids)?;
    write_ascii_array(&mut buf, &msg.header.client_ids)?;
    write_bytes(&mut buf, &msg.header.payload)?;

    // v0 kind-specific tail
    match &msg.body {
        Body::Event => {}
        Body::Request {
            reply_to_topic,
            service_id,
        } => {
            write_ascii(&mut buf, reply_to_topic)?;
            write_ascii_opt(&mut buf, service_id)?;
        }
        Body::Response {
            request_message_id,
            service_id,
        } => {
            write_ascii(&mut buf, request_message_id)?;
            write_ascii_opt(&mut buf, service_id)?;
        }
        Body::Error {
            request_message_id,
            service_id,
            error_code,
            error_message,
        } => {
            write_ascii(&mut buf, request_message_id)?;
            write_ascii_opt(&mut buf, service_id)?;
            buf.write_i32::<BigEndian>(*error_code)
                .expect("write to Vec never fails");
            write_ascii_opt(&mut buf, error_message)?;
        }
    }

    // v1: other-fields
    write_other_fields(&mut buf, &msg.header.other_fields)?;

    // v2: tenant set
    write_ascii_opt(&mut buf, &msg.header.source_tenant_id)?;
    write_ascii_array(&mut buf, &msg.header.destination_tenant_ids)?;

    // v3: source client instance id
    write_ascii_opt(&mut buf, &msg.header.source_client_instance_id)?;

    Ok(buf)
}

/// Decode a frame written by [`encode`]. The transport (MQTT topic) is not
/// part of the frame; the caller sets `destination_topic` on the result.
pub fn decode(data: &[u8]) -> Result<Message, DxlError> {
    let mut r = Reader::new(data);

    let version = r
        .cursor
        .read_u32::<BigEndian>()
        .map_err(|_| malformed("truncated frame reading version"))?;
    let version = u8::try_from(version).map_err(|_| malformed("unsupported wire version"))?;

    let kind_byte = r.read_u8()?;
    let kind = MessageKind::from_byte(kind_byte)
        .ok_or_else(|| malformed(format!("unknown message kind byte {kind_byte}")))?;

    let message_id = r.read_ascii()?;
    let source_client_id = r.read_ascii()?;
    let source_broker_id = r.read_ascii()?;
    let broker_ids = r.read_ascii_array()?;
    let client_ids = r.read_ascii_array()?;
    let payload = r.read_bytes()?;

    let body = match kind {
        MessageKind::Event => Body::Event,
        MessageKind::Request => {
            let reply_to_topic = r.read_ascii()?;
            let service_id = r.read_ascii()?;
            Body::Request {
                reply_to_topic,
                service_id,
            }
        }
        MessageKind::Response => {
            let request_message_id = r.read_ascii()?;
            let service_id = r.read_ascii()?;
            Body::Response {
                request_message_id,
                service_id,
            }
        }
        MessageKind::Error => {
            let request_message_id = r.read_ascii()?;
            let service_id = r.read_ascii()?;
            let error_code = r.read_i32()?;
            let error_message = r.read_ascii()?;
            Body::Error {
                request_message_id,
                service_id,
                error_code,
                error_message,
            }
        }
    };

    let mut other_fields = HashMap::new();
    let mut source_tenant_id = String::new();
    let mut destination_tenant_ids = Vec::new();
    let mut source_client_instance_id = String::new();

    if version > 0 && r.has_remaining() {
        other_fields = r.read_other_fields()?;
    }
    if version > 1 && r.has_remaining() {
        source_tenant_id = r.read_ascii()?;
        destination_tenant_ids = r.read_ascii_array()?;
    }
    if version > 2 && r.has_remaining() {
        source_client_instance_id = r.read_ascii()?;
    }

    Ok(Message {
        header: Header {
            version,
            message_id,
            source_client_id,
            source_client_instance_id,
            source_broker_id,
            destination_topic: String::new(),
            payload,
            broker_ids,
            client_ids,
            other_fields,
            source_tenant_id,
            destination_tenant_ids,
        },
        body,
        in_reply_to: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_request() {
        let mut msg = Message::new_request("{src}", "/t", "/r").with_service_id("{svc}");
        msg.header.message_id = "{id-1}".into();
        msg = msg
            .with_payload(vec![0x01, 0x02])
            .with_other_field("h", "v")
            .with_source_tenant_id("{tnt}");

        let bytes = encode(&msg).unwrap();
        let mut decoded = decode(&bytes).unwrap();
        decoded.header.destination_topic = "/t".into(); // set by facade on receive

        assert_eq!(decoded.header.version, WIRE_VERSION);
        assert_eq!(decoded.message_id(), "{id-1}");
        assert_eq!(decoded.header.source_client_id, "{src}");
        assert_eq!(decoded.header.payload, vec![0x01, 0x02]);
        assert_eq!(decoded.header.other_fields.get("h"), Some(&"v".to_string()));
        assert_eq!(decoded.header.source_tenant_id, "{tnt}");
        match decoded.body {
            Body::Request {
                ref reply_to_topic,
                ref service_id,
            } => {
                assert_eq!(reply_to_topic, "/r");
                assert_eq!(service_id, "{svc}");
            }
            _ => panic!("expected Request"),
        }
    }

    #[test]
    fn round_trips_an_error() {
        let req = Message::new_request("{src}", "/no/such/service", "/r");
        let err = Message::new_error_response(
            "{broker}",
            &req,
            0x8000_0001_u32 as i32,
            "unable to locate service for request",
        )
        .unwrap();

        let bytes = encode(&err).unwrap();
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.kind(), MessageKind::Error);
        match decoded.body {
            Body::Error {
                error_code,
                ref error_message,
                ..
            } => {
                assert_eq!(error_code, 0x8000_0001_u32 as i32);
                assert_eq!(error_message, "unable to locate service for request");
            }
            _ => panic!("expected Error"),
        }
    }

    #[test]
    fn decoding_unknown_kind_byte_fails() {
        let mut bytes = encode(&Message::new_event("{src}", "/e")).unwrap();
        bytes[4] = 0xFF; // kind byte follows the 4-byte version
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn decoding_truncated_frame_fails() {
        let bytes = encode(&Message::new_event("{src}", "/e")).unwrap();
        assert!(decode(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn v0_frame_decodes_with_default_higher_version_fields() {
        // Hand-build a v0 frame: version=0, kind=Event, then just the v0 sections.
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.push(MessageKind::Event.as_byte());
        write_ascii(&mut buf, "{id}").unwrap();
        write_ascii(&mut buf, "{src}").unwrap();
        write_ascii_opt(&mut buf, "").unwrap();
        write_ascii_array(&mut buf, &[]).unwrap();
        write_ascii_array(&mut buf, &[]).unwrap();
        write_bytes(&mut buf, b"payload").unwrap();

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.header.version, 0);
        assert_eq!(decoded.header.payload, b"payload");
        assert!(decoded.header.other_fields.is_empty());
        assert_eq!(decoded.header.source_tenant_id, "");
    }
}
