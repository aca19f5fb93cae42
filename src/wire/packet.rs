//! MQTT v3.1.1 control packets, QoS 0/1 subset (spec §4.2 design note).
//!
//! Remaining-length is read the way `mqtt-core::decode::variable_length`
//! does: up to 4 continuation-bit-prefixed bytes, little-endian-by-7-bit-group.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::DxlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    fn from_byte(b: u8) -> Result<Self, DxlError> {
        Ok(match b {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            other => return Err(DxlError::Malformed(format!("unknown packet type {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect {
        client_id: String,
        keep_alive_secs: u16,
        clean_session: bool,
    },
    ConnAck {
        session_present: bool,
        return_code: u8,
    },
    Publish {
        topic: String,
        packet_id: Option<u16>,
        payload: Vec<u8>,
    },
    PubAck {
        packet_id: u16,
    },
    Subscribe {
        packet_id: u16,
        topic_filter: String,
    },
    SubAck {
        packet_id: u16,
    },
    Unsubscribe {
        packet_id: u16,
        topic_filter: String,
    },
    UnsubAck {
        packet_id: u16,
    },
    PingReq,
    PingResp,
    Disconnect,
}

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4; // MQTT v3.1.1

pub fn write_packet<W: Write>(w: &mut W, packet: &Packet) -> io::Result<()> {
    let mut body = Vec::new();
    let packet_type;
    let mut flags = 0u8;

    match packet {
        Packet::Connect {
            client_id,
            keep_alive_secs,
            clean_session,
        } => {
            packet_type = PacketType::Connect;
            write_str(&mut body, PROTOCOL_NAME)?;
            body.write_u8(PROTOCOL_LEVEL)?;
            body.write_u8(if *clean_session { 0x02 } else { 0x00 })?;
            body.write_u16::<BigEndian>(*keep_alive_secs)?;
            write_str(&mut body, client_id)?;
        }
        Packet::Publish {
            topic,
            packet_id,
            payload,
        } => {
            packet_type = PacketType::Publish;
            if packet_id.is_some() {
                flags |= 0x02; // QoS 1
            }
            write_str(&mut body, topic)?;
            if let Some(id) = packet_id {
                body.write_u16::<BigEndian>(*id)?;
            }
            body.extend_from_slice(payload);
        }
        Packet::PubAck { packet_id } => {
            packet_type = PacketType::PubAck;
            body.write_u16::<BigEndian>(*packet_id)?;
        }
        Packet::Subscribe {
            packet_id,
            topic_filter,
        } => {
            packet_type = PacketType::Subscribe;
            flags = 0x02;
            body.write_u16::<BigEndian>(*packet_id)?;
            write_str(&mut body, topic_filter)?;
            body.write_u8(0)?; // requested QoS 0
        }
        Packet::Unsubscribe {
            packet_id,
            topic_filter,
        } => {
            packet_type = PacketType::Unsubscribe;
            flags = 0x02;
            body.write_u16::<BigEndian>(*packet_id)?;
            write_str(&mut body, topic_filter)?;
        }
        Packet::PingReq => packet_type = PacketType::PingReq,
        Packet::Disconnect => packet_type = PacketType::Disconnect,
        Packet::ConnAck { .. } | Packet::SubAck { .. } | Packet::UnsubAck { .. } | Packet::PingResp => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "client never writes a broker-originated packet",
            ))
        }
    }

    w.write_u8(((packet_type as u8) << 4) | flags)?;
    write_remaining_length(w, body.len())?;
    w.write_all(&body)
}

pub fn read_packet<R: Read>(r: &mut R) -> io::Result<Packet> {
    let first = r.read_u8()?;
    let packet_type = PacketType::from_byte(first >> 4)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    let flags = first & 0x0F;
    let remaining_length = read_remaining_length(r)?;

    let mut body = vec![0u8; remaining_length];
    r.read_exact(&mut body)?;
    let mut cursor = io::Cursor::new(body);

    Ok(match packet_type {
        PacketType::ConnAck => {
            let ack_flags = cursor.read_u8()?;
            let return_code = cursor.read_u8()?;
            Packet::ConnAck {
                session_present: ack_flags & 0x01 != 0,
                return_code,
            }
        }
        PacketType::Publish => {
            let topic = read_str(&mut cursor)?;
            let qos = (flags >> 1) & 0x03;
            let packet_id = if qos > 0 {
                Some(cursor.read_u16::<BigEndian>()?)
            } else {
                None
            };
            let mut payload = Vec::new();
            cursor.read_to_end(&mut payload)?;
            Packet::Publish {
                topic,
                packet_id,
                payload,
            }
        }
        PacketType::PubAck => Packet::PubAck {
            packet_id: cursor.read_u16::<BigEndian>()?,
        },
        PacketType::SubAck => Packet::SubAck {
            packet_id: cursor.read_u16::<BigEndian>()?,
        },
        PacketType::UnsubAck => Packet::UnsubAck {
            packet_id: cursor.read_u16::<BigEndian>()?,
        },
        PacketType::PingResp => Packet::PingResp,
        PacketType::Connect => {
            let _protocol_name = read_str(&mut cursor)?;
            let _level = cursor.read_u8()?;
            let connect_flags = cursor.read_u8()?;
            let keep_alive_secs = cursor.read_u16::<BigEndian>()?;
            let client_id = read_str(&mut cursor)?;
            Packet::Connect {
                client_id,
                keep_alive_secs,
                clean_session: connect_flags & 0x02 != 0,
            }
        }
        PacketType::Subscribe => {
            let packet_id = cursor.read_u16::<BigEndian>()?;
            let topic_filter = read_str(&mut cursor)?;
            let _requested_qos = cursor.read_u8()?;
            Packet::Subscribe {
                packet_id,
                topic_filter,
            }
        }
        PacketType::Unsubscribe => {
            let packet_id = cursor.read_u16::<BigEndian>()?;
            let topic_filter = read_str(&mut cursor)?;
            Packet::Unsubscribe {
                packet_id,
                topic_filter,
            }
        }
        PacketType::PingReq => Packet::PingReq,
        PacketType::Disconnect => Packet::Disconnect,
    })
}

fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_u16::<BigEndian>(s.len() as u16)?;
    w.write_all(s.as_bytes())
}

fn read_str<R: Read>(r: &mut R) -> io::Result<String> {
    let len = r.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

const CONTINUATION_BIT: u8 = 0x80;

fn write_remaining_length<W: Write>(w: &mut W, mut len: usize) -> io::Result<()> {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= CONTINUATION_BIT;
        }
        w.write_u8(byte)?;
        if len == 0 {
            break;
        }
    }
    Ok(())
}

fn read_remaining_length<R: Read>(r: &mut R) -> io::Result<usize> {
    let mut value = 0usize;
    for i in 0..4 {
        let byte = r.read_u8()?;
        value += ((byte & !CONTINUATION_BIT) as usize) << (7 * i);
        if byte & CONTINUATION_BIT == 0 {
            return Ok(value);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "remaining length field exceeds 4 bytes",
    ))
}
