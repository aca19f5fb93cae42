//! [`BlockingDriver`]: the one production [`super::MqttDriver`], generic
//! over any `Read + Write + TryClone + Send` transport (spec §4.2 design
//! note). Shape mirrors `mqtt-sync-client::framed::Framed<T>` buffering a
//! byte stream into discrete control packets.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use crate::error::DxlError;
use crate::wire::packet::{self, Packet};
use crate::wire::transport::TryClone;
use crate::wire::{DriverEvent, MqttDriver};

const READ_CHUNK: usize = 8 * 1024;

pub struct BlockingDriver<T> {
    stream: T,
    buffer: VecDeque<u8>,
    next_packet_id: AtomicU16,
    pending_events: VecDeque<DriverEvent>,
}

impl<T> BlockingDriver<T>
where
    T: Read + Write + TryClone + Send,
{
    pub fn new(stream: T) -> Self {
        BlockingDriver {
            stream,
            buffer: VecDeque::new(),
            next_packet_id: AtomicU16::new(1),
            pending_events: VecDeque::new(),
        }
    }

    fn allocate_packet_id(&self) -> u16 {
        self.next_packet_id.fetch_add(1, Ordering::SeqCst)
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<(), DxlError> {
        packet::write_packet(&mut self.stream, packet).map_err(DxlError::from)
    }

    /// Read exactly one control packet, blocking until enough bytes have
    /// arrived. `set_read_timeout` on the underlying stream (where
    /// supported) bounds how long this can block.
    fn read_one_packet(&mut self) -> Result<Packet, DxlError> {
        let mut reader = BufferedReader {
            stream: &mut self.stream,
            buffer: &mut self.buffer,
        };
        packet::read_packet(&mut reader).map_err(DxlError::from)
    }

    fn await_reply<F>(&mut self, deadline: Instant, mut matches: F) -> Result<(), DxlError>
    where
        F: FnMut(&Packet) -> bool,
    {
        loop {
            if Instant::now() >= deadline {
                return Err(DxlError::WaitTimeout);
            }

            let packet = self.read_one_packet()?;
            if matches(&packet) {
                return Ok(());
            }

            if let Packet::Publish {
                topic,
                payload,
                packet_id,
            } = packet
            {
                if let Some(id) = packet_id {
                    self.write_packet(&Packet::PubAck { packet_id: id })?;
                }
                self.pending_events
                    .push_back(DriverEvent::Publish { topic, payload });
            }
        }
    }
}

struct BufferedReader<'a, T> {
    stream: &'a mut T,
    buffer: &'a mut VecDeque<u8>,
}

impl<T: Read> Read for BufferedReader<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffer.is_empty() {
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Ok(0);
            }
            self.buffer.extend(&chunk[..n]);
        }

        let n = buf.len().min(self.buffer.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.buffer.pop_front().expect("checked len");
        }
        Ok(n)
    }
}

const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

impl<T> MqttDriver for BlockingDriver<T>
where
    T: Read + Write + TryClone + Send,
{
    fn connect(&mut self, client_id: &str, keep_alive: Duration) -> Result<(), DxlError> {
        self.write_packet(&Packet::Connect {
            client_id: client_id.to_string(),
            keep_alive_secs: keep_alive.as_secs().min(u16::MAX as u64) as u16,
            clean_session: true,
        })?;

        let deadline = Instant::now() + REPLY_TIMEOUT;
        let mut accepted = false;
        self.await_reply(deadline, |packet| {
            if let Packet::ConnAck { return_code, .. } = packet {
                accepted = *return_code == 0;
                true
            } else {
                false
            }
        })?;

        if accepted {
            Ok(())
        } else {
            Err(DxlError::NotConnectable(
                "broker rejected CONNECT".to_string(),
            ))
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos1: bool) -> Result<(), DxlError> {
        let packet_id = if qos1 {
            Some(self.allocate_packet_id())
        } else {
            None
        };

        self.write_packet(&Packet::Publish {
            topic: topic.to_string(),
            packet_id,
            payload: payload.to_vec(),
        })?;

        if let Some(id) = packet_id {
            let deadline = Instant::now() + REPLY_TIMEOUT;
            self.await_reply(deadline, |packet| {
                matches!(packet, Packet::PubAck { packet_id } if *packet_id == id)
            })?;
        }

        Ok(())
    }

    fn subscribe(&mut self, topic_filter: &str) -> Result<(), DxlError> {
        let packet_id = self.allocate_packet_id();
        self.write_packet(&Packet::Subscribe {
            packet_id,
            topic_filter: topic_filter.to_string(),
        })?;

        let deadline = Instant::now() + REPLY_TIMEOUT;
        self.await_reply(deadline, |packet| {
            matches!(packet, Packet::SubAck { packet_id: id } if *id == packet_id)
        })
    }

    fn unsubscribe(&mut self, topic_filter: &str) -> Result<(), DxlError> {
        let packet_id = self.allocate_packet_id();
        self.write_packet(&Packet::Unsubscribe {
            packet_id,
            topic_filter: topic_filter.to_string(),
        })?;

        let deadline = Instant::now() + REPLY_TIMEOUT;
        self.await_reply(deadline, |packet| {
            matches!(packet, Packet::UnsubAck { packet_id: id } if *id == packet_id)
        })
    }

    fn ping(&mut self) -> Result<(), DxlError> {
        self.write_packet(&Packet::PingReq)?;
        let deadline = Instant::now() + REPLY_TIMEOUT;
        self.await_reply(deadline, |packet| matches!(packet, Packet::PingResp))
    }

    fn disconnect(&mut self) -> Result<(), DxlError> {
        self.write_packet(&Packet::Disconnect)
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<DriverEvent>, DxlError> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(Some(event));
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let packet = match self.read_one_packet() {
                Ok(packet) => packet,
                Err(DxlError::Internal(err)) => {
                    if let Some(io_err) = err.downcast_ref::<io::Error>() {
                        if io_err.kind() == io::ErrorKind::WouldBlock
                            || io_err.kind() == io::ErrorKind::TimedOut
                        {
                            continue;
                        }
                        if matches!(io_err.kind(), io::ErrorKind::UnexpectedEof) {
                            return Ok(Some(DriverEvent::Disconnected));
                        }
                    }
                    return Err(DxlError::Internal(err));
                }
                Err(other) => return Err(other),
            };

            match packet {
                Packet::Publish {
                    topic,
                    payload,
                    packet_id,
                } => {
                    if let Some(id) = packet_id {
                        self.write_packet(&Packet::PubAck { packet_id: id })?;
                    }
                    return Ok(Some(DriverEvent::Publish { topic, payload }));
                }
                Packet::PingResp => continue,
                _ => continue,
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Clone)]
    struct LoopbackStream {
        read: Cursor<Vec<u8>>,
    }

    impl Read for LoopbackStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.read.read(buf)
        }
    }

    impl Write for LoopbackStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl TryClone for LoopbackStream {
        fn try_clone(&self) -> io::Result<Self> {
            Ok(self.clone())
        }
    }

    fn connack_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        packet::write_packet(
            &mut buf,
            &Packet::ConnAck {
                session_present: false,
                return_code: 0,
            },
        )
        .unwrap();
        buf
    }

    #[test]
    fn connect_succeeds_on_accepted_connack() {
        let stream = LoopbackStream {
            read: Cursor::new(connack_bytes()),
        };
        let mut driver = BlockingDriver::new(stream);
        driver.connect("{client}", Duration::from_secs(30)).unwrap();
    }

    #[test]
    fn connect_fails_on_rejected_connack() {
        let mut buf = Vec::new();
        packet::write_packet(
            &mut buf,
            &Packet::ConnAck {
                session_present: false,
                return_code: 5,
            },
        )
        .unwrap();
        let stream = LoopbackStream {
            read: Cursor::new(buf),
        };
        let mut driver = BlockingDriver::new(stream);
        assert!(driver.connect("{client}", Duration::from_secs(30)).is_err());
    }
}
