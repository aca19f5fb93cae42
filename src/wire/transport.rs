//! Generic byte-stream transports the driver runs over: plain TCP, TLS
//! (`rustls`), and WebSocket (`tungstenite`). Mirrors `mqtt-sync-client::io`'s
//! `TryClone` split so the same [`super::blocking::BlockingDriver`] runs over
//! any of them without knowing which.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use rustls::{ClientConnection, StreamOwned};

use crate::error::DxlError;

/// Mirrors `mqtt-sync-client::io::TryClone`: a duplicated handle sharing the
/// same underlying socket, needed so the keepalive ping scheduler and the
/// read loop can each own a sender independently.
pub trait TryClone: Sized {
    fn try_clone(&self) -> io::Result<Self>;
}

impl TryClone for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }
}

/// A plain or TLS-wrapped TCP connection to one broker.
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
    WebSocket(WsTransport),
}

impl Transport {
    pub fn connect_ws(host: &str, port: u16, timeout: Duration) -> Result<Self, DxlError> {
        Ok(Transport::WebSocket(WsTransport::connect(host, port, timeout)?))
    }
}

fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, DxlError> {
    use std::net::ToSocketAddrs;

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|err| DxlError::NotConnectable(format!("cannot resolve {host}:{port}: {err}")))?
        .next()
        .ok_or_else(|| DxlError::NotConnectable(format!("no address for {host}:{port}")))?;

    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|err| DxlError::NotConnectable(format!("connect to {host}:{port} failed: {err}")))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
            Transport::WebSocket(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
            Transport::WebSocket(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
            Transport::WebSocket(s) => s.flush(),
        }
    }
}

impl TryClone for Transport {
    fn try_clone(&self) -> io::Result<Self> {
        match self {
            Transport::Tcp(s) => Ok(Transport::Tcp(s.try_clone()?)),
            Transport::Tls(s) => Ok(Transport::Tcp(s.get_ref().try_clone()?)),
            Transport::WebSocket(s) => Ok(Transport::Tcp(s.raw.try_clone()?)),
        }
    }
}

/// A byte-stream view over a `tungstenite` WebSocket connection: MQTT frames
/// are carried as binary WS messages, one MQTT control packet does not
/// necessarily align with one WS message, so reads are buffered.
pub struct WsTransport {
    raw: TcpStream,
    socket: tungstenite::WebSocket<TcpStream>,
    read_buffer: std::collections::VecDeque<u8>,
}

impl WsTransport {
    fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, DxlError> {
        let raw = dial(host, port, timeout)?;
        let cloned = raw.try_clone().map_err(DxlError::from)?;

        let request = format!("wss://{host}:{port}/");
        let (socket, _response) = tungstenite::client(request, cloned)
            .map_err(|err| DxlError::NotConnectable(format!("websocket handshake failed: {err}")))?;

        Ok(WsTransport {
            raw,
            socket,
            read_buffer: std::collections::VecDeque::new(),
        })
    }
}

impl Read for WsTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.read_buffer.is_empty() {
            match self.socket.read() {
                Ok(tungstenite::Message::Binary(data)) => self.read_buffer.extend(data),
                Ok(_) => continue,
                Err(tungstenite::Error::Io(err)) => return Err(err),
                Err(err) => return Err(io::Error::new(io::ErrorKind::Other, err)),
            }
        }

        let n = buf.len().min(self.read_buffer.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.read_buffer.pop_front().expect("checked len");
        }
        Ok(n)
    }
}

impl Write for WsTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket
            .write(tungstenite::Message::Binary(buf.to_vec()))
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.socket
            .flush()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }
}
