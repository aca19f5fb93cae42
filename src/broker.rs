//! Broker descriptors, parsing, and latency-based ordering (C3, spec §4.6).

use std::cmp::Ordering;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;

use crate::error::DxlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerProtocol {
    MqttTcp,
    MqttWs,
}

impl BrokerProtocol {
    fn scheme(self) -> &'static str {
        match self {
            BrokerProtocol::MqttTcp => "ssl",
            BrokerProtocol::MqttWs => "wss",
        }
    }
}

/// One MQTT broker participating in the fabric (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct Broker {
    pub id: String,
    pub port: u16,
    pub host: String,
    pub ip: Option<String>,
    pub protocol: BrokerProtocol,
    pub response_time: Option<Duration>,
    pub connected_via_ip: bool,
}

impl Broker {
    pub fn new(id: impl Into<String>, port: u16, host: impl Into<String>) -> Self {
        Broker {
            id: id.into(),
            port,
            host: host.into(),
            ip: None,
            protocol: BrokerProtocol::MqttTcp,
            response_time: None,
            connected_via_ip: false,
        }
    }

    /// Parse `<id>;<port>;<host>;<ip>`, the value half of a `[Brokers]`
    /// INI entry (spec §6). `ip` may be empty.
    pub fn parse(s: &str, protocol: BrokerProtocol) -> Result<Self, DxlError> {
        let parts: Vec<&str> = s.split(';').collect();
        if parts.len() != 4 {
            return Err(DxlError::MalformedBroker(format!(
                "expected `<id>;<port>;<host>;<ip>`, got {s:?}"
            )));
        }

        let id = parts[0].trim();
        let port_str = parts[1].trim();
        let host = parts[2].trim();
        let ip = parts[3].trim();

        if id.is_empty() || host.is_empty() {
            return Err(DxlError::MalformedBroker(format!(
                "broker id/host must not be empty in {s:?}"
            )));
        }

        let port: u16 = port_str
            .parse()
            .map_err(|_| DxlError::MalformedBroker(format!("invalid port in {s:?}")))?;

        Ok(Broker {
            id: id.to_string(),
            port,
            host: host.to_string(),
            ip: if ip.is_empty() {
                None
            } else {
                Some(ip.to_string())
            },
            protocol,
            response_time: None,
            connected_via_ip: false,
        })
    }

    pub fn to_server_uri(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }

    pub fn to_alternative_server_uri(&self) -> Option<String> {
        self.ip
            .as_ref()
            .map(|ip| format!("{}://{}:{}", self.protocol.scheme(), ip, self.port))
    }

    /// Probe this broker's latency via a raw TCP connect attempt against
    /// the hostname, falling back to the IP literal on failure (spec
    /// §4.2 Broker selection). Records the measured latency and which
    /// address succeeded on a clone; the stored broker list is never
    /// mutated directly by a concurrent probe.
    pub fn probe(&self, timeout: Duration) -> Broker {
        let mut probed = self.clone();

        if let Some(elapsed) = probe_addr(&self.host, self.port, timeout) {
            probed.response_time = Some(elapsed);
            probed.connected_via_ip = false;
            return probed;
        }

        if let Some(ip) = self.ip.clone() {
            if let Some(elapsed) = probe_addr(&ip, self.port, timeout) {
                probed.response_time = Some(elapsed);
                probed.connected_via_ip = true;
            }
        }

        probed
    }
}

fn probe_addr(host: &str, port: u16, timeout: Duration) -> Option<Duration> {
    let addr = (host, port).to_socket_addrs().ok()?.next()?;
    let start = Instant::now();
    TcpStream::connect_timeout(&addr, timeout).ok()?;
    Some(start.elapsed())
}

impl PartialOrd for Broker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Broker {}

impl Ord for Broker {
    /// Ascending by `response_time`; brokers with no measured response
    /// (did not respond during probing) sort last (spec §3/§4.2).
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.response_time, other.response_time) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

/// Probe every broker in `brokers` concurrently (bounded worker group, per
/// spec §9) and return them sorted ascending by latency, with unreachable
/// brokers appended unsorted at the tail.
pub fn rank_by_latency(brokers: &[Broker], ping_timeout: Duration) -> Vec<Broker> {
    const MAX_WORKERS: usize = 20;
    let hard_stop = ping_timeout * 5;

    let workers = brokers.len().min(MAX_WORKERS).max(1);
    let (work_tx, work_rx) = bounded::<Broker>(brokers.len());
    let (result_tx, result_rx) = bounded::<Broker>(brokers.len());

    for broker in brokers {
        work_tx.send(broker.clone()).expect("channel sized to len");
    }
    drop(work_tx);

    let mut results = std::thread::scope(|scope| {
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                while let Ok(broker) = work_rx.recv() {
                    let probed = broker.probe(ping_timeout);
                    let _ = result_tx.send(probed);
                }
            });
        }
        drop(result_tx);

        let deadline = Instant::now() + hard_stop;
        let mut ranked = Vec::with_capacity(brokers.len());
        while ranked.len() < brokers.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match result_rx.recv_timeout(remaining) {
                Ok(broker) => ranked.push(broker),
                Err(_) => break,
            }
        }
        ranked
    });

    results.sort();
    results
}

/// An HTTP/SOCKS proxy the transport manager tunnels connections through
/// (spec §3 ClientConfig, `[Proxy]` in spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Establish a raw TCP stream to `target_host:target_port` tunneled
/// through an HTTP CONNECT proxy (spec §4.2).
pub fn connect_via_http_proxy(
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    timeout: Duration,
) -> Result<TcpStream, DxlError> {
    let addr = (proxy.host.as_str(), proxy.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| DxlError::Internal(anyhow::anyhow!("cannot resolve proxy host")))?;

    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;

    let mut request = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n"
    );
    if let Some(user) = &proxy.user {
        let password = proxy.password.clone().unwrap_or_default();
        let credentials = base64_basic_auth(user, &password);
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes())?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte)?;
        response.push(byte[0]);
        if response.ends_with(b"\r\n\r\n") {
            break;
        }
        if response.len() > 8192 {
            return Err(DxlError::Internal(anyhow::anyhow!(
                "proxy CONNECT response too large"
            )));
        }
    }

    let status_line = String::from_utf8_lossy(&response);
    if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
        return Err(DxlError::Internal(anyhow::anyhow!(
            "proxy CONNECT rejected: {}",
            status_line.lines().next().unwrap_or_default()
        )));
    }

    Ok(stream)
}

fn base64_basic_auth(user: &str, password: &str) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let input = format!("{user}:{password}");
    let bytes = input.as_bytes();
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);

    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);

        out.push(ALPHABET[(b0 >> 2) as usize] as char);
        out.push(ALPHABET[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[(b2 & 0x3f) as usize] as char
        } else {
            '='
        });
    }

    out
}
