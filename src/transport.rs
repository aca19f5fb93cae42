//! Connection lifecycle: broker selection, TLS/proxy dial, reconnect
//! backoff, and keepalive scheduling (C5, spec §4.2/§4.6).
//!
//! Keepalive scheduling mirrors `mqtt-sync-client::keepalive::KeepAlive<T>`:
//! a `timer::Timer` rescheduled after every outbound packet, not a fixed
//! ticker, so a chatty client never sends redundant pings.

use std::io::BufReader;
use std::net::ToSocketAddrs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rustls::RootCertStore;
use timer::{Guard, Timer};

use crate::broker::{rank_by_latency, Broker, BrokerProtocol};
use crate::config::ClientConfig;
use crate::error::DxlError;
use crate::wire::blocking::BlockingDriver;
use crate::wire::transport::Transport;
use crate::wire::MqttDriver;

pub mod backoff {
    use super::*;

    /// Reconnect delay for `attempt` (1-based), per spec §4.2/§8 property 6:
    /// `min(base * multiplier^(attempt-1), max)`, multiplied by a random
    /// factor in `[1, 1+random_fraction]` to avoid a reconnect thundering
    /// herd while never delaying less than the nominal value. Isolated from
    /// the reconnect state machine, the way
    /// `ReconnectConfig::calculate_backoff_delay` is in the pack's
    /// `2389-research` agent.
    pub fn next_delay(attempt: u32, config: &ClientConfig) -> Duration {
        let base = config.reconnect_delay.as_secs_f64();
        let max = config.reconnect_delay_max.as_secs_f64();
        let multiplier = config.reconnect_back_off_multiplier as f64;

        let exponent = attempt.saturating_sub(1).min(32);
        let nominal = (base * multiplier.powi(exponent as i32)).min(max);

        let jitter_fraction = config.reconnect_delay_random.clamp(0.0, 1.0);
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_fraction);
        let jittered = nominal * (1.0 + jitter);

        Duration::from_secs_f64(jittered)
    }
}

/// What to do right after a (re)connect succeeds: replay subscriptions and
/// active service registrations so the broker-side state matches what the
/// client believes it has (spec §4.2 "post-connect resync").
pub trait ConnectHook: Send {
    fn on_connected(&self, driver: &mut dyn MqttDriver) -> Result<(), DxlError>;
}

pub struct TransportManager {
    config: Arc<ClientConfig>,
    driver: Mutex<Option<Box<dyn MqttDriver>>>,
    keepalive_timer: Timer,
    keepalive_guard: Mutex<Option<Guard>>,
    hook: Box<dyn ConnectHook>,
}

impl TransportManager {
    pub fn new(config: Arc<ClientConfig>, hook: Box<dyn ConnectHook>) -> Self {
        TransportManager {
            config,
            driver: Mutex::new(None),
            keepalive_timer: Timer::new(),
            keepalive_guard: Mutex::new(None),
            hook,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.driver.lock().expect("driver lock poisoned").is_some()
    }

    /// Rank the configured brokers by latency, dial the fastest reachable
    /// one, retrying with backoff up to `connect_retries` times (spec §4.2).
    /// A negative `connect_retries` (-1 per spec §3) retries forever.
    pub fn connect(&self) -> Result<(), DxlError> {
        let (brokers, protocol) = if self.config.use_web_sockets {
            (&self.config.brokers_web_sockets, BrokerProtocol::MqttWs)
        } else {
            (&self.config.brokers, BrokerProtocol::MqttTcp)
        };

        if brokers.is_empty() {
            return Err(DxlError::NotConnectable(
                "no brokers configured for the selected transport".to_string(),
            ));
        }

        let max_attempts = if self.config.connect_retries < 0 {
            None
        } else {
            Some(self.config.connect_retries.max(1) as u32)
        };

        let mut last_err = None;
        let mut attempt: u32 = 1;

        loop {
            let ranked = rank_by_latency(brokers, Duration::from_secs(5));

            for broker in &ranked {
                match self.dial(broker, protocol) {
                    Ok(driver) => {
                        self.adopt(driver)?;
                        return Ok(());
                    }
                    Err(err) => last_err = Some(err),
                }
            }

            if let Some(max) = max_attempts {
                if attempt >= max {
                    break;
                }
            }

            std::thread::sleep(backoff::next_delay(attempt, &self.config));
            attempt += 1;
        }

        Err(last_err.unwrap_or_else(|| {
            DxlError::NotConnectable("exhausted all brokers and retries".to_string())
        }))
    }

    pub fn reconnect(&self) -> Result<(), DxlError> {
        self.disconnect();
        self.connect()
    }

    pub fn disconnect(&self) {
        *self.keepalive_guard.lock().expect("guard lock poisoned") = None;
        if let Some(mut driver) = self.driver.lock().expect("driver lock poisoned").take() {
            let _ = driver.disconnect();
        }
    }

    fn dial(&self, broker: &Broker, protocol: BrokerProtocol) -> Result<Box<dyn MqttDriver>, DxlError> {
        let timeout = Duration::from_secs(30);
        let host = &broker.host;
        let port = broker.port;

        let transport = match (protocol, &self.config.proxy) {
            (BrokerProtocol::MqttWs, _) => Transport::connect_ws(host, port, timeout)?,
            (BrokerProtocol::MqttTcp, Some(proxy)) => {
                let stream = crate::broker::connect_via_http_proxy(proxy, host, port, timeout)?;
                self.wrap_tls(stream, host)?
            }
            (BrokerProtocol::MqttTcp, None) => {
                let stream = std::net::TcpStream::connect_timeout(
                    &(host.as_str(), port)
                        .to_socket_addrs()?
                        .next()
                        .ok_or_else(|| DxlError::NotConnectable(format!("cannot resolve {host}:{port}")))?,
                    timeout,
                )?;
                self.wrap_tls(stream, host)?
            }
        };

        let mut driver: Box<dyn MqttDriver> = Box::new(BlockingDriver::new(transport));
        driver.connect(&self.config.client_id.to_string(), self.config.keep_alive_interval)?;
        Ok(driver)
    }

    fn wrap_tls(&self, stream: std::net::TcpStream, host: &str) -> Result<Transport, DxlError> {
        let roots = Arc::new(self.load_roots()?);
        let (certs, key) = self.load_client_identity()?;

        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|err| DxlError::MalformedBroker(format!("invalid broker hostname {host:?}: {err}")))?;
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots.as_ref().clone())
            .with_client_auth_cert(certs, key)
            .map_err(|err| DxlError::NotConnectable(format!("client certificate rejected: {err}")))?;
        let conn = rustls::ClientConnection::new(Arc::new(client_config), server_name)
            .map_err(|err| DxlError::NotConnectable(format!("TLS handshake setup failed: {err}")))?;

        Ok(Transport::Tls(Box::new(rustls::StreamOwned::new(conn, stream))))
    }

    fn load_roots(&self) -> Result<RootCertStore, DxlError> {
        let pem = std::fs::read(&self.config.broker_ca_bundle_path)
            .map_err(|err| DxlError::Malformed(format!("cannot read broker CA bundle: {err}")))?;
        let mut reader = BufReader::new(pem.as_slice());
        let mut store = RootCertStore::empty();

        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|err| DxlError::Malformed(format!("invalid CA cert: {err}")))?;
            store
                .add(cert)
                .map_err(|err| DxlError::Malformed(format!("untrusted CA cert: {err}")))?;
        }

        Ok(store)
    }

    fn load_client_identity(
        &self,
    ) -> Result<
        (
            Vec<rustls::pki_types::CertificateDer<'static>>,
            rustls::pki_types::PrivateKeyDer<'static>,
        ),
        DxlError,
    > {
        let cert_pem = std::fs::read(&self.config.cert_file_path)
            .map_err(|err| DxlError::Malformed(format!("cannot read client cert: {err}")))?;
        let key_pem = std::fs::read(&self.config.private_key_file_path)
            .map_err(|err| DxlError::Malformed(format!("cannot read client key: {err}")))?;

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
            .collect::<Result<_, _>>()
            .map_err(|err| DxlError::Malformed(format!("invalid client cert: {err}")))?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))
            .map_err(|err| DxlError::Malformed(format!("invalid client key: {err}")))?
            .ok_or_else(|| DxlError::Malformed("no private key found in key file".to_string()))?;

        Ok((certs, key))
    }

    fn adopt(&self, mut driver: Box<dyn MqttDriver>) -> Result<(), DxlError> {
        self.hook.on_connected(driver.as_mut())?;
        *self.driver.lock().expect("driver lock poisoned") = Some(driver);
        Ok(())
    }

    /// Adopt an already-constructed driver instead of dialing a broker —
    /// used to drive a fully-wired `DxlClient` against a fake `MqttDriver` in
    /// tests, without a real socket or TLS handshake.
    pub fn adopt_driver(&self, driver: Box<dyn MqttDriver>) -> Result<(), DxlError> {
        self.adopt(driver)
    }

    pub fn with_driver<R>(
        &self,
        f: impl FnOnce(&mut dyn MqttDriver) -> Result<R, DxlError>,
    ) -> Result<R, DxlError> {
        let mut guard = self.driver.lock().expect("driver lock poisoned");
        match guard.as_mut() {
            Some(driver) => f(driver.as_mut()),
            None => Err(DxlError::NotConnected),
        }
    }
}
