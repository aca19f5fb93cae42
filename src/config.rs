//! Client configuration: [`ClientConfig`] and its INI on-disk form (C4,
//! spec §3/§6).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::{Broker, BrokerProtocol, ProxyConfig};
use crate::error::DxlError;
use crate::id::UniqueId;

const SECTION_GENERAL: &str = "General";
const SECTION_CERTS: &str = "Certs";
const SECTION_BROKERS: &str = "Brokers";
const SECTION_BROKERS_WS: &str = "BrokersWebSockets";
const SECTION_PROXY: &str = "Proxy";

/// Everything needed to connect, authenticate, and tune a [`crate::client::DxlClient`]
/// (spec §3). Loaded from the DXL provisioning INI file via [`ClientConfig::load`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: UniqueId,

    pub broker_ca_bundle_path: PathBuf,
    pub cert_file_path: PathBuf,
    pub private_key_file_path: PathBuf,

    pub brokers: Vec<Broker>,
    pub brokers_web_sockets: Vec<Broker>,
    pub use_web_sockets: bool,

    pub proxy: Option<ProxyConfig>,

    /// Connect retries; -1 means retry forever (spec §3/§4.2).
    pub connect_retries: i32,
    pub reconnect_delay: Duration,
    pub reconnect_delay_max: Duration,
    pub reconnect_delay_random: f64,
    pub reconnect_back_off_multiplier: u32,

    pub keep_alive_interval: Duration,

    pub incoming_message_queue_size: usize,
    pub incoming_message_thread_pool_size: usize,

    pub verify_broker_cert_chain_subject: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            client_id: UniqueId::new(),
            broker_ca_bundle_path: PathBuf::new(),
            cert_file_path: PathBuf::new(),
            private_key_file_path: PathBuf::new(),
            brokers: Vec::new(),
            brokers_web_sockets: Vec::new(),
            use_web_sockets: false,
            proxy: None,
            connect_retries: 10,
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(60),
            reconnect_delay_random: 0.25,
            reconnect_back_off_multiplier: 2,
            keep_alive_interval: Duration::from_secs(30),
            incoming_message_queue_size: 1000,
            incoming_message_thread_pool_size: 10,
            verify_broker_cert_chain_subject: true,
        }
    }
}

impl ClientConfig {
    /// Load and validate a provisioned DXL config from `path` (spec §6).
    /// Relative cert/key paths resolve against the config file's own
    /// directory, matching the provisioning tool's placement convention.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DxlError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| DxlError::Malformed(format!("cannot read {path:?}: {err}")))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base_dir)
    }

    fn parse(text: &str, base_dir: &Path) -> Result<Self, DxlError> {
        let ini = Ini::parse(text)?;

        let general = ini.section(SECTION_GENERAL)?;
        let certs = ini.section(SECTION_CERTS)?;

        let client_id_str = general.get("ClientId").ok_or_else(|| {
            DxlError::Malformed(format!("[{SECTION_GENERAL}] is missing ClientId"))
        })?;
        let client_id: UniqueId = client_id_str.parse()?;

        let broker_ca_bundle_path = resolve_path(base_dir, certs.require("BrokerCertChain")?);
        let cert_file_path = resolve_path(base_dir, certs.require("CertFile")?);
        let private_key_file_path = resolve_path(base_dir, certs.require("PrivateKey")?);

        let brokers = ini
            .try_section(SECTION_BROKERS)
            .map(|s| parse_broker_section(s, BrokerProtocol::MqttTcp))
            .transpose()?
            .unwrap_or_default();

        let brokers_web_sockets = ini
            .try_section(SECTION_BROKERS_WS)
            .map(|s| parse_broker_section(s, BrokerProtocol::MqttWs))
            .transpose()?
            .unwrap_or_default();

        // Absent `UseWebSockets`: infer from which broker list is populated
        // (spec §6) -- WebSockets only if no plain MQTT brokers exist.
        let use_web_sockets = match general.get("UseWebSockets") {
            Some(v) => parse_bool(v)?,
            None => brokers.is_empty() && !brokers_web_sockets.is_empty(),
        };

        let proxy = match ini.try_section(SECTION_PROXY) {
            Some(proxy_section) => {
                let host = proxy_section.get("Address").map(str::to_string);
                match host {
                    Some(host) if !host.is_empty() => {
                        let port: u16 = proxy_section
                            .require("Port")?
                            .parse()
                            .map_err(|_| DxlError::Malformed("invalid [Proxy] Port".into()))?;
                        Some(ProxyConfig {
                            host,
                            port,
                            user: proxy_section.get("User").map(str::to_string),
                            password: proxy_section.get("Password").map(str::to_string),
                        })
                    }
                    _ => None,
                }
            }
            None => None,
        };

        let mut config = ClientConfig {
            client_id,
            broker_ca_bundle_path,
            cert_file_path,
            private_key_file_path,
            brokers,
            brokers_web_sockets,
            use_web_sockets,
            proxy,
            ..ClientConfig::default()
        };

        if let Some(v) = general.get("ConnectRetries") {
            config.connect_retries = parse_i32(v, "ConnectRetries")?;
        }
        if let Some(v) = general.get("ReconnectDelay") {
            config.reconnect_delay = Duration::from_secs_f64(parse_f64(v, "ReconnectDelay")?);
        }
        if let Some(v) = general.get("ReconnectDelayMax") {
            config.reconnect_delay_max =
                Duration::from_secs_f64(parse_f64(v, "ReconnectDelayMax")?);
        }
        if let Some(v) = general.get("ReconnectDelayRandom") {
            config.reconnect_delay_random = parse_f64(v, "ReconnectDelayRandom")?;
        }
        if let Some(v) = general.get("ReconnectBackOffMultiplier") {
            config.reconnect_back_off_multiplier = parse_u32(v, "ReconnectBackOffMultiplier")?;
        }
        if let Some(v) = general.get("KeepAliveInterval") {
            config.keep_alive_interval = Duration::from_secs(parse_u32(v, "KeepAliveInterval")? as u64);
        }
        if let Some(v) = general.get("IncomingMessageQueueSize") {
            config.incoming_message_queue_size = parse_u32(v, "IncomingMessageQueueSize")? as usize;
        }
        if let Some(v) = general.get("IncomingMessageThreadPoolSize") {
            config.incoming_message_thread_pool_size =
                parse_u32(v, "IncomingMessageThreadPoolSize")? as usize;
        }
        if let Some(v) = general.get("VerifyBrokerCertChainSubject") {
            config.verify_broker_cert_chain_subject = parse_bool(v)?;
        }

        // Every `[Brokers]`/`[BrokersWebSockets]` key must equal the guid
        // embedded in its own value (spec §6 validation rule).
        for (key, broker) in ini
            .try_section(SECTION_BROKERS)
            .into_iter()
            .flat_map(|s| s.entries.iter())
            .chain(
                ini.try_section(SECTION_BROKERS_WS)
                    .into_iter()
                    .flat_map(|s| s.entries.iter()),
            )
        {
            let id_no_braces = key.trim_start_matches('{').trim_end_matches('}');
            if !broker.contains(id_no_braces) {
                return Err(DxlError::Malformed(format!(
                    "broker key {key:?} does not match the id embedded in its value"
                )));
            }
        }

        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DxlError> {
        let mut out = String::new();

        out.push_str(&format!("[{SECTION_GENERAL}]\n"));
        out.push_str(&format!("ClientId={}\n", self.client_id));
        out.push_str(&format!("UseWebSockets={}\n", self.use_web_sockets));
        out.push_str(&format!("ConnectRetries={}\n", self.connect_retries));
        out.push_str(&format!(
            "ReconnectDelay={}\n",
            self.reconnect_delay.as_secs_f64()
        ));
        out.push_str(&format!(
            "ReconnectDelayMax={}\n",
            self.reconnect_delay_max.as_secs_f64()
        ));
        out.push_str(&format!(
            "ReconnectDelayRandom={}\n",
            self.reconnect_delay_random
        ));
        out.push_str(&format!(
            "ReconnectBackOffMultiplier={}\n",
            self.reconnect_back_off_multiplier
        ));
        out.push_str(&format!(
            "KeepAliveInterval={}\n",
            self.keep_alive_interval.as_secs()
        ));
        out.push_str(&format!(
            "IncomingMessageQueueSize={}\n",
            self.incoming_message_queue_size
        ));
        out.push_str(&format!(
            "IncomingMessageThreadPoolSize={}\n",
            self.incoming_message_thread_pool_size
        ));
        out.push_str(&format!(
            "VerifyBrokerCertChainSubject={}\n\n",
            self.verify_broker_cert_chain_subject
        ));

        out.push_str(&format!("[{SECTION_CERTS}]\n"));
        out.push_str(&format!(
            "BrokerCertChain={}\n",
            self.broker_ca_bundle_path.display()
        ));
        out.push_str(&format!("CertFile={}\n", self.cert_file_path.display()));
        out.push_str(&format!(
            "PrivateKey={}\n\n",
            self.private_key_file_path.display()
        ));

        out.push_str(&format!("[{SECTION_BROKERS}]\n"));
        for broker in &self.brokers {
            out.push_str(&format!(
                "{}={};{};{};{}\n",
                broker.id,
                broker.id,
                broker.port,
                broker.host,
                broker.ip.as_deref().unwrap_or("")
            ));
        }
        out.push('\n');

        out.push_str(&format!("[{SECTION_BROKERS_WS}]\n"));
        for broker in &self.brokers_web_sockets {
            out.push_str(&format!(
                "{}={};{};{};{}\n",
                broker.id,
                broker.id,
                broker.port,
                broker.host,
                broker.ip.as_deref().unwrap_or("")
            ));
        }

        if let Some(proxy) = &self.proxy {
            out.push_str(&format!("\n[{SECTION_PROXY}]\n"));
            out.push_str(&format!("Address={}\n", proxy.host));
            out.push_str(&format!("Port={}\n", proxy.port));
            if let Some(user) = &proxy.user {
                out.push_str(&format!("User={user}\n"));
            }
            if let Some(password) = &proxy.password {
                out.push_str(&format!("Password={password}\n"));
            }
        }

        fs::write(path.as_ref(), out)
            .map_err(|err| DxlError::Malformed(format!("cannot write {:?}: {err}", path.as_ref())))
    }
}

fn resolve_path(base_dir: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    }
}

fn parse_u32(v: &str, field: &str) -> Result<u32, DxlError> {
    v.parse()
        .map_err(|_| DxlError::Malformed(format!("invalid {field}: {v:?}")))
}

fn parse_i32(v: &str, field: &str) -> Result<i32, DxlError> {
    v.parse()
        .map_err(|_| DxlError::Malformed(format!("invalid {field}: {v:?}")))
}

fn parse_f64(v: &str, field: &str) -> Result<f64, DxlError> {
    v.parse()
        .map_err(|_| DxlError::Malformed(format!("invalid {field}: {v:?}")))
}

fn parse_bool(v: &str) -> Result<bool, DxlError> {
    match v.to_ascii_lowercase().as_str() {
        "yes" | "on" | "1" | "true" => Ok(true),
        "no" | "off" | "0" | "false" => Ok(false),
        other => Err(DxlError::Malformed(format!("invalid boolean: {other:?}"))),
    }
}

fn parse_broker_section(section: &IniSection, protocol: BrokerProtocol) -> Result<Vec<Broker>, DxlError> {
    section
        .entries
        .values()
        .map(|v| Broker::parse(v, protocol))
        .collect()
}

/// Minimal INI reader sufficient for the handful of sections the DXL
/// provisioning format defines (spec §6): `[Section]` headers, `key=value`
/// pairs, `;`/`#` comment lines, no nesting, no multi-line values.
struct Ini {
    sections: BTreeMap<String, IniSection>,
}

#[derive(Default)]
struct IniSection {
    entries: BTreeMap<String, String>,
}

impl IniSection {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> Result<&str, DxlError> {
        self.get(key)
            .ok_or_else(|| DxlError::Malformed(format!("missing key {key:?}")))
    }
}

impl Ini {
    fn parse(text: &str) -> Result<Self, DxlError> {
        let mut sections: BTreeMap<String, IniSection> = BTreeMap::new();
        let mut current: Option<String> = None;

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(stripped) = line.strip_prefix('[') {
                let name = stripped.strip_suffix(']').ok_or_else(|| {
                    DxlError::Malformed(format!("unterminated section header: {raw_line:?}"))
                })?;
                sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                DxlError::Malformed(format!("expected key=value, got {raw_line:?}"))
            })?;
            let section_name = current
                .clone()
                .ok_or_else(|| DxlError::Malformed("key=value outside any section".into()))?;
            sections
                .entry(section_name)
                .or_default()
                .entries
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Ini { sections })
    }

    fn section(&self, name: &str) -> Result<&IniSection, DxlError> {
        self.sections
            .get(name)
            .ok_or_else(|| DxlError::Malformed(format!("missing [{name}] section")))
    }

    fn try_section(&self, name: &str) -> Option<&IniSection> {
        self.sections.get(name)
    }
}
