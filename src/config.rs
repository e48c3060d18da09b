use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Operating mode of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Standalone MLLP listener
    Server,
    /// Standalone interactive MLLP client
    Client,
    /// Bidirectional store-and-forward proxy
    Proxy,
}

/// Which physical device sits on which side of the proxy.
///
/// The proxy always listens on `Port` and dials `ClientHost:ClientPort`;
/// the direction decides whether the analyzer is the listening peer (the
/// default) or the dialed peer, which in turn drives ACK timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyDirection {
    /// Analyzer connects to us, we dial the LIS. Both peers are ACKed on receipt.
    ListenerToClient,
    /// LIS connects to us, we dial the analyzer. The analyzer is ACKed only
    /// after its message has been handed to the LIS.
    ClientToListener,
}

/// Process settings, read once at start-up and immutable afterwards.
///
/// Serialized shape matches the configuration document: PascalCase keys
/// nested under a top-level `Hl7` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Hl7Settings {
    /// Passive-side listening port
    pub port: u16,
    /// Active-side target host
    pub client_host: String,
    /// Active-side target port
    pub client_port: u16,
    /// ACK default sender application (used when the inbound MSH is short)
    pub sending_application: String,
    /// ACK default sender facility
    pub sending_facility: String,
    /// ACK default receiver application
    pub receiving_application: String,
    /// ACK default receiver facility
    pub receiving_facility: String,
    /// Log sink path; the token `{Date}` expands to yyyymmdd. Empty = stderr.
    pub log_file_path: String,
    /// Listener only: MSH-9 values that receive an ACK. Empty admits everything.
    pub allowed_events: Vec<String>,
    /// MSA-1 value in generated ACKs
    pub ack_mode: String,
    /// MSH-7 formatting, .NET-style tokens (yyyy MM dd HH mm ss fff)
    pub message_date_time_format: String,
    /// Close the stream after sending an ACK (listener and client modes)
    pub disconnect_after_ack: bool,
    /// Selects listener vs client when `Mode` is not `Proxy`
    pub is_server: bool,
    pub mode: Mode,
    pub proxy_direction: ProxyDirection,
}

impl Default for Hl7Settings {
    fn default() -> Self {
        Self {
            port: 5100,
            client_host: "127.0.0.1".to_string(),
            client_port: 5200,
            sending_application: String::new(),
            sending_facility: String::new(),
            receiving_application: String::new(),
            receiving_facility: String::new(),
            log_file_path: String::new(),
            allowed_events: Vec::new(),
            ack_mode: "AA".to_string(),
            message_date_time_format: "yyyy-MM-dd HH:mm:ss".to_string(),
            disconnect_after_ack: false,
            is_server: true,
            mode: Mode::Server,
            proxy_direction: ProxyDirection::ListenerToClient,
        }
    }
}

/// On-disk wrapper: the settings live under an `Hl7` key.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(rename = "Hl7")]
    hl7: Hl7Settings,
}

impl Hl7Settings {
    /// Loads settings from a JSON file and applies `HL7_*` environment
    /// overrides. A missing or unparsable file is a fatal start-up error.
    pub fn load(path: &Path) -> Result<Hl7Settings> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let file: ConfigFile = serde_json::from_str(&raw).map_err(|e| {
            BridgeError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })?;
        let mut settings = file.hl7;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Applies `HL7_<KEY>` environment variables (key uppercased, e.g.
    /// `HL7_CLIENTPORT`) on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(format!("HL7_{}", key.to_uppercase())).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("Port").and_then(|v| v.parse().ok()) {
            self.port = v;
        }
        if let Some(v) = lookup("ClientHost") {
            self.client_host = v;
        }
        if let Some(v) = lookup("ClientPort").and_then(|v| v.parse().ok()) {
            self.client_port = v;
        }
        if let Some(v) = lookup("SendingApplication") {
            self.sending_application = v;
        }
        if let Some(v) = lookup("SendingFacility") {
            self.sending_facility = v;
        }
        if let Some(v) = lookup("ReceivingApplication") {
            self.receiving_application = v;
        }
        if let Some(v) = lookup("ReceivingFacility") {
            self.receiving_facility = v;
        }
        if let Some(v) = lookup("LogFilePath") {
            self.log_file_path = v;
        }
        if let Some(v) = lookup("AllowedEvents") {
            self.allowed_events = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("AckMode") {
            self.ack_mode = v;
        }
        if let Some(v) = lookup("MessageDateTimeFormat") {
            self.message_date_time_format = v;
        }
        if let Some(v) = lookup("DisconnectAfterAck").and_then(|v| v.parse().ok()) {
            self.disconnect_after_ack = v;
        }
        if let Some(v) = lookup("IsServer").and_then(|v| v.parse().ok()) {
            self.is_server = v;
        }
        if let Some(v) = lookup("Mode").and_then(|v| parse_mode(&v)) {
            self.mode = v;
        }
        if let Some(v) = lookup("ProxyDirection").and_then(|v| parse_direction(&v)) {
            self.proxy_direction = v;
        }
    }

    /// Resolves the `Mode`/`IsServer` pair into the mode the process runs in.
    /// `Mode: Proxy` wins; otherwise `IsServer` picks listener vs client.
    pub fn effective_mode(&self) -> Mode {
        match self.mode {
            Mode::Proxy => Mode::Proxy,
            Mode::Client => Mode::Client,
            Mode::Server => {
                if self.is_server {
                    Mode::Server
                } else {
                    Mode::Client
                }
            }
        }
    }
}

fn parse_mode(s: &str) -> Option<Mode> {
    match s {
        "Server" => Some(Mode::Server),
        "Client" => Some(Mode::Client),
        "Proxy" => Some(Mode::Proxy),
        _ => None,
    }
}

fn parse_direction(s: &str) -> Option<ProxyDirection> {
    match s {
        "ListenerToClient" => Some(ProxyDirection::ListenerToClient),
        "ClientToListener" => Some(ProxyDirection::ClientToListener),
        _ => None,
    }
}
