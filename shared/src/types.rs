use std::collections::BTreeMap;
use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::{DEFAULT_IGNORE_LIST, FIELD_FAVORITE, FIELD_HIDDEN, FIELD_ICON, FIELD_NAME};

/// Transport protocol of an observed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// One open port reported by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortObservation {
    pub port: u16,
    pub protocol: Protocol,
    pub state: String,
    /// Service name as reported by the scanner, e.g. "ssh"
    pub service_hint: String,
    /// Anything the scanner printed after the service name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A host found during one scan, not yet merged with stored overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub address: String,
    /// Reverse-DNS name the scanner printed beside the address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub ports: Vec<PortObservation>,
}

/// A port after best-effort title and icon discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedService {
    #[serde(flatten)]
    pub observed: PortObservation,
    /// Page title, else the service hint, else empty
    pub display_name: String,
    /// Public path of a stored icon asset
    #[serde(default)]
    pub icon: Option<String>,
}

impl EnrichedService {
    pub fn port(&self) -> u16 {
        self.observed.port
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSnapshot {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Effective favorite flag used for this cycle's scan depth
    pub favorite: bool,
    pub services: Vec<EnrichedService>,
}

/// The output of one completed discovery cycle.
/// Hosts are ordered by address and services by port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub scanned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hosts: Vec<HostSnapshot>,
}

/// A user-set overlay value. Literal "true"/"false" bodies become booleans.
/// Hand-edited documents may hold any other JSON value; it is kept as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OverlayValue {
    Bool(bool),
    Text(String),
    Other(serde_json::Value),
}

impl OverlayValue {
    pub fn from_text(raw: &str) -> Self {
        match raw {
            "true" => OverlayValue::Bool(true),
            "false" => OverlayValue::Bool(false),
            other => OverlayValue::Text(other.to_string()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OverlayValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OverlayValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Accessors for the well-known keys of an overlay field map
pub trait OverlayFields {
    fn fields(&self) -> &BTreeMap<String, OverlayValue>;

    fn name(&self) -> Option<&str> {
        self.fields().get(FIELD_NAME).and_then(OverlayValue::as_str)
    }

    fn favorite(&self) -> Option<bool> {
        self.fields().get(FIELD_FAVORITE).and_then(OverlayValue::as_bool)
    }

    fn hidden(&self) -> Option<bool> {
        self.fields().get(FIELD_HIDDEN).and_then(OverlayValue::as_bool)
    }

    fn icon(&self) -> Option<&str> {
        self.fields().get(FIELD_ICON).and_then(OverlayValue::as_str)
    }
}

/// Persisted per-service overrides, nested under a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayService {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, OverlayValue>,
}

impl OverlayService {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            first_seen: None,
            last_seen: None,
            fields: BTreeMap::new(),
        }
    }
}

impl OverlayFields for OverlayService {
    fn fields(&self) -> &BTreeMap<String, OverlayValue> {
        &self.fields
    }
}

/// Persisted per-host overrides and bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayHost {
    #[serde(rename = "ip")]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, rename = "openPorts")]
    pub services: Vec<OverlayService>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, OverlayValue>,
}

impl OverlayHost {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            first_seen: None,
            last_seen: None,
            services: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn service(&self, port: u16) -> Option<&OverlayService> {
        self.services.iter().find(|s| s.port == port)
    }
}

impl OverlayFields for OverlayHost {
    fn fields(&self) -> &BTreeMap<String, OverlayValue> {
        &self.fields
    }
}

/// The full user-editable overlay document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayConfig {
    #[serde(default = "default_ignore_list")]
    pub ignore_list: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<OverlayHost>,
}

fn default_ignore_list() -> Vec<String> {
    DEFAULT_IGNORE_LIST.iter().map(|s| s.to_string()).collect()
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            ignore_list: default_ignore_list(),
            hosts: Vec::new(),
        }
    }
}

impl OverlayConfig {
    pub fn host(&self, address: &str) -> Option<&OverlayHost> {
        self.hosts.iter().find(|h| h.address == address)
    }
}

/// Presentation of one service: snapshot data with overrides applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceView {
    pub port: u16,
    pub protocol: Protocol,
    pub service_hint: String,
    pub name: String,
    pub icon: Option<String>,
    pub favorite: bool,
    pub hidden: bool,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// User keys beyond the well-known ones
    #[serde(flatten)]
    pub extra: BTreeMap<String, OverlayValue>,
}

/// Presentation of one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostView {
    pub address: String,
    pub name: String,
    pub favorite: bool,
    pub hidden: bool,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub services: Vec<ServiceView>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, OverlayValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_value_coercion() {
        assert_eq!(OverlayValue::from_text("true"), OverlayValue::Bool(true));
        assert_eq!(OverlayValue::from_text("false"), OverlayValue::Bool(false));
        assert_eq!(
            OverlayValue::from_text("True"),
            OverlayValue::Text("True".to_string())
        );
    }

    #[test]
    fn test_overlay_document_shape() {
        let json = r#"{
            "hosts": [{
                "ip": "10.0.0.5",
                "favorite": true,
                "name": "nas",
                "openPorts": [{ "port": 80, "name": "My Printer" }]
            }]
        }"#;
        let config: OverlayConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.ignore_list, vec!["upnp", "https-alt", "ajp13"]);
        let host = config.host("10.0.0.5").unwrap();
        assert_eq!(host.favorite(), Some(true));
        assert_eq!(host.name(), Some("nas"));
        assert_eq!(host.service(80).unwrap().name(), Some("My Printer"));
        assert!(!host.fields.contains_key("openPorts"));
    }

    #[test]
    fn test_hand_edited_values_are_kept() {
        let json = r#"{
            "hosts": [{
                "ip": "10.0.0.5",
                "order": 3,
                "note": null,
                "tags": ["nas", "backup"],
                "openPorts": []
            }]
        }"#;
        let config: OverlayConfig = serde_json::from_str(json).unwrap();

        let host = config.host("10.0.0.5").unwrap();
        assert_eq!(host.fields["order"], OverlayValue::Other(serde_json::json!(3)));
        assert_eq!(host.fields["note"], OverlayValue::Other(serde_json::Value::Null));
        assert_eq!(host.fields["order"].as_str(), None);

        let written = serde_json::to_value(&config).unwrap();
        assert_eq!(written["hosts"][0]["order"], 3);
        assert_eq!(written["hosts"][0]["tags"][1], "backup");
    }
}
