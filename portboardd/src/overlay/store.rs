use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use shared::protocol::RESERVED_FIELDS;
use shared::types::{OverlayConfig, OverlayHost, OverlayService, OverlayValue};

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("field {0:?} is maintained by the scanner and cannot be set")]
    ReservedField(String),
    #[error("failed to write overlay: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode overlay: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("overlay store is not running")]
    Closed,
}

/// The user overlay document and where it lives on disk.
pub struct OverlayStore {
    path: PathBuf,
    config: OverlayConfig,
}

fn stamp(first_seen: &mut Option<DateTime<Utc>>, last_seen: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) {
    first_seen.get_or_insert(at);
    *last_seen = Some(last_seen.map_or(at, |prev| prev.max(at)));
}

impl OverlayStore {
    /// Load the overlay at `path`; a missing file yields the default document
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = Self::load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    pub fn load(path: &Path) -> Result<OverlayConfig> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No overlay at {}, starting empty", path.display());
                return Ok(OverlayConfig::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read overlay: {}", path.display()))
            }
        };

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse overlay: {}", path.display()))
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Look up a host entry, creating it with defaults if absent
    pub fn get_or_create_host(&mut self, address: &str) -> &mut OverlayHost {
        let idx = match self.config.hosts.iter().position(|h| h.address == address) {
            Some(idx) => idx,
            None => {
                self.config.hosts.push(OverlayHost::new(address));
                self.config.hosts.len() - 1
            }
        };
        &mut self.config.hosts[idx]
    }

    /// Look up a service entry (and its host), creating either if absent
    pub fn get_or_create_service(&mut self, address: &str, port: u16) -> &mut OverlayService {
        let host = self.get_or_create_host(address);
        let idx = match host.services.iter().position(|s| s.port == port) {
            Some(idx) => idx,
            None => {
                host.services.push(OverlayService::new(port));
                host.services.len() - 1
            }
        };
        &mut host.services[idx]
    }

    /// Record that a host was seen at `at`
    pub fn observe_host(&mut self, address: &str, at: DateTime<Utc>) -> OverlayHost {
        let host = self.get_or_create_host(address);
        stamp(&mut host.first_seen, &mut host.last_seen, at);
        host.clone()
    }

    /// Record that a service was seen at `at`
    pub fn observe_service(&mut self, address: &str, port: u16, at: DateTime<Utc>) -> OverlayService {
        let service = self.get_or_create_service(address, port);
        stamp(&mut service.first_seen, &mut service.last_seen, at);
        service.clone()
    }

    /// Set a user field on a host, or on one of its services, then persist.
    pub fn set_field(
        &mut self,
        address: &str,
        port: Option<u16>,
        key: &str,
        value: OverlayValue,
    ) -> Result<(), OverlayError> {
        if key.is_empty() || RESERVED_FIELDS.contains(&key) {
            return Err(OverlayError::ReservedField(key.to_string()));
        }

        let fields = match port {
            Some(port) => &mut self.get_or_create_service(address, port).fields,
            None => &mut self.get_or_create_host(address).fields,
        };
        fields.insert(key.to_string(), value);

        self.persist()
    }

    /// Write the whole document; readers never see a partial file
    pub fn persist(&self) -> Result<(), OverlayError> {
        let json = serde_json::to_string_pretty(&self.config)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
