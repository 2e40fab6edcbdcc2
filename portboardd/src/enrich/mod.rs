pub mod favicon;
pub mod html;

use std::net::IpAddr;
use std::time::Instant;
use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;
use shared::types::{EnrichedService, PortObservation, Protocol};
use crate::config::EnrichConfig;
use crate::icons::{IconError, IconStore};

/// Best-effort naming of a discovered service. Never fails: anything that
/// cannot be fetched degrades to an empty or absent field.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, address: &str, observed: &PortObservation) -> EnrichedService;
}

#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("no favicon advertised")]
    NoCandidate,
    #[error(transparent)]
    Icon(#[from] IconError),
}

/// Root URL of a service; IPv6 literals get brackets.
pub fn service_url(address: &str, port: u16) -> Result<Url, url::ParseError> {
    let host = match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
        _ => address.to_string(),
    };
    Url::parse(&format!("http://{}:{}/", host, port))
}

/// Probes services over plain HTTP for a page title and a favicon.
pub struct HttpEnricher {
    client: reqwest::Client,
    icons: IconStore,
    denylist: Vec<String>,
    target_width: u32,
}

impl HttpEnricher {
    pub fn new(config: &EnrichConfig, icons: IconStore) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            // appliances redirect to https with self-signed certificates
            .danger_accept_invalid_certs(true)
            .user_agent(concat!("portboard/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            icons,
            denylist: config.title_denylist.clone(),
            target_width: config.icon_target_width,
        })
    }

    /// Hints whose root page is never requested; only `/favicon.ico` is tried
    fn title_denied(&self, observed: &PortObservation) -> bool {
        self.denylist.iter().any(|d| d == &observed.service_hint)
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response, EnrichError> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(EnrichError::Status(response.status()));
        }
        Ok(response)
    }

    async fn fetch_page(&self, url: &Url) -> Result<String, EnrichError> {
        let started = Instant::now();
        let body = self.get(url).await?.text().await?;
        tracing::debug!("Fetched {} in {:?}", url, started.elapsed());
        Ok(body)
    }

    async fn candidates(&self, base: &Url, page: &str) -> Vec<favicon::Candidate> {
        let hints = html::extract_icons(page);
        let mut candidates = favicon::from_hints(base, &hints.icons);

        if let Some(href) = hints.manifest {
            match base.join(&href) {
                Ok(manifest_url) => match self.fetch_page(&manifest_url).await {
                    Ok(body) => candidates.extend(favicon::from_manifest(&manifest_url, &body)),
                    Err(e) => tracing::debug!("Skipping manifest {}: {}", manifest_url, e),
                },
                Err(e) => tracing::debug!("Skipping manifest {}: {}", href, e),
            }
        }

        if candidates.is_empty() {
            candidates.extend(favicon::fallback(base));
        }
        candidates
    }

    async fn fetch_icon(&self, candidates: &[favicon::Candidate]) -> Result<String, EnrichError> {
        let best = favicon::pick_best(candidates, self.target_width)
            .ok_or(EnrichError::NoCandidate)?;

        tracing::debug!("Downloading favicon {} (width {})", best.url, best.width);
        let bytes = self.get(&best.url).await?.bytes().await?;
        Ok(self.icons.store(&bytes).await?)
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    async fn enrich(&self, address: &str, observed: &PortObservation) -> EnrichedService {
        let port = observed.port;
        let mut title = None;
        let mut icon = None;

        if observed.protocol == Protocol::Tcp {
            match service_url(address, port) {
                Ok(base) => {
                    let candidates = if self.title_denied(observed) {
                        Some(favicon::fallback(&base).into_iter().collect())
                    } else {
                        match self.fetch_page(&base).await {
                            Ok(body) => {
                                title = html::extract_title(&body);
                                if title.is_none() {
                                    tracing::warn!(address, port, field = "title", "Page has no title");
                                }
                                Some(self.candidates(&base, &body).await)
                            }
                            Err(error) => {
                                tracing::warn!(address, port, field = "title,icon", %error, "Page unavailable");
                                None
                            }
                        }
                    };

                    if let Some(candidates) = candidates {
                        match self.fetch_icon(&candidates).await {
                            Ok(path) => icon = Some(path),
                            Err(error) => {
                                tracing::warn!(address, port, field = "icon", %error, "Icon unavailable")
                            }
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(address, port, field = "title,icon", %error, "Invalid service address")
                }
            }
        }

        let display_name = title
            .or_else(|| Some(observed.service_hint.clone()).filter(|h| !h.is_empty()))
            .unwrap_or_default();

        EnrichedService {
            observed: observed.clone(),
            display_name,
            icon,
        }
    }
}
