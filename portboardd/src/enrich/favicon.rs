use serde::Deserialize;
use url::Url;
use super::html::{parse_sizes, IconHint};

/// A resolved, fetchable icon URL with its declared width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub url: Url,
    pub width: u32,
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    icons: Vec<ManifestIcon>,
}

#[derive(Deserialize)]
struct ManifestIcon {
    src: String,
    #[serde(default)]
    sizes: Option<String>,
}

fn resolve(base: &Url, href: &str, width: u32) -> Option<Candidate> {
    let url = base.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(Candidate { url, width })
}

/// Resolve page hints against the page URL, dropping data: and other
/// unfetchable schemes.
pub fn from_hints(base: &Url, hints: &[IconHint]) -> Vec<Candidate> {
    hints
        .iter()
        .filter_map(|hint| resolve(base, &hint.href, hint.width))
        .collect()
}

/// Icons listed in a Web App Manifest, resolved against the manifest URL.
pub fn from_manifest(manifest_url: &Url, body: &str) -> Vec<Candidate> {
    let manifest: Manifest = match serde_json::from_str(body) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("Ignoring unparseable manifest {}: {}", manifest_url, e);
            return Vec::new();
        }
    };

    manifest
        .icons
        .iter()
        .filter_map(|icon| {
            let width = icon.sizes.as_deref().map(parse_sizes).unwrap_or(0);
            resolve(manifest_url, &icon.src, width)
        })
        .collect()
}

/// The conventional location, tried when a page advertises nothing.
pub fn fallback(base: &Url) -> Option<Candidate> {
    resolve(base, "/favicon.ico", 0)
}

/// The candidate whose width is closest to `target`; earlier wins ties.
pub fn pick_best(candidates: &[Candidate], target: u32) -> Option<&Candidate> {
    candidates.iter().min_by_key(|c| c.width.abs_diff(target))
}
