use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use shared::protocol::ICON_URL_PREFIX;

/// Detect an image type from its leading bytes.
/// Returns the file extension to store it under.
pub fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("png");
    }
    if bytes.starts_with(b"\xff\xd8\xff") {
        return Some("jpg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("gif");
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("webp");
    }
    if bytes.starts_with(b"BM") && bytes.len() > 14 {
        return Some("bmp");
    }
    if bytes.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        return Some("ico");
    }
    sniff_markup(bytes)
}

/// SVG documents, including ones that only show an XML prolog up front.
fn sniff_markup(bytes: &[u8]) -> Option<&'static str> {
    let head = &bytes[..bytes.len().min(1024)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    let lower = text.to_ascii_lowercase();

    let svg_after_comment = lower.starts_with("<!--") && lower.contains("<svg");
    if lower.starts_with("<svg") || lower.starts_with("<?xml") || lower.starts_with("<!doctype svg") || svg_after_comment {
        // generic XML is served as SVG, the only XML icon format browsers render
        return Some("svg");
    }
    None
}

/// `{sha256}.{ext}` for the given bytes
pub fn asset_name(bytes: &[u8], ext: &str) -> String {
    format!("{}.{}", hex::encode(Sha256::digest(bytes)), ext)
}

/// True for names this store could have produced; guards the static route.
pub fn is_asset_name(name: &str) -> bool {
    match name.split_once('.') {
        Some((hash, ext)) => {
            hash.len() == 64
                && hash.bytes().all(|b| b.is_ascii_hexdigit())
                && !ext.is_empty()
                && ext.bytes().all(|b| b.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// A directory of content-addressed icon files.
#[derive(Debug, Clone)]
pub struct IconStore {
    dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum IconError {
    #[error("unrecognised image type")]
    UnknownType,
    #[error("failed to write icon: {0}")]
    Io(#[from] std::io::Error),
}

impl IconStore {
    /// Open the store, creating the directory if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create icon directory: {}", dir.display()))?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store the bytes under their content hash and return the public path.
    /// Storing identical bytes again is a no-op returning the same path.
    pub async fn store(&self, bytes: &[u8]) -> Result<String, IconError> {
        let ext = sniff_extension(bytes).ok_or(IconError::UnknownType)?;
        let name = asset_name(bytes, ext);
        let path = self.dir.join(&name);

        if !tokio::fs::try_exists(&path).await? {
            static WRITES: AtomicU64 = AtomicU64::new(0);
            let seq = WRITES.fetch_add(1, Ordering::Relaxed);
            let tmp = self.dir.join(format!(".{}.{}.tmp", name, seq));
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
            tracing::debug!("Stored icon {}", name);
        }

        Ok(format!("{}/{}", ICON_URL_PREFIX, name))
    }

    /// Read an asset by name, `None` if absent or not an asset name
    pub async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if !is_asset_name(name) {
            return Ok(None);
        }
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read icon {}", name)),
        }
    }
}

/// Content type for a stored asset's extension
pub fn content_type(name: &str) -> &'static str {
    match name.rsplit('.').next().unwrap_or_default() {
        "png" => "image/png",
        "jpg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}
