//! Just enough HTML scanning to pull a page title and favicon hints out of a
//! device's landing page. Embedded web UIs are rarely well-formed, so this
//! works tag by tag instead of building a document tree.

use std::collections::HashMap;
use std::sync::OnceLock;
use regex::Regex;

fn re_title() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").unwrap())
}

fn re_tag(name: &str) -> Regex {
    Regex::new(&format!(r"(?is)<{}\b([^>]*)>", name)).unwrap()
}

fn re_meta() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re_tag("meta"))
}

fn re_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re_tag("link"))
}

fn re_attr() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
    })
}

fn re_whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Attributes of a single tag, names lowercased.
fn attributes(raw: &str) -> HashMap<String, String> {
    re_attr()
        .captures_iter(raw)
        .map(|caps| {
            let name = caps[1].to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| decode_entities(m.as_str()))
                .unwrap_or_default();
            (name, value)
        })
        .collect()
}

fn tags<'a>(re: &'a Regex, html: &'a str) -> impl Iterator<Item = HashMap<String, String>> + 'a {
    re.captures_iter(html).map(|caps| attributes(&caps[1]))
}

fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

fn clean_text(s: &str) -> String {
    re_whitespace()
        .replace_all(&decode_entities(s), " ")
        .trim()
        .to_string()
}

/// The `<title>` text, else the Open Graph title. Empty values don't count.
pub fn extract_title(html: &str) -> Option<String> {
    let title = re_title()
        .captures(html)
        .map(|caps| clean_text(&caps[1]))
        .filter(|t| !t.is_empty());
    if title.is_some() {
        return title;
    }

    tags(re_meta(), html)
        .find(|attrs| attrs.get("property").map(String::as_str) == Some("og:title"))
        .and_then(|attrs| attrs.get("content").map(|c| clean_text(c)))
        .filter(|t| !t.is_empty())
}

/// An icon advertised by a page, before URL resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconHint {
    pub href: String,
    /// Largest declared width; 0 when undeclared
    pub width: u32,
}

/// What a page advertises about its icons.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PageIcons {
    pub icons: Vec<IconHint>,
    pub manifest: Option<String>,
}

/// Collect favicon hints: `<link rel=*icon*>`, the Windows tile image and a
/// Web App Manifest reference.
pub fn extract_icons(html: &str) -> PageIcons {
    let mut page = PageIcons::default();

    for attrs in tags(re_link(), html) {
        let Some(href) = attrs.get("href").map(|h| h.trim()).filter(|h| !h.is_empty()) else {
            continue;
        };
        let rel = attrs.get("rel").map(|r| r.to_ascii_lowercase()).unwrap_or_default();

        if rel.split_whitespace().any(|token| token.contains("icon")) {
            page.icons.push(IconHint {
                href: href.to_string(),
                width: attrs.get("sizes").map(|s| parse_sizes(s)).unwrap_or(0),
            });
        } else if rel.split_whitespace().any(|token| token == "manifest") && page.manifest.is_none() {
            page.manifest = Some(href.to_string());
        }
    }

    for attrs in tags(re_meta(), html) {
        let is_tile = attrs
            .get("name")
            .is_some_and(|n| n.eq_ignore_ascii_case("msapplication-TileImage"));
        if let (true, Some(content)) = (is_tile, attrs.get("content")) {
            if !content.trim().is_empty() {
                page.icons.push(IconHint {
                    href: content.trim().to_string(),
                    // the tag declares no size
                    width: 0,
                });
            }
        }
    }

    page
}

/// `"16x16 32x32"` -> 32, `"any"` -> 0
pub fn parse_sizes(sizes: &str) -> u32 {
    sizes
        .split_whitespace()
        .filter_map(|size| {
            let (w, _h) = size.split_once(['x', 'X'])?;
            w.parse::<u32>().ok()
        })
        .max()
        .unwrap_or(0)
}
