use anyhow::{Context, Result};
use regex::Regex;
use url::Url;

/// The kind of a discovered remote resource. Documents recurse; everything
/// else is a leaf of the resource tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Script,
    Image,
    Video,
}

impl ResourceKind {
    /// Text resources are worth compressing in the cache; images and video
    /// arrive already compressed and are stored raw.
    pub fn is_text(&self) -> bool {
        matches!(self, ResourceKind::Document | ResourceKind::Stylesheet | ResourceKind::Script)
    }
}

/// A resource discovered in markup, identified by its absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResource {
    /// Absolute URL after resolution against the containing page.
    pub url: Url,
    /// The literal attribute value as it appeared in the markup. This is the
    /// substring the rewriter replaces.
    pub raw: String,
    pub kind: ResourceKind,
}

/// Best-effort resource discovery over raw HTML text.
///
/// This is deliberately not an HTML parser. Each method matches one specific
/// attribute shape with tolerant quoting, which is sufficient for the
/// resources a mirror needs and is the documented contract. Malformed or
/// deeply nested markup may be missed; that degrades the mirror, it does not
/// break it.
pub struct Extractor {
    link_re: Regex,
    stylesheet_re: Regex,
    script_re: Regex,
    image_re: Regex,
    video_re: Regex,
    css_url_re: Regex,
}

impl Extractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            link_re: Regex::new(r#"<a[^>]*href=["'](https?://[^"']+)["']"#)
                .context("failed to compile link pattern")?,
            stylesheet_re: Regex::new(r#"<link[^>]*rel=["']stylesheet["'][^>]*href=["']([^"']+)["']"#)
                .context("failed to compile stylesheet pattern")?,
            script_re: Regex::new(r#"<script[^>]*src=["']([^"']+)["']"#)
                .context("failed to compile script pattern")?,
            image_re: Regex::new(r#"src=["']([^"']+\.(?:jpg|jpeg|png|gif))["']"#)
                .context("failed to compile image pattern")?,
            video_re: Regex::new(r#"src=["']([^"']+\.(?:mp4|mov|avi))["']"#)
                .context("failed to compile video pattern")?,
            css_url_re: Regex::new(r#"url\(['"]?([^'")\s]+)['"]?\)"#)
                .context("failed to compile css url pattern")?,
        })
    }

    /// Anchor `href` values with an http or https scheme. Duplicates are
    /// kept; deduplication is the coordinator's job.
    pub fn extract_links(&self, html: &str) -> Vec<String> {
        self.captures(&self.link_re, html)
    }

    /// `href` values of stylesheet link tags.
    pub fn extract_stylesheets(&self, html: &str) -> Vec<String> {
        self.captures(&self.stylesheet_re, html)
    }

    /// `src` values of external script tags. Inline script bodies are
    /// ignored; they cannot be rewritten to local paths safely.
    pub fn extract_scripts(&self, html: &str) -> Vec<String> {
        self.captures(&self.script_re, html)
    }

    /// `src` values with image or video file extensions, tagged with their kind.
    pub fn extract_media(&self, html: &str) -> Vec<(String, ResourceKind)> {
        let mut media: Vec<(String, ResourceKind)> = self
            .captures(&self.image_re, html)
            .into_iter()
            .map(|u| (u, ResourceKind::Image))
            .collect();
        media.extend(
            self.captures(&self.video_re, html)
                .into_iter()
                .map(|u| (u, ResourceKind::Video)),
        );
        media
    }

    /// `url(...)` references inside stylesheet text, so backgrounds render
    /// offline too.
    pub fn extract_css_urls(&self, css: &str) -> Vec<String> {
        self.captures(&self.css_url_re, css)
    }

    /// Every leaf resource referenced by a page, with raw attribute values
    /// resolved against the page URL. Unparseable references are skipped.
    pub fn discover_leaves(&self, html: &str, page_url: &Url) -> Vec<RemoteResource> {
        let mut resources = Vec::new();
        for raw in self.extract_stylesheets(html) {
            self.push_resolved(&mut resources, page_url, raw, ResourceKind::Stylesheet);
        }
        for raw in self.extract_scripts(html) {
            self.push_resolved(&mut resources, page_url, raw, ResourceKind::Script);
        }
        for (raw, kind) in self.extract_media(html) {
            self.push_resolved(&mut resources, page_url, raw, kind);
        }
        resources
    }

    /// Page links resolved against the page URL.
    pub fn discover_links(&self, html: &str, page_url: &Url) -> Vec<RemoteResource> {
        let mut resources = Vec::new();
        for raw in self.extract_links(html) {
            self.push_resolved(&mut resources, page_url, raw, ResourceKind::Document);
        }
        resources
    }

    fn push_resolved(
        &self,
        out: &mut Vec<RemoteResource>,
        base: &Url,
        raw: String,
        kind: ResourceKind,
    ) {
        match resolve_url(base, &raw) {
            Some(url) if matches!(url.scheme(), "http" | "https") => {
                out.push(RemoteResource { url, raw, kind });
            }
            _ => {}
        }
    }

    fn captures(&self, re: &Regex, text: &str) -> Vec<String> {
        re.captures_iter(text)
            .filter_map(|cap| cap.get(1))
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

/// Resolves a reference as it appears in markup to an absolute URL.
///
/// Handles absolute URLs, protocol-relative references, and paths relative
/// to the containing page.
pub fn resolve_url(base: &Url, raw: &str) -> Option<Url> {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        Url::parse(raw).ok()
    } else if let Some(rest) = raw.strip_prefix("//") {
        Url::parse(&format!("{}://{}", base.scheme(), rest)).ok()
    } else if raw.contains("://") {
        Url::parse(raw).ok()
    } else {
        base.join(raw).ok()
    }
}
