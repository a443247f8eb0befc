//! Link extraction from fetched documents.
//!
//! The dispatcher picks an extractor by content type (with a file-extension
//! fallback) and returns whatever links were found; a parse error partway
//! through keeps the links collected before it. Extractors never deduplicate,
//! the frontier owns that.

mod css;
mod html;
mod sitemap;

pub use css::CssExtractor;
pub use html::HtmlExtractor;
pub use sitemap::{sitemaps_in_robots, SitemapExtractor};

use crate::models::LinkType;
use crate::urlnorm::UrlInfo;

/// How a link was referenced by its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Navigational link to another page.
    LinkedPage,
    /// Resource needed to render the page (image, stylesheet, ...).
    PageRequisite,
    /// Script reference; a requisite with its own content class.
    ScriptSrc,
    /// Entry found in a sitemap.
    SitemapEntry,
}

impl LinkKind {
    pub fn is_inline(&self) -> bool {
        matches!(self, LinkKind::PageRequisite | LinkKind::ScriptSrc)
    }
}

/// One link discovered in a document.
#[derive(Debug, Clone)]
pub struct ExtractedLink {
    pub url: UrlInfo,
    pub kind: LinkKind,
    /// Expected content class of the target, when the reference implies one.
    pub link_type: Option<LinkType>,
}

/// Routes response bodies to the extractor for their format.
pub struct ScrapeDispatcher {
    html: HtmlExtractor,
    css: CssExtractor,
    sitemap: SitemapExtractor,
}

impl ScrapeDispatcher {
    pub fn new(follow_tags: Option<Vec<String>>, ignore_tags: Vec<String>) -> Self {
        Self {
            html: HtmlExtractor::new(follow_tags, ignore_tags),
            css: CssExtractor::new(),
            sitemap: SitemapExtractor::new(),
        }
    }

    /// Whether any extractor applies, so callers can skip materializing
    /// bodies that would never be parsed.
    pub fn wants(
        &self,
        base_url: &UrlInfo,
        content_type: Option<&str>,
        expected: Option<LinkType>,
    ) -> bool {
        self.pick(base_url, content_type, expected).is_some()
    }

    /// Extract links from a response body.
    ///
    /// `content_type` is the bare MIME type from the response;
    /// `expected` is the link type recorded when the URL was discovered.
    pub fn scrape(
        &self,
        base_url: &UrlInfo,
        content_type: Option<&str>,
        expected: Option<LinkType>,
        body: &[u8],
    ) -> Vec<ExtractedLink> {
        match self.pick(base_url, content_type, expected) {
            Some(Format::Html) => {
                let text = String::from_utf8_lossy(body);
                self.html.extract(base_url, &text)
            }
            Some(Format::Css) => {
                let text = String::from_utf8_lossy(body);
                self.css.extract(base_url, &text)
            }
            Some(Format::Sitemap) => {
                let text = String::from_utf8_lossy(body);
                self.sitemap.extract(base_url, &text)
            }
            None => Vec::new(),
        }
    }

    fn pick(
        &self,
        url: &UrlInfo,
        content_type: Option<&str>,
        expected: Option<LinkType>,
    ) -> Option<Format> {
        if let Some(content_type) = content_type {
            let content_type = content_type.to_ascii_lowercase();
            if content_type.contains("html") {
                return Some(Format::Html);
            }
            if content_type.contains("css") {
                return Some(Format::Css);
            }
            if content_type.contains("xml") {
                if expected == Some(LinkType::Sitemap) || url.path().contains("sitemap") {
                    return Some(Format::Sitemap);
                }
                return None;
            }
        }

        match expected {
            Some(LinkType::Html) => return Some(Format::Html),
            Some(LinkType::Css) => return Some(Format::Css),
            Some(LinkType::Sitemap) => return Some(Format::Sitemap),
            _ => {}
        }

        let path = url.path().to_ascii_lowercase();
        if path.ends_with(".html") || path.ends_with(".htm") || path.ends_with('/') {
            Some(Format::Html)
        } else if path.ends_with(".css") {
            Some(Format::Css)
        } else if path.ends_with(".xml") && path.contains("sitemap") {
            Some(Format::Sitemap)
        } else {
            None
        }
    }
}

enum Format {
    Html,
    Css,
    Sitemap,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> UrlInfo {
        UrlInfo::parse(s).unwrap()
    }

    #[test]
    fn test_dispatch_by_content_type() {
        let dispatcher = ScrapeDispatcher::new(None, Vec::new());
        let base = url("http://h/");

        let links = dispatcher.scrape(
            &base,
            Some("text/html"),
            None,
            b"<a href=\"/next\">n</a>",
        );
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url.fetch_url(), "http://h/next");

        let links = dispatcher.scrape(
            &base,
            Some("text/css"),
            None,
            b"body { background: url(/bg.png); }",
        );
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].kind, LinkKind::PageRequisite);
    }

    #[test]
    fn test_dispatch_ignores_binary() {
        let dispatcher = ScrapeDispatcher::new(None, Vec::new());
        let links = dispatcher.scrape(
            &url("http://h/img.png"),
            Some("image/png"),
            None,
            &[0x89, 0x50, 0x4e, 0x47],
        );
        assert!(links.is_empty());
    }

    #[test]
    fn test_dispatch_sitemap_by_hint() {
        let dispatcher = ScrapeDispatcher::new(None, Vec::new());
        let links = dispatcher.scrape(
            &url("http://h/feed.xml"),
            Some("application/xml"),
            Some(LinkType::Sitemap),
            b"<urlset><url><loc>http://h/page</loc></url></urlset>",
        );
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].kind, LinkKind::SitemapEntry);
    }
}
