//! Sitemap XML extraction.
//!
//! Handles both `<urlset>` page lists and `<sitemapindex>` files pointing at
//! further sitemaps. A lightweight `<loc>` scan is deliberate: sitemaps in
//! the wild are frequently malformed, and links found before any breakage
//! must be kept.

use regex::Regex;

use super::{ExtractedLink, LinkKind};
use crate::models::LinkType;
use crate::urlnorm::UrlInfo;

pub struct SitemapExtractor {
    loc_re: Regex,
}

impl SitemapExtractor {
    pub fn new() -> Self {
        Self {
            loc_re: Regex::new(r"<loc>\s*([^<]+?)\s*</loc>").expect("static regex"),
        }
    }

    pub fn extract(&self, base_url: &UrlInfo, body: &str) -> Vec<ExtractedLink> {
        let is_index = body.contains("<sitemapindex");
        let mut links = Vec::new();

        for capture in self.loc_re.captures_iter(body) {
            let raw = unescape_xml(&capture[1]);
            let Ok(url) = base_url.join(raw.trim()) else {
                continue;
            };

            links.push(ExtractedLink {
                url,
                kind: LinkKind::SitemapEntry,
                link_type: if is_index {
                    Some(LinkType::Sitemap)
                } else {
                    Some(LinkType::Html)
                },
            });
        }

        links
    }
}

impl Default for SitemapExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// `Sitemap:` directives from a robots.txt body.
pub fn sitemaps_in_robots(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("sitemap") {
                let value = value.trim();
                if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            } else {
                None
            }
        })
        .collect()
}

fn unescape_xml(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> UrlInfo {
        UrlInfo::parse(s).unwrap()
    }

    #[test]
    fn test_urlset() {
        let extractor = SitemapExtractor::new();
        let links = extractor.extract(
            &url("http://h/sitemap.xml"),
            r#"<?xml version="1.0"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>http://h/page1</loc></url>
              <url><loc>http://h/page2?a=1&amp;b=2</loc></url>
            </urlset>"#,
        );

        assert_eq!(links.len(), 2);
        assert_eq!(links[0].url.fetch_url(), "http://h/page1");
        assert_eq!(links[1].url.query(), Some("a=1&b=2"));
        assert!(links.iter().all(|l| l.link_type == Some(LinkType::Html)));
    }

    #[test]
    fn test_sitemap_index() {
        let extractor = SitemapExtractor::new();
        let links = extractor.extract(
            &url("http://h/sitemap.xml"),
            r#"<sitemapindex>
              <sitemap><loc>http://h/sitemap-1.xml</loc></sitemap>
            </sitemapindex>"#,
        );

        assert_eq!(links.len(), 1);
        assert_eq!(links[0].link_type, Some(LinkType::Sitemap));
    }

    #[test]
    fn test_truncated_sitemap_keeps_early_entries() {
        let extractor = SitemapExtractor::new();
        let links = extractor.extract(
            &url("http://h/sitemap.xml"),
            "<urlset><url><loc>http://h/ok</loc></url><url><loc>http://h/cut",
        );
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url.fetch_url(), "http://h/ok");
    }

    #[test]
    fn test_sitemaps_in_robots() {
        let sitemaps = sitemaps_in_robots(
            "User-agent: *\nDisallow: /private/\nSitemap: http://h/sitemap.xml\nsitemap: http://h/other.xml\n",
        );
        assert_eq!(
            sitemaps,
            vec!["http://h/sitemap.xml", "http://h/other.xml"]
        );
    }
}
