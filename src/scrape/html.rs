//! HTML link extraction.

use scraper::{Html, Selector};
use tracing::trace;

use super::{ExtractedLink, LinkKind};
use crate::models::LinkType;
use crate::urlnorm::UrlInfo;

/// Table of elements and the attribute carrying their reference.
const LINK_SOURCES: &[(&str, &str, LinkKind, Option<LinkType>)] = &[
    ("a", "href", LinkKind::LinkedPage, None),
    ("area", "href", LinkKind::LinkedPage, None),
    ("frame", "src", LinkKind::PageRequisite, Some(LinkType::Html)),
    ("iframe", "src", LinkKind::PageRequisite, Some(LinkType::Html)),
    ("img", "src", LinkKind::PageRequisite, Some(LinkType::Media)),
    ("input", "src", LinkKind::PageRequisite, Some(LinkType::Media)),
    ("embed", "src", LinkKind::PageRequisite, Some(LinkType::Media)),
    ("source", "src", LinkKind::PageRequisite, Some(LinkType::Media)),
    ("audio", "src", LinkKind::PageRequisite, Some(LinkType::Media)),
    ("video", "src", LinkKind::PageRequisite, Some(LinkType::Media)),
    ("track", "src", LinkKind::PageRequisite, Some(LinkType::Media)),
    ("object", "data", LinkKind::PageRequisite, Some(LinkType::Media)),
    ("script", "src", LinkKind::ScriptSrc, Some(LinkType::JavaScript)),
];

pub struct HtmlExtractor {
    /// When set, only these elements contribute navigational links.
    follow_tags: Option<Vec<String>>,
    ignore_tags: Vec<String>,
    base_selector: Selector,
    meta_refresh_selector: Selector,
    link_selector: Selector,
}

impl HtmlExtractor {
    pub fn new(follow_tags: Option<Vec<String>>, ignore_tags: Vec<String>) -> Self {
        Self {
            follow_tags: follow_tags
                .map(|tags| tags.into_iter().map(|t| t.to_ascii_lowercase()).collect()),
            ignore_tags: ignore_tags
                .into_iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            base_selector: Selector::parse("base[href]").expect("static selector"),
            meta_refresh_selector: Selector::parse("meta[http-equiv]").expect("static selector"),
            link_selector: Selector::parse("link[href]").expect("static selector"),
        }
    }

    pub fn extract(&self, base_url: &UrlInfo, body: &str) -> Vec<ExtractedLink> {
        let document = Html::parse_document(body);
        let mut links = Vec::new();

        // <base href> overrides the resolution base for the whole document.
        let base = document
            .select(&self.base_selector)
            .next()
            .and_then(|el| el.value().attr("href"))
            .and_then(|href| base_url.join(href).ok())
            .unwrap_or_else(|| base_url.clone());

        for (tag, attr, kind, link_type) in LINK_SOURCES {
            if self.skips(tag, *kind) {
                continue;
            }
            let selector = match Selector::parse(&format!("{tag}[{attr}]")) {
                Ok(selector) => selector,
                Err(_) => continue,
            };
            for element in document.select(&selector) {
                if let Some(value) = element.value().attr(attr) {
                    push_link(&mut links, &base, value, *kind, *link_type);
                }
            }
        }

        // <link> elements split by rel: stylesheets and icons are
        // requisites, everything else is ignored.
        if !self.skips("link", LinkKind::PageRequisite) {
            for element in document.select(&self.link_selector) {
                let rel = element.value().attr("rel").unwrap_or("").to_ascii_lowercase();
                let link_type = if rel.contains("stylesheet") {
                    Some(LinkType::Css)
                } else if rel.contains("icon") {
                    Some(LinkType::Media)
                } else {
                    continue;
                };
                if let Some(href) = element.value().attr("href") {
                    push_link(&mut links, &base, href, LinkKind::PageRequisite, link_type);
                }
            }
        }

        // <meta http-equiv="refresh" content="0; url=/next">
        for element in document.select(&self.meta_refresh_selector) {
            let equiv = element.value().attr("http-equiv").unwrap_or("");
            if !equiv.eq_ignore_ascii_case("refresh") {
                continue;
            }
            if let Some(content) = element.value().attr("content") {
                if let Some(target) = meta_refresh_url(content) {
                    push_link(&mut links, &base, target, LinkKind::LinkedPage, None);
                }
            }
        }

        trace!(url = base_url.fetch_url(), count = links.len(), "html links");
        links
    }

    fn skips(&self, tag: &str, kind: LinkKind) -> bool {
        if self.ignore_tags.iter().any(|t| t == tag) {
            return true;
        }
        // --follow-tags narrows navigational links only; requisites are
        // governed by the requisite policy instead.
        if kind == LinkKind::LinkedPage {
            if let Some(follow) = &self.follow_tags {
                return !follow.iter().any(|t| t == tag);
            }
        }
        false
    }
}

fn push_link(
    links: &mut Vec<ExtractedLink>,
    base: &UrlInfo,
    raw: &str,
    kind: LinkKind,
    link_type: Option<LinkType>,
) {
    let raw = raw.trim();
    if raw.is_empty()
        || raw.starts_with('#')
        || raw.starts_with("javascript:")
        || raw.starts_with("data:")
        || raw.starts_with("mailto:")
    {
        return;
    }

    match base.join(raw) {
        Ok(url) => links.push(ExtractedLink {
            url,
            kind,
            link_type,
        }),
        Err(_) => trace!(href = raw, "unparseable link dropped"),
    }
}

/// Pull the url= component out of a meta refresh content value.
fn meta_refresh_url(content: &str) -> Option<&str> {
    let lower = content.to_ascii_lowercase();
    let idx = lower.find("url=")?;
    let target = content[idx + 4..].trim().trim_matches(['\'', '"']);
    if target.is_empty() {
        None
    } else {
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> UrlInfo {
        UrlInfo::parse(s).unwrap()
    }

    fn extract(body: &str) -> Vec<ExtractedLink> {
        HtmlExtractor::new(None, Vec::new()).extract(&url("http://h/dir/page.html"), body)
    }

    #[test]
    fn test_anchors_and_images() {
        let links = extract(
            r#"<html><body>
                <a href="/sub/">sub</a>
                <a href="other.html">other</a>
                <img src="/img.png">
            </body></html>"#,
        );

        assert_eq!(links.len(), 3);
        assert_eq!(links[0].url.fetch_url(), "http://h/sub/");
        assert_eq!(links[0].kind, LinkKind::LinkedPage);
        assert_eq!(links[1].url.fetch_url(), "http://h/dir/other.html");
        assert_eq!(links[2].url.fetch_url(), "http://h/img.png");
        assert_eq!(links[2].kind, LinkKind::PageRequisite);
        assert_eq!(links[2].link_type, Some(LinkType::Media));
    }

    #[test]
    fn test_stylesheet_and_script() {
        let links = extract(
            r#"<head>
                <link rel="stylesheet" href="/style.css">
                <link rel="canonical" href="/canonical">
                <script src="/app.js"></script>
            </head>"#,
        );

        let stylesheet = links
            .iter()
            .find(|l| l.link_type == Some(LinkType::Css))
            .unwrap();
        assert_eq!(stylesheet.url.fetch_url(), "http://h/style.css");
        assert_eq!(stylesheet.kind, LinkKind::PageRequisite);

        let script = links
            .iter()
            .find(|l| l.link_type == Some(LinkType::JavaScript))
            .unwrap();
        assert_eq!(script.kind, LinkKind::ScriptSrc);

        // rel=canonical is not harvested.
        assert!(!links.iter().any(|l| l.url.fetch_url().ends_with("canonical")));
    }

    #[test]
    fn test_base_href_override() {
        let links = extract(
            r#"<head><base href="http://cdn.example/assets/"></head>
               <body><img src="logo.png"></body>"#,
        );
        assert_eq!(links[0].url.fetch_url(), "http://cdn.example/assets/logo.png");
    }

    #[test]
    fn test_meta_refresh() {
        let links = extract(r#"<meta http-equiv="refresh" content="5; url=/moved">"#);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url.fetch_url(), "http://h/moved");
    }

    #[test]
    fn test_skips_pseudo_links() {
        let links = extract(
            r##"<a href="#section">s</a>
               <a href="javascript:void(0)">j</a>
               <a href="mailto:a@b.c">m</a>
               <a href="data:text/plain,x">d</a>"##,
        );
        assert!(links.is_empty());
    }

    #[test]
    fn test_follow_tags_limits_navigation() {
        let extractor = HtmlExtractor::new(Some(vec!["area".to_string()]), Vec::new());
        let links = extractor.extract(
            &url("http://h/"),
            r#"<a href="/a">a</a><area href="/b"><img src="/i.png">"#,
        );

        // Only area navigational links survive; requisites are untouched.
        assert!(!links.iter().any(|l| l.url.fetch_url().ends_with("/a")));
        assert!(links.iter().any(|l| l.url.fetch_url().ends_with("/b")));
        assert!(links.iter().any(|l| l.url.fetch_url().ends_with("/i.png")));
    }

    #[test]
    fn test_ignore_tags() {
        let extractor = HtmlExtractor::new(None, vec!["img".to_string()]);
        let links = extractor.extract(
            &url("http://h/"),
            r#"<a href="/a">a</a><img src="/i.png">"#,
        );
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url.fetch_url(), "http://h/a");
    }

    #[test]
    fn test_truncated_document_keeps_early_links() {
        // Unclosed markup mid-document; links before it must survive.
        let links = extract(r#"<a href="/first">f</a><div class="<broken <a href="#);
        assert!(links.iter().any(|l| l.url.fetch_url().ends_with("/first")));
    }
}
