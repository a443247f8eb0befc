//! CSS link extraction: `url(...)` references and `@import` rules.

use regex::Regex;

use super::{ExtractedLink, LinkKind};
use crate::models::LinkType;
use crate::urlnorm::UrlInfo;

pub struct CssExtractor {
    url_re: Regex,
    import_re: Regex,
}

impl CssExtractor {
    pub fn new() -> Self {
        Self {
            url_re: Regex::new(r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).expect("static regex"),
            import_re: Regex::new(r#"@import\s+['"]([^'"]+)['"]"#).expect("static regex"),
        }
    }

    pub fn extract(&self, base_url: &UrlInfo, body: &str) -> Vec<ExtractedLink> {
        let mut links = Vec::new();

        for capture in self.import_re.captures_iter(body) {
            self.push(&mut links, base_url, &capture[1], Some(LinkType::Css));
        }

        for capture in self.url_re.captures_iter(body) {
            let raw = &capture[1];
            let link_type = if raw.ends_with(".css") {
                Some(LinkType::Css)
            } else {
                Some(LinkType::Media)
            };
            self.push(&mut links, base_url, raw, link_type);
        }

        links
    }

    fn push(
        &self,
        links: &mut Vec<ExtractedLink>,
        base: &UrlInfo,
        raw: &str,
        link_type: Option<LinkType>,
    ) {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with("data:") {
            return;
        }
        if let Ok(url) = base.join(raw) {
            links.push(ExtractedLink {
                url,
                kind: LinkKind::PageRequisite,
                link_type,
            });
        }
    }
}

impl Default for CssExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> UrlInfo {
        UrlInfo::parse(s).unwrap()
    }

    #[test]
    fn test_url_references() {
        let extractor = CssExtractor::new();
        let links = extractor.extract(
            &url("http://h/css/site.css"),
            r#"
            body { background: url("/bg.png"); }
            .logo { background-image: url(../logo.svg); }
            .inline { background: url(data:image/png;base64,AAAA); }
            "#,
        );

        assert_eq!(links.len(), 2);
        assert_eq!(links[0].url.fetch_url(), "http://h/bg.png");
        assert_eq!(links[1].url.fetch_url(), "http://h/logo.svg");
        assert!(links.iter().all(|l| l.kind == LinkKind::PageRequisite));
    }

    #[test]
    fn test_imports_are_css() {
        let extractor = CssExtractor::new();
        let links = extractor.extract(
            &url("http://h/css/site.css"),
            r#"@import "reset.css"; @import 'theme.css';"#,
        );

        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| l.link_type == Some(LinkType::Css)));
        assert_eq!(links[0].url.fetch_url(), "http://h/css/reset.css");
    }
}
