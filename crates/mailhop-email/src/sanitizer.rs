use ammonia::{Builder, UrlRelative};
use std::collections::{HashMap, HashSet};

const ALLOWED_TAGS: &[&str] = &[
    "p", "div", "span", "br", "hr", "h1", "h2", "h3", "h4", "h5", "h6", "strong", "b", "em", "i",
    "u", "s", "strike", "ul", "ol", "li", "blockquote", "pre", "code", "table", "thead", "tbody",
    "tr", "th", "td", "img", "a",
];

const DROPPED_WITH_CONTENT: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "form", "textarea", "select", "noscript",
];

/// Allow-list HTML cleaner for message bodies shown on the web view.
///
/// Links and images keep only absolute `http`, `https` or `mailto` URLs;
/// anything relative or unparseable is dropped along with its attribute.
pub struct HtmlSanitizer {
    builder: Builder<'static>,
}

impl HtmlSanitizer {
    pub fn new() -> Self {
        let mut tag_attributes: HashMap<&'static str, HashSet<&'static str>> = HashMap::new();
        tag_attributes.insert("a", HashSet::from(["href", "title"]));
        tag_attributes.insert("img", HashSet::from(["src", "alt", "width", "height"]));
        tag_attributes.insert("td", HashSet::from(["colspan", "rowspan"]));
        tag_attributes.insert("th", HashSet::from(["colspan", "rowspan"]));

        let mut builder = Builder::default();
        builder
            .tags(ALLOWED_TAGS.iter().copied().collect())
            .clean_content_tags(DROPPED_WITH_CONTENT.iter().copied().collect())
            .tag_attributes(tag_attributes)
            .generic_attributes(HashSet::from(["class", "id"]))
            .url_schemes(HashSet::from(["http", "https", "mailto"]))
            .url_relative(UrlRelative::Deny)
            .link_rel(Some("noopener noreferrer"));

        Self { builder }
    }

    pub fn clean(&self, html: &str) -> String {
        self.builder.clean(html).to_string()
    }
}

impl Default for HtmlSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::HtmlSanitizer;

    #[test]
    fn active_content_is_removed_and_formatting_kept() {
        let sanitizer = HtmlSanitizer::new();
        let cleaned = sanitizer.clean(
            r#"<div class="body"><script>alert(1)</script>
               <iframe src="https://evil.example"></iframe>
               <form action="https://evil.example"><input name="pw"></form>
               <p onclick="steal()"><b>Hello</b> <a href="javascript:alert(1)">bad</a>
               <a href="https://example.com/x">good</a>
               <img src="/relative.png"><img src="https://cdn.example/a.png" alt="a"></p></div>"#,
        );

        assert!(!cleaned.contains("<script"));
        assert!(!cleaned.contains("alert(1)"));
        assert!(!cleaned.contains("<iframe"));
        assert!(!cleaned.contains("<form"));
        assert!(!cleaned.contains("<input"));
        assert!(!cleaned.contains("onclick"));
        assert!(!cleaned.contains("javascript:"));
        assert!(!cleaned.contains("/relative.png"));
        assert!(cleaned.contains("<b>Hello</b>"));
        assert!(cleaned.contains(r#"href="https://example.com/x""#));
        assert!(cleaned.contains(r#"src="https://cdn.example/a.png""#));
        assert!(cleaned.contains(r#"class="body""#));
    }

    #[test]
    fn mailto_links_survive() {
        let cleaned = HtmlSanitizer::new().clean(r#"<a href="mailto:a@example.com">mail</a>"#);
        assert!(cleaned.contains("mailto:a@example.com"));
    }
}
