//! Reference structural tokenizer: HTML page -> document-ordered blocks.

use carid_core::{Block, BlockId};
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use url::Url;

use crate::ExtractError;

const BLOCK_TAGS: &[&str] = &["article", "section", "div", "li", "tr"];
const SKIPPED_TAGS: &[&str] = &["script", "style", "template", "noscript", "svg", "nav"];

/// Substrings that mark decoration rather than vehicle photos.
const IMAGE_SKIP_PATTERNS: &[&str] = &[
    "logo",
    "icon",
    "avatar",
    "nophoto",
    "no-photo",
    "placeholder",
    "banner",
    "advert",
    "sprite",
    "facebook",
    "twitter",
    "instagram",
    "youtube",
    "analytics",
    "tracking",
    "pixel",
    "beacon",
];

const BACKGROUND_IMAGE: &str = r#"background(?:-image)?\s*:[^;]*url\(\s*['"]?([^'")]+)['"]?\s*\)"#;

pub struct HtmlBlockSource {
    link: Selector,
    image: Selector,
    styled: Selector,
    background: Regex,
    base_url: Option<Url>,
}

impl HtmlBlockSource {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            link: parse_selector("a[href]")?,
            image: parse_selector("img")?,
            styled: parse_selector("[style]")?,
            background: Regex::new(BACKGROUND_IMAGE).map_err(|err| ExtractError::Selector {
                selector: BACKGROUND_IMAGE.to_string(),
                reason: err.to_string(),
            })?,
            base_url: None,
        })
    }

    /// Relative hrefs and image sources are resolved against `base`.
    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base_url = Url::parse(base).ok();
        self
    }

    /// Emit one block per non-empty `article|section|div|li|tr`, in document
    /// order, each pointing at its nearest emitted ancestor.
    pub fn blocks(&self, html: &str) -> Vec<Block> {
        let document = Html::parse_document(html);
        let mut blocks = Vec::new();
        self.walk(document.root_element(), None, &mut blocks);
        blocks
    }

    fn walk(&self, element: ElementRef<'_>, parent: Option<BlockId>, out: &mut Vec<Block>) {
        let tag = element.value().name();
        if SKIPPED_TAGS.contains(&tag) {
            return;
        }
        let mut enclosing = parent;
        if BLOCK_TAGS.contains(&tag) {
            let mut pieces = Vec::new();
            visible_text(element, &mut pieces);
            let text = collapse_whitespace(pieces.into_iter());
            if !text.is_empty() {
                let mut block = Block::new(out.len(), text);
                block.parent = parent;
                block.listing_ref = self.listing_ref(element);
                block.image_urls = self.image_urls(element);
                enclosing = Some(block.id);
                out.push(block);
            }
        }
        for child in element.children().filter_map(ElementRef::wrap) {
            self.walk(child, enclosing, out);
        }
    }

    fn listing_ref(&self, element: ElementRef<'_>) -> Option<String> {
        element
            .select(&self.link)
            .filter_map(|a| a.value().attr("href"))
            .map(str::trim)
            .find(|href| !href.is_empty() && !href.starts_with('#') && !href.starts_with("javascript:"))
            .map(|href| self.absolutize(href))
    }

    fn image_urls(&self, element: ElementRef<'_>) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let mut push = |raw: &str| {
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with("data:") || !is_listing_image(raw) {
                return;
            }
            let resolved = self.absolutize(raw);
            if !urls.contains(&resolved) {
                urls.push(resolved);
            }
        };
        for img in element.select(&self.image) {
            let src = img
                .value()
                .attr("data-src")
                .or_else(|| img.value().attr("src"));
            if let Some(src) = src {
                push(src);
            }
        }
        let styled = std::iter::once(element).chain(element.select(&self.styled));
        for styled in styled {
            if let Some(style) = styled.value().attr("style") {
                for caps in self.background.captures_iter(style) {
                    if let Some(m) = caps.get(1) {
                        push(m.as_str());
                    }
                }
            }
        }
        urls
    }

    fn absolutize(&self, raw: &str) -> String {
        match &self.base_url {
            Some(base) => base
                .join(raw)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| raw.to_string()),
            None => raw.to_string(),
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|err| ExtractError::Selector {
        selector: selector.to_string(),
        reason: format!("{err:?}"),
    })
}

pub fn is_listing_image(url: &str) -> bool {
    let lower = url.to_lowercase();
    !IMAGE_SKIP_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Text nodes under `element`, leaving out script, style and navigation subtrees.
fn visible_text<'a>(element: ElementRef<'a>, out: &mut Vec<&'a str>) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push(text),
            Node::Element(el) if !SKIPPED_TAGS.contains(&el.name()) => {
                if let Some(child) = ElementRef::wrap(child) {
                    visible_text(child, out);
                }
            }
            _ => {}
        }
    }
}

fn collapse_whitespace<'a>(pieces: impl Iterator<Item = &'a str>) -> String {
    let mut buf = String::new();
    for word in pieces.flat_map(str::split_whitespace) {
        if !buf.is_empty() {
            buf.push(' ');
        }
        buf.push_str(word);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"
<html><body>
  <nav><div>Начало Търсене</div></nav>
  <div class="results">
    <div class="item">
      <a href="/obiava-11712345-bmw-m5">BMW M5 Competition</a>
      <img src="/photos/11712345_1.jpg"><img src="/static/logo.png">
      <span>2019 г.</span> <span>113 000 км</span>
    </div>
    <div class="item" style="background-image: url('https://cdn.example.bg/p/2.jpg')">
      <a href="#">share</a><a href="obiava-2">Audi RS6</a>
    </div>
    <div class="empty">   </div>
  </div>
  <script>var x = "<div>not a block</div>";</script>
</body></html>
"##;

    #[test]
    fn blocks_follow_document_order_with_parent_links() {
        let source = HtmlBlockSource::new()
            .expect("selectors")
            .with_base_url("https://www.mobile.bg/search");
        let blocks = source.blocks(PAGE);
        assert_eq!(blocks.len(), 3, "{blocks:#?}");

        assert_eq!(blocks[0].parent, None);
        assert!(blocks[0].text.contains("BMW M5 Competition"));
        assert!(blocks[0].text.contains("Audi RS6"));
        assert!(!blocks[0].text.contains("Начало"));

        assert_eq!(blocks[1].parent, Some(BlockId(0)));
        assert_eq!(blocks[1].text, "BMW M5 Competition 2019 г. 113 000 км");
        assert_eq!(
            blocks[1].listing_ref.as_deref(),
            Some("https://www.mobile.bg/obiava-11712345-bmw-m5")
        );
        assert_eq!(
            blocks[1].image_urls,
            vec!["https://www.mobile.bg/photos/11712345_1.jpg".to_string()]
        );

        assert_eq!(blocks[2].parent, Some(BlockId(0)));
        assert_eq!(
            blocks[2].listing_ref.as_deref(),
            Some("https://www.mobile.bg/obiava-2")
        );
        assert_eq!(
            blocks[2].image_urls,
            vec!["https://cdn.example.bg/p/2.jpg".to_string()]
        );
    }

    #[test]
    fn inline_scripts_and_menus_stay_out_of_block_text() {
        let page = r#"<div class="item">BMW M5 2019 г.<script>var price = "1 000 000 лв"; var km = "5 км";</script>
            <nav>Home Sell Mileage 999 999 km</nav><style>.p { color: red }</style>
            <span>109 999 лв.</span></div>"#;
        let blocks = HtmlBlockSource::new().expect("selectors").blocks(page);
        assert_eq!(blocks.len(), 1, "{blocks:#?}");
        assert_eq!(blocks[0].text, "BMW M5 2019 г. 109 999 лв.");
    }

    #[test]
    fn decoration_images_are_skipped() {
        assert!(is_listing_image("https://cdn.example.bg/big/1.webp"));
        assert!(!is_listing_image("https://cdn.example.bg/img/Logo-white.svg"));
        assert!(!is_listing_image("https://px.example.com/tracking.gif"));
    }
}
