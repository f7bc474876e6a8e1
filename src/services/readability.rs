//! Readability-style main-content extraction.
//!
//! Paragraph-like blocks score their parent and grandparent by length and
//! comma count. Candidates are weighted by tag and by class/id hints and
//! penalised by link density. The best candidate's subtree is re-serialized
//! without scripts, chrome and presentational attributes.

use std::collections::HashMap;

use scraper::{ElementRef, Html, Node};
use url::Url;

use crate::error::{AppError, Result};

/// Average adult reading speed used for reading-time estimates.
pub const WORDS_PER_MINUTE: f64 = 225.0;

const EXCERPT_CHARS: usize = 200;

const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "iframe", "form", "nav", "aside", "footer", "button",
    "input", "select", "textarea", "svg", "object", "embed", "link", "meta", "template",
];

const VOID_TAGS: &[&str] = &["br", "hr", "img", "source", "wbr", "col"];

const KEEP_ATTRS: &[&str] = &["href", "src", "alt", "title", "colspan", "rowspan"];

const POSITIVE_HINTS: &[&str] = &[
    "article", "body", "content", "entry", "main", "page", "post", "text", "blog", "story",
];

const NEGATIVE_HINTS: &[&str] = &[
    "hidden", "banner", "combx", "comment", "contact", "foot", "masthead", "media", "meta",
    "outbrain", "promo", "related", "scroll", "share", "shoutbox", "sidebar", "skyscraper",
    "sponsor", "shopping", "tags", "tool", "widget", "nav", "menu", "advert", "cookie",
    "subscribe", "newsletter",
];

/// What the extractor hands back to the worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub title: Option<String>,
    /// Cleaned HTML of the main content block.
    pub content: String,
    pub excerpt: Option<String>,
    pub site_name: Option<String>,
    pub image_url: Option<String>,
    pub language: Option<String>,
}

/// HTML-to-readable-content collaborator.
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, html: &str, url: &Url) -> Result<Extracted>;
}

#[derive(Debug, Clone, Default)]
pub struct Readability;

impl ContentExtractor for Readability {
    fn extract(&self, html: &str, url: &Url) -> Result<Extracted> {
        let document = Html::parse_document(html);
        let meta = MetaTags::collect(&document);

        let candidate = best_candidate(&document)
            .ok_or_else(|| AppError::ExternalService(format!("no readable content at {url}")))?;
        let mut content = String::new();
        write_element(candidate, url, &mut content);

        let plain = plain_text(&content);
        if plain.is_empty() {
            return Err(AppError::ExternalService(format!(
                "no readable content at {url}"
            )));
        }

        let title = meta
            .first(&["og:title", "twitter:title"])
            .or_else(|| first_text(&document, "title"))
            .or_else(|| first_text(&document, "h1"));
        let excerpt = meta
            .first(&["og:description", "twitter:description", "description"])
            .or_else(|| Some(truncate_chars(&plain, EXCERPT_CHARS)));
        let site_name = meta
            .first(&["og:site_name", "application-name", "twitter:site"])
            .or_else(|| url.host_str().map(|h| h.trim_start_matches("www.").to_string()));
        let image_url = meta
            .first(&["og:image", "og:image:url", "og:image:secure_url", "twitter:image", "twitter:image:src"])
            .or_else(|| link_href(&document, "image_src"))
            .and_then(|src| url.join(&src).ok())
            .map(|u| u.to_string());
        let language = document
            .root_element()
            .value()
            .attr("lang")
            .map(str::to_string)
            .or_else(|| meta.first(&["content-language", "og:locale"]))
            .and_then(|lang| primary_language(&lang));

        Ok(Extracted {
            title,
            content,
            excerpt,
            site_name,
            image_url,
            language,
        })
    }
}

/// Words in `html` after markup is stripped, split on whitespace.
pub fn word_count(html: &str) -> i64 {
    plain_text(html).split_whitespace().count() as i64
}

pub fn reading_time_seconds(word_count: i64) -> i64 {
    (word_count as f64 / WORDS_PER_MINUTE * 60.0).round() as i64
}

fn plain_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Meta tag values keyed by lowercased `property`, `name` or `http-equiv`.
/// The first occurrence of a key wins.
struct MetaTags(HashMap<String, String>);

impl MetaTags {
    fn collect(document: &Html) -> Self {
        let mut tags = HashMap::new();
        for element in elements(document).filter(|e| e.value().name() == "meta") {
            let el = element.value();
            let Some(content) = el.attr("content").map(str::trim).filter(|c| !c.is_empty()) else {
                continue;
            };
            for key in [el.attr("property"), el.attr("name"), el.attr("http-equiv")]
                .into_iter()
                .flatten()
            {
                tags.entry(key.trim().to_ascii_lowercase())
                    .or_insert_with(|| content.to_string());
            }
        }
        Self(tags)
    }

    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.0.get(*key).cloned())
    }
}

fn elements(document: &Html) -> impl Iterator<Item = ElementRef<'_>> {
    document.root_element().descendants().filter_map(ElementRef::wrap)
}

fn first_text(document: &Html, tag: &str) -> Option<String> {
    elements(document)
        .find(|e| e.value().name() == tag)
        .map(|e| e.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
}

fn link_href(document: &Html, rel: &str) -> Option<String> {
    elements(document)
        .filter(|e| e.value().name() == "link")
        .find(|e| e.value().attr("rel").is_some_and(|r| r.eq_ignore_ascii_case(rel)))
        .and_then(|e| e.value().attr("href").map(str::to_string))
}

/// `en-US`, `en_US` and `EN` all become `en`.
fn primary_language(tag: &str) -> Option<String> {
    let primary = tag.split(['-', '_']).next()?.trim().to_ascii_lowercase();
    (!primary.is_empty() && primary.chars().all(|c| c.is_ascii_alphabetic())).then_some(primary)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", text[..idx].trim_end()),
        None => text.to_string(),
    }
}

fn class_id_weight(element: &ElementRef) -> f64 {
    let el = element.value();
    let mut weight = 0.0;
    for attr in [el.attr("class"), el.attr("id")].into_iter().flatten() {
        let attr = attr.to_ascii_lowercase();
        if NEGATIVE_HINTS.iter().any(|hint| attr.contains(hint)) {
            weight -= 25.0;
        }
        if POSITIVE_HINTS.iter().any(|hint| attr.contains(hint)) {
            weight += 25.0;
        }
    }
    weight
}

fn base_tag_score(tag: &str) -> f64 {
    match tag {
        "article" => 10.0,
        "main" | "div" => 5.0,
        "pre" | "td" | "blockquote" | "section" => 3.0,
        "address" | "ol" | "ul" | "dl" | "dd" | "dt" | "li" | "form" => -3.0,
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "th" => -5.0,
        _ => 0.0,
    }
}

fn link_density(element: &ElementRef) -> f64 {
    let total: usize = element.text().map(str::len).sum();
    if total == 0 {
        return 0.0;
    }
    let linked: usize = element
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|e| e.value().name() == "a")
        .map(|a| a.text().map(str::len).sum::<usize>())
        .sum();
    linked as f64 / total as f64
}

fn is_skipped(element: &ElementRef) -> bool {
    let el = element.value();
    SKIP_TAGS.contains(&el.name())
        || el.attr("hidden").is_some()
        || el.attr("aria-hidden") == Some("true")
}

fn best_candidate(document: &Html) -> Option<ElementRef<'_>> {
    let mut scores: HashMap<_, (ElementRef, f64)> = HashMap::new();

    for block in elements(document).filter(|e| matches!(e.value().name(), "p" | "pre" | "td" | "blockquote")) {
        if block.ancestors().filter_map(ElementRef::wrap).any(|a| is_skipped(&a)) {
            continue;
        }
        let text = block.text().collect::<String>();
        let len = text.trim().chars().count();
        if len < 25 {
            continue;
        }
        let score = 1.0 + text.matches(',').count() as f64 + (len as f64 / 100.0).min(3.0);

        let mut ancestors = block.ancestors().filter_map(ElementRef::wrap);
        for share in [1.0, 0.5] {
            let Some(ancestor) = ancestors.next() else {
                break;
            };
            let entry = scores.entry(ancestor.id()).or_insert_with(|| {
                let initial = base_tag_score(ancestor.value().name()) + class_id_weight(&ancestor);
                (ancestor, initial)
            });
            entry.1 += score * share;
        }
    }

    let best = scores
        .into_values()
        .map(|(element, score)| (element, score * (1.0 - link_density(&element))))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(element, _)| element);

    best.or_else(|| elements(document).find(|e| e.value().name() == "body"))
}

fn write_element(element: ElementRef<'_>, base: &Url, out: &mut String) {
    if is_skipped(&element) {
        return;
    }
    let el = element.value();
    let name = el.name();
    out.push('<');
    out.push_str(name);
    for (attr, value) in el.attrs() {
        if !KEEP_ATTRS.contains(&attr) {
            continue;
        }
        let value = if matches!(attr, "href" | "src") {
            match base.join(value) {
                Ok(resolved) if matches!(resolved.scheme(), "http" | "https" | "mailto") => {
                    resolved.to_string()
                }
                _ => continue,
            }
        } else {
            value.to_string()
        };
        out.push(' ');
        out.push_str(attr);
        out.push_str("=\"");
        escape_into(&value, true, out);
        out.push('"');
    }
    out.push('>');
    if VOID_TAGS.contains(&name) {
        return;
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => escape_into(text, false, out),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    write_element(child, base, out);
                }
            }
            _ => {}
        }
    }
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn escape_into(text: &str, in_attribute: bool, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if in_attribute => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}
