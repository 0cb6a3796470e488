//! Selector application: dot/bracket paths over JSON payloads and CSS
//! selectors over HTML documents. XPath-style selectors (leading `/` or
//! `//`) are recognized for disambiguation but not executed.

use scraper::{Html, Selector};

use crate::error::TransformError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorKind {
    Css,
    XPath,
}

/// Leading `/` or `//` means XPath; anything else is CSS.
pub fn selector_kind(selector: &str) -> SelectorKind {
    if selector.starts_with('/') {
        SelectorKind::XPath
    } else {
        SelectorKind::Css
    }
}

/// Apply a dot/bracket path (`.a.b[0].c`) to a JSON payload. `root` (or an
/// empty selector) selects the full payload.
pub fn select_json<'a>(
    payload: &'a serde_json::Value,
    selector: &str,
) -> Option<&'a serde_json::Value> {
    let selector = selector.trim();
    if selector.is_empty() || selector == "root" || selector == "." {
        return Some(payload);
    }

    let mut current = payload;
    for segment in parse_path(selector) {
        current = match segment {
            PathSegment::Key(key) => current.get(key.as_str())?,
            PathSegment::Index(i) => current.get(i)?,
        };
    }
    Some(current)
}

enum PathSegment {
    Key(String),
    Index(usize),
}

fn parse_path(selector: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    let mut rest = selector;

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('.') {
            rest = stripped;
            continue;
        }
        if let Some(stripped) = rest.strip_prefix('[') {
            if let Some(end) = stripped.find(']') {
                if let Ok(i) = stripped[..end].trim().parse::<usize>() {
                    segments.push(PathSegment::Index(i));
                }
                rest = &stripped[end + 1..];
                continue;
            }
            rest = stripped;
            continue;
        }
        let end = rest
            .find(['.', '['])
            .unwrap_or(rest.len());
        segments.push(PathSegment::Key(rest[..end].to_string()));
        rest = &rest[end..];
    }

    segments
}

/// Apply a CSS selector to an HTML document; the result is the inner text
/// of the first match, trimmed.
pub fn select_html(html: &str, selector: &str, field: &str) -> Result<String, TransformError> {
    let selection_err = || TransformError::Selection {
        field: field.to_string(),
        selector: selector.to_string(),
    };

    if selector_kind(selector) == SelectorKind::XPath {
        // no XPath engine is carried; surfaced as a selection failure
        return Err(selection_err());
    }

    let parsed = Selector::parse(selector).map_err(|_| selection_err())?;
    let document = Html::parse_document(html);
    let element = document.select(&parsed).next().ok_or_else(selection_err)?;
    let text = element.text().collect::<String>().trim().to_string();
    if text.is_empty() {
        return Err(selection_err());
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn selects_nested_path() {
        let payload = json!({"data": {"rate": 1.0012, "items": [{"v": 7}, {"v": 8}]}});
        assert_eq!(
            select_json(&payload, ".data.rate"),
            Some(&json!(1.0012))
        );
        assert_eq!(
            select_json(&payload, ".data.items[1].v"),
            Some(&json!(8))
        );
        assert_eq!(select_json(&payload, ".data.missing"), None);
    }

    #[test]
    fn root_selects_full_payload_even_scalar() {
        let payload = json!(42);
        assert_eq!(select_json(&payload, "root"), Some(&json!(42)));
        assert_eq!(select_json(&payload, ""), Some(&json!(42)));
    }

    #[test]
    fn path_without_leading_dot() {
        let payload = json!({"p": "40000.5"});
        assert_eq!(select_json(&payload, "p"), Some(&json!("40000.5")));
        assert_eq!(select_json(&payload, ".p"), Some(&json!("40000.5")));
    }

    #[test]
    fn kind_disambiguation() {
        assert_eq!(selector_kind("//div/span"), SelectorKind::XPath);
        assert_eq!(selector_kind("/html/body"), SelectorKind::XPath);
        assert_eq!(selector_kind("div.price > span"), SelectorKind::Css);
    }

    #[test]
    fn css_selects_inner_text() {
        let html = r#"<html><body><div class="price"><span>42.5</span></div></body></html>"#;
        assert_eq!(select_html(html, "div.price span", "p").unwrap(), "42.5");
        assert!(select_html(html, "div.absent", "p").is_err());
    }

    #[test]
    fn xpath_is_rejected_as_selection_error() {
        let html = "<html><body></body></html>";
        assert!(select_html(html, "//div", "p").is_err());
    }
}
