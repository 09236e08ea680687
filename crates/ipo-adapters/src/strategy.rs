//! Ordered field-extraction strategies over a parsed document.

use std::fmt;

use ipo_core::normalize::{is_not_available, normalize_text};
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::ExtractError;

lazy_static! {
    static ref ROW: Selector = Selector::parse("tr").unwrap();
    static ref CELL: Selector = Selector::parse("th, td").unwrap();
    static ref LIST_ITEM: Selector = Selector::parse("li").unwrap();
}

pub trait Strategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> u8;

    fn extract(&self, doc: &Html) -> Option<String>;
}

/// Text of an element with whitespace runs collapsed.
pub(crate) fn collapsed_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn parse_selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::InvalidSelector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

/// CSS selector; reads an attribute when one is set, element text otherwise.
#[derive(Debug)]
pub struct SelectorStrategy {
    name: String,
    priority: u8,
    selector: Selector,
    attr: Option<String>,
}

impl SelectorStrategy {
    pub fn new(name: impl Into<String>, priority: u8, css: &str) -> Result<Self, ExtractError> {
        Ok(Self {
            name: name.into(),
            priority,
            selector: parse_selector(css)?,
            attr: None,
        })
    }

    pub fn attr(mut self, attr: impl Into<String>) -> Self {
        self.attr = Some(attr.into());
        self
    }

    fn read(&self, element: ElementRef<'_>) -> Option<String> {
        match &self.attr {
            Some(attr) => element.value().attr(attr).and_then(|v| non_blank(v.to_string())),
            None => non_blank(collapsed_text(element)),
        }
    }

    /// Every non-blank match in document order.
    pub fn extract_all(&self, doc: &Html) -> Vec<String> {
        doc.select(&self.selector).filter_map(|el| self.read(el)).collect()
    }
}

impl Strategy for SelectorStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn extract(&self, doc: &Html) -> Option<String> {
        doc.select(&self.selector).find_map(|el| self.read(el))
    }
}

/// Label/value layouts: a table row whose cell contains one of the labels
/// yields the following cell; a list item yields the text after the label.
#[derive(Debug)]
pub struct LabeledRowStrategy {
    name: String,
    priority: u8,
    labels: Vec<String>,
}

impl LabeledRowStrategy {
    pub fn new(name: impl Into<String>, priority: u8, labels: &[&str]) -> Self {
        Self {
            name: name.into(),
            priority,
            labels: labels.iter().map(|l| l.to_lowercase()).collect(),
        }
    }

    fn label_in(&self, text: &str) -> Option<usize> {
        let lowered = text.to_lowercase();
        self.labels.iter().find_map(|label| lowered.find(label.as_str()).map(|idx| idx + label.len()))
    }

    fn from_rows(&self, doc: &Html) -> Option<String> {
        for row in doc.select(&ROW) {
            let cells = row.select(&CELL).map(collapsed_text).collect::<Vec<_>>();
            for (idx, cell) in cells.iter().enumerate() {
                if self.label_in(cell).is_none() {
                    continue;
                }
                if let Some(value) = cells.get(idx + 1).cloned().and_then(non_blank) {
                    return Some(value);
                }
            }
        }
        None
    }

    fn from_list_items(&self, doc: &Html) -> Option<String> {
        doc.select(&LIST_ITEM).find_map(|item| {
            let text = collapsed_text(item);
            // Lowercasing can shift byte offsets for non-ASCII text.
            if text.to_lowercase().len() != text.len() {
                return None;
            }
            let end = self.label_in(&text)?;
            let rest = text.get(end..)?;
            non_blank(rest.trim_start_matches(|c: char| c == ':' || c == '-' || c.is_whitespace()).to_string())
        })
    }
}

impl Strategy for LabeledRowStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn extract(&self, doc: &Html) -> Option<String> {
        self.from_rows(doc).or_else(|| self.from_list_items(doc))
    }
}

/// Regex over the visible document text; the first capture group is the value.
#[derive(Debug)]
pub struct TextPatternStrategy {
    name: String,
    priority: u8,
    pattern: Regex,
}

impl TextPatternStrategy {
    pub fn new(name: impl Into<String>, priority: u8, pattern: &str) -> Result<Self, ExtractError> {
        let pattern = Regex::new(pattern).map_err(|e| ExtractError::InvalidSelector {
            selector: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name: name.into(),
            priority,
            pattern,
        })
    }
}

impl Strategy for TextPatternStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn extract(&self, doc: &Html) -> Option<String> {
        let text = collapsed_text(doc.root_element());
        self.pattern
            .captures(&text)
            .and_then(|c| c.get(1))
            .and_then(|m| non_blank(m.as_str().to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matched {
    pub strategy: String,
    pub value: String,
}

/// Strategies for one field, tried in ascending priority. First usable hit wins.
#[derive(Debug)]
pub struct StrategyChain {
    field: String,
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyChain {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            strategies: Vec::new(),
        }
    }

    pub fn with(mut self, strategy: impl Strategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self.strategies.sort_by_key(|s| s.priority());
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Skips hits that normalize to nothing or to a placeholder like "TBA".
    pub fn first_match(&self, doc: &Html) -> Option<Matched> {
        self.first_valid(doc, |raw| {
            let normalized = normalize_text(raw);
            if normalized.is_empty() || is_not_available(&normalized) {
                None
            } else {
                Some(raw.to_string())
            }
        })
        .map(|(strategy, value)| Matched { strategy, value })
    }

    /// Tries strategies in order until `parse` accepts a value. A strategy
    /// whose text fails to parse does not stop the lower-priority ones.
    pub fn first_valid<T>(&self, doc: &Html, mut parse: impl FnMut(&str) -> Option<T>) -> Option<(String, T)> {
        for strategy in &self.strategies {
            let Some(raw) = strategy.extract(doc) else {
                continue;
            };
            if let Some(value) = parse(&raw) {
                debug!(field = %self.field, strategy = strategy.name(), "strategy matched");
                return Some((strategy.name().to_string(), value));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipo_core::normalize::parse_date;

    const PAGE: &str = r#"
        <html><body>
          <h1 class="title">  Acme   Widgets Ltd </h1>
          <meta property="og:title" content="Acme Widgets IPO">
          <table>
            <tr><td>IPO Open Date</td><td>TBA</td></tr>
            <tr><th>Issue Size</th><td>₹1,200 Cr</td></tr>
          </table>
          <ul><li>Registrar: Link Intime India</li></ul>
          <p>The issue closes on 12 Dec 2025 at 5pm.</p>
        </body></html>"#;

    fn doc() -> Html {
        Html::parse_document(PAGE)
    }

    #[test]
    fn selector_reads_text_or_attribute() {
        let text = SelectorStrategy::new("h1", 1, "h1.title").unwrap();
        assert_eq!(text.extract(&doc()).as_deref(), Some("Acme Widgets Ltd"));
        let attr = SelectorStrategy::new("og", 2, "meta[property='og:title']").unwrap().attr("content");
        assert_eq!(attr.extract(&doc()).as_deref(), Some("Acme Widgets IPO"));
    }

    #[test]
    fn invalid_selector_is_an_error() {
        assert!(matches!(
            SelectorStrategy::new("bad", 1, "td:::"),
            Err(ExtractError::InvalidSelector { .. })
        ));
    }

    #[test]
    fn labeled_rows_and_list_items() {
        let size = LabeledRowStrategy::new("issue_size", 1, &["issue size"]);
        assert_eq!(size.extract(&doc()).as_deref(), Some("₹1,200 Cr"));
        let registrar = LabeledRowStrategy::new("registrar", 1, &["registrar"]);
        assert_eq!(registrar.extract(&doc()).as_deref(), Some("Link Intime India"));
        let missing = LabeledRowStrategy::new("lot", 1, &["lot size"]);
        assert_eq!(missing.extract(&doc()), None);
    }

    #[test]
    fn chain_orders_by_priority_and_skips_placeholders() {
        let chain = StrategyChain::new("name")
            .with(SelectorStrategy::new("og", 5, "meta[property='og:title']").unwrap().attr("content"))
            .with(SelectorStrategy::new("h1", 1, "h1").unwrap());
        assert_eq!(chain.strategy_names(), vec!["h1", "og"]);
        let hit = chain.first_match(&doc()).unwrap();
        assert_eq!(hit.strategy, "h1");

        let open = StrategyChain::new("open_date")
            .with(LabeledRowStrategy::new("row", 1, &["open date"]))
            .with(TextPatternStrategy::new("text", 2, r"closes on (\d{1,2} \w{3} \d{4})").unwrap());
        // "TBA" is a placeholder, so the text pattern wins.
        let hit = open.first_match(&doc()).unwrap();
        assert_eq!(hit.strategy, "text");
        assert_eq!(hit.value, "12 Dec 2025");
    }

    #[test]
    fn first_valid_falls_through_on_unparseable_values() {
        let chain = StrategyChain::new("close_date")
            .with(LabeledRowStrategy::new("row", 1, &["issue size"]))
            .with(TextPatternStrategy::new("text", 2, r"closes on (\d{1,2} \w{3} \d{4})").unwrap());
        let (strategy, date) = chain.first_valid(&doc(), parse_date).unwrap();
        assert_eq!(strategy, "text");
        assert_eq!(date.to_string(), "2025-12-12");
    }

    #[test]
    fn empty_chain_matches_nothing() {
        assert_eq!(StrategyChain::new("x").first_match(&doc()), None);
    }
}
