//! Grey-market premium tables.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipo_core::normalize::{
    extract_signed_percentage, is_not_available, normalize_text, parse_gmp_text, parse_price_band, parse_rating,
    parse_subscription,
};
use ipo_core::{Clock, GmpSnapshot, GmpStatusCode};
use ipo_storage::{FetchRequest, Fetcher, PageArchive};
use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::embedded::{extract_embedded_json, Scalar};
use crate::strategy::collapsed_text;
use crate::{decode_page, ExtractError, GmpSource};

const GMP_ANCHORS: &[&str] = &["gmpData", "gmp", "rows"];

lazy_static! {
    static ref TABLE: Selector = Selector::parse("table").unwrap();
    static ref ROW: Selector = Selector::parse("tr").unwrap();
    static ref HEADER_CELL: Selector = Selector::parse("th").unwrap();
    static ref DATA_CELL: Selector = Selector::parse("td").unwrap();
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EmbeddedGmpRow {
    #[serde(alias = "ipoName", alias = "companyName")]
    name: Option<String>,
    #[serde(alias = "stock_id")]
    stock_id: Option<Scalar>,
    #[serde(alias = "gmpValue")]
    gmp: Option<Scalar>,
    #[serde(alias = "gmpPercent")]
    gain_percent: Option<Scalar>,
    #[serde(alias = "ipoPrice", alias = "issuePrice")]
    price: Option<Scalar>,
    subscription: Option<Scalar>,
    #[serde(alias = "fireRating")]
    rating: Option<Scalar>,
    #[serde(alias = "statusCode")]
    status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Name,
    Gmp,
    Price,
    Gain,
    Subscription,
    Rating,
    Status,
    Ignored,
}

fn classify_header(text: &str) -> Column {
    let h = text.to_lowercase();
    if h.contains("gmp") {
        Column::Gmp
    } else if h.starts_with("est") || h.contains("estimated") || h.contains("listing") {
        Column::Ignored
    } else if h.contains("price") {
        Column::Price
    } else if h.contains("gain") || h.contains('%') {
        Column::Gain
    } else if h.contains("sub") {
        Column::Subscription
    } else if h.contains("rating") || h.contains("fire") {
        Column::Rating
    } else if h.contains("status") {
        Column::Status
    } else if h.contains("name") || h.contains("ipo") || h.contains("company") {
        Column::Name
    } else {
        Column::Ignored
    }
}

/// Column index per field; the first header claiming a field keeps it.
#[derive(Debug, Default)]
struct ColumnMap {
    name: Option<usize>,
    gmp: Option<usize>,
    price: Option<usize>,
    gain: Option<usize>,
    subscription: Option<usize>,
    rating: Option<usize>,
    status: Option<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &[String]) -> Self {
        let mut map = Self::default();
        for (idx, header) in headers.iter().enumerate() {
            let slot = match classify_header(header) {
                Column::Name => &mut map.name,
                Column::Gmp => &mut map.gmp,
                Column::Price => &mut map.price,
                Column::Gain => &mut map.gain,
                Column::Subscription => &mut map.subscription,
                Column::Rating => &mut map.rating,
                Column::Status => &mut map.status,
                Column::Ignored => continue,
            };
            slot.get_or_insert(idx);
        }
        map
    }

    fn is_usable(&self) -> bool {
        self.name.is_some() && self.gmp.is_some()
    }
}

fn is_badge(element: ElementRef<'_>) -> bool {
    element
        .value()
        .classes()
        .any(|c| matches!(c, "badge" | "status" | "ipo-status"))
}

fn collect_name_text(element: ElementRef<'_>, parts: &mut Vec<String>, badge: &mut Option<GmpStatusCode>) {
    for child in element.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            if is_badge(child_el) {
                if badge.is_none() {
                    *badge = GmpStatusCode::parse(&collapsed_text(child_el));
                }
            } else {
                collect_name_text(child_el, parts, badge);
            }
        } else if let Some(text) = child.value().as_text() {
            parts.push((**text).to_string());
        }
    }
}

/// Display name plus a status badge, either a badge element or a trailing
/// single-letter U/O/C token.
fn name_and_status(cell: ElementRef<'_>) -> (String, Option<GmpStatusCode>) {
    let mut parts = Vec::new();
    let mut badge = None;
    collect_name_text(cell, &mut parts, &mut badge);
    let name = normalize_text(&parts.join(" "));
    if badge.is_none() {
        if let Some((head, last)) = name.rsplit_once(' ') {
            if last.len() == 1 {
                if let Some(code) = GmpStatusCode::parse(last) {
                    return (head.to_string(), Some(code));
                }
            }
        }
    }
    (name, badge)
}

fn finish(mut snapshot: GmpSnapshot) -> GmpSnapshot {
    snapshot.recompute_estimated_listing();
    snapshot.recompute_confidence();
    snapshot
}

fn snapshot_from_row(row: ElementRef<'_>, columns: &ColumnMap, source_id: &str, now: DateTime<Utc>) -> Option<GmpSnapshot> {
    let cells = row.select(&DATA_CELL).collect::<Vec<_>>();
    let cell_text = |idx: Option<usize>| idx.and_then(|i| cells.get(i)).map(|c| collapsed_text(*c));

    let (name, badge) = name_and_status(*cells.get(columns.name?)?);
    if name.is_empty() || is_not_available(&name) {
        return None;
    }

    let mut snapshot = GmpSnapshot::new(name, source_id, now);
    snapshot.stock_id = row
        .value()
        .attr("data-stock-id")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let (gmp_value, gmp_percent) = cell_text(columns.gmp).map(|t| parse_gmp_text(&t)).unwrap_or((None, None));
    snapshot.gmp_value = gmp_value;
    snapshot.gain_percent = cell_text(columns.gain)
        .and_then(|t| extract_signed_percentage(&t))
        .or(gmp_percent);
    snapshot.reference_price = cell_text(columns.price).and_then(|t| parse_price_band(&t).1);
    snapshot.subscription = cell_text(columns.subscription).and_then(|t| parse_subscription(&t));
    snapshot.rating = cell_text(columns.rating).and_then(|t| parse_rating(&t));
    snapshot.status_code = cell_text(columns.status)
        .and_then(|t| GmpStatusCode::parse(&t))
        .or(badge);
    Some(finish(snapshot))
}

fn header_texts(row: ElementRef<'_>) -> Vec<String> {
    let headers = row.select(&HEADER_CELL).map(collapsed_text).collect::<Vec<_>>();
    if headers.is_empty() {
        row.select(&DATA_CELL).map(collapsed_text).collect()
    } else {
        headers
    }
}

fn from_table(html: &str, source_id: &str, now: DateTime<Utc>) -> Result<Vec<GmpSnapshot>, ExtractError> {
    let doc = Html::parse_document(html);
    for table in doc.select(&TABLE) {
        let mut rows = table.select(&ROW);
        let Some(header_row) = rows.next() else {
            continue;
        };
        let columns = ColumnMap::from_headers(&header_texts(header_row));
        if !columns.is_usable() {
            continue;
        }
        let mut snapshots = Vec::new();
        for row in rows {
            match snapshot_from_row(row, &columns, source_id, now) {
                Some(snapshot) => snapshots.push(snapshot),
                None => debug!(source = source_id, "skipping gmp row without a name"),
            }
        }
        return Ok(snapshots);
    }
    Err(ExtractError::Parse("no gmp table with name and gmp columns".into()))
}

fn from_embedded_row(row: EmbeddedGmpRow, source_id: &str, now: DateTime<Utc>) -> Option<GmpSnapshot> {
    let name = normalize_text(row.name.as_deref()?);
    if name.is_empty() || is_not_available(&name) {
        return None;
    }
    let mut snapshot = GmpSnapshot::new(name, source_id, now);
    snapshot.stock_id = row.stock_id.and_then(|s| s.as_text());
    let (gmp_value, gmp_percent) = match &row.gmp {
        Some(Scalar::Text(text)) => parse_gmp_text(text),
        Some(other) => (other.as_f64(), None),
        None => (None, None),
    };
    snapshot.gmp_value = gmp_value;
    snapshot.gain_percent = match &row.gain_percent {
        Some(Scalar::Text(text)) => extract_signed_percentage(text),
        Some(other) => other.as_f64(),
        None => None,
    }
    .or(gmp_percent);
    snapshot.reference_price = match &row.price {
        Some(Scalar::Text(text)) => parse_price_band(text).1,
        Some(other) => other.as_f64(),
        None => None,
    };
    snapshot.subscription = row.subscription.as_ref().and_then(|s| match s {
        Scalar::Text(text) => parse_subscription(text),
        Scalar::Number(_) => s.as_f64().filter(|v| *v >= 0.0),
    });
    snapshot.rating = row.rating.as_ref().and_then(|r| match r {
        Scalar::Text(text) => parse_rating(text),
        Scalar::Number(n) => Some(n.round().clamp(0.0, 5.0) as u8),
    });
    snapshot.status_code = row.status.as_deref().and_then(GmpStatusCode::parse);
    Some(finish(snapshot))
}

fn from_embedded(body: &str, source_id: &str, now: DateTime<Utc>) -> Result<Vec<GmpSnapshot>, ExtractError> {
    let json = extract_embedded_json(body, GMP_ANCHORS)?;
    let rows: Vec<EmbeddedGmpRow> = serde_json::from_str(&json)?;
    Ok(rows.into_iter().filter_map(|row| from_embedded_row(row, source_id, now)).collect())
}

/// Embedded JSON rows when the page carries them, the GMP table otherwise.
pub fn parse_gmp_page(body: &str, source_id: &str, now: DateTime<Utc>) -> Result<Vec<GmpSnapshot>, ExtractError> {
    match from_embedded(body, source_id, now) {
        Ok(rows) if !rows.is_empty() => return Ok(rows),
        Ok(_) => debug!(source = source_id, "embedded gmp rows empty"),
        Err(err) => debug!(source = source_id, error = %err, "no embedded gmp rows"),
    }
    from_table(body, source_id, now)
}

pub struct GmpExtractor {
    source_id: String,
    urls: Vec<String>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    archive: Option<PageArchive>,
}

impl GmpExtractor {
    pub fn new(source_id: impl Into<String>, urls: Vec<String>, fetcher: Arc<dyn Fetcher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source_id: source_id.into(),
            urls,
            fetcher,
            clock,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }
}

#[async_trait]
impl GmpSource for GmpExtractor {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn page_urls(&self) -> Vec<String> {
        self.urls.clone()
    }

    async fn extract_gmp_page(&self, url: &str) -> Result<Vec<GmpSnapshot>, ExtractError> {
        let response = self.fetcher.fetch(&FetchRequest::get(url)).await?;
        let now = self.clock.now();
        if let Some(archive) = &self.archive {
            if let Err(err) = archive.archive(now, &self.source_id, "html", &response.body).await {
                warn!(source = %self.source_id, %url, error = %err, "page archive failed");
            }
        }
        let body = decode_page(&response.body)?;
        let snapshots = parse_gmp_page(body, &self.source_id, now)?;
        debug!(source = %self.source_id, %url, rows = snapshots.len(), "gmp page parsed");
        Ok(snapshots)
    }
}
