//! IPO detail pages: embedded JSON first, then labeled HTML, then listing context.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ipo_core::normalize::{
    collapse_whitespace, generate_company_code, generate_slug, normalize_text, parse_date, parse_number, parse_price_band,
    parse_quantity,
};
use ipo_core::{Clock, Ipo, ListingMetadata};
use ipo_storage::{FetchRequest, Fetcher, PageArchive};
use scraper::Html;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cleanup::{clean_free_text, ABOUT_MAX_LEN, DESCRIPTION_MAX_LEN};
use crate::embedded::{extract_embedded_json, Scalar};
use crate::listing::{parse_listing_page, resolve_url};
use crate::strategy::{LabeledRowStrategy, SelectorStrategy, StrategyChain, TextPatternStrategy};
use crate::{decode_page, ExtractError, ExtractFailure, IpoSource, Parsed};

const DETAIL_ANCHORS: &[&str] = &["ipoDetails", "ipoDetail", "ipo"];

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EmbeddedIpo {
    #[serde(alias = "companyName")]
    name: Option<String>,
    #[serde(alias = "stock_id")]
    stock_id: Option<Scalar>,
    symbol: Option<String>,
    #[serde(alias = "registrarName")]
    registrar: Option<String>,
    #[serde(alias = "logoUrl")]
    logo: Option<String>,
    description: Option<String>,
    #[serde(alias = "aboutCompany")]
    about: Option<String>,
    strengths: Vec<String>,
    risks: Vec<String>,
    #[serde(alias = "biddingStartDate")]
    open_date: Option<Scalar>,
    #[serde(alias = "biddingEndDate")]
    close_date: Option<Scalar>,
    #[serde(alias = "allotmentDate")]
    result_date: Option<Scalar>,
    listing_date: Option<Scalar>,
    #[serde(alias = "priceRange")]
    price_band: Option<String>,
    min_price: Option<Scalar>,
    max_price: Option<Scalar>,
    issue_size: Option<Scalar>,
    #[serde(alias = "lotSize")]
    min_qty: Option<Scalar>,
    #[serde(alias = "minInvestment")]
    min_amount: Option<Scalar>,
    #[serde(alias = "subscription")]
    subscription_status: Option<Scalar>,
    #[serde(alias = "listingGains")]
    listing_gain: Option<String>,
}

impl EmbeddedIpo {
    fn has_content(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.trim().is_empty())
            || self.open_date.is_some()
            || self.price_band.is_some()
            || self.max_price.is_some()
    }
}

/// Free-text fields keep their units ("₹500 Cr"); only numeric parsing strips them.
fn text_value(value: Option<&str>) -> Option<String> {
    let value = collapse_whitespace(value?);
    if value.is_empty() || ipo_core::normalize::is_not_available(&value) {
        None
    } else {
        Some(value)
    }
}

fn scalar_text(value: Option<&Scalar>) -> Option<String> {
    text_value(value?.as_text().as_deref())
}

fn rename(ipo: &mut Ipo, name: String) {
    ipo.company_code = generate_company_code(&name);
    ipo.slug = generate_slug(&name);
    ipo.name = name;
}

/// Field chains for the HTML path.
#[derive(Debug)]
struct DetailChains {
    name: StrategyChain,
    symbol: StrategyChain,
    registrar: StrategyChain,
    logo: StrategyChain,
    description: StrategyChain,
    about: StrategyChain,
    open_date: StrategyChain,
    close_date: StrategyChain,
    result_date: StrategyChain,
    listing_date: StrategyChain,
    price_band: StrategyChain,
    issue_size: StrategyChain,
    min_qty: StrategyChain,
    min_amount: StrategyChain,
    subscription: StrategyChain,
    listing_gain: StrategyChain,
    strengths: SelectorStrategy,
    risks: SelectorStrategy,
}

fn labeled(field: &str, labels: &[&str]) -> StrategyChain {
    StrategyChain::new(field).with(LabeledRowStrategy::new(format!("{field}_row"), 10, labels))
}

impl DetailChains {
    fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            name: StrategyChain::new("name")
                .with(SelectorStrategy::new("ipo_title", 1, "h1.ipo-title, [data-field='name']")?)
                .with(SelectorStrategy::new("h1", 2, "h1")?)
                .with(SelectorStrategy::new("og_title", 3, "meta[property='og:title']")?.attr("content")),
            symbol: labeled("symbol", &["nse symbol", "bse code", "symbol"]),
            registrar: labeled("registrar", &["registrar"])
                .with(SelectorStrategy::new("registrar_block", 20, ".registrar-name")?),
            logo: StrategyChain::new("logo")
                .with(SelectorStrategy::new("logo_img", 1, "img.company-logo, .ipo-logo img")?.attr("src"))
                .with(SelectorStrategy::new("og_image", 2, "meta[property='og:image']")?.attr("content")),
            description: StrategyChain::new("description")
                .with(SelectorStrategy::new("description_block", 1, ".ipo-description, [data-field='description']")?)
                .with(SelectorStrategy::new("meta_description", 5, "meta[name='description']")?.attr("content")),
            about: StrategyChain::new("about")
                .with(SelectorStrategy::new("about_block", 1, ".about-company, #about, [data-field='about']")?),
            open_date: labeled("open_date", &["open date", "opening date", "ipo open", "bidding start"]).with(
                TextPatternStrategy::new(
                    "open_date_text",
                    20,
                    r"(?i)opens?\s+on\s+([A-Za-z]{3,9}\.?\s+\d{1,2},?\s+\d{4}|\d{1,2}\s+[A-Za-z]{3,9},?\s+\d{4})",
                )?,
            ),
            close_date: labeled("close_date", &["close date", "closing date", "ipo close", "bidding end"]).with(
                TextPatternStrategy::new(
                    "close_date_text",
                    20,
                    r"(?i)closes?\s+on\s+([A-Za-z]{3,9}\.?\s+\d{1,2},?\s+\d{4}|\d{1,2}\s+[A-Za-z]{3,9},?\s+\d{4})",
                )?,
            ),
            result_date: labeled("result_date", &["allotment date", "basis of allotment", "allotment finalization", "result date"]),
            listing_date: labeled("listing_date", &["listing date", "listing on"]),
            price_band: labeled("price_band", &["price band", "price range", "issue price"]),
            issue_size: labeled("issue_size", &["issue size", "total issue size"]),
            min_qty: labeled("min_qty", &["lot size", "market lot", "minimum quantity"]),
            min_amount: labeled("min_amount", &["min investment", "minimum investment", "min amount"]),
            subscription: labeled("subscription", &["subscription status", "total subscription", "subscribed"]),
            listing_gain: labeled("listing_gain", &["listing gain", "listing gains"]),
            strengths: SelectorStrategy::new("strengths", 1, ".strengths li, [data-field='strengths'] li")?,
            risks: SelectorStrategy::new("risks", 1, ".risks li, [data-field='risks'] li")?,
        })
    }
}

/// Pure page-to-record parsing; no I/O.
#[derive(Debug)]
pub struct IpoPageParser {
    chains: DetailChains,
}

impl IpoPageParser {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            chains: DetailChains::new()?,
        })
    }

    /// Never fails: whatever the page lacks falls back to the listing context.
    pub fn parse(&self, html: &str, listing: &ListingMetadata, now: DateTime<Utc>) -> Parsed<Ipo> {
        let mut ipo = Ipo::from_listing(listing, now);
        let listing_name = ipo.name.clone();

        let from_json = match embedded_ipo(html) {
            Ok(embedded) if embedded.has_content() => {
                apply_embedded(&mut ipo, embedded);
                true
            }
            Ok(_) => false,
            Err(err) => {
                debug!(url = %listing.detail_url, error = %err, "no embedded ipo json");
                false
            }
        };

        let doc = Html::parse_document(html);
        let name_locked = ipo.name != listing_name;
        let from_html = self.apply_html(&mut ipo, &doc, listing, name_locked);

        if ipo.company_code.is_empty() {
            ipo.company_code = generate_company_code(&ipo.name);
        }
        if ipo.slug.is_empty() {
            ipo.slug = generate_slug(&ipo.name);
        }
        ipo.refresh_status(now);

        if from_json {
            Parsed::Json(ipo)
        } else if from_html {
            Parsed::Html(ipo)
        } else {
            Parsed::Fallback(ipo)
        }
    }

    /// Fills only fields that are still empty. Returns whether anything matched.
    fn apply_html(&self, ipo: &mut Ipo, doc: &Html, listing: &ListingMetadata, name_locked: bool) -> bool {
        let c = &self.chains;
        let mut found = false;
        let mut hit = |matched: bool| {
            found |= matched;
        };

        if !name_locked {
            if let Some(m) = c.name.first_match(doc) {
                let name = normalize_text(&m.value);
                if name != ipo.name {
                    rename(ipo, name);
                }
                hit(true);
            }
        }

        let text = |chain: &StrategyChain| chain.first_valid(doc, |raw| text_value(Some(raw))).map(|(_, v)| v);
        let date = |chain: &StrategyChain| chain.first_valid(doc, parse_date).map(|(_, d)| d);

        macro_rules! fill {
            ($slot:expr, $value:expr) => {
                if $slot.is_none() {
                    let value = $value;
                    hit(value.is_some());
                    $slot = value;
                }
            };
        }

        fill!(ipo.symbol, text(&c.symbol));
        fill!(ipo.registrar, text(&c.registrar));
        fill!(ipo.issue_size, text(&c.issue_size));
        fill!(ipo.subscription_status, text(&c.subscription));
        fill!(ipo.listing_gain, text(&c.listing_gain));
        fill!(ipo.open_date, date(&c.open_date));
        fill!(ipo.close_date, date(&c.close_date));
        fill!(ipo.result_date, date(&c.result_date));
        fill!(ipo.listing_date, date(&c.listing_date));
        fill!(ipo.min_qty, c.min_qty.first_valid(doc, parse_quantity).map(|(_, v)| v));
        fill!(ipo.min_amount, c.min_amount.first_valid(doc, parse_number).map(|(_, v)| v));
        fill!(
            ipo.logo_url,
            c.logo.first_match(doc).map(|m| resolve_url(&listing.detail_url, &m.value))
        );
        fill!(
            ipo.description,
            c.description.first_valid(doc, |raw| clean_free_text(raw, DESCRIPTION_MAX_LEN)).map(|(_, v)| v)
        );
        fill!(
            ipo.about,
            c.about.first_valid(doc, |raw| clean_free_text(raw, ABOUT_MAX_LEN)).map(|(_, v)| v)
        );

        if ipo.price_band_low.is_none() && ipo.price_band_high.is_none() {
            if let Some((_, (low, high))) = c.price_band.first_valid(doc, |raw| {
                let band = parse_price_band(raw);
                (band.0.is_some() || band.1.is_some()).then_some(band)
            }) {
                ipo.price_band_low = low;
                ipo.price_band_high = high;
                hit(true);
            }
        }

        if ipo.strengths.is_empty() {
            ipo.strengths = c.strengths.extract_all(doc).iter().filter_map(|s| text_value(Some(s))).collect();
            hit(!ipo.strengths.is_empty());
        }
        if ipo.risks.is_empty() {
            ipo.risks = c.risks.extract_all(doc).iter().filter_map(|s| text_value(Some(s))).collect();
            hit(!ipo.risks.is_empty());
        }

        found
    }
}

fn embedded_ipo(html: &str) -> Result<EmbeddedIpo, ExtractError> {
    let json = extract_embedded_json(html, DETAIL_ANCHORS)?;
    Ok(serde_json::from_str(&json)?)
}

fn scalar_date(value: Option<&Scalar>) -> Option<NaiveDate> {
    value?.as_date()
}

fn apply_embedded(ipo: &mut Ipo, embedded: EmbeddedIpo) {
    if let Some(name) = text_value(embedded.name.as_deref()) {
        if name != ipo.name {
            rename(ipo, name);
        }
    }
    if let Some(stock_id) = scalar_text(embedded.stock_id.as_ref()) {
        ipo.stock_id = Some(stock_id);
    }
    ipo.symbol = text_value(embedded.symbol.as_deref());
    ipo.registrar = text_value(embedded.registrar.as_deref());
    if let Some(logo) = text_value(embedded.logo.as_deref()) {
        ipo.logo_url = Some(logo);
    }
    ipo.description = embedded
        .description
        .as_deref()
        .and_then(|d| clean_free_text(d, DESCRIPTION_MAX_LEN));
    ipo.about = embedded.about.as_deref().and_then(|a| clean_free_text(a, ABOUT_MAX_LEN));
    ipo.strengths = embedded.strengths.iter().filter_map(|s| text_value(Some(s))).collect();
    ipo.risks = embedded.risks.iter().filter_map(|s| text_value(Some(s))).collect();
    ipo.open_date = scalar_date(embedded.open_date.as_ref());
    ipo.close_date = scalar_date(embedded.close_date.as_ref());
    ipo.result_date = scalar_date(embedded.result_date.as_ref());
    ipo.listing_date = scalar_date(embedded.listing_date.as_ref());

    let (band_low, band_high) = embedded
        .price_band
        .as_deref()
        .map(parse_price_band)
        .unwrap_or((None, None));
    let min_price = embedded.min_price.as_ref().and_then(Scalar::as_f64);
    let max_price = embedded.max_price.as_ref().and_then(Scalar::as_f64);
    ipo.price_band_low = min_price.or(band_low).or(max_price);
    ipo.price_band_high = max_price.or(band_high).or(min_price);

    ipo.issue_size = scalar_text(embedded.issue_size.as_ref());
    ipo.min_qty = embedded
        .min_qty
        .as_ref()
        .and_then(|q| q.as_text())
        .and_then(|q| parse_quantity(&q));
    ipo.min_amount = embedded.min_amount.as_ref().and_then(Scalar::as_f64);
    ipo.subscription_status = scalar_text(embedded.subscription_status.as_ref());
    ipo.listing_gain = text_value(embedded.listing_gain.as_deref());
}

/// Fetches listing and detail pages for one configured source.
pub struct IpoDetailExtractor {
    source_id: String,
    listing_urls: Vec<String>,
    base_url: String,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    archive: Option<PageArchive>,
    parser: IpoPageParser,
}

impl IpoDetailExtractor {
    pub fn new(
        source_id: impl Into<String>,
        base_url: impl Into<String>,
        listing_urls: Vec<String>,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ExtractError> {
        Ok(Self {
            source_id: source_id.into(),
            listing_urls,
            base_url: base_url.into(),
            fetcher,
            clock,
            archive: None,
            parser: IpoPageParser::new()?,
        })
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, ExtractError> {
        let response = self.fetcher.fetch(&FetchRequest::get(url)).await?;
        if let Some(archive) = &self.archive {
            if let Err(err) = archive.archive(self.clock.now(), &self.source_id, "html", &response.body).await {
                warn!(source = %self.source_id, %url, error = %err, "page archive failed");
            }
        }
        Ok(response.body)
    }
}

#[async_trait]
impl IpoSource for IpoDetailExtractor {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn list_ipos(&self) -> Result<Vec<ListingMetadata>, ExtractError> {
        let mut listings = Vec::new();
        let mut last_error = None;
        let mut fetched_any = false;
        for url in &self.listing_urls {
            let page = match self.fetch_page(url).await {
                Ok(body) => body,
                Err(err) => {
                    warn!(source = %self.source_id, %url, error = %err, "listing page failed");
                    last_error = Some(err);
                    continue;
                }
            };
            let html = match decode_page(&page) {
                Ok(html) => html,
                Err(err) => {
                    warn!(source = %self.source_id, %url, error = %err, "listing page unreadable");
                    last_error = Some(err);
                    continue;
                }
            };
            fetched_any = true;
            let base = if self.base_url.is_empty() { url.as_str() } else { self.base_url.as_str() };
            for listing in parse_listing_page(html, base) {
                if !listings.iter().any(|l: &ListingMetadata| l.detail_url == listing.detail_url) {
                    listings.push(listing);
                }
            }
        }
        match (fetched_any, last_error) {
            (false, Some(err)) => Err(err),
            _ => {
                info!(source = %self.source_id, count = listings.len(), "listing pages read");
                Ok(listings)
            }
        }
    }

    async fn extract_ipo(&self, listing: &ListingMetadata) -> Result<Ipo, ExtractFailure> {
        let now = self.clock.now();
        let body = match self.fetch_page(&listing.detail_url).await {
            Ok(body) => body,
            Err(err) => return Err(ExtractFailure::new(Ipo::from_listing(listing, now), err)),
        };
        let html = decode_page(&body).map_err(|err| ExtractFailure::new(Ipo::from_listing(listing, now), err))?;
        let parsed = self.parser.parse(html, listing, now);
        debug!(source = %self.source_id, url = %listing.detail_url, path = parsed.path(), "ipo page parsed");
        Ok(parsed.into_inner())
    }
}
