//! Core domain model for IPO listings and grey-market premium snapshots.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod batch;
pub mod normalize;
pub mod status;

pub use batch::{run_sequential, BatchCollector, BatchError, BatchOutcome, CancelSignal, ItemOutcome};
pub use status::{compute_status, Clock, FixedClock, IpoStatus, SystemClock};

pub const CRATE_NAME: &str = "ipo-core";

/// Canonical record of one offering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ipo {
    pub id: Uuid,
    pub stock_id: Option<String>,
    pub company_code: String,
    pub name: String,
    pub symbol: Option<String>,
    pub registrar: Option<String>,
    pub logo_url: Option<String>,
    pub description: Option<String>,
    pub about: Option<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    pub slug: String,
    pub open_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDate>,
    pub result_date: Option<NaiveDate>,
    pub listing_date: Option<NaiveDate>,
    pub price_band_low: Option<f64>,
    pub price_band_high: Option<f64>,
    pub issue_size: Option<String>,
    pub min_qty: Option<i32>,
    pub min_amount: Option<f64>,
    pub status: IpoStatus,
    pub subscription_status: Option<String>,
    pub listing_gain: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ipo {
    /// Bare record carrying only a display name; everything else absent.
    pub fn named(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        let name = name.into();
        Self {
            id: Uuid::new_v4(),
            stock_id: None,
            company_code: normalize::generate_company_code(&name),
            slug: normalize::generate_slug(&name),
            name,
            symbol: None,
            registrar: None,
            logo_url: None,
            description: None,
            about: None,
            strengths: Vec::new(),
            risks: Vec::new(),
            open_date: None,
            close_date: None,
            result_date: None,
            listing_date: None,
            price_band_low: None,
            price_band_high: None,
            issue_size: None,
            min_qty: None,
            min_amount: None,
            status: IpoStatus::Unknown,
            subscription_status: None,
            listing_gain: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Minimal record built from list-page context only.
    pub fn from_listing(listing: &ListingMetadata, now: DateTime<Utc>) -> Self {
        let mut ipo = Self::named(listing.title.trim(), now);
        ipo.stock_id = listing.stock_id.clone();
        ipo.logo_url = listing.logo_url.clone();
        ipo
    }

    /// Overwrites whatever status was loaded with one derived from the timeline.
    pub fn with_live_status(mut self, now: DateTime<Utc>) -> Self {
        self.refresh_status(now);
        self
    }

    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        self.status = compute_status(self.open_date, self.close_date, self.listing_date, now);
    }

    /// Fills `company_code` and `slug` from `name` when they are blank.
    pub fn ensure_derived_keys(&mut self) {
        if self.company_code.trim().is_empty() {
            self.company_code = normalize::generate_company_code(&self.name);
        }
        if self.slug.trim().is_empty() {
            self.slug = normalize::generate_slug(&self.name);
        }
    }

    /// Trimmed stock id; blank ids count as absent.
    pub fn stock_key(&self) -> Option<&str> {
        self.stock_id.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// Raw status code as quoted by a GMP source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GmpStatusCode {
    Upcoming,
    Open,
    Closed,
}

impl GmpStatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upcoming => "Upcoming",
            Self::Open => "Open",
            Self::Closed => "Closed",
        }
    }

    /// Accepts full words ("Open") as well as single-letter badges ("O").
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "u" | "upcoming" => Some(Self::Upcoming),
            "o" | "open" | "live" | "active" => Some(Self::Open),
            "c" | "closed" | "close" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Which fields an extractor found and how complete the record is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExtractionConfidence {
    pub found: Vec<String>,
    pub missing: Vec<String>,
    pub score: u8,
}

impl ExtractionConfidence {
    pub fn from_fields<'a>(fields: impl IntoIterator<Item = (&'a str, bool)>) -> Self {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for (name, present) in fields {
            if present {
                found.push(name.to_string());
            } else {
                missing.push(name.to_string());
            }
        }
        let total = found.len() + missing.len();
        let score = if total == 0 {
            0
        } else {
            ((found.len() as f64 / total as f64) * 100.0).round() as u8
        };
        Self {
            found,
            missing,
            score,
        }
    }
}

/// Point-in-time grey-market premium quote for one IPO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GmpSnapshot {
    pub id: Uuid,
    pub ipo_name: String,
    pub company_code: String,
    pub stock_id: Option<String>,
    pub gmp_value: Option<f64>,
    pub gain_percent: Option<f64>,
    pub reference_price: Option<f64>,
    pub estimated_listing: Option<f64>,
    pub subscription: Option<f64>,
    pub rating: Option<u8>,
    pub status_code: Option<GmpStatusCode>,
    pub data_source: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub confidence: ExtractionConfidence,
}

impl GmpSnapshot {
    pub fn new(ipo_name: impl Into<String>, data_source: impl Into<String>, now: DateTime<Utc>) -> Self {
        let ipo_name = ipo_name.into();
        Self {
            id: Uuid::new_v4(),
            company_code: normalize::generate_company_code(&ipo_name),
            ipo_name,
            stock_id: None,
            gmp_value: None,
            gain_percent: None,
            reference_price: None,
            estimated_listing: None,
            subscription: None,
            rating: None,
            status_code: None,
            data_source: data_source.into(),
            last_updated: now,
            confidence: ExtractionConfidence::default(),
        }
    }

    /// `estimated_listing` is always `reference_price + gmp_value`, or absent.
    pub fn recompute_estimated_listing(&mut self) {
        self.estimated_listing = match (self.reference_price, self.gmp_value) {
            (Some(price), Some(gmp)) => Some(price + gmp),
            _ => None,
        };
    }

    pub fn recompute_confidence(&mut self) {
        self.confidence = ExtractionConfidence::from_fields([
            ("gmp_value", self.gmp_value.is_some()),
            ("gain_percent", self.gain_percent.is_some()),
            ("reference_price", self.reference_price.is_some()),
            ("subscription", self.subscription.is_some()),
            ("rating", self.rating.is_some()),
            ("status_code", self.status_code.is_some()),
        ]);
    }
}

/// What a list page tells us about an IPO before its detail page is visited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingMetadata {
    pub title: String,
    pub detail_url: String,
    pub logo_url: Option<String>,
    pub stock_id: Option<String>,
}
