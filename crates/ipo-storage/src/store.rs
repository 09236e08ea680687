//! Persistence for IPO records and GMP snapshots.
//!
//! Stored `status` values are advisory; readers recompute them from the
//! timeline before handing records out.

use std::cmp::Ordering;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipo_core::{ExtractionConfidence, GmpSnapshot, GmpStatusCode, Ipo, IpoStatus};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait IpoStore: Send + Sync {
    /// Insert-or-update keyed by `stock_id`, or `company_code` for records
    /// without one. Returns the row as stored; an existing row keeps its
    /// `id` and `created_at`.
    async fn upsert_ipo(&self, ipo: &Ipo) -> Result<Ipo>;

    /// Insert-or-update keyed by `ipo_name`.
    async fn upsert_gmp(&self, snapshot: &GmpSnapshot) -> Result<GmpSnapshot>;

    async fn list_ipos(&self) -> Result<Vec<Ipo>>;

    /// Looks a record up by id, slug, stock id or company code.
    async fn find_ipo(&self, key: &str) -> Result<Option<Ipo>>;

    async fn list_gmp(&self) -> Result<Vec<GmpSnapshot>>;
}

/// Newest offerings first, undated ones last, then by name.
fn ipo_listing_order(a: &Ipo, b: &Ipo) -> Ordering {
    match (a.open_date, b.open_date) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.name.cmp(&b.name))
}

fn key_matches(ipo: &Ipo, key: &str) -> bool {
    Uuid::parse_str(key).is_ok_and(|id| id == ipo.id)
        || ipo.slug == key
        || ipo.stock_id.as_deref() == Some(key)
        || ipo.company_code == key
}

#[derive(Debug, Default)]
pub struct MemoryIpoStore {
    ipos: RwLock<Vec<Ipo>>,
    gmp: RwLock<Vec<GmpSnapshot>>,
}

impl MemoryIpoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ipo_count(&self) -> usize {
        self.ipos.read().await.len()
    }

    pub async fn gmp_count(&self) -> usize {
        self.gmp.read().await.len()
    }
}

#[async_trait]
impl IpoStore for MemoryIpoStore {
    async fn upsert_ipo(&self, ipo: &Ipo) -> Result<Ipo> {
        let mut ipo = ipo.clone();
        ipo.stock_id = ipo.stock_key().map(str::to_string);
        let mut rows = self.ipos.write().await;
        let existing = if ipo.stock_id.is_some() {
            rows.iter()
                .position(|row| row.stock_id == ipo.stock_id)
                .or_else(|| {
                    rows.iter()
                        .position(|row| row.stock_id.is_none() && row.company_code == ipo.company_code)
                })
        } else {
            rows.iter()
                .position(|row| row.stock_id.is_none() && row.company_code == ipo.company_code)
        };

        match existing {
            Some(idx) => {
                let mut merged = ipo.clone();
                merged.id = rows[idx].id;
                merged.created_at = rows[idx].created_at;
                rows[idx] = merged.clone();
                Ok(merged)
            }
            None => {
                rows.push(ipo.clone());
                Ok(ipo)
            }
        }
    }

    async fn upsert_gmp(&self, snapshot: &GmpSnapshot) -> Result<GmpSnapshot> {
        let mut rows = self.gmp.write().await;
        match rows.iter_mut().find(|row| row.ipo_name == snapshot.ipo_name) {
            Some(row) => {
                let id = row.id;
                *row = snapshot.clone();
                row.id = id;
                Ok(row.clone())
            }
            None => {
                rows.push(snapshot.clone());
                Ok(snapshot.clone())
            }
        }
    }

    async fn list_ipos(&self) -> Result<Vec<Ipo>> {
        let mut rows = self.ipos.read().await.clone();
        rows.sort_by(ipo_listing_order);
        Ok(rows)
    }

    async fn find_ipo(&self, key: &str) -> Result<Option<Ipo>> {
        Ok(self.ipos.read().await.iter().find(|ipo| key_matches(ipo, key)).cloned())
    }

    async fn list_gmp(&self) -> Result<Vec<GmpSnapshot>> {
        let mut rows = self.gmp.read().await.clone();
        rows.sort_by(|a, b| b.last_updated.cmp(&a.last_updated).then_with(|| a.ipo_name.cmp(&b.ipo_name)));
        Ok(rows)
    }
}

const IPO_COLUMNS: &str = "id, stock_id, company_code, name, symbol, registrar, logo_url, description, about, \
    strengths, risks, slug, open_date, close_date, result_date, listing_date, price_band_low, \
    price_band_high, issue_size, min_qty, min_amount, status, subscription_status, listing_gain, \
    created_at, updated_at";

const IPO_UPDATE_SET: &str = "company_code = EXCLUDED.company_code, name = EXCLUDED.name, \
    symbol = EXCLUDED.symbol, registrar = EXCLUDED.registrar, logo_url = EXCLUDED.logo_url, \
    description = EXCLUDED.description, about = EXCLUDED.about, strengths = EXCLUDED.strengths, \
    risks = EXCLUDED.risks, slug = EXCLUDED.slug, open_date = EXCLUDED.open_date, \
    close_date = EXCLUDED.close_date, result_date = EXCLUDED.result_date, \
    listing_date = EXCLUDED.listing_date, price_band_low = EXCLUDED.price_band_low, \
    price_band_high = EXCLUDED.price_band_high, issue_size = EXCLUDED.issue_size, \
    min_qty = EXCLUDED.min_qty, min_amount = EXCLUDED.min_amount, status = EXCLUDED.status, \
    subscription_status = EXCLUDED.subscription_status, listing_gain = EXCLUDED.listing_gain, \
    updated_at = EXCLUDED.updated_at";

const GMP_COLUMNS: &str = "id, ipo_name, company_code, stock_id, gmp_value, gain_percent, reference_price, \
    estimated_listing, subscription, rating, status_code, data_source, last_updated, confidence";

#[derive(Debug, Clone)]
pub struct PgIpoStore {
    pool: PgPool,
}

impl PgIpoStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }

    /// A keyless row for the same company becomes the home of its first stock id.
    async fn adopt_keyless_row(&self, ipo: &Ipo) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ipos
               SET stock_id = $1
             WHERE company_code = $2
               AND stock_id IS NULL
               AND NOT EXISTS (SELECT 1 FROM ipos WHERE stock_id = $1)
            "#,
        )
        .bind(ipo.stock_key())
        .bind(&ipo.company_code)
        .execute(&self.pool)
        .await
        .context("adopting keyless ipo row")?;
        Ok(())
    }
}

fn ipo_from_row(row: &PgRow) -> Result<Ipo> {
    let status: String = row.try_get("status")?;
    let strengths: Json<Vec<String>> = row.try_get("strengths")?;
    let risks: Json<Vec<String>> = row.try_get("risks")?;
    Ok(Ipo {
        id: row.try_get("id")?,
        stock_id: row.try_get("stock_id")?,
        company_code: row.try_get("company_code")?,
        name: row.try_get("name")?,
        symbol: row.try_get("symbol")?,
        registrar: row.try_get("registrar")?,
        logo_url: row.try_get("logo_url")?,
        description: row.try_get("description")?,
        about: row.try_get("about")?,
        strengths: strengths.0,
        risks: risks.0,
        slug: row.try_get("slug")?,
        open_date: row.try_get("open_date")?,
        close_date: row.try_get("close_date")?,
        result_date: row.try_get("result_date")?,
        listing_date: row.try_get("listing_date")?,
        price_band_low: row.try_get("price_band_low")?,
        price_band_high: row.try_get("price_band_high")?,
        issue_size: row.try_get("issue_size")?,
        min_qty: row.try_get("min_qty")?,
        min_amount: row.try_get("min_amount")?,
        status: IpoStatus::parse(&status).unwrap_or(IpoStatus::Unknown),
        subscription_status: row.try_get("subscription_status")?,
        listing_gain: row.try_get("listing_gain")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn gmp_from_row(row: &PgRow) -> Result<GmpSnapshot> {
    let rating: Option<i16> = row.try_get("rating")?;
    let status_code: Option<String> = row.try_get("status_code")?;
    let confidence: Option<Json<ExtractionConfidence>> = row.try_get("confidence")?;
    Ok(GmpSnapshot {
        id: row.try_get("id")?,
        ipo_name: row.try_get("ipo_name")?,
        company_code: row.try_get("company_code")?,
        stock_id: row.try_get("stock_id")?,
        gmp_value: row.try_get("gmp_value")?,
        gain_percent: row.try_get("gain_percent")?,
        reference_price: row.try_get("reference_price")?,
        estimated_listing: row.try_get("estimated_listing")?,
        subscription: row.try_get("subscription")?,
        rating: rating.and_then(|r| u8::try_from(r).ok()),
        status_code: status_code.as_deref().and_then(GmpStatusCode::parse),
        data_source: row.try_get("data_source")?,
        last_updated: row.try_get("last_updated")?,
        confidence: confidence.map(|c| c.0).unwrap_or_default(),
    })
}

#[async_trait]
impl IpoStore for PgIpoStore {
    async fn upsert_ipo(&self, ipo: &Ipo) -> Result<Ipo> {
        let stock_id = ipo.stock_key();
        let conflict = if stock_id.is_some() {
            self.adopt_keyless_row(ipo).await?;
            "ON CONFLICT (stock_id)"
        } else {
            "ON CONFLICT (company_code) WHERE stock_id IS NULL"
        };
        let sql = format!(
            "INSERT INTO ipos ({IPO_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
                     $19, $20, $21, $22, $23, $24, $25, $26) \
             {conflict} DO UPDATE SET {IPO_UPDATE_SET} \
             RETURNING {IPO_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(ipo.id)
            .bind(stock_id)
            .bind(&ipo.company_code)
            .bind(&ipo.name)
            .bind(&ipo.symbol)
            .bind(&ipo.registrar)
            .bind(&ipo.logo_url)
            .bind(&ipo.description)
            .bind(&ipo.about)
            .bind(Json(&ipo.strengths))
            .bind(Json(&ipo.risks))
            .bind(&ipo.slug)
            .bind(ipo.open_date)
            .bind(ipo.close_date)
            .bind(ipo.result_date)
            .bind(ipo.listing_date)
            .bind(ipo.price_band_low)
            .bind(ipo.price_band_high)
            .bind(&ipo.issue_size)
            .bind(ipo.min_qty)
            .bind(ipo.min_amount)
            .bind(ipo.status.as_str())
            .bind(&ipo.subscription_status)
            .bind(&ipo.listing_gain)
            .bind(ipo.created_at)
            .bind(ipo.updated_at)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("upserting ipo {}", ipo.company_code))?;
        ipo_from_row(&row)
    }

    async fn upsert_gmp(&self, snapshot: &GmpSnapshot) -> Result<GmpSnapshot> {
        let sql = format!(
            "INSERT INTO gmp_snapshots ({GMP_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (ipo_name) DO UPDATE SET \
                company_code = EXCLUDED.company_code, stock_id = EXCLUDED.stock_id, \
                gmp_value = EXCLUDED.gmp_value, gain_percent = EXCLUDED.gain_percent, \
                reference_price = EXCLUDED.reference_price, estimated_listing = EXCLUDED.estimated_listing, \
                subscription = EXCLUDED.subscription, rating = EXCLUDED.rating, \
                status_code = EXCLUDED.status_code, data_source = EXCLUDED.data_source, \
                last_updated = EXCLUDED.last_updated, confidence = EXCLUDED.confidence \
             RETURNING {GMP_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(snapshot.id)
            .bind(&snapshot.ipo_name)
            .bind(&snapshot.company_code)
            .bind(&snapshot.stock_id)
            .bind(snapshot.gmp_value)
            .bind(snapshot.gain_percent)
            .bind(snapshot.reference_price)
            .bind(snapshot.estimated_listing)
            .bind(snapshot.subscription)
            .bind(snapshot.rating.map(i16::from))
            .bind(snapshot.status_code.map(|c| c.as_str()))
            .bind(&snapshot.data_source)
            .bind(snapshot.last_updated)
            .bind(Json(&snapshot.confidence))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("upserting gmp snapshot {}", snapshot.ipo_name))?;
        gmp_from_row(&row)
    }

    async fn list_ipos(&self) -> Result<Vec<Ipo>> {
        let sql = format!(
            "SELECT {IPO_COLUMNS} FROM ipos ORDER BY open_date DESC NULLS LAST, name ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("listing ipos")?;
        rows.iter().map(ipo_from_row).collect()
    }

    async fn find_ipo(&self, key: &str) -> Result<Option<Ipo>> {
        let sql = format!(
            "SELECT {IPO_COLUMNS} FROM ipos \
              WHERE id::text = $1 OR slug = $1 OR stock_id = $1 OR company_code = $1 \
              ORDER BY (id::text = $1) DESC, (stock_id = $1) DESC NULLS LAST \
              LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("finding ipo {key}"))?;
        row.as_ref().map(ipo_from_row).transpose()
    }

    async fn list_gmp(&self) -> Result<Vec<GmpSnapshot>> {
        let sql = format!(
            "SELECT {GMP_COLUMNS} FROM gmp_snapshots ORDER BY last_updated DESC, ipo_name ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("listing gmp snapshots")?;
        rows.iter().map(gmp_from_row).collect()
    }
}
