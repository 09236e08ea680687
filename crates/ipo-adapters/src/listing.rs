use std::collections::HashSet;

use ipo_core::ListingMetadata;
use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tracing::debug;

use crate::embedded::{extract_embedded_json, Scalar};
use crate::strategy::collapsed_text;

const LIST_ANCHORS: &[&str] = &["ipoList", "ipos", "items"];

lazy_static! {
    static ref DETAIL_LINK: Selector = Selector::parse("a[href*='/ipo/']").unwrap();
    static ref IMG: Selector = Selector::parse("img").unwrap();
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EmbeddedListingItem {
    #[serde(alias = "companyName", alias = "title")]
    name: Option<String>,
    #[serde(alias = "detailUrl", alias = "href")]
    url: Option<String>,
    slug: Option<String>,
    #[serde(alias = "logoUrl")]
    logo: Option<String>,
    #[serde(alias = "stock_id")]
    stock_id: Option<Scalar>,
}

/// Absolute URL for `href` as seen from `base`.
pub(crate) fn resolve_url(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{rest}");
    }
    let origin_end = base
        .find("://")
        .map(|scheme| base[scheme + 3..].find('/').map_or(base.len(), |p| scheme + 3 + p))
        .unwrap_or(base.len());
    if href.starts_with('/') {
        return format!("{}{}", &base[..origin_end], href);
    }
    let dir = match base[origin_end..].rfind('/') {
        Some(p) => &base[..origin_end + p + 1],
        None => return format!("{}/{}", &base[..origin_end], href),
    };
    format!("{dir}{href}")
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn from_embedded(html: &str, base_url: &str) -> Vec<ListingMetadata> {
    let Ok(json) = extract_embedded_json(html, LIST_ANCHORS) else {
        return Vec::new();
    };
    let items: Vec<EmbeddedListingItem> = match serde_json::from_str(&json) {
        Ok(items) => items,
        Err(err) => {
            debug!(error = %err, "embedded listing did not decode");
            return Vec::new();
        }
    };
    items
        .into_iter()
        .filter_map(|item| {
            let title = non_blank(item.name.as_deref())?;
            let href = non_blank(item.url.as_deref())
                .or_else(|| non_blank(item.slug.as_deref()).map(|slug| format!("/ipo/{slug}")))?;
            Some(ListingMetadata {
                title,
                detail_url: resolve_url(base_url, &href),
                logo_url: non_blank(item.logo.as_deref()).map(|l| resolve_url(base_url, &l)),
                stock_id: item.stock_id.and_then(|s| s.as_text()),
            })
        })
        .collect()
}

fn stock_id_of(anchor: ElementRef<'_>) -> Option<String> {
    non_blank(anchor.value().attr("data-stock-id")).or_else(|| {
        anchor
            .parent()
            .and_then(ElementRef::wrap)
            .and_then(|parent| non_blank(parent.value().attr("data-stock-id")))
    })
}

fn from_anchors(html: &str, base_url: &str) -> Vec<ListingMetadata> {
    let doc = Html::parse_document(html);
    doc.select(&DETAIL_LINK)
        .filter_map(|anchor| {
            let href = non_blank(anchor.value().attr("href"))?;
            let img = anchor.select(&IMG).next();
            let title = non_blank(anchor.value().attr("data-title"))
                .or_else(|| non_blank(Some(collapsed_text(anchor).as_str())))
                .or_else(|| img.and_then(|i| non_blank(i.value().attr("alt"))))?;
            let logo_url = img
                .and_then(|i| non_blank(i.value().attr("data-src")).or_else(|| non_blank(i.value().attr("src"))))
                .map(|src| resolve_url(base_url, &src));
            Some(ListingMetadata {
                title,
                detail_url: resolve_url(base_url, &href),
                logo_url,
                stock_id: stock_id_of(anchor),
            })
        })
        .collect()
}

/// Detail-page links from a listing page, embedded JSON first, then anchors.
/// First occurrence of each detail URL wins.
pub fn parse_listing_page(html: &str, base_url: &str) -> Vec<ListingMetadata> {
    let mut listings = from_embedded(html, base_url);
    if listings.is_empty() {
        listings = from_anchors(html, base_url);
    }
    let mut seen = HashSet::new();
    listings.retain(|l| seen.insert(l.detail_url.clone()));
    listings
}
