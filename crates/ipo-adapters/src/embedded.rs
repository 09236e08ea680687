//! Locating JSON embedded in server-rendered pages.

use chrono::{DateTime, NaiveDate};
use ipo_core::normalize::{parse_date, parse_number};
use ipo_core::status::market_date;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

use crate::ExtractError;

const FLIGHT_NEEDLE: &str = "self.__next_f.push([1,\"";

lazy_static! {
    static ref NEXT_DATA: Regex =
        Regex::new(r#"(?is)<script[^>]*\bid\s*=\s*["']__NEXT_DATA__["'][^>]*>(.*?)</script>"#).unwrap();
}

/// Number-or-string fields; sources are inconsistent about quoting.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) if n.is_finite() => Some(*n),
            Self::Number(_) => None,
            Self::Text(s) => parse_number(s),
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Number(n) => Some(n.to_string()),
            Self::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
        }
    }

    /// Date strings in any known layout, or epoch seconds/millis read in market time.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Text(s) => parse_date(s),
            Self::Number(n) if n.is_finite() && *n > 0.0 => {
                let ts = if *n > 1e11 {
                    DateTime::from_timestamp_millis(*n as i64)
                } else {
                    DateTime::from_timestamp(*n as i64, 0)
                };
                ts.map(market_date)
            }
            Self::Number(_) => None,
        }
    }
}

fn flight_payload(text: &str) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut search = text;

    while let Some(start) = search.find(FLIGHT_NEEDLE) {
        let after = &search[start + FLIGHT_NEEDLE.len()..];
        let mut escaped = false;
        let mut end_idx = None;
        for (i, ch) in after.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '"' => {
                    end_idx = Some(i);
                    break;
                }
                _ => {}
            }
        }
        let Some(end) = end_idx else {
            break;
        };
        let decoded: String = serde_json::from_str(&format!("\"{}\"", &after[..end]))?;
        out.push_str(&decoded);
        search = &after[end + 1..];
    }
    Ok(out)
}

/// The page's serialized state: `__NEXT_DATA__`, streamed flight chunks, or
/// the body itself when it is already JSON.
pub fn embedded_payload(text: &str) -> Result<String, ExtractError> {
    if let Some(body) = NEXT_DATA.captures(text).and_then(|c| c.get(1)) {
        let body = body.as_str().trim();
        if !body.is_empty() {
            return Ok(body.to_string());
        }
    }
    let flight = flight_payload(text)?;
    if !flight.is_empty() {
        return Ok(flight);
    }
    let trimmed = text.trim_start_matches('\u{feff}').trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed.to_string());
    }
    Err(ExtractError::MissingPayload)
}

/// Balanced `{...}` or `[...]` starting at `start`, honoring strings and escapes.
fn balanced_value(payload: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escape = false;
    for (offset, ch) in payload[start..].char_indices() {
        if in_str {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_str = false;
            }
            continue;
        }
        match ch {
            '"' => in_str = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&payload[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Start of the object/array value for the first `"key":` occurrence that has one.
fn value_start(payload: &str, key: &str) -> Option<usize> {
    let quoted = format!("\"{key}\"");
    let mut cursor = 0;
    while let Some(pos) = payload[cursor..].find(&quoted) {
        let after_key = cursor + pos + quoted.len();
        let rest = &payload[after_key..];
        let after_ws = rest.trim_start();
        if let Some(value) = after_ws.strip_prefix(':') {
            let value_trimmed = value.trim_start();
            if value_trimmed.starts_with('{') || value_trimmed.starts_with('[') {
                return Some(payload.len() - value_trimmed.len());
            }
        }
        cursor = after_key;
    }
    None
}

/// Raw JSON text of the value under the first anchor key found. With no
/// anchors the whole payload is returned.
pub fn extract_embedded_json(text: &str, anchors: &[&str]) -> Result<String, ExtractError> {
    let payload = embedded_payload(text)?;
    if anchors.is_empty() {
        return Ok(payload);
    }
    for anchor in anchors {
        if let Some(start) = value_start(&payload, anchor) {
            if let Some(value) = balanced_value(&payload, start) {
                return Ok(value.to_string());
            }
        }
    }
    Err(ExtractError::MissingPayload)
}
