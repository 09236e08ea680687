//! Stateless transforms from raw scraped strings to canonical values.
//!
//! Every function here is pure: the same input always yields the same output
//! and nothing is cached between calls.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref RUPEE_ABBREV: Regex = Regex::new(r"(?i)\brs\.").unwrap();
    static ref DIGIT_GROUP_COMMA: Regex = Regex::new(r"(\d),(\d)").unwrap();
    static ref SIGNED_NUMBER: Regex = Regex::new(r"[-+]?\d+(?:\.\d+)?").unwrap();
    static ref UNSIGNED_NUMBER: Regex = Regex::new(r"\d+(?:\.\d+)?").unwrap();
    static ref PERCENT_NUMBER: Regex = Regex::new(r"([-+]?\d+(?:\.\d+)?)\s*%").unwrap();
    static ref OUT_OF_FIVE: Regex = Regex::new(r"(\d+(?:\.\d+)?)\s*/\s*5\b").unwrap();
    static ref ORDINAL_SUFFIX: Regex = Regex::new(r"(?i)\b(\d{1,2})(st|nd|rd|th)\b").unwrap();
}

const NOT_AVAILABLE: &[&str] = &[
    "",
    "-",
    "--",
    "---",
    "—",
    "tba",
    "tbd",
    "n/a",
    "na",
    "nil",
    "null",
    "none",
    "pending",
    "awaited",
    "to be announced",
    "not available",
    "not applicable",
    "coming soon",
];

const LEGAL_SUFFIXES: &[&str] = &[
    " bse sme",
    " nse sme",
    " limited",
    " private",
    " ltd",
    " pvt",
    " ipo",
    " inc",
    " llp",
    " sme",
];

const DATE_LAYOUTS: &[&str] = &[
    "%Y-%m-%d",
    "%d-%m-%Y",
    "%d/%m/%Y",
    "%d.%m.%Y",
    "%Y/%m/%d",
    "%b %d, %Y",
    "%B %d, %Y",
    "%b %d %Y",
    "%d %b %Y",
    "%d %B %Y",
    "%d %b, %Y",
    "%d-%b-%Y",
    "%a, %b %d, %Y",
    "%A, %B %d, %Y",
    "%a, %d %b %Y",
    "%a %b %d %Y",
];

const DATETIME_LAYOUTS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

fn strip_currency_once(input: &str) -> String {
    let replaced = input.replace('₹', " ");
    RUPEE_ABBREV.replace_all(&replaced, " ").into_owned()
}

fn strip_currency(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        let next = strip_currency_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Trims and collapses whitespace runs; everything else is kept as written.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trims, collapses whitespace runs and drops currency glyphs (₹, Rs.).
pub fn normalize_text(input: &str) -> String {
    collapse_whitespace(&strip_currency(input))
}

/// Case-insensitive exact match against the placeholder set used by sources
/// for "no value yet".
pub fn is_not_available(input: &str) -> bool {
    let lowered = input.trim().to_lowercase();
    NOT_AVAILABLE.contains(&lowered.as_str())
}

fn numeric_view(input: &str) -> String {
    let text = strip_currency(input).replace('\u{2212}', "-");
    let mut current = text;
    // "1,23,456" needs two passes because matches cannot overlap.
    loop {
        let next = DIGIT_GROUP_COMMA.replace_all(&current, "$1$2").into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

/// First signed decimal number in the text, if any.
pub fn parse_number(input: &str) -> Option<f64> {
    if is_not_available(input) {
        return None;
    }
    let view = numeric_view(input);
    SIGNED_NUMBER
        .find(&view)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Like [`parse_number`] but `0.0` when nothing is found. Callers that need
/// to tell "absent" from "zero" should use [`parse_number`].
pub fn extract_numeric(input: &str) -> f64 {
    parse_number(input).unwrap_or(0.0)
}

fn number_before_percent(view: &str) -> Option<f64> {
    PERCENT_NUMBER
        .captures(view)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Percentage with its sign kept. Prefers the number right before `%`.
pub fn extract_signed_percentage(input: &str) -> Option<f64> {
    if is_not_available(input) {
        return None;
    }
    let view = numeric_view(input);
    number_before_percent(&view).or_else(|| {
        SIGNED_NUMBER
            .find(&view)
            .and_then(|m| m.as_str().parse::<f64>().ok())
    })
}

/// Splits GMP cells such as `"₹25 (30.86%)"` into value and gain percent.
pub fn parse_gmp_text(input: &str) -> (Option<f64>, Option<f64>) {
    if is_not_available(input) {
        return (None, None);
    }
    let (value_part, rest) = match input.find('(') {
        Some(idx) => (&input[..idx], &input[idx..]),
        None => (input, ""),
    };
    let value = parse_number(value_part);
    let percent = if rest.is_empty() {
        None
    } else {
        number_before_percent(&numeric_view(rest))
    };
    (value, percent)
}

/// `"₹95 to ₹100"`, `"₹76-81"` or a single price. A single price fills both bounds.
pub fn parse_price_band(input: &str) -> (Option<f64>, Option<f64>) {
    if is_not_available(input) {
        return (None, None);
    }
    let view = numeric_view(input);
    let numbers = UNSIGNED_NUMBER
        .find_iter(&view)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .take(2)
        .collect::<Vec<_>>();
    match numbers.as_slice() {
        [] => (None, None),
        [only] => (Some(*only), Some(*only)),
        [a, b, ..] => (Some(a.min(*b)), Some(a.max(*b))),
    }
}

/// Subscription multiplier from `"12.5x"` or `"12.50 times"`.
pub fn parse_subscription(input: &str) -> Option<f64> {
    parse_number(input).filter(|v| *v >= 0.0)
}

/// Rating 0–5 from fire emoji counts, `"4/5"` or a bare number.
pub fn parse_rating(input: &str) -> Option<u8> {
    let fires = input.matches('🔥').count();
    if fires > 0 {
        return Some(fires.min(5) as u8);
    }
    if is_not_available(input) {
        return None;
    }
    let value = OUT_OF_FIVE
        .captures(input)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .or_else(|| parse_number(input))?;
    Some(value.round().clamp(0.0, 5.0) as u8)
}

/// Whole-unit quantity such as a lot size.
pub fn parse_quantity(input: &str) -> Option<i32> {
    let value = parse_number(input)?;
    if value < 0.0 || value > i32::MAX as f64 {
        return None;
    }
    Some(value.round() as i32)
}

/// Tries the known date layouts in order; `None` when none fits.
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    if is_not_available(input) {
        return None;
    }
    let cleaned = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = ORDINAL_SUFFIX.replace_all(&cleaned, "$1");
    let cleaned = cleaned.trim_end_matches('.').trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(cleaned) {
        return Some(dt.date_naive());
    }
    for layout in DATETIME_LAYOUTS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(cleaned, layout) {
            return Some(dt.date());
        }
    }
    DATE_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDate::parse_from_str(cleaned, layout).ok())
}

fn strip_legal_suffixes(lowered: &str) -> &str {
    let mut current = lowered;
    loop {
        current = current.trim_end_matches(|c: char| c == '.' || c == ',' || c.is_whitespace());
        match LEGAL_SUFFIXES.iter().find(|suffix| current.ends_with(*suffix)) {
            Some(suffix) => current = &current[..current.len() - suffix.len()],
            None => return current,
        }
    }
}

fn hyphenate(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Deterministic join key: `"Wakefit Innovations Ltd."` → `"wakefit-innovations"`.
pub fn generate_company_code(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    hyphenate(strip_legal_suffixes(&lowered))
}

/// URL slug for an IPO page. Same normalization as the company code.
pub fn generate_slug(name: &str) -> String {
    generate_company_code(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn company_code_strips_legal_suffixes() {
        assert_eq!(generate_company_code("Wakefit Innovations Ltd."), "wakefit-innovations");
        assert_eq!(generate_company_code("ABC Pvt. Ltd."), "abc");
        assert_eq!(generate_company_code("Shree Tirupati Balajee Agro IPO"), "shree-tirupati-balajee-agro");
        assert_eq!(generate_company_code("Kalpa Engineering NSE SME"), "kalpa-engineering");
        assert_eq!(generate_company_code("  Mrs. Bectors Food Specialities Limited "), "mrs-bectors-food-specialities");
        assert_eq!(generate_company_code(""), "");
        assert_eq!(generate_company_code("IPO"), "ipo");
    }

    #[test]
    fn normalize_text_collapses_and_drops_currency() {
        assert_eq!(normalize_text("  ₹ 1,200   per\n share "), "1,200 per share");
        assert_eq!(normalize_text("Rs. 500 Cr"), "500 Cr");
        assert_eq!(normalize_text("Mrs. Bectors"), "Mrs. Bectors");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn collapse_whitespace_keeps_glyphs() {
        assert_eq!(collapse_whitespace("  ₹ 1,200   per\n share "), "₹ 1,200 per share");
        assert_eq!(collapse_whitespace("Rs. 500 Cr"), "Rs. 500 Cr");
    }

    #[test]
    fn numbers_are_signed_and_grouping_aware() {
        assert_eq!(parse_number("₹1,23,456.50"), Some(123456.5));
        assert_eq!(parse_number("Rs. -12"), Some(-12.0));
        assert_eq!(parse_number("\u{2212}4.5"), Some(-4.5));
        assert_eq!(parse_number("TBA"), None);
        assert_eq!(parse_number("no digits"), None);
        assert_eq!(extract_numeric("no digits"), 0.0);
        assert_eq!(extract_numeric("₹0"), 0.0);
        assert_eq!(parse_number("₹0"), Some(0.0));
    }

    #[test]
    fn gmp_cell_splits_value_and_percent() {
        assert_eq!(parse_gmp_text("₹25 (30.86%)"), (Some(25.0), Some(30.86)));
        assert_eq!(parse_gmp_text("₹-3 (-2.5%)"), (Some(-3.0), Some(-2.5)));
        assert_eq!(parse_gmp_text("₹0 (0.00%)"), (Some(0.0), Some(0.0)));
        assert_eq!(parse_gmp_text("₹12"), (Some(12.0), None));
        assert_eq!(parse_gmp_text("--"), (None, None));
    }

    #[test]
    fn percentages_keep_sign() {
        assert_eq!(extract_signed_percentage("+12.5%"), Some(12.5));
        assert_eq!(extract_signed_percentage("(-3.25%)"), Some(-3.25));
        assert_eq!(extract_signed_percentage("-7"), Some(-7.0));
        assert_eq!(extract_signed_percentage("N/A"), None);
        assert_eq!(extract_signed_percentage("awaited"), None);
    }

    #[test]
    fn placeholders_are_recognised() {
        for p in ["TBA", " n/a ", "NA", "--", "-", "", "Nil", "NULL", "Pending", "Awaited"] {
            assert!(is_not_available(p), "{p:?}");
        }
        assert!(!is_not_available("0"));
        assert!(!is_not_available("Open"));
    }

    #[test]
    fn price_band_variants() {
        assert_eq!(parse_price_band("₹95 to ₹100 per share"), (Some(95.0), Some(100.0)));
        assert_eq!(parse_price_band("₹76-81"), (Some(76.0), Some(81.0)));
        assert_eq!(parse_price_band("₹1,250"), (Some(1250.0), Some(1250.0)));
        assert_eq!(parse_price_band("TBA"), (None, None));
    }

    #[test]
    fn subscription_rating_and_quantity() {
        assert_eq!(parse_subscription("12.5x"), Some(12.5));
        assert_eq!(parse_subscription("3.02 times"), Some(3.02));
        assert_eq!(parse_subscription("-"), None);
        assert_eq!(parse_rating("🔥🔥🔥"), Some(3));
        assert_eq!(parse_rating("🔥🔥🔥🔥🔥🔥"), Some(5));
        assert_eq!(parse_rating("4/5"), Some(4));
        assert_eq!(parse_rating("9"), Some(5));
        assert_eq!(parse_rating("--"), None);
        assert_eq!(parse_quantity("148 Shares"), Some(148));
        assert_eq!(parse_quantity("-1"), None);
    }

    #[test]
    fn date_layouts() {
        let expected = d(2025, 1, 7);
        for raw in [
            "2025-01-07",
            "07-01-2025",
            "07/01/2025",
            "07.01.2025",
            "2025/01/07",
            "Jan 7, 2025",
            "January 7, 2025",
            "Jan 07 2025",
            "7 Jan 2025",
            "7 January 2025",
            "7th Jan 2025",
            "07-Jan-2025",
            "Tue, Jan 7, 2025",
            "Tuesday, January 7, 2025",
            "Tue, 7 Jan 2025",
            "2025-01-07T09:15:00+05:30",
            "2025-01-07T00:00:00.000Z",
            "2025-01-07 10:00:00",
        ] {
            assert_eq!(parse_date(raw), Some(expected), "{raw}");
        }
        assert_eq!(parse_date("TBA"), None);
        assert_eq!(parse_date("next week"), None);
        assert_eq!(parse_date("31-02-2025"), None);
    }

    proptest! {
        #[test]
        fn company_code_is_idempotent(name in any::<String>()) {
            let once = generate_company_code(&name);
            prop_assert_eq!(generate_company_code(&once), once);
        }

        #[test]
        fn normalize_text_is_stable(text in any::<String>()) {
            let once = normalize_text(&text);
            prop_assert_eq!(normalize_text(&once), once);
        }

        #[test]
        fn company_code_ignores_call_order(a in "[A-Za-z .]{0,24}", b in "[A-Za-z .]{0,24}") {
            let first = generate_company_code(&a);
            let _ = generate_company_code(&b);
            prop_assert_eq!(generate_company_code(&a), first);
        }

        #[test]
        fn date_parsing_never_panics(raw in any::<String>()) {
            let _ = parse_date(&raw);
        }
    }
}
