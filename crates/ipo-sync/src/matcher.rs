//! Pairs GMP snapshots with canonical IPO records.

use std::cmp::{Ordering, Reverse};

use ipo_core::{GmpSnapshot, Ipo};
use serde::Serialize;
use strsim::jaro_winkler;

const FUZZY_SUFFIXES: &[&str] = &[" ltd.", " limited", " ipo", " bse sme", " nse sme", " inc."];

/// Match rules, strongest first. The discriminant is the cascade rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    StockId = 1,
    CompanyCode = 2,
    ExactName = 3,
    FuzzyContainment = 4,
    TokenPrefix = 5,
}

impl MatchRule {
    pub fn rank(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GmpMatch {
    pub snapshot: GmpSnapshot,
    pub rule: MatchRule,
    /// Jaro-Winkler similarity of the display names; diagnostic only.
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedIpo {
    pub ipo: Ipo,
    pub gmp: Option<GmpMatch>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn fuzzy_key(name: &str) -> String {
    let mut current = name.trim().to_lowercase();
    loop {
        let before = current.len();
        for suffix in FUZZY_SUFFIXES {
            if let Some(stripped) = current.strip_suffix(suffix) {
                current = stripped.trim_end().to_string();
            }
        }
        if current.len() == before {
            return current;
        }
    }
}

fn first_two_tokens(name: &str) -> Option<(String, String)> {
    let mut tokens = name.split_whitespace().map(str::to_lowercase);
    Some((tokens.next()?, tokens.next()?))
}

/// Strongest rule under which `ipo` and `gmp` describe the same offering.
pub fn match_rule(ipo: &Ipo, gmp: &GmpSnapshot) -> Option<MatchRule> {
    if let (Some(a), Some(b)) = (non_empty(ipo.stock_id.as_deref()), non_empty(gmp.stock_id.as_deref())) {
        if a == b {
            return Some(MatchRule::StockId);
        }
    }
    if let (Some(a), Some(b)) = (non_empty(Some(ipo.company_code.as_str())), non_empty(Some(gmp.company_code.as_str()))) {
        if a == b {
            return Some(MatchRule::CompanyCode);
        }
    }
    let ipo_name = ipo.name.trim();
    let gmp_name = gmp.ipo_name.trim();
    if !ipo_name.is_empty() && ipo_name.to_lowercase() == gmp_name.to_lowercase() {
        return Some(MatchRule::ExactName);
    }
    let (a, b) = (fuzzy_key(ipo_name), fuzzy_key(gmp_name));
    if !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a)) {
        return Some(MatchRule::FuzzyContainment);
    }
    match (first_two_tokens(ipo_name), first_two_tokens(gmp_name)) {
        (Some(x), Some(y)) if x == y => Some(MatchRule::TokenPrefix),
        _ => None,
    }
}

/// Rule first, then the freshest snapshot; name, source and id make the order total.
fn candidate_order(a: &(MatchRule, &GmpSnapshot), b: &(MatchRule, &GmpSnapshot)) -> Ordering {
    let key = |(rule, gmp): &(MatchRule, &GmpSnapshot)| {
        (*rule, Reverse(gmp.last_updated), gmp.ipo_name.clone(), gmp.data_source.clone(), gmp.id)
    };
    key(a).cmp(&key(b))
}

pub fn best_match(ipo: &Ipo, gmps: &[GmpSnapshot]) -> Option<GmpMatch> {
    gmps.iter()
        .filter_map(|gmp| match_rule(ipo, gmp).map(|rule| (rule, gmp)))
        .min_by(candidate_order)
        .map(|(rule, gmp)| GmpMatch {
            similarity: jaro_winkler(&ipo.name.to_lowercase(), &gmp.ipo_name.to_lowercase()),
            snapshot: gmp.clone(),
            rule,
        })
}

/// Every IPO, in input order, with its best GMP snapshot when one matches.
pub fn match_gmp_to_ipo(ipos: &[Ipo], gmps: &[GmpSnapshot]) -> Vec<MatchedIpo> {
    ipos.iter()
        .map(|ipo| MatchedIpo {
            ipo: ipo.clone(),
            gmp: best_match(ipo, gmps),
        })
        .collect()
}

/// Only IPOs that have a matching GMP snapshot.
pub fn match_gmp_to_ipo_inner(ipos: &[Ipo], gmps: &[GmpSnapshot]) -> Vec<MatchedIpo> {
    match_gmp_to_ipo(ipos, gmps)
        .into_iter()
        .filter(|m| m.gmp.is_some())
        .collect()
}
