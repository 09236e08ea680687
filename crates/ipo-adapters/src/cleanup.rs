//! Cleanup of scraped prose (descriptions, "about the company" blocks).

use lazy_static::lazy_static;
use regex::Regex;

pub const DESCRIPTION_MAX_LEN: usize = 2000;
pub const ABOUT_MAX_LEN: usize = 5000;

const MIN_LEN: usize = 10;

lazy_static! {
    static ref TAG: Regex = Regex::new(r"(?s)<[^>]*>").unwrap();
    static ref BOILERPLATE: Regex = Regex::new(
        r"(?i)\b(?:dashboard|ipo list|read more|read less|show more|view more|click here|sign in|log in|subscribe now|download (?:the )?app|back to top)\b"
    )
    .unwrap();
    static ref LEADING_PREFIX: Regex = Regex::new(
        r"(?i)^(?:about us|about the company|about company|about|company details|company overview|company profile|overview|description)\s*[:\-]\s*"
    )
    .unwrap();
}

fn decode_entities(input: &str) -> String {
    input
        .replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn collapse(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn ends_sentence(text: &str) -> bool {
    text.ends_with(['.', '!', '?', '…'])
}

/// Cuts at the last whitespace within `budget` chars. A single word longer
/// than the budget is cut at a char boundary and marked with an ellipsis.
fn truncate_at_word(text: &str, budget: usize) -> String {
    let cut = text.chars().take(budget).collect::<String>();
    match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => cut[..idx]
            .trim_end_matches(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | ':' | '-'))
            .to_string(),
        _ => {
            let mut word = cut.chars().take(budget.saturating_sub(1)).collect::<String>();
            word.push('…');
            word
        }
    }
}

/// Strips markup and site chrome, collapses whitespace, truncates at a word
/// boundary to `max_len` chars and makes sure the text ends a sentence.
/// `None` when fewer than ten characters survive.
pub fn clean_free_text(raw: &str, max_len: usize) -> Option<String> {
    let text = TAG.replace_all(raw, " ");
    let text = decode_entities(&text);
    let text = BOILERPLATE.replace_all(&text, " ");
    let mut text = collapse(&text);

    loop {
        let stripped = LEADING_PREFIX.replace(&text, "").into_owned();
        if stripped == text {
            break;
        }
        text = stripped;
    }
    let mut text = text.trim_matches(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | ':' | '-' | '|')).to_string();

    if text.chars().count() < MIN_LEN {
        return None;
    }
    let limit = if ends_sentence(&text) {
        max_len
    } else {
        max_len.saturating_sub(1)
    };
    if text.chars().count() > limit {
        text = truncate_at_word(&text, max_len.saturating_sub(1));
    }
    if !ends_sentence(&text) {
        text.push('.');
    }
    Some(text)
}
