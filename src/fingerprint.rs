//! Entry fingerprinting.
//!
//! A fingerprint is the SHA-256 of a normalized `(link, title, body)`
//! triple. Normalization decodes HTML entities, strips tags, folds case and
//! collapses whitespace so that a re-fetch of the same article hashes to the
//! same key even if the feed reformatted it.

use crate::models::{Fingerprint, RawEntry};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<[^>]*>").expect("static regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Field separator; cannot appear in normalized text.
const SEPARATOR: u8 = 0x1f;

/// Compute the dedup key for an entry. Never fails.
pub fn fingerprint(entry: &RawEntry) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(normalize_link(&entry.link).as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(normalize_text(&entry.title).as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(normalize_text(&entry.body).as_bytes());
    Fingerprint::from_digest(&hasher.finalize())
}

/// Plain-text, lowercased, single-spaced form of possibly-HTML text.
pub fn normalize_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);
    let stripped = RE_TAGS.replace_all(&decoded, " ");
    // Entities may have encoded tags themselves.
    let stripped = html_escape::decode_html_entities(&stripped).replace('\u{a0}', " ");
    let collapsed = RE_WS.replace_all(&stripped, " ");
    collapsed.trim().to_lowercase()
}

/// Links compare case-insensitively and without a trailing slash.
fn normalize_link(link: &str) -> String {
    let trimmed = link.trim();
    trimmed.trim_end_matches('/').to_lowercase()
}

/// Readable plain text of an HTML body, without case folding.
pub fn plain_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);
    let stripped = RE_TAGS.replace_all(&decoded, " ");
    RE_WS.replace_all(&stripped, " ").trim().to_string()
}
