//! Feed fetching and keyword matching.
//!
//! Fetches RSS/Atom documents over HTTP, parses them with `feed-rs` and
//! converts every item into a [`RawEntry`].

use crate::models::RawEntry;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::future::join_all;
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP client for feed documents.
pub struct FeedReader {
    client: reqwest::Client,
}

impl FeedReader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("feedwatch/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    /// Fetch and parse one feed.
    pub async fn fetch(&self, url: &str) -> Result<Vec<RawEntry>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch feed {}", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Feed {} returned HTTP {}", url, status);
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read feed body from {}", url))?;

        parse_feed(&bytes, url)
    }

    /// Fetch every feed concurrently. A failing feed is logged and skipped;
    /// entries keep the order of `urls`.
    pub async fn fetch_all(&self, urls: &[String]) -> Vec<RawEntry> {
        let results = join_all(urls.iter().map(|url| self.fetch(url))).await;

        let mut entries = Vec::new();
        for (url, result) in urls.iter().zip(results) {
            match result {
                Ok(mut feed_entries) => {
                    info!(feed = %url, entries = feed_entries.len(), "Fetched feed");
                    entries.append(&mut feed_entries);
                }
                Err(e) => warn!(feed = %url, "Skipping feed: {:#}", e),
            }
        }
        entries
    }
}

/// Parse an RSS/Atom document into entries tagged with `feed_url`.
pub fn parse_feed(bytes: &[u8], feed_url: &str) -> Result<Vec<RawEntry>> {
    let feed = feed_rs::parser::parse(bytes)
        .with_context(|| format!("Failed to parse RSS/Atom feed {}", feed_url))?;

    let entries: Vec<RawEntry> = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))
                .unwrap_or_default();

            let summary = entry.summary.map(|s| s.content);
            let body = entry
                .content
                .and_then(|c| c.body)
                .or(summary)
                .unwrap_or_default();

            let title = entry.title.map(|t| t.content).unwrap_or_default();
            let raw = RawEntry::new(title, link, body).with_feed(feed_url);
            match entry.published.or(entry.updated) {
                Some(dt) => raw.with_published(dt.with_timezone(&Utc)),
                None => raw,
            }
        })
        .collect();

    debug!(feed = feed_url, entries = entries.len(), "Parsed feed");
    Ok(entries)
}

/// Case-insensitive substring match of any keyword against title and body.
/// An empty keyword list matches everything.
pub fn matches_keywords(entry: &RawEntry, keywords: &[String]) -> bool {
    if keywords.iter().all(|k| k.trim().is_empty()) {
        return true;
    }
    let haystack = format!("{} {}", entry.title, entry.body).to_lowercase();
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .any(|k| haystack.contains(&k))
}
