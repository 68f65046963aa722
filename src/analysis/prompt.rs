//! Analysis requests and the instruction template.

use crate::fingerprint::plain_text;
use crate::models::RawEntry;

/// Content submitted to the reasoning service for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub title: String,
    pub link: String,
    pub published: Option<String>,
    /// Plain-text body, possibly shortened.
    pub body: String,
    pub keywords: Vec<String>,
    /// Set once the body has been cut down after an input-too-large signal.
    pub truncated: bool,
}

impl AnalysisRequest {
    /// Build the first request of a lineage. Bodies longer than
    /// `max_body_chars` are clipped up front.
    pub fn from_entry(entry: &RawEntry, keywords: &[String], max_body_chars: usize) -> Self {
        let body = plain_text(&entry.body);
        Self {
            title: entry.title.trim().to_string(),
            link: entry.link.trim().to_string(),
            published: entry.published.map(|p| p.to_rfc3339()),
            body: clip_chars(&body, max_body_chars),
            keywords: keywords.to_vec(),
            truncated: false,
        }
    }

    /// The request to re-issue after an input-too-large signal: the body
    /// shrinks to at most `budget` chars and never less than halves.
    pub fn truncated(&self, budget: usize) -> Self {
        let current = self.body.chars().count();
        let target = budget.min(current / 2);
        Self {
            body: clip_chars(&self.body, target),
            truncated: true,
            ..self.clone()
        }
    }

    /// System message sent with every attempt.
    pub fn instruction(&self) -> String {
        let stacks = if self.keywords.is_empty() {
            "any widely used software, cloud service or API".to_string()
        } else {
            self.keywords.join(", ")
        };
        INSTRUCTION_TEMPLATE.replace("{stacks}", &stacks)
    }

    /// User message sent with every attempt.
    pub fn user_message(&self) -> String {
        let mut message = format!("Title: {}\nLink: {}\n", self.title, self.link);
        if let Some(ref published) = self.published {
            message.push_str(&format!("Published: {}\n", published));
        }
        if self.truncated {
            message.push_str("Note: content was truncated to fit the input limit.\n");
        }
        message.push_str("Content:\n");
        message.push_str(&self.body);
        message
    }
}

fn clip_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

const INSTRUCTION_TEMPLATE: &str = r#"You review RSS/Atom feed entries for engineering teams.
Relevant tech stacks: {stacks}.

Decide whether the entry announces a breaking change, a deprecation, an ordinary update,
or is not relevant to those stacks. Reply with ONE JSON object and nothing else:

{
  "classification": "breaking_change" | "deprecation" | "update" | "not_relevant",
  "summary": "two or three sentences on what changes and who is affected",
  "deadline": "YYYY-MM-DD" or null,
  "confidence": number between 0 and 1,
  "impact": "short description of the impact",
  "actions": ["concrete step", "..."]
}

Use null for deadline when the entry states no date. Do not invent dates."#;
