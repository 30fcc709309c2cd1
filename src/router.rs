//! Content-event to invalidation-pattern routing.
//!
//! Each rule maps an event type to pattern templates. Templates may
//! embed `{field}` placeholders resolved from the event's `data` object;
//! a template whose placeholder cannot be resolved is skipped rather
//! than widened.

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::webhook::WebhookPayload;

/// One event-to-patterns mapping.
#[derive(Debug, Clone)]
pub struct InvalidationRule {
    pub event_type: String,
    pub patterns: Vec<String>,
}

impl InvalidationRule {
    pub fn new(event_type: impl Into<String>, patterns: &[&str]) -> Self {
        Self {
            event_type: event_type.into(),
            patterns: patterns.iter().map(|pattern| pattern.to_string()).collect(),
        }
    }
}

/// Result of applying an event's invalidation patterns.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationOutcome {
    pub patterns: Vec<String>,
    pub removed: u64,
}

/// Routes content events to the cache patterns they invalidate.
pub struct InvalidationRouter {
    rules: Vec<InvalidationRule>,
}

impl InvalidationRouter {
    pub fn new(rules: Vec<InvalidationRule>) -> Self {
        Self { rules }
    }

    /// The standard rule set for the content API.
    ///
    /// Post events touch the post itself, every listing, and the
    /// sitemap. Category events touch the category list and listings
    /// (listings embed category names). Bulk updates flush everything.
    pub fn with_default_rules() -> Self {
        let post_patterns: &[&str] = &["post:{slug}", "posts:*", "sitemap:*"];
        let category_patterns: &[&str] = &["categories:*", "posts:*"];
        Self::new(vec![
            InvalidationRule::new("post.created", post_patterns),
            InvalidationRule::new("post.updated", post_patterns),
            InvalidationRule::new("post.deleted", post_patterns),
            InvalidationRule::new("category.created", category_patterns),
            InvalidationRule::new("category.updated", category_patterns),
            InvalidationRule::new("category.deleted", category_patterns),
            InvalidationRule::new("bulk.update", &["*"]),
        ])
    }

    pub fn add_rule(&mut self, rule: InvalidationRule) {
        self.rules.push(rule);
    }

    /// Patterns to invalidate for an event, placeholders resolved and
    /// duplicates removed. Unknown event types resolve to nothing.
    pub fn patterns_for(&self, payload: &WebhookPayload) -> Vec<String> {
        let matching: Vec<&InvalidationRule> = self
            .rules
            .iter()
            .filter(|rule| rule.event_type == payload.event_type)
            .collect();

        if matching.is_empty() {
            warn!(event = %payload.event_type, "unknown webhook event type, nothing invalidated");
            return Vec::new();
        }

        let mut patterns = Vec::new();
        for rule in matching {
            for template in &rule.patterns {
                match expand(template, &payload.data) {
                    Some(pattern) => {
                        if !patterns.contains(&pattern) {
                            patterns.push(pattern);
                        }
                    }
                    None => {
                        warn!(
                            event = %payload.event_type,
                            template,
                            "placeholder unresolved, skipping pattern"
                        );
                    }
                }
            }
        }
        patterns
    }
}

/// Resolve `{field}` placeholders against the event data. `None` when a
/// field is missing or not a string/number.
fn expand(template: &str, data: &Value) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}')?;
        let field = &after[..end];
        match data.get(field)? {
            Value::String(value) => out.push_str(value),
            Value::Number(value) => out.push_str(&value.to_string()),
            _ => return None,
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}
