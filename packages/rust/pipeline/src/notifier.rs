//! Slack Block Kit notifier for qualifying events.

use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use procwatch_shared::{ChangeEvent, ProcwatchError, Result, clip};

/// Slack webhooks answer fast or not at all.
const POST_TIMEOUT: Duration = Duration::from_secs(15);

/// Display cap for the source link label.
const MAX_LABEL_CHARS: usize = 80;

/// Posts intelligence cards to a Slack incoming webhook.
pub struct SlackNotifier {
    http: Client,
    webhook_url: String,
}

impl SlackNotifier {
    /// `webhook_url` may be empty, which disables delivery with a warning
    /// per send.
    pub fn new(webhook_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(POST_TIMEOUT)
            .build()
            .map_err(|e| ProcwatchError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            webhook_url: webhook_url.to_string(),
        })
    }

    /// Post a card for `event`. Returns the delivery receipt (Slack answers
    /// `ok`) on HTTP 200, `None` otherwise. Never raises.
    pub async fn send(&self, event: &ChangeEvent) -> Option<String> {
        if self.webhook_url.is_empty() {
            warn!(event_id = event.id, "slack webhook not configured");
            return None;
        }

        let payload = json!({
            "text": fallback_text(event),
            "blocks": build_blocks(event),
        });

        let response = match self.http.post(&self.webhook_url).json(&payload).send().await {
            Ok(r) => r,
            Err(e) => {
                error!(event_id = event.id, error = %e, "slack post failed");
                return None;
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::OK {
            info!(event_id = event.id, "slack card delivered");
            Some(body)
        } else {
            error!(
                event_id = event.id,
                %status,
                body = clip(&body, 200),
                "slack rejected the card"
            );
            None
        }
    }
}

/// Plain-text fallback shown in notification previews.
fn fallback_text(event: &ChangeEvent) -> String {
    let classification = event.classification.as_deref().unwrap_or("UNKNOWN");
    let urgency = event.urgency.as_deref().unwrap_or("MEDIUM");
    let body = event
        .summary
        .as_deref()
        .unwrap_or(event.watch_url.as_str());
    format!("{classification} [{urgency}]: {body}")
}

fn urgency_emoji(urgency: &str) -> &'static str {
    match urgency {
        "CRITICAL" => ":rotating_light:",
        "HIGH" => ":warning:",
        "LOW" => ":white_circle:",
        _ => ":large_blue_circle:",
    }
}

fn section(text: String) -> Value {
    json!({"type": "section", "text": {"type": "mrkdwn", "text": text}})
}

/// Build the Block Kit card for an event.
pub fn build_blocks(event: &ChangeEvent) -> Vec<Value> {
    let classification = event.classification.as_deref().unwrap_or("UNKNOWN");
    let urgency = event.urgency.as_deref().unwrap_or("MEDIUM");

    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": format!("{} {classification} - {urgency} Urgency", urgency_emoji(urgency)),
            },
        }),
        section(format!(
            "*Source:* <{}|{}>",
            event.watch_url,
            truncate_label(&event.watch_url)
        )),
    ];

    if let Some(summary) = &event.summary {
        blocks.push(section(summary.clone()));
    }

    if let Some(actions) = parse_string_list(event.recommended_actions.as_deref()) {
        let steps: Vec<String> = actions
            .iter()
            .enumerate()
            .map(|(i, action)| format!("{}. {action}", i + 1))
            .collect();
        blocks.push(section(format!("*Next Steps:*\n{}", steps.join("\n"))));
    }

    if let Some(dates) = parse_string_list(event.key_dates.as_deref()) {
        let lines: Vec<String> = dates.iter().map(|d| format!("• {d}")).collect();
        blocks.push(section(format!(
            ":calendar: *Key Dates:*\n{}",
            lines.join("\n")
        )));
    }

    if let Some(agencies) = parse_string_list(event.relevant_agencies.as_deref()) {
        blocks.push(section(format!(
            ":office: *Agencies:* {}",
            agencies.join(", ")
        )));
    }

    let mut context: Vec<Value> = Vec::new();
    if let Some(parent_id) = event.parent_event_id {
        context.push(json!({"type": "mrkdwn", "text": format!("Discovered via Event #{parent_id}")}));
    }
    if let Some(confidence) = event.classification_confidence {
        context.push(json!({
            "type": "mrkdwn",
            "text": format!("Confidence: {:.0}%", confidence * 100.0),
        }));
    }
    if let Some(model) = &event.classification_model {
        context.push(json!({"type": "mrkdwn", "text": format!("Model: {model}")}));
    }
    context.push(json!({"type": "mrkdwn", "text": format!("Event #{}", event.id)}));
    blocks.push(json!({"type": "context", "elements": context}));

    blocks
}

/// Parse a persisted JSON string array, treating absence, parse failure, and
/// emptiness alike.
fn parse_string_list(raw: Option<&str>) -> Option<Vec<String>> {
    let items: Vec<String> = serde_json::from_str(raw?).ok()?;
    if items.is_empty() { None } else { Some(items) }
}

fn truncate_label(url: &str) -> String {
    if url.chars().count() <= MAX_LABEL_CHARS {
        url.to_string()
    } else {
        format!("{}...", clip(url, MAX_LABEL_CHARS - 3))
    }
}
