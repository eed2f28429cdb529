//! Core domain types for the procwatch pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProcwatchError, Result};

// ---------------------------------------------------------------------------
// PipelineStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a change event. Stored lowercase in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Webhook accepted, nothing fetched yet.
    #[default]
    Received,
    /// Diff and snapshot pulled from the change-detection service.
    Fetched,
    /// Triage verdict recorded.
    Triaged,
    /// Classification recorded.
    Classified,
    /// Enrichment recorded; resting status when notification is not warranted.
    Enriched,
    /// Slack card delivered.
    Notified,
    /// Dropped by a filter; `error_message` carries the reason.
    FilteredOut,
    /// Pipeline failure; `error_message` carries the cause.
    Error,
}

/// Forward-only status transitions. `Fetched -> Classified` exists because
/// child events skip triage.
const VALID_TRANSITIONS: &[(PipelineStatus, &[PipelineStatus])] = &[
    (
        PipelineStatus::Received,
        &[
            PipelineStatus::Fetched,
            PipelineStatus::FilteredOut,
            PipelineStatus::Error,
        ],
    ),
    (
        PipelineStatus::Fetched,
        &[
            PipelineStatus::Triaged,
            PipelineStatus::Classified,
            PipelineStatus::FilteredOut,
            PipelineStatus::Error,
        ],
    ),
    (
        PipelineStatus::Triaged,
        &[
            PipelineStatus::Classified,
            PipelineStatus::FilteredOut,
            PipelineStatus::Error,
        ],
    ),
    (
        PipelineStatus::Classified,
        &[
            PipelineStatus::Enriched,
            PipelineStatus::FilteredOut,
            PipelineStatus::Error,
        ],
    ),
    (
        PipelineStatus::Enriched,
        &[PipelineStatus::Notified, PipelineStatus::Error],
    ),
    (PipelineStatus::Notified, &[]),
    (PipelineStatus::FilteredOut, &[]),
    (PipelineStatus::Error, &[]),
];

impl PipelineStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Fetched => "fetched",
            Self::Triaged => "triaged",
            Self::Classified => "classified",
            Self::Enriched => "enriched",
            Self::Notified => "notified",
            Self::FilteredOut => "filtered_out",
            Self::Error => "error",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(Self::Received),
            "fetched" => Some(Self::Fetched),
            "triaged" => Some(Self::Triaged),
            "classified" => Some(Self::Classified),
            "enriched" => Some(Self::Enriched),
            "notified" => Some(Self::Notified),
            "filtered_out" => Some(Self::FilteredOut),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether `self -> to` is a legal move in the lifecycle.
    pub fn can_transition(&self, to: PipelineStatus) -> bool {
        VALID_TRANSITIONS
            .iter()
            .find(|(from, _)| from == self)
            .map(|(_, allowed)| allowed.contains(&to))
            .unwrap_or(false)
    }

    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Notified | Self::FilteredOut | Self::Error)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Classification / Urgency labels
// ---------------------------------------------------------------------------

/// Canonical classification labels. The raw model string is persisted on the
/// event; decisions parse it into this enum, and a label that parses to no
/// variant never matches an allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    Rfi,
    Rfp,
    Actionable,
    Informational,
    Irrelevant,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rfi => "RFI",
            Self::Rfp => "RFP",
            Self::Actionable => "ACTIONABLE",
            Self::Informational => "INFORMATIONAL",
            Self::Irrelevant => "IRRELEVANT",
        }
    }

    /// Case-insensitive parse of a model- or config-supplied label.
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        [
            Self::Rfi,
            Self::Rfp,
            Self::Actionable,
            Self::Informational,
            Self::Irrelevant,
        ]
        .into_iter()
        .find(|c| c.as_str().eq_ignore_ascii_case(trimmed))
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Urgency labels produced by enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Urgency {
    Critical,
    High,
    Medium,
    Low,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }

    /// Case-insensitive parse of a model-supplied label.
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        [Self::Critical, Self::High, Self::Medium, Self::Low]
            .into_iter()
            .find(|u| u.as_str().eq_ignore_ascii_case(trimmed))
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ChangeEvent
// ---------------------------------------------------------------------------

/// A detected page change moving through the pipeline. One row in
/// `change_events`; list-valued outputs are stored as JSON text.
#[derive(Debug, Clone, Default)]
pub struct ChangeEvent {
    /// Storage-assigned id (0 until inserted).
    pub id: i64,
    /// Watch identifier in the change-detection service.
    pub watch_uuid: String,
    /// Page URL the watch monitors; for child events, the discovered link.
    pub watch_url: String,
    /// UTC timestamp at ingest.
    pub received_at: DateTime<Utc>,
    /// Line-set diff of the change.
    pub diff_text: Option<String>,
    /// Latest full snapshot (for children, the crawled page text).
    pub snapshot_text: Option<String>,
    /// Raw classification label as returned by the model.
    pub classification: Option<String>,
    pub classification_confidence: Option<f64>,
    pub classification_reasoning: Option<String>,
    pub classification_model: Option<String>,
    pub classification_tokens_used: Option<i64>,
    /// Enrichment summary.
    pub summary: Option<String>,
    /// JSON array of recommended action strings.
    pub recommended_actions: Option<String>,
    /// Raw urgency label as returned by the model.
    pub urgency: Option<String>,
    /// JSON array of date strings; null when the model found none.
    pub key_dates: Option<String>,
    /// JSON array of agency names; null when the model found none.
    pub relevant_agencies: Option<String>,
    pub enrichment_model: Option<String>,
    pub enrichment_tokens_used: Option<i64>,
    /// JSON text `{"meaningful": bool, "triage_reasoning": string}`.
    pub triage_result: Option<String>,
    pub triage_tokens_used: Option<i64>,
    /// JSON array of `{"url", "reason"}` objects.
    pub discovered_links: Option<String>,
    /// Set on child events spawned from discovered links.
    pub parent_event_id: Option<i64>,
    pub pipeline_status: PipelineStatus,
    /// Filter reason or failure cause for terminal statuses.
    pub error_message: Option<String>,
    /// Notifier delivery receipt.
    pub slack_message_ts: Option<String>,
}

impl ChangeEvent {
    /// A freshly ingested event, not yet persisted.
    pub fn new(watch_uuid: impl Into<String>, watch_url: impl Into<String>) -> Self {
        Self {
            watch_uuid: watch_uuid.into(),
            watch_url: watch_url.into(),
            received_at: Utc::now(),
            pipeline_status: PipelineStatus::Received,
            ..Default::default()
        }
    }

    /// Whether this event was spawned from a discovered link.
    pub fn is_child(&self) -> bool {
        self.parent_event_id.is_some()
    }

    /// Move to `status`, rejecting moves the lifecycle does not allow.
    /// The orchestrator's catch-all error path writes the field directly.
    pub fn advance(&mut self, status: PipelineStatus) -> Result<()> {
        if !self.pipeline_status.can_transition(status) {
            return Err(ProcwatchError::validation(format!(
                "illegal status transition {} -> {} for event {}",
                self.pipeline_status, status, self.id
            )));
        }
        self.pipeline_status = status;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stage results (deserialized from model JSON)
// ---------------------------------------------------------------------------

/// A related link proposed by triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredLink {
    pub url: String,
    #[serde(default)]
    pub reason: String,
}

/// Triage verdict. `discovered_links` is capped by the orchestrator config
/// and persisted separately from the verdict itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageResult {
    pub meaningful: bool,
    #[serde(default)]
    pub triage_reasoning: String,
    #[serde(default)]
    pub discovered_links: Vec<DiscoveredLink>,
}

/// Classification verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub classification: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub key_signals: Vec<String>,
}

/// Enrichment output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub summary: String,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
    #[serde(default = "default_urgency")]
    pub urgency: String,
    #[serde(default)]
    pub key_dates: Vec<String>,
    #[serde(default)]
    pub relevant_agencies: Vec<String>,
}

fn default_urgency() -> String {
    "MEDIUM".into()
}

// ---------------------------------------------------------------------------
// CostLedgerEntry
// ---------------------------------------------------------------------------

/// One append-only row in the LLM cost ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostLedgerEntry {
    /// Storage-assigned id (0 until inserted).
    pub id: i64,
    /// UTC day `YYYY-MM-DD` the spend counts against.
    pub date: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub estimated_cost_usd: f64,
    /// Event that incurred the spend, when known.
    pub event_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// Clip `text` to at most `max_chars` characters on a char boundary.
pub fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            PipelineStatus::Received,
            PipelineStatus::Fetched,
            PipelineStatus::Triaged,
            PipelineStatus::Classified,
            PipelineStatus::Enriched,
            PipelineStatus::Notified,
            PipelineStatus::FilteredOut,
            PipelineStatus::Error,
        ] {
            assert_eq!(PipelineStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PipelineStatus::parse("bogus"), None);
    }

    #[test]
    fn happy_path_transitions_are_valid() {
        use PipelineStatus::*;
        let chain = [Received, Fetched, Triaged, Classified, Enriched, Notified];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn child_events_may_skip_triage() {
        assert!(PipelineStatus::Fetched.can_transition(PipelineStatus::Classified));
    }

    #[test]
    fn terminal_statuses_accept_nothing() {
        use PipelineStatus::*;
        for terminal in [Notified, FilteredOut, Error] {
            assert!(terminal.is_terminal());
            for to in [Received, Fetched, Triaged, Classified, Enriched, Notified] {
                assert!(!terminal.can_transition(to));
            }
        }
    }

    #[test]
    fn backward_transitions_are_rejected() {
        assert!(!PipelineStatus::Classified.can_transition(PipelineStatus::Fetched));
        assert!(!PipelineStatus::Enriched.can_transition(PipelineStatus::Triaged));
        // Notification requires enrichment first
        assert!(!PipelineStatus::Classified.can_transition(PipelineStatus::Notified));
    }

    #[test]
    fn advance_enforces_lifecycle() {
        let mut event = ChangeEvent::new("watch-1", "https://example.gov/bids");
        event.advance(PipelineStatus::Fetched).expect("received -> fetched");
        assert_eq!(event.pipeline_status, PipelineStatus::Fetched);

        let err = event.advance(PipelineStatus::Notified).unwrap_err();
        assert!(err.to_string().contains("illegal status transition"));
        assert_eq!(event.pipeline_status, PipelineStatus::Fetched);
    }

    #[test]
    fn classification_parse_is_case_insensitive() {
        assert_eq!(Classification::parse("rfp"), Some(Classification::Rfp));
        assert_eq!(Classification::parse(" RFI "), Some(Classification::Rfi));
        assert_eq!(
            Classification::parse("Actionable"),
            Some(Classification::Actionable)
        );
        assert_eq!(Classification::parse("press release"), None);
    }

    #[test]
    fn urgency_parse_is_case_insensitive() {
        assert_eq!(Urgency::parse("critical"), Some(Urgency::Critical));
        assert_eq!(Urgency::parse("LOW"), Some(Urgency::Low));
        assert_eq!(Urgency::parse("whenever"), None);
    }

    #[test]
    fn triage_result_fills_defaults() {
        let parsed: TriageResult =
            serde_json::from_str(r#"{"meaningful": true}"#).expect("deserialize");
        assert!(parsed.meaningful);
        assert_eq!(parsed.triage_reasoning, "");
        assert!(parsed.discovered_links.is_empty());
    }

    #[test]
    fn triage_result_requires_meaningful() {
        let result: std::result::Result<TriageResult, _> =
            serde_json::from_str(r#"{"triage_reasoning": "no verdict"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn enrichment_result_defaults_urgency() {
        let parsed: EnrichmentResult =
            serde_json::from_str(r#"{"summary": "New RFP posted"}"#).expect("deserialize");
        assert_eq!(parsed.urgency, "MEDIUM");
        assert!(parsed.key_dates.is_empty());
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("hello", 10), "hello");
        assert_eq!(clip("hello", 3), "hel");
        // Multibyte: clipping counts chars, not bytes
        assert_eq!(clip("日本語テキスト", 3), "日本語");
        assert_eq!(clip("", 5), "");
    }
}
