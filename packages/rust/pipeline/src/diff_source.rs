//! changedetection.io client producing (diff, snapshot) for an event.
//!
//! The service keeps a history of page snapshots per watch. We pull the
//! latest snapshot and, when at least two snapshots exist, compute a line-set
//! diff of the two most recent. Every failure degrades to `None` for that
//! channel so the orchestrator never sees a fetch error.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use procwatch_shared::{ProcwatchError, Result};

/// The change-detection instance is usually local; 30s covers slow history reads.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the changedetection.io watch-history API.
pub struct DiffSource {
    http: Client,
    base_url: String,
    api_key: String,
}

impl DiffSource {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| ProcwatchError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Fetch the latest snapshot and a diff for a watch. Either channel may
    /// come back `None`; failures are logged, never raised.
    pub async fn fetch(&self, watch_uuid: &str) -> (Option<String>, Option<String>) {
        let snapshot_text = self
            .get_text(&format!(
                "{}/api/v1/watch/{watch_uuid}/history/latest",
                self.base_url
            ))
            .await;
        if snapshot_text.is_none() {
            warn!(watch_uuid, "latest snapshot fetch failed");
        }

        let diff_text = self.fetch_diff(watch_uuid, snapshot_text.as_deref()).await;
        (diff_text, snapshot_text)
    }

    /// Diff the two most recent history entries; with exactly one entry the
    /// snapshot itself is the diff (first sighting of the page).
    async fn fetch_diff(&self, watch_uuid: &str, snapshot_text: Option<&str>) -> Option<String> {
        let history_url = format!("{}/api/v1/watch/{watch_uuid}/history", self.base_url);
        let body = self.get_text(&history_url).await?;

        // Timestamp keys sort ascending as strings
        let history: BTreeMap<String, serde_json::Value> = match serde_json::from_str(&body) {
            Ok(map) => map,
            Err(e) => {
                warn!(watch_uuid, error = %e, "history response was not a JSON object");
                return None;
            }
        };

        let timestamps: Vec<&String> = history.keys().collect();
        match timestamps.len() {
            0 => None,
            1 => snapshot_text.map(str::to_string),
            n => {
                let prev = self
                    .get_text(&format!("{history_url}/{}", timestamps[n - 2]))
                    .await?;
                let curr = self
                    .get_text(&format!("{history_url}/{}", timestamps[n - 1]))
                    .await?;
                Some(compute_diff(&prev, &curr))
            }
        }
    }

    async fn get_text(&self, url: &str) -> Option<String> {
        let response = match self
            .http
            .get(url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(url, error = %e, "change-detection request failed");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(url, %status, "change-detection request returned non-success");
            return None;
        }

        match response.text().await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(url, error = %e, "change-detection body read failed");
                None
            }
        }
    }
}

/// Line-set diff: lines in `new` but not `old` prefixed `"+ "` in encounter
/// order, then lines in `old` but not `new` prefixed `"- "` sorted. Empty
/// string when nothing changed.
fn compute_diff(old: &str, new: &str) -> String {
    let old_lines: HashSet<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let new_set: HashSet<&str> = new_lines.iter().copied().collect();

    let mut parts = Vec::new();
    for line in &new_lines {
        if !old_lines.contains(line) {
            parts.push(format!("+ {line}"));
        }
    }

    let mut removed: Vec<&&str> = old_lines
        .iter()
        .filter(|line| !new_set.contains(**line))
        .collect();
    removed.sort();
    for line in removed {
        parts.push(format!("- {line}"));
    }

    debug!(added_or_removed = parts.len(), "computed line-set diff");
    parts.join("\n")
}
