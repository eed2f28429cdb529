//! Pipeline orchestrator: drives one change event through the stages.
//!
//! The orchestrator owns fetch and terminal status decisions; each LLM stage
//! advances the event to its own success status as part of persisting its
//! outputs. Child events created from discovered links re-enter through
//! [`Pipeline::run`] but skip triage, which bounds link-following to one
//! level.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use procwatch_crawler::PageFetcher;
use procwatch_llm::LlmClient;
use procwatch_shared::{ChangeEvent, PipelineSettings, PipelineStatus, Result, TriageResult, clip};
use procwatch_storage::{Session, Storage};

use crate::diff_source::DiffSource;
use crate::notifier::SlackNotifier;
use crate::{classify, enrich, filter, triage};

/// Shared pipeline host. One instance serves all events; each run acquires
/// its own storage session.
pub struct Pipeline {
    storage: Arc<Storage>,
    settings: Arc<PipelineSettings>,
    llm: LlmClient,
    diff_source: DiffSource,
    fetcher: PageFetcher,
    notifier: SlackNotifier,
}

impl Pipeline {
    pub fn new(storage: Arc<Storage>, settings: Arc<PipelineSettings>) -> Result<Self> {
        let llm = LlmClient::new(
            &settings.openrouter_base_url,
            &settings.openrouter_api_key,
            &settings.default_model,
        )?;
        let diff_source = DiffSource::new(&settings.cdio_base_url, &settings.cdio_api_key)?;
        let fetcher = PageFetcher::new()?;
        let notifier = SlackNotifier::new(&settings.slack_webhook_url)?;

        Ok(Self {
            storage,
            settings,
            llm,
            diff_source,
            fetcher,
            notifier,
        })
    }

    /// Run the pipeline for an event. Never returns an error: any failure
    /// escaping the stages lands on the event as a terminal `error` status.
    #[instrument(skip_all, fields(event_id = event_id))]
    pub async fn run(&self, event_id: i64) {
        let session = match self.storage.session() {
            Ok(s) => s,
            Err(e) => {
                error!(event_id, error = %e, "could not acquire storage session");
                return;
            }
        };

        let mut event = match session.get_event(event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                error!(event_id, "event not found");
                return;
            }
            Err(e) => {
                error!(event_id, error = %e, "event load failed");
                return;
            }
        };

        if let Err(e) = self.execute(&session, &mut event).await {
            error!(event_id, error = %e, "pipeline run failed");
            // Safety net: write the terminal directly, whatever state the
            // event was left in.
            event.pipeline_status = PipelineStatus::Error;
            event.error_message = Some(clip(&e.to_string(), 500).to_string());
            if let Err(e) = session.update_event(&event).await {
                error!(event_id, error = %e, "could not persist error status");
            }
        }
    }

    /// Type-erased recursion point for child runs.
    fn run_boxed(&self, event_id: i64) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.run(event_id))
    }

    async fn execute(&self, session: &Session, event: &mut ChangeEvent) -> Result<()> {
        let settings = self.settings.as_ref();
        let is_child = event.is_child();

        // Fetch the change content (children arrive already fetched)
        if event.pipeline_status == PipelineStatus::Received {
            info!(event_id = event.id, "fetching change content");
            let (diff_text, snapshot_text) = self.diff_source.fetch(&event.watch_uuid).await;
            event.diff_text = diff_text;
            event.snapshot_text = snapshot_text;
            event.advance(PipelineStatus::Fetched)?;
            session.update_event(event).await?;
        }

        if filter::is_diff_too_small(event.diff_text.as_deref(), settings.min_diff_length)
            && event.snapshot_text.is_none()
        {
            info!(event_id = event.id, "filtered: diff too small");
            event.advance(PipelineStatus::FilteredOut)?;
            event.error_message = Some("Diff too small".into());
            session.update_event(event).await?;
            return Ok(());
        }

        // Triage gates parents only; children already passed discovery
        let mut triage_verdict: Option<TriageResult> = None;
        if !is_child {
            info!(event_id = event.id, "triaging");
            let Some(verdict) = triage::triage(session, event, settings, &self.llm).await? else {
                event.advance(PipelineStatus::Error)?;
                event.error_message = Some("Triage failed or budget exceeded".into());
                session.update_event(event).await?;
                return Ok(());
            };

            if !verdict.meaningful {
                info!(
                    event_id = event.id,
                    reasoning = verdict.triage_reasoning,
                    "filtered by triage"
                );
                event.advance(PipelineStatus::FilteredOut)?;
                event.error_message = Some(format!("Triage: {}", verdict.triage_reasoning));
                session.update_event(event).await?;
                // Discovered links survive parent filtering
                self.process_discovered_links(session, event, &verdict).await;
                return Ok(());
            }
            triage_verdict = Some(verdict);
        }

        info!(event_id = event.id, "classifying");
        let Some(classification) = classify::classify(session, event, settings, &self.llm).await?
        else {
            event.advance(PipelineStatus::Error)?;
            event.error_message = Some("Classification failed or budget exceeded".into());
            session.update_event(event).await?;
            return Ok(());
        };

        if !filter::label_allowed(
            &classification.classification,
            &settings.enrich_classifications,
        ) {
            info!(
                event_id = event.id,
                classification = classification.classification,
                "filtered: not actionable"
            );
            event.advance(PipelineStatus::FilteredOut)?;
            session.update_event(event).await?;
            return Ok(());
        }

        info!(event_id = event.id, "enriching");
        if enrich::enrich(session, event, settings, &self.llm).await?.is_none() {
            event.advance(PipelineStatus::Error)?;
            event.error_message = Some("Enrichment failed or budget exceeded".into());
            session.update_event(event).await?;
            return Ok(());
        }

        if filter::label_allowed(
            &classification.classification,
            &settings.notify_classifications,
        ) {
            info!(event_id = event.id, "notifying");
            match self.notifier.send(event).await {
                Some(receipt) => {
                    event.slack_message_ts = Some(receipt);
                    event.advance(PipelineStatus::Notified)?;
                }
                None => {
                    event.advance(PipelineStatus::Error)?;
                    event.error_message = Some("Slack notification failed".into());
                }
            }
            session.update_event(event).await?;
        }
        // Otherwise the event rests at `enriched`, already persisted

        if let Some(verdict) = &triage_verdict {
            self.process_discovered_links(session, event, verdict).await;
        }

        info!(
            event_id = event.id,
            status = %event.pipeline_status,
            "pipeline complete"
        );
        Ok(())
    }

    /// Crawl each discovered link, create a child event, and run it through
    /// the pipeline. Per-link failures never abort siblings or the parent;
    /// the parent's status is already persisted when this starts.
    async fn process_discovered_links(
        &self,
        session: &Session,
        parent: &ChangeEvent,
        verdict: &TriageResult,
    ) {
        if !self.settings.link_discovery_enabled || verdict.discovered_links.is_empty() {
            return;
        }

        for link in &verdict.discovered_links {
            info!(
                parent_event_id = parent.id,
                url = link.url,
                reason = link.reason,
                "following discovered link"
            );

            let Some(page_text) = self
                .fetcher
                .fetch_page_text(&link.url, self.settings.max_page_fetch_chars)
                .await
            else {
                info!(url = link.url, "discovered link yielded no content");
                continue;
            };

            let child = match session.create_child_event(parent, &link.url, &page_text).await {
                Ok(child) => child,
                Err(e) => {
                    warn!(
                        parent_event_id = parent.id,
                        url = link.url,
                        error = clip(&e.to_string(), 200),
                        "could not create child event"
                    );
                    continue;
                }
            };

            info!(
                parent_event_id = parent.id,
                child_event_id = child.id,
                "child event created"
            );
            self.run_boxed(child.id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procwatch_shared::AppConfig;
    use uuid::Uuid;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        storage: Arc<Storage>,
        llm: MockServer,
        cdio: MockServer,
        slack: MockServer,
        pages: MockServer,
        settings: PipelineSettings,
    }

    impl Harness {
        async fn new() -> Self {
            let llm = MockServer::start().await;
            let cdio = MockServer::start().await;
            let slack = MockServer::start().await;
            let pages = MockServer::start().await;

            let mut settings = PipelineSettings::from(&AppConfig::default());
            settings.openrouter_base_url = llm.uri();
            settings.openrouter_api_key = "test-key".into();
            settings.cdio_base_url = cdio.uri();
            settings.cdio_api_key = "cdio-key".into();
            settings.slack_webhook_url = format!("{}/hook", slack.uri());

            let tmp = std::env::temp_dir().join(format!("pw_orch_{}.db", Uuid::now_v7()));
            let storage = Arc::new(Storage::open(&tmp).await.expect("open test db"));

            Self {
                storage,
                llm,
                cdio,
                slack,
                pages,
                settings,
            }
        }

        fn pipeline(&self) -> Pipeline {
            Pipeline::new(self.storage.clone(), Arc::new(self.settings.clone())).expect("pipeline")
        }

        fn session(&self) -> Session {
            self.storage.session().expect("session")
        }

        /// Stage mocks discriminate on prompt fields unique to each stage:
        /// triage asks for `discovered_links`, classification for
        /// `key_signals`, enrichment for `recommended_actions`.
        async fn mock_triage(&self, content: serde_json::Value) {
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .and(body_string_contains("discovered_links"))
                .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(&content)))
                .mount(&self.llm)
                .await;
        }

        async fn mock_classify(&self, content: serde_json::Value) {
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .and(body_string_contains("key_signals"))
                .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(&content)))
                .mount(&self.llm)
                .await;
        }

        async fn mock_enrich(&self, content: serde_json::Value) {
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .and(body_string_contains("recommended_actions"))
                .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(&content)))
                .mount(&self.llm)
                .await;
        }

        async fn mock_slack_ok(&self) {
            Mock::given(method("POST"))
                .and(path("/hook"))
                .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
                .mount(&self.slack)
                .await;
        }

        /// Seed a watch with two history snapshots so fetch yields a diff.
        async fn mock_cdio(&self, uuid: &str, old: &str, new: &str) {
            Mock::given(method("GET"))
                .and(path(format!("/api/v1/watch/{uuid}/history")))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "100": "a.txt", "200": "b.txt"
                })))
                .mount(&self.cdio)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("/api/v1/watch/{uuid}/history/100")))
                .respond_with(ResponseTemplate::new(200).set_body_string(old))
                .mount(&self.cdio)
                .await;
            for tail in ["200", "latest"] {
                Mock::given(method("GET"))
                    .and(path(format!("/api/v1/watch/{uuid}/history/{tail}")))
                    .respond_with(ResponseTemplate::new(200).set_body_string(new))
                    .mount(&self.cdio)
                    .await;
            }
        }
    }

    fn llm_body(content: &serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "model": "anthropic/claude-sonnet-4",
            "choices": [{"message": {"content": content.to_string()}}],
            "usage": {"prompt_tokens": 500, "completion_tokens": 100, "total_tokens": 600}
        })
    }

    fn meaningful_triage() -> serde_json::Value {
        serde_json::json!({
            "meaningful": true,
            "triage_reasoning": "new solicitation posted",
            "discovered_links": []
        })
    }

    fn rfp_classification() -> serde_json::Value {
        serde_json::json!({
            "classification": "RFP",
            "confidence": 0.9,
            "reasoning": "solicitation number present",
            "key_signals": ["RFP 2026-14"]
        })
    }

    fn enrichment() -> serde_json::Value {
        serde_json::json!({
            "summary": "New RFP for rural broadband.",
            "recommended_actions": ["Read solicitation"],
            "urgency": "HIGH",
            "key_dates": [],
            "relevant_agencies": []
        })
    }

    const PAGE: &str = "+ RFP 2026-14 for rural broadband now open, proposals due April 1 2026";

    #[tokio::test]
    async fn tiny_diff_filters_without_llm_spend() {
        let h = Harness::new().await;
        // Any LLM call would be a failure here
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&h.llm)
            .await;

        let session = h.session();
        let mut event = session.create_event("w-1", "https://a.gov").await.unwrap();
        event.diff_text = Some("+ tiny".into());
        event.pipeline_status = PipelineStatus::Fetched;
        session.update_event(&event).await.unwrap();

        h.pipeline().run(event.id).await;

        let stored = session.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::FilteredOut);
        assert_eq!(stored.error_message.as_deref(), Some("Diff too small"));
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(session.daily_spend(&today).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn full_run_ends_notified() {
        let h = Harness::new().await;
        h.mock_cdio("w-1", "Welcome", &format!("Welcome\n{PAGE}")).await;
        h.mock_triage(meaningful_triage()).await;
        h.mock_classify(rfp_classification()).await;
        h.mock_enrich(enrichment()).await;
        h.mock_slack_ok().await;

        let session = h.session();
        let event = session.create_event("w-1", "https://a.gov/bids").await.unwrap();

        h.pipeline().run(event.id).await;

        let stored = session.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::Notified);
        assert_eq!(stored.diff_text.as_deref(), Some(&format!("+ {PAGE}")[..]));
        assert_eq!(stored.classification.as_deref(), Some("RFP"));
        assert!(stored.summary.unwrap().contains("rural broadband"));
        assert_eq!(stored.slack_message_ts.as_deref(), Some("ok"));
        // Three stages recorded spend
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let spend = session.daily_spend(&today).await.unwrap();
        assert!((spend - 3.0 * 0.003).abs() < 1e-9);
    }

    #[tokio::test]
    async fn non_notify_label_rests_at_enriched() {
        let h = Harness::new().await;
        let mut settings = h.settings.clone();
        settings.notify_classifications = vec![];
        h.mock_triage(meaningful_triage()).await;
        h.mock_classify(rfp_classification()).await;
        h.mock_enrich(enrichment()).await;
        // No Slack mock: any post would fail the run

        let session = h.session();
        let mut event = session.create_event("w-1", "https://a.gov").await.unwrap();
        event.diff_text = Some(PAGE.into());
        event.pipeline_status = PipelineStatus::Fetched;
        session.update_event(&event).await.unwrap();

        let pipeline = Pipeline::new(h.storage.clone(), Arc::new(settings)).unwrap();
        pipeline.run(event.id).await;

        let stored = session.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::Enriched);
        assert!(stored.slack_message_ts.is_none());
    }

    #[tokio::test]
    async fn irrelevant_label_filters_before_enrichment() {
        let h = Harness::new().await;
        h.mock_triage(meaningful_triage()).await;
        h.mock_classify(serde_json::json!({
            "classification": "IRRELEVANT",
            "confidence": 0.8,
            "reasoning": "navigation churn"
        }))
        .await;
        // Enrichment must never run
        Mock::given(method("POST"))
            .and(body_string_contains("recommended_actions"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&h.llm)
            .await;

        let session = h.session();
        let mut event = session.create_event("w-1", "https://a.gov").await.unwrap();
        event.diff_text = Some(PAGE.into());
        event.pipeline_status = PipelineStatus::Fetched;
        session.update_event(&event).await.unwrap();

        h.pipeline().run(event.id).await;

        let stored = session.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::FilteredOut);
        assert_eq!(stored.classification.as_deref(), Some("IRRELEVANT"));
    }

    #[tokio::test]
    async fn child_events_skip_triage() {
        let h = Harness::new().await;
        // A triage call would match this and fail the expectation
        Mock::given(method("POST"))
            .and(body_string_contains("discovered_links"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&h.llm)
            .await;
        h.mock_classify(rfp_classification()).await;
        h.mock_enrich(enrichment()).await;
        h.mock_slack_ok().await;

        let session = h.session();
        let parent = session.create_event("w-1", "https://a.gov").await.unwrap();
        let child = session
            .create_child_event(&parent, "https://a.gov/rfp/14", PAGE)
            .await
            .unwrap();

        h.pipeline().run(child.id).await;

        let stored = session.get_event(child.id).await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::Notified);
        assert!(stored.triage_result.is_none());
    }

    #[tokio::test]
    async fn filtered_parent_still_spawns_children() {
        let h = Harness::new().await;
        let notice_url = format!("{}/notice", h.pages.uri());
        h.mock_triage(serde_json::json!({
            "meaningful": false,
            "triage_reasoning": "only a link list changed",
            "discovered_links": [{"url": notice_url, "reason": "new notice"}]
        }))
        .await;
        Mock::given(method("GET"))
            .and(path("/notice"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string(format!("<html><body><p>{PAGE}</p></body></html>")),
            )
            .mount(&h.pages)
            .await;
        // Child is classified irrelevant and drops out
        h.mock_classify(serde_json::json!({
            "classification": "IRRELEVANT", "confidence": 0.7, "reasoning": "r"
        }))
        .await;

        let session = h.session();
        let mut event = session.create_event("w-1", "https://a.gov").await.unwrap();
        event.diff_text = Some(PAGE.into());
        event.pipeline_status = PipelineStatus::Fetched;
        session.update_event(&event).await.unwrap();

        h.pipeline().run(event.id).await;

        let parent = session.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(parent.pipeline_status, PipelineStatus::FilteredOut);
        assert_eq!(
            parent.error_message.as_deref(),
            Some("Triage: only a link list changed")
        );

        let children = session.children_of(event.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].watch_url, notice_url);
        assert_eq!(children[0].pipeline_status, PipelineStatus::FilteredOut);
    }

    #[tokio::test]
    async fn dead_links_are_skipped_without_children() {
        let h = Harness::new().await;
        let dead_url = format!("{}/gone", h.pages.uri());
        h.mock_triage(serde_json::json!({
            "meaningful": true,
            "triage_reasoning": "r",
            "discovered_links": [{"url": dead_url, "reason": "broken"}]
        }))
        .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&h.pages)
            .await;
        h.mock_classify(rfp_classification()).await;
        h.mock_enrich(enrichment()).await;
        h.mock_slack_ok().await;

        let session = h.session();
        let mut event = session.create_event("w-1", "https://a.gov").await.unwrap();
        event.diff_text = Some(PAGE.into());
        event.pipeline_status = PipelineStatus::Fetched;
        session.update_event(&event).await.unwrap();

        h.pipeline().run(event.id).await;

        let stored = session.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::Notified);
        assert!(session.children_of(event.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_budget_errors_at_triage() {
        let h = Harness::new().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&h.llm)
            .await;

        let session = h.session();
        procwatch_llm::record_usage(&session, "anthropic/claude-sonnet-4", 2_000_000, 0, None)
            .await
            .unwrap();

        let mut event = session.create_event("w-1", "https://a.gov").await.unwrap();
        event.diff_text = Some(PAGE.into());
        event.pipeline_status = PipelineStatus::Fetched;
        session.update_event(&event).await.unwrap();

        h.pipeline().run(event.id).await;

        let stored = session.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::Error);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("Triage failed or budget exceeded")
        );
    }

    #[tokio::test]
    async fn malformed_classification_lands_on_error() {
        let h = Harness::new().await;
        h.mock_triage(meaningful_triage()).await;
        Mock::given(method("POST"))
            .and(body_string_contains("key_signals"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "test/model",
                "choices": [{"message": {"content": "not json at all"}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            })))
            .mount(&h.llm)
            .await;

        let session = h.session();
        let mut event = session.create_event("w-1", "https://a.gov").await.unwrap();
        event.diff_text = Some(PAGE.into());
        event.pipeline_status = PipelineStatus::Fetched;
        session.update_event(&event).await.unwrap();

        h.pipeline().run(event.id).await;

        let stored = session.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::Error);
        assert!(
            stored
                .error_message
                .unwrap()
                .contains("did not return valid JSON")
        );
    }

    #[tokio::test]
    async fn slack_failure_is_a_terminal_error() {
        let h = Harness::new().await;
        h.mock_triage(meaningful_triage()).await;
        h.mock_classify(rfp_classification()).await;
        h.mock_enrich(enrichment()).await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&h.slack)
            .await;

        let session = h.session();
        let mut event = session.create_event("w-1", "https://a.gov").await.unwrap();
        event.diff_text = Some(PAGE.into());
        event.pipeline_status = PipelineStatus::Fetched;
        session.update_event(&event).await.unwrap();

        h.pipeline().run(event.id).await;

        let stored = session.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::Error);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("Slack notification failed")
        );
        // Enrichment outputs were persisted before the delivery attempt
        assert!(stored.summary.is_some());
    }
}
