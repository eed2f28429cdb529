//! Enrichment stage: actionable intelligence for qualifying events.

use tracing::{info, warn};

use procwatch_llm::{
    ChatMessage, CompletionOptions, LlmClient, LlmContent, check_budget, prompts, record_usage,
};
use procwatch_shared::{
    ChangeEvent, EnrichmentResult, PipelineSettings, PipelineStatus, ProcwatchError, Result, clip,
};
use procwatch_storage::Session;

/// Enrichment reads the diff and a slice of the snapshot for context.
const MAX_DIFF_CHARS: usize = 6000;
const MAX_SNAPSHOT_CHARS: usize = 3000;

/// Enrich a classified event. Returns `None` when the daily budget is
/// exhausted; on success summary, actions, urgency, dates, and agencies are
/// persisted and the event advances to `enriched`.
pub async fn enrich(
    session: &Session,
    event: &mut ChangeEvent,
    settings: &PipelineSettings,
    llm: &LlmClient,
) -> Result<Option<EnrichmentResult>> {
    if !check_budget(session, settings.daily_budget_usd).await? {
        warn!(event_id = event.id, "enrichment skipped, budget exhausted");
        return Ok(None);
    }

    let prompt = prompts::enrich_prompt(
        &event.watch_url,
        event.classification.as_deref().unwrap_or("UNKNOWN"),
        event.classification_confidence.unwrap_or(0.0),
        clip(event.diff_text.as_deref().unwrap_or_default(), MAX_DIFF_CHARS),
        clip(
            event.snapshot_text.as_deref().unwrap_or_default(),
            MAX_SNAPSHOT_CHARS,
        ),
    );

    let completion = llm
        .complete(
            &[
                ChatMessage::system(prompts::SYSTEM_PROMPT),
                ChatMessage::user(prompt),
            ],
            &CompletionOptions {
                model: settings.enrich_model.clone(),
                max_tokens: settings.max_tokens_enrich,
                temperature: settings.temperature,
                json_output: true,
            },
        )
        .await?;

    record_usage(
        session,
        &completion.model,
        completion.prompt_tokens,
        completion.completion_tokens,
        Some(event.id),
    )
    .await?;

    let value = match &completion.content {
        LlmContent::Parsed(value) => value,
        LlmContent::Unparsed(raw) => {
            return Err(ProcwatchError::InvalidModelOutput(format!(
                "enrichment did not return valid JSON: {}",
                clip(raw, 200)
            )));
        }
    };
    let result: EnrichmentResult = serde_json::from_value(value.clone()).map_err(|e| {
        ProcwatchError::InvalidModelOutput(format!("enrichment response shape invalid: {e}"))
    })?;

    event.summary = Some(result.summary.clone());
    event.recommended_actions = Some(json_list(&result.recommended_actions)?);
    event.urgency = Some(result.urgency.clone());
    event.key_dates = if result.key_dates.is_empty() {
        None
    } else {
        Some(json_list(&result.key_dates)?)
    };
    event.relevant_agencies = if result.relevant_agencies.is_empty() {
        None
    } else {
        Some(json_list(&result.relevant_agencies)?)
    };
    event.enrichment_model = Some(completion.model.clone());
    event.enrichment_tokens_used = Some(completion.total_tokens);
    event.advance(PipelineStatus::Enriched)?;
    session.update_event(event).await?;

    info!(
        event_id = event.id,
        urgency = result.urgency,
        actions_count = result.recommended_actions.len(),
        "enriched"
    );
    Ok(Some(result))
}

fn json_list(items: &[String]) -> Result<String> {
    serde_json::to_string(items)
        .map_err(|e| ProcwatchError::InvalidModelOutput(format!("list not serializable: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use procwatch_storage::Storage;
    use uuid::Uuid;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_session() -> (Storage, Session) {
        let tmp = std::env::temp_dir().join(format!("pw_enrich_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.expect("open test db");
        let session = storage.session().expect("session");
        (storage, session)
    }

    fn test_settings() -> PipelineSettings {
        PipelineSettings::from(&procwatch_shared::AppConfig::default())
    }

    fn llm_response(content: &str) -> serde_json::Value {
        serde_json::json!({
            "model": "anthropic/claude-sonnet-4",
            "choices": [{"message": {"content": content}}],
            "usage": {"prompt_tokens": 1500, "completion_tokens": 400, "total_tokens": 1900}
        })
    }

    async fn classified_event(session: &Session) -> ChangeEvent {
        let mut event = session
            .create_event("w-1", "https://agency.gov/bids")
            .await
            .unwrap();
        event.diff_text = Some("+ RFP 2026-14 now open".into());
        event.snapshot_text = Some("Full page body".into());
        event.classification = Some("RFP".into());
        event.classification_confidence = Some(0.92);
        event.pipeline_status = PipelineStatus::Classified;
        event
    }

    #[tokio::test]
    async fn enrich_persists_intelligence_and_advances() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("classified as RFP"))
            .respond_with(ResponseTemplate::new(200).set_body_json(llm_response(
                r#"{"summary": "USDA posted RFP 2026-14 for rural broadband.",
                    "recommended_actions": ["Read the full solicitation", "Draft questions"],
                    "urgency": "HIGH",
                    "key_dates": ["Proposals due April 1, 2026"],
                    "relevant_agencies": ["USDA Rural Development"]}"#,
            )))
            .mount(&server)
            .await;

        let (_storage, session) = test_session().await;
        let llm = LlmClient::new(&server.uri(), "k", "test/model").unwrap();
        let settings = test_settings();
        let mut event = classified_event(&session).await;

        let result = enrich(&session, &mut event, &settings, &llm)
            .await
            .expect("enrich")
            .expect("result");
        assert_eq!(result.urgency, "HIGH");

        let stored = session.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::Enriched);
        assert!(stored.summary.unwrap().contains("rural broadband"));
        assert_eq!(
            stored.recommended_actions.as_deref(),
            Some(r#"["Read the full solicitation","Draft questions"]"#)
        );
        assert_eq!(stored.urgency.as_deref(), Some("HIGH"));
        assert!(stored.key_dates.unwrap().contains("April 1"));
        assert!(stored.relevant_agencies.unwrap().contains("USDA"));
        assert_eq!(stored.enrichment_tokens_used, Some(1900));
    }

    #[tokio::test]
    async fn empty_lists_persist_as_null() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(llm_response(
                r#"{"summary": "Minor update.", "recommended_actions": [], "urgency": "LOW"}"#,
            )))
            .mount(&server)
            .await;

        let (_storage, session) = test_session().await;
        let llm = LlmClient::new(&server.uri(), "k", "test/model").unwrap();
        let settings = test_settings();
        let mut event = classified_event(&session).await;

        enrich(&session, &mut event, &settings, &llm)
            .await
            .unwrap()
            .unwrap();

        let stored = session.get_event(event.id).await.unwrap().unwrap();
        // recommended_actions always persists; the nullable lists do not
        assert_eq!(stored.recommended_actions.as_deref(), Some("[]"));
        assert!(stored.key_dates.is_none());
        assert!(stored.relevant_agencies.is_none());
    }

    #[tokio::test]
    async fn enrich_skips_when_over_budget() {
        let (_storage, session) = test_session().await;
        record_usage(&session, "anthropic/claude-sonnet-4", 2_000_000, 0, None)
            .await
            .unwrap();

        let llm = LlmClient::new("http://127.0.0.1:1", "k", "test/model").unwrap();
        let settings = test_settings();
        let mut event = classified_event(&session).await;

        let result = enrich(&session, &mut event, &settings, &llm).await.unwrap();
        assert!(result.is_none());
        assert_eq!(event.pipeline_status, PipelineStatus::Classified);
    }

    #[tokio::test]
    async fn enrich_fails_hard_on_non_json_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(llm_response("Summary: things changed")),
            )
            .mount(&server)
            .await;

        let (_storage, session) = test_session().await;
        let llm = LlmClient::new(&server.uri(), "k", "test/model").unwrap();
        let settings = test_settings();
        let mut event = classified_event(&session).await;

        let err = enrich(&session, &mut event, &settings, &llm)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not return valid JSON"));
    }
}
