//! Triage stage: a cheap meaningfulness gate that also proposes links.

use serde_json::json;
use tracing::{info, warn};

use procwatch_llm::{
    ChatMessage, CompletionOptions, LlmClient, LlmContent, check_budget, prompts, record_usage,
};
use procwatch_shared::{
    ChangeEvent, PipelineSettings, PipelineStatus, ProcwatchError, Result, TriageResult, clip,
};
use procwatch_storage::Session;

/// Triage reads at most this much change content.
const MAX_DIFF_CHARS: usize = 4000;

/// Run triage for an event. Returns `None` when the daily budget is
/// exhausted; on success the verdict is persisted and the event advances to
/// `triaged`. Links beyond the configured cap are dropped here.
pub async fn triage(
    session: &Session,
    event: &mut ChangeEvent,
    settings: &PipelineSettings,
    llm: &LlmClient,
) -> Result<Option<TriageResult>> {
    if !check_budget(session, settings.daily_budget_usd).await? {
        warn!(event_id = event.id, "triage skipped, budget exhausted");
        return Ok(None);
    }

    let content = event
        .diff_text
        .as_deref()
        .or(event.snapshot_text.as_deref())
        .unwrap_or_default();
    let prompt = prompts::triage_prompt(
        &event.watch_url,
        clip(content, MAX_DIFF_CHARS),
        settings.max_links_per_event,
    );

    let completion = llm
        .complete(
            &[
                ChatMessage::system(prompts::SYSTEM_PROMPT),
                ChatMessage::user(prompt),
            ],
            &CompletionOptions {
                model: settings.triage_model.clone(),
                max_tokens: settings.max_tokens_triage,
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
                "triage did not return valid JSON: {}",
                clip(raw, 200)
            )));
        }
    };
    let mut result: TriageResult = serde_json::from_value(value.clone()).map_err(|e| {
        ProcwatchError::InvalidModelOutput(format!("triage response shape invalid: {e}"))
    })?;
    result.discovered_links.truncate(settings.max_links_per_event);

    event.triage_result = Some(
        json!({
            "meaningful": result.meaningful,
            "triage_reasoning": result.triage_reasoning,
        })
        .to_string(),
    );
    event.triage_tokens_used = Some(completion.total_tokens);
    event.discovered_links = if result.discovered_links.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&result.discovered_links).map_err(|e| {
            ProcwatchError::InvalidModelOutput(format!("discovered links not serializable: {e}"))
        })?)
    };
    event.advance(PipelineStatus::Triaged)?;
    session.update_event(event).await?;

    info!(
        event_id = event.id,
        meaningful = result.meaningful,
        links_found = result.discovered_links.len(),
        "triaged"
    );
    Ok(Some(result))
}
