//! Classification stage: assign a procurement-relevance label.

use tracing::{info, warn};

use procwatch_llm::{
    ChatMessage, CompletionOptions, LlmClient, LlmContent, check_budget, prompts, record_usage,
};
use procwatch_shared::{
    ChangeEvent, ClassificationResult, PipelineSettings, PipelineStatus, ProcwatchError, Result,
    clip,
};
use procwatch_storage::Session;

/// Classification reads at most this much change content.
const MAX_DIFF_CHARS: usize = 6000;

/// Classify an event. Returns `None` when the daily budget is exhausted; on
/// success the raw label and its supporting fields are persisted and the
/// event advances to `classified`.
pub async fn classify(
    session: &Session,
    event: &mut ChangeEvent,
    settings: &PipelineSettings,
    llm: &LlmClient,
) -> Result<Option<ClassificationResult>> {
    if !check_budget(session, settings.daily_budget_usd).await? {
        warn!(event_id = event.id, "classification skipped, budget exhausted");
        return Ok(None);
    }

    let content = event
        .diff_text
        .as_deref()
        .or(event.snapshot_text.as_deref())
        .unwrap_or_default();
    let prompt = prompts::classify_prompt(&event.watch_url, clip(content, MAX_DIFF_CHARS));

    let completion = llm
        .complete(
            &[
                ChatMessage::system(prompts::SYSTEM_PROMPT),
                ChatMessage::user(prompt),
            ],
            &CompletionOptions {
                model: settings.classify_model.clone(),
                max_tokens: settings.max_tokens_classify,
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
                "classification did not return valid JSON: {}",
                clip(raw, 200)
            )));
        }
    };
    let result: ClassificationResult = serde_json::from_value(value.clone()).map_err(|e| {
        ProcwatchError::InvalidModelOutput(format!("classification response shape invalid: {e}"))
    })?;

    event.classification = Some(result.classification.clone());
    event.classification_confidence = Some(result.confidence);
    event.classification_reasoning = Some(result.reasoning.clone());
    event.classification_model = Some(completion.model.clone());
    event.classification_tokens_used = Some(completion.total_tokens);
    event.advance(PipelineStatus::Classified)?;
    session.update_event(event).await?;

    info!(
        event_id = event.id,
        classification = result.classification,
        confidence = result.confidence,
        "classified"
    );
    Ok(Some(result))
}
