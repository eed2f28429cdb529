//! Per-model pricing, the daily budget gate, and cost ledger writes.
//!
//! The budget is a soft limit: the gate reads today's spend and then acts,
//! so concurrent runs can overshoot the ceiling by the cost of in-flight
//! calls. The ledger itself stays append-only and consistent.

use chrono::Utc;
use tracing::{info, warn};

use procwatch_shared::{CostLedgerEntry, Result};
use procwatch_storage::Session;

/// USD per million tokens (input, output) for models without a table entry.
const DEFAULT_RATES: (f64, f64) = (3.0, 15.0);

/// Approximate USD per million tokens (input, output) for common models.
const MODEL_RATES: &[(&str, (f64, f64))] = &[
    ("moonshotai/kimi-k2.5", (1.0, 4.0)),
    ("deepseek/deepseek-v3.2", (0.50, 1.40)),
    ("anthropic/claude-sonnet-4", (3.0, 15.0)),
    ("anthropic/claude-3.5-sonnet", (3.0, 15.0)),
    ("anthropic/claude-3-haiku", (0.25, 1.25)),
    ("google/gemini-flash-1.5", (0.075, 0.30)),
    ("openai/gpt-4o-mini", (0.15, 0.60)),
    ("openai/gpt-4o", (2.50, 10.0)),
];

/// Rate pair for a model, falling back to [`DEFAULT_RATES`].
fn rates_for(model: &str) -> (f64, f64) {
    MODEL_RATES
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, rates)| *rates)
        .unwrap_or(DEFAULT_RATES)
}

/// Estimate USD cost for a call, rounded to 6 decimal places.
pub fn estimate_cost(model: &str, prompt_tokens: i64, completion_tokens: i64) -> f64 {
    let (input_rate, output_rate) = rates_for(model);
    let cost =
        (prompt_tokens as f64 * input_rate + completion_tokens as f64 * output_rate) / 1_000_000.0;
    (cost * 1_000_000.0).round() / 1_000_000.0
}

/// Current UTC day, the granularity the ledger accounts at.
fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Whether today's summed spend is strictly below the daily ceiling.
/// Spend equal to the ceiling is NOT under budget.
pub async fn check_budget(session: &Session, daily_budget_usd: f64) -> Result<bool> {
    let spent = session.daily_spend(&today()).await?;
    let under = spent < daily_budget_usd;
    if !under {
        warn!(spent, limit = daily_budget_usd, "daily LLM budget exceeded");
    }
    Ok(under)
}

/// Append a ledger row for a completed call and return the estimated cost.
/// Called once per completed LLM call, before any output validation, so
/// spend is accounted even when the output later fails parsing.
pub async fn record_usage(
    session: &Session,
    model: &str,
    prompt_tokens: i64,
    completion_tokens: i64,
    event_id: Option<i64>,
) -> Result<f64> {
    let cost = estimate_cost(model, prompt_tokens, completion_tokens);
    session
        .record_cost(&CostLedgerEntry {
            id: 0,
            date: today(),
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
            estimated_cost_usd: cost,
            event_id,
            created_at: Utc::now(),
        })
        .await?;
    info!(
        model,
        prompt_tokens, completion_tokens, cost_usd = cost, "recorded LLM usage"
    );
    Ok(cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use procwatch_storage::Storage;
    use uuid::Uuid;

    #[test]
    fn known_model_estimate() {
        // 1000 prompt at $3/M + 500 completion at $15/M
        let cost = estimate_cost("anthropic/claude-sonnet-4", 1000, 500);
        assert_eq!(cost, 0.0105);
    }

    #[test]
    fn cheap_model_estimate() {
        let cost = estimate_cost("google/gemini-flash-1.5", 10_000, 2_000);
        assert_eq!(cost, 0.00135);
    }

    #[test]
    fn unknown_model_falls_back_to_default_rates() {
        let unknown = estimate_cost("somevendor/brand-new-model", 1000, 500);
        assert_eq!(unknown, estimate_cost("anthropic/claude-sonnet-4", 1000, 500));
    }

    #[test]
    fn estimate_is_monotonic_in_tokens() {
        let base = estimate_cost("openai/gpt-4o-mini", 1000, 500);
        assert!(estimate_cost("openai/gpt-4o-mini", 2000, 500) > base);
        assert!(estimate_cost("openai/gpt-4o-mini", 1000, 1000) > base);
        assert_eq!(estimate_cost("openai/gpt-4o-mini", 0, 0), 0.0);
    }

    #[test]
    fn estimate_rounds_to_six_places() {
        let cost = estimate_cost("anthropic/claude-3-haiku", 1, 1);
        // (0.25 + 1.25) / 1M = 0.0000015 rounds to 0.000002
        assert_eq!(cost, 0.000002);
    }

    async fn test_session() -> (Storage, Session) {
        let tmp = std::env::temp_dir().join(format!("pw_cost_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.expect("open test db");
        let session = storage.session().expect("session");
        (storage, session)
    }

    #[tokio::test]
    async fn empty_ledger_is_under_budget() {
        let (_storage, session) = test_session().await;
        assert!(check_budget(&session, 5.0).await.unwrap());
    }

    #[tokio::test]
    async fn record_usage_appends_and_counts_toward_budget() {
        let (_storage, session) = test_session().await;

        // cost_ledger.event_id references change_events(id); create the row
        // the ledger entry points at so the foreign key is satisfied.
        let event = session
            .create_event("watch-cost", "https://agency.gov/rfp")
            .await
            .unwrap();
        let cost = record_usage(&session, "anthropic/claude-sonnet-4", 1000, 500, Some(event.id))
            .await
            .unwrap();
        assert_eq!(cost, 0.0105);

        let spent = session.daily_spend(&today()).await.unwrap();
        assert!((spent - 0.0105).abs() < 1e-9);
        assert!(check_budget(&session, 5.0).await.unwrap());
    }

    #[tokio::test]
    async fn spend_at_ceiling_is_not_under_budget() {
        let (_storage, session) = test_session().await;

        // 1M prompt tokens at $3/M = exactly $3.00
        record_usage(&session, "anthropic/claude-sonnet-4", 1_000_000, 0, None)
            .await
            .unwrap();

        assert!(!check_budget(&session, 3.0).await.unwrap());
        assert!(!check_budget(&session, 2.5).await.unwrap());
        assert!(check_budget(&session, 3.01).await.unwrap());
    }
}
