//! Prompt builders for the three pipeline stages.
//!
//! Each builder produces the user message; every stage pairs it with
//! [`SYSTEM_PROMPT`] and requests JSON output, so the templates spell out
//! the exact object shape the stage will deserialize.

/// System message shared by all three stages.
pub const SYSTEM_PROMPT: &str =
    "You are a government procurement intelligence analyst. Respond with valid JSON only.";

/// Triage: is this change worth pursuing, and which related links matter.
pub fn triage_prompt(watch_url: &str, diff_text: &str, max_links: usize) -> String {
    format!(
        "A monitored government web page changed.\n\n\
         Page: {watch_url}\n\n\
         Change content:\n\
         ---\n\
         {diff_text}\n\
         ---\n\n\
         Decide whether this change is meaningful for a company tracking government \
         procurement opportunities (funding notices, solicitations, RFIs, RFPs, award \
         schedules). Routine edits, styling changes, and navigation churn are not \
         meaningful.\n\n\
         Also list up to {max_links} URLs from the change content that are worth \
         fetching independently (linked notices, attachments, detail pages). Only \
         include full URLs that appear in the content. Return an empty list if none.\n\n\
         Respond with a JSON object:\n\
         {{\n\
           \"meaningful\": true or false,\n\
           \"triage_reasoning\": \"one or two sentences\",\n\
           \"discovered_links\": [{{\"url\": \"...\", \"reason\": \"...\"}}]\n\
         }}"
    )
}

/// Classification: assign a procurement-relevance label with confidence.
pub fn classify_prompt(watch_url: &str, diff_text: &str) -> String {
    format!(
        "Classify this change on a monitored government web page.\n\n\
         Page: {watch_url}\n\n\
         Change content:\n\
         ---\n\
         {diff_text}\n\
         ---\n\n\
         Classify as exactly one of:\n\
         - RFI: a request for information or sources sought notice\n\
         - RFP: a solicitation, funding opportunity, or request for proposals\n\
         - ACTIONABLE: not yet a solicitation, but requires action or preparation\n\
         - INFORMATIONAL: relevant background with no action required\n\
         - IRRELEVANT: noise with no procurement relevance\n\n\
         Respond with a JSON object:\n\
         {{\n\
           \"classification\": \"RFI|RFP|ACTIONABLE|INFORMATIONAL|IRRELEVANT\",\n\
           \"confidence\": 0.0 to 1.0,\n\
           \"reasoning\": \"one or two sentences\",\n\
           \"key_signals\": [\"phrases from the content that drove the decision\"]\n\
         }}"
    )
}

/// Enrichment: actionable summary, urgency, dates, agencies.
pub fn enrich_prompt(
    watch_url: &str,
    classification: &str,
    confidence: f64,
    diff_text: &str,
    snapshot_text: &str,
) -> String {
    format!(
        "A change on a monitored government page was classified as {classification} \
         (confidence {confidence:.2}). Produce actionable intelligence for a business \
         development team.\n\n\
         Page: {watch_url}\n\n\
         Change content:\n\
         ---\n\
         {diff_text}\n\
         ---\n\n\
         Full page snapshot (for context):\n\
         ---\n\
         {snapshot_text}\n\
         ---\n\n\
         Respond with a JSON object:\n\
         {{\n\
           \"summary\": \"2-3 sentence summary of what changed and why it matters\",\n\
           \"recommended_actions\": [\"ordered concrete next steps\"],\n\
           \"urgency\": \"CRITICAL|HIGH|MEDIUM|LOW\",\n\
           \"key_dates\": [\"deadlines or milestones mentioned, with what they are\"],\n\
           \"relevant_agencies\": [\"agencies or offices involved\"]\n\
         }}"
    )
}
