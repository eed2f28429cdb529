//! Pure filter decisions applied between pipeline stages.

use procwatch_shared::Classification;

/// Whether a diff is too small to be worth any LLM spend. Absent or
/// whitespace-only diffs always count as too small.
pub fn is_diff_too_small(diff_text: Option<&str>, min_diff_length: usize) -> bool {
    match diff_text {
        Some(diff) => diff.trim().chars().count() < min_diff_length,
        None => true,
    }
}

/// Whether a raw classification label is in an allow-list. A label that
/// parses to no known [`Classification`] never matches.
pub fn label_allowed(label: &str, allowed: &[Classification]) -> bool {
    Classification::parse(label).is_some_and(|c| allowed.contains(&c))
}
