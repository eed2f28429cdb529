//! OpenRouter LLM client, cost accounting, and stage prompts.
//!
//! This crate provides:
//! - [`LlmClient`] — the chat-completions client shared by every stage
//! - [`LlmContent`] — tagged result of the JSON extraction ladder
//! - [`cost`] — per-model pricing, the daily budget gate, and ledger writes
//! - [`prompts`] — prompt builders for triage, classification, enrichment

pub mod client;
pub mod cost;
pub mod prompts;

pub use client::{ChatMessage, Completion, CompletionOptions, LlmClient, LlmContent};
pub use cost::{check_budget, estimate_cost, record_usage};
