//! The staged intelligence pipeline for change events.
//!
//! This crate provides:
//! - [`Pipeline`] — the orchestrator driving one event through the stages
//! - [`DiffSource`] — changedetection.io client producing (diff, snapshot)
//! - [`triage`], [`classify`], [`enrich`] — the three LLM-backed stages
//! - [`filter`] — pure pre/post-stage filter decisions
//! - [`SlackNotifier`] — Block Kit card delivery for qualifying events

pub mod classify;
pub mod diff_source;
pub mod enrich;
pub mod filter;
pub mod notifier;
pub mod orchestrator;
pub mod triage;

pub use diff_source::DiffSource;
pub use notifier::SlackNotifier;
pub use orchestrator::Pipeline;
