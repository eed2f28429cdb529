//! Page fetching for discovered links.
//!
//! This crate provides:
//! - [`PageFetcher`] — bounded, redirect-following page fetch that degrades
//!   to `None` on every failure instead of raising into the caller
//! - [`html_to_text`] — strip markup to the visible text of a page

pub mod fetch;
pub mod text;

pub use fetch::PageFetcher;
pub use text::html_to_text;
