//! HTML to plain-text extraction.

use ego_tree::NodeRef;
use scraper::{Html, Node};

/// Subtrees whose text is never visible page content.
const SKIP_TAGS: &[&str] = &["script", "style", "noscript", "svg", "head"];

/// Strip markup to the visible text of a page: walk the node tree, skip
/// [`SKIP_TAGS`] subtrees entirely, collect trimmed non-empty text nodes,
/// join with newlines.
pub fn html_to_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut pieces: Vec<String> = Vec::new();
    collect_text(doc.tree.root(), &mut pieces);
    pieces.join("\n")
}

fn collect_text(node: NodeRef<'_, Node>, pieces: &mut Vec<String>) {
    match node.value() {
        Node::Element(element) => {
            if SKIP_TAGS.contains(&element.name()) {
                return;
            }
        }
        Node::Text(text) => {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                pieces.push(trimmed.to_string());
            }
        }
        _ => {}
    }
    for child in node.children() {
        collect_text(child, pieces);
    }
}
