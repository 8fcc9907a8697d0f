use std::sync::LazyLock;

use regex::Regex;

static HIGHLIGHT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@@@\w+@@@").expect("valid highlight marker regex"));
static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid html tag regex"));

/// Clean a remote title or label for terminal display.
///
/// Highlight markers such as `@@@hl@@@` go first, then HTML entities are
/// decoded, then any HTML tags left over (including ones that arrived escaped)
/// are stripped. Control characters other than whitespace are dropped.
pub fn sanitize_text(text: &str) -> String {
    let without_markers = HIGHLIGHT_MARKER.replace_all(text, "");
    let decoded = html_escape::decode_html_entities(&without_markers);
    HTML_TAG
        .replace_all(&decoded, "")
        .chars()
        .filter(|ch| !ch.is_control() || ch.is_whitespace())
        .collect()
}
