//! Panel updates embedded in tool-result text.

use super::PanelUpdate;

/// Opens the embedded update block.
pub const START_MARKER: &str = "<<<PANEL_UPDATES>>>";
/// Closes the embedded update block.
pub const END_MARKER: &str = "<<<END_PANEL_UPDATES>>>";

/// Append `updates` to `text` inside the marker block.
///
/// Returns `text` unchanged when there is nothing to embed.
pub fn embed_panel_updates(text: &str, updates: &[PanelUpdate]) -> String {
    if updates.is_empty() {
        return text.to_string();
    }

    match serde_json::to_string(updates) {
        Ok(json) => format!("{text}\n\n{START_MARKER}{json}{END_MARKER}"),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode panel updates");
            text.to_string()
        }
    }
}

/// Split embedded updates out of `text`.
///
/// The block is searched for from the end, since the embedder appends it
/// after whatever the snippet printed, and the snippet's own output may
/// contain the marker text. Text without a complete marker block, or whose
/// block does not hold a valid update array, comes back unchanged with no
/// updates.
pub fn extract_panel_updates(text: &str) -> (String, Vec<PanelUpdate>) {
    for (start, _) in text.rmatch_indices(START_MARKER) {
        let body_start = start + START_MARKER.len();
        let Some(body_len) = text[body_start..].rfind(END_MARKER) else {
            continue;
        };
        let body_end = body_start + body_len;

        match serde_json::from_str::<Vec<PanelUpdate>>(&text[body_start..body_end]) {
            Ok(updates) => {
                let before = text[..start].trim_end();
                let after = text[body_end + END_MARKER.len()..].trim_start();
                let stripped = match (before.is_empty(), after.is_empty()) {
                    (_, true) => before.to_string(),
                    (true, false) => after.to_string(),
                    (false, false) => format!("{before}\n{after}"),
                };
                return (stripped, updates);
            }
            Err(e) => tracing::debug!(error = %e, "ignoring malformed panel update block"),
        }
    }
    (text.to_string(), Vec::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::models::{Panel, PanelKind};

    fn sample() -> Vec<PanelUpdate> {
        vec![PanelUpdate::add(
            Panel::new(
                "table-sales",
                PanelKind::Table {
                    table_id: "sales".into(),
                },
            ),
            None,
        )]
    }

    #[test]
    fn test_text_without_markers_is_unchanged() {
        let (text, updates) = extract_panel_updates("just some output");
        assert_eq!(text, "just some output");
        assert!(updates.is_empty());

        let (again, updates) = extract_panel_updates(&text);
        assert_eq!(again, text);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_embedded_block_is_stripped() {
        let embedded = embed_panel_updates("Done.", &sample());
        assert!(embedded.contains(START_MARKER));

        let (text, updates) = extract_panel_updates(&embedded);
        assert_eq!(text, "Done.");
        assert_eq!(updates, sample());
    }

    #[test]
    fn test_text_after_block_is_kept() {
        let json = serde_json::to_string(&sample()).unwrap();
        let input = format!("before\n{START_MARKER}{json}{END_MARKER}\nafter");

        let (text, updates) = extract_panel_updates(&input);
        assert_eq!(text, "before\nafter");
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn test_invalid_json_returns_original() {
        let input = format!("out {START_MARKER}[{{not json{END_MARKER}");

        let (text, updates) = extract_panel_updates(&input);
        assert_eq!(text, input);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_unterminated_block_returns_original() {
        let input = format!("out {START_MARKER}[]");

        let (text, updates) = extract_panel_updates(&input);
        assert_eq!(text, input);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_marker_text_in_output_does_not_hide_block() {
        let output = format!("the delimiter is {START_MARKER} by the way");
        let embedded = embed_panel_updates(&output, &sample());

        let (text, updates) = extract_panel_updates(&embedded);
        assert_eq!(text, output);
        assert_eq!(updates, sample());
    }

    #[test]
    fn test_marker_text_inside_update_content() {
        let updates = vec![PanelUpdate::add(
            Panel::new(
                "notes",
                PanelKind::Markdown {
                    content: format!("{START_MARKER} and {END_MARKER}"),
                },
            ),
            None,
        )];
        let embedded = embed_panel_updates("ok", &updates);

        let (text, extracted) = extract_panel_updates(&embedded);
        assert_eq!(text, "ok");
        assert_eq!(extracted, updates);
    }

    #[test]
    fn test_embed_nothing() {
        assert_eq!(embed_panel_updates("x", &[]), "x");
    }
}
