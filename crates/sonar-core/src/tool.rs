//! Tool results and content items.
//!
//! Tool handlers produce a [`ToolResult`]: a content array plus an
//! optional error flag. The wire form is exactly
//! `{ "content": [...], "isError": true? }` — any extra fields a handler
//! (or plugin runtime) attaches are a protocol violation and are stripped
//! before serialization.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single content item in a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Base64-encoded image data.
    Image {
        /// Base64 payload.
        data: String,
        /// MIME type, e.g. `image/png`.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl Content {
    /// Text content item.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// The result of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Ordered content items.
    pub content: Vec<Content>,
    /// Set to `true` when the handler failed; absent on success.
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResult {
    /// Successful result with a single text item.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: None,
        }
    }

    /// Successful result carrying a JSON payload, pretty-printed as text.
    #[must_use]
    pub fn json(value: &Value) -> Self {
        let text =
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        Self::text(text)
    }

    /// Error result: the failure text still reaches the client as content.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(message)],
            is_error: Some(true),
        }
    }

    /// Whether this result reports a handler failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }

    /// Concatenated text of all text items.
    #[must_use]
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::Text { text } => Some(text.as_str()),
                Content::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Rebuild a result from an untrusted JSON value, keeping only the
    /// protocol fields.
    ///
    /// Unknown content items and extra top-level fields are dropped; a
    /// value without a usable `content` array becomes an error result so
    /// the caller still sees something.
    #[must_use]
    pub fn from_value_lossy(value: &Value) -> Self {
        let content = value
            .get("content")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value::<Content>(item.clone()).ok())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if content.is_empty() {
            return Self::error("tool returned no usable content");
        }

        let is_error = value.get("isError").and_then(Value::as_bool);
        Self {
            content,
            is_error: if is_error == Some(true) { Some(true) } else { None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_omits_is_error_on_the_wire() {
        let result = ToolResult::text("4 packets transmitted");
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(
            wire,
            json!({"content": [{"type": "text", "text": "4 packets transmitted"}]})
        );
    }

    #[test]
    fn error_sets_flag_and_keeps_text() {
        let result = ToolResult::error("nmap exited with status 1");
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["isError"], json!(true));
        assert_eq!(result.text_content(), "nmap exited with status 1");
    }

    #[test]
    fn lossy_rebuild_strips_extra_fields() {
        let raw = json!({
            "content": [{"type": "text", "text": "ok"}],
            "isError": false,
            "debug": {"elapsed_ms": 12},
            "_internal": true
        });
        let result = ToolResult::from_value_lossy(&raw);
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire, json!({"content": [{"type": "text", "text": "ok"}]}));
    }

    #[test]
    fn lossy_rebuild_without_content_is_an_error() {
        let result = ToolResult::from_value_lossy(&json!({"status": "ok"}));
        assert!(result.is_error());
    }

    #[test]
    fn image_content_round_trips() {
        let item = Content::Image {
            data: "aGVsbG8=".into(),
            mime_type: "image/png".into(),
        };
        let wire = serde_json::to_value(&item).unwrap();
        assert_eq!(wire["mimeType"], json!("image/png"));
        let back: Content = serde_json::from_value(wire).unwrap();
        assert_eq!(back, item);
    }
}
