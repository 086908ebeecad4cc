//! Transcript text extraction
//!
//! Flow output frames have no fixed schema, so text is located with a short
//! list of known shapes, tried in priority order. The first rule whose field
//! is present (and not `null`) decides: a string there is the fragment, any
//! other value yields nothing. When the frame itself is a JSON string, that
//! string is the fragment.

use serde_json::Value;

/// One place a text fragment may live inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionRule {
    pub name: &'static str,
    pub path: &'static [&'static str],
}

/// Extraction rules in priority order
pub const EXTRACTION_RULES: &[ExtractionRule] = &[
    ExtractionRule {
        name: "chunk",
        path: &["chunk"],
    },
    ExtractionRule {
        name: "result.message.text",
        path: &["result", "message", "text"],
    },
    ExtractionRule {
        name: "message.text",
        path: &["message", "text"],
    },
    ExtractionRule {
        name: "result.text",
        path: &["result", "text"],
    },
    ExtractionRule {
        name: "text",
        path: &["text"],
    },
];

impl ExtractionRule {
    /// Value at this rule's path, treating `null` as absent.
    pub fn lookup<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.path
            .iter()
            .try_fold(value, |current, key| current.as_object()?.get(*key))
            .filter(|found| !found.is_null())
    }
}

/// Extract the plain-text fragment carried by a decoded frame, if any.
pub fn extract_text(value: &Value) -> Option<&str> {
    if let Value::String(text) = value {
        return Some(text);
    }
    EXTRACTION_RULES
        .iter()
        .find_map(|rule| rule.lookup(value))
        .and_then(Value::as_str)
}

/// Per-job accumulator of extracted text
#[derive(Debug, Default, Clone)]
pub struct TranscriptBuffer {
    text: String,
    fragments: usize,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the fragment of `value`, if it has one. Returns whether text was added.
    pub fn absorb(&mut self, value: &Value) -> bool {
        match extract_text(value) {
            Some(fragment) if !fragment.is_empty() => {
                self.text.push_str(fragment);
                self.fragments += 1;
                true
            }
            _ => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    pub fn into_string(self) -> String {
        self.text
    }
}
