//! Tool-schema sanitisation and compression
//!
//! Two concerns: (1) strip JSON-Schema constructs some backends reject
//! (`format: "uri"`), (2) under summarisation mode shrink verbose agent tool
//! descriptions so small local models don't drown in them.

use serde_json::Value;

/// Tool-filtering level. `Full` passes schemas through untouched (minus the
/// sanitise pass); the other levels apply compression with progressively
/// tighter description caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolSummaryMode {
    #[default]
    Full,
    Standard,
    Essential,
    UltraCompact,
}

impl ToolSummaryMode {
    /// Description length cap, `None` for passthrough.
    pub fn description_cap(self) -> Option<usize> {
        match self {
            ToolSummaryMode::Full => None,
            ToolSummaryMode::Standard => Some(150),
            ToolSummaryMode::Essential => Some(100),
            ToolSummaryMode::UltraCompact => Some(60),
        }
    }
}

/// Maximum enum values kept under compression.
const MAX_ENUM_VALUES: usize = 5;
/// Property-description cap under compression.
const MAX_PROPERTY_DESCRIPTION: usize = 80;

/// Remove `format: "uri"` declarations recursively. Several OpenAI-compatible
/// backends (and Gemini) reject the format keyword outright.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if k == "format" && v.as_str() == Some("uri") {
                    continue;
                }
                out.insert(k.clone(), sanitize_schema(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

/// Strip HTML/XML tags and collapse whitespace.
fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First sentence, or a hard cap, whichever comes first.
pub fn summarize_description(description: &str, cap: usize) -> String {
    let clean = strip_markup(description);
    let first_sentence = clean
        .split_inclusive(['.', '!', '?'])
        .next()
        .unwrap_or(&clean)
        .trim();
    let picked = if first_sentence.is_empty() {
        clean.as_str()
    } else {
        first_sentence
    };
    if picked.chars().count() <= cap {
        picked.to_string()
    } else {
        let truncated: String = picked.chars().take(cap.saturating_sub(1)).collect();
        format!("{}…", truncated.trim_end())
    }
}

/// Compression pass over a parameter schema: enum lists capped, property
/// descriptions trimmed.
fn compress_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let v = match (k.as_str(), v) {
                    ("enum", Value::Array(items)) if items.len() > MAX_ENUM_VALUES => {
                        Value::Array(items.iter().take(MAX_ENUM_VALUES).cloned().collect())
                    }
                    ("description", Value::String(s)) => {
                        Value::String(summarize_description(s, MAX_PROPERTY_DESCRIPTION))
                    }
                    _ => compress_schema(v),
                };
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(compress_schema).collect()),
        other => other.clone(),
    }
}

/// Prepare one tool's `(description, parameters)` for an upstream dialect.
pub fn prepare_tool(description: &str, schema: &Value, mode: ToolSummaryMode) -> (String, Value) {
    let schema = sanitize_schema(schema);
    match mode.description_cap() {
        None => (description.to_string(), schema),
        Some(cap) => (summarize_description(description, cap), compress_schema(&schema)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_removes_uri_format_recursively() {
        let schema = json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "format": "uri"},
                "date": {"type": "string", "format": "date-time"},
                "nested": {"items": {"format": "uri", "type": "string"}}
            }
        });
        let out = sanitize_schema(&schema);
        assert!(out["properties"]["url"].get("format").is_none());
        // Only "uri" is the problem child; other formats survive.
        assert_eq!(out["properties"]["date"]["format"], "date-time");
        assert!(out["properties"]["nested"]["items"].get("format").is_none());
    }

    #[test]
    fn test_summarize_takes_first_sentence() {
        let desc = "Reads a file from disk. Accepts absolute paths only. Returns contents.";
        assert_eq!(summarize_description(desc, 150), "Reads a file from disk.");
    }

    #[test]
    fn test_summarize_strips_markup_and_caps() {
        let desc = "<b>Runs a shell command</b> in the sandbox and waits for it to finish before returning anything at all to the caller";
        let out = summarize_description(desc, 60);
        assert!(!out.contains('<'));
        assert!(out.chars().count() <= 60);
    }

    #[test]
    fn test_compression_caps_enums_and_property_descriptions() {
        let schema = json!({
            "type": "object",
            "properties": {
                "mode": {"enum": ["a", "b", "c", "d", "e", "f", "g"]},
                "path": {"description": "x".repeat(200)}
            }
        });
        let (_, out) = prepare_tool("desc", &schema, ToolSummaryMode::Standard);
        assert_eq!(out["properties"]["mode"]["enum"].as_array().unwrap().len(), 5);
        assert!(
            out["properties"]["path"]["description"]
                .as_str()
                .unwrap()
                .chars()
                .count()
                <= 80
        );
    }

    #[test]
    fn test_full_mode_passes_description_through() {
        let (desc, _) = prepare_tool("Long description. With two sentences.", &json!({}), ToolSummaryMode::Full);
        assert_eq!(desc, "Long description. With two sentences.");
    }
}
