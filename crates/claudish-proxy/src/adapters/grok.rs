//! Grok adapter
//!
//! Grok intermittently ignores the OpenAI tool_calls mechanism and emits its
//! own XML dialect inline in answer text:
//!
//! ```text
//! <xai:function_call name="Read">
//!   <xai:parameter name="file_path">/tmp/a</xai:parameter>
//! </xai:function_call>
//! ```
//!
//! The adapter buffers streamed text, extracts complete elements into proper
//! tool calls with freshly minted ids, and withholds text while an element is
//! in progress or a partial opening tag sits at the end of the buffer.

use super::{thinking_budget, ExtractedToolCall, ModelAdapter, TextOutcome};
use crate::ids::new_tool_id;
use claudish_core::{anthropic, openai as oai};
use regex::Regex;
use std::sync::OnceLock;

const OPEN_TAG: &str = "<xai:function_call";

/// Budget at or above which a Grok mini model runs at high effort.
const EFFORT_THRESHOLD: u32 = 20_000;

fn call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<xai:function_call\s+name="([^"]+)"\s*>(.*?)</xai:function_call>"#)
            .expect("grok call regex")
    })
}

fn param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<xai:parameter\s+name="([^"]+)"\s*>(.*?)</xai:parameter>"#)
            .expect("grok param regex")
    })
}

pub struct GrokAdapter {
    mini: bool,
    buffer: String,
}

impl GrokAdapter {
    pub fn new(model: &str) -> Self {
        Self {
            mini: model.to_lowercase().contains("mini"),
            buffer: String::new(),
        }
    }

    /// Extract every complete XML call from the buffer, returning the
    /// remaining text with the elements cut out.
    fn drain_complete_calls(&mut self) -> (String, Vec<ExtractedToolCall>) {
        let mut calls = Vec::new();
        let mut clean = String::with_capacity(self.buffer.len());
        let mut last_end = 0;

        for caps in call_regex().captures_iter(&self.buffer) {
            let whole = caps.get(0).unwrap();
            clean.push_str(&self.buffer[last_end..whole.start()]);
            last_end = whole.end();

            let name = caps[1].to_string();
            let mut input = serde_json::Map::new();
            for p in param_regex().captures_iter(&caps[2]) {
                let key = p[1].to_string();
                let raw = p[2].trim();
                // Parameter values may be JSON; fall back to the raw string.
                let value = serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
                input.insert(key, value);
            }
            calls.push(ExtractedToolCall {
                id: new_tool_id(),
                name,
                input: serde_json::Value::Object(input),
            });
        }

        clean.push_str(&self.buffer[last_end..]);
        self.buffer.clear();
        (clean, calls)
    }

    /// Index from which the text tail could be the start of an opening tag;
    /// text from there must be withheld until more arrives.
    fn partial_tag_start(text: &str) -> Option<usize> {
        let mut from = text.len().saturating_sub(OPEN_TAG.len() + 1);
        while from > 0 && !text.is_char_boundary(from) {
            from -= 1;
        }
        for (offset, _) in text[from..].char_indices().filter(|(_, c)| *c == '<') {
            let idx = from + offset;
            let tail = &text[idx..];
            if OPEN_TAG.starts_with(tail) || tail.starts_with(OPEN_TAG) {
                return Some(idx);
            }
        }
        None
    }
}

impl ModelAdapter for GrokAdapter {
    fn name(&self) -> &'static str {
        "grok"
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn prepare_request(
        &mut self,
        outbound: &mut oai::ChatCompletionRequest,
        original: &anthropic::MessagesRequest,
    ) {
        // Only the mini models take reasoning_effort; the full models reject
        // any thinking parameter, so the budget is simply dropped.
        if self.mini {
            if let Some(budget) = thinking_budget(original) {
                let effort = if budget >= EFFORT_THRESHOLD { "high" } else { "low" };
                outbound.reasoning_effort = Some(effort.to_string());
            }
        }
    }

    fn process_text(&mut self, chunk: &str) -> TextOutcome {
        self.buffer.push_str(chunk);

        let (mut text, calls) = self.drain_complete_calls();

        // An element still in progress (opening tag seen, close pending)
        // goes back to the buffer wholesale; so does a partial opening tag
        // at the very tail.
        if let Some(idx) = text.find(OPEN_TAG) {
            self.buffer = text.split_off(idx);
        } else if let Some(idx) = Self::partial_tag_start(&text) {
            self.buffer = text.split_off(idx);
        }

        let transformed = !calls.is_empty() || !self.buffer.is_empty();
        TextOutcome {
            text,
            extracted_calls: calls,
            transformed,
        }
    }

    fn flush(&mut self) -> TextOutcome {
        // An unterminated element at stream end is dropped; a lone partial
        // tag can never complete either and is dropped with it.
        let rest = std::mem::take(&mut self.buffer);
        if rest.contains(OPEN_TAG) || OPEN_TAG.starts_with(rest.as_str()) {
            TextOutcome {
                text: String::new(),
                extracted_calls: Vec::new(),
                transformed: !rest.is_empty(),
            }
        } else {
            TextOutcome {
                text: rest,
                extracted_calls: Vec::new(),
                transformed: false,
            }
        }
    }
}

pub fn matches(lower_model: &str) -> bool {
    lower_model.contains("grok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect(adapter: &mut GrokAdapter, chunks: &[&str]) -> (String, Vec<ExtractedToolCall>) {
        let mut text = String::new();
        let mut calls = Vec::new();
        for chunk in chunks {
            let out = adapter.process_text(chunk);
            text.push_str(&out.text);
            calls.extend(out.extracted_calls);
        }
        let out = adapter.flush();
        text.push_str(&out.text);
        calls.extend(out.extracted_calls);
        (text, calls)
    }

    #[test]
    fn test_complete_call_extracted_with_minted_id() {
        let mut a = GrokAdapter::new("grok-4");
        let (text, calls) = collect(
            &mut a,
            &[r#"<xai:function_call name="Read"><xai:parameter name="file_path">/tmp/a</xai:parameter></xai:function_call>"#],
        );
        assert!(text.is_empty());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Read");
        assert!(calls[0].id.starts_with("toolu_"));
        assert_eq!(calls[0].input, json!({"file_path": "/tmp/a"}));
    }

    #[test]
    fn test_call_split_across_chunks() {
        let mut a = GrokAdapter::new("grok-4");
        let (text, calls) = collect(
            &mut a,
            &[
                "checking the file ",
                "<xai:function_",
                r#"call name="Bash"><xai:parameter name="command">ls -la</xai:param"#,
                "eter></xai:function_call> done",
            ],
        );
        assert_eq!(text, "checking the file  done");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].input, json!({"command": "ls -la"}));
    }

    #[test]
    fn test_json_parameter_values_decoded() {
        let mut a = GrokAdapter::new("grok-4");
        let (_, calls) = collect(
            &mut a,
            &[r#"<xai:function_call name="Edit"><xai:parameter name="count">3</xai:parameter><xai:parameter name="flags">["a","b"]</xai:parameter></xai:function_call>"#],
        );
        assert_eq!(calls[0].input, json!({"count": 3, "flags": ["a", "b"]}));
    }

    #[test]
    fn test_multiple_calls_in_one_buffer() {
        let mut a = GrokAdapter::new("grok-4");
        let (_, calls) = collect(
            &mut a,
            &[r#"<xai:function_call name="A"></xai:function_call><xai:function_call name="B"></xai:function_call>"#],
        );
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn test_partial_tag_withheld_then_released_as_text() {
        let mut a = GrokAdapter::new("grok-4");
        let first = a.process_text("hello <xai:func");
        assert_eq!(first.text, "hello ");
        // turns out it wasn't a call after all
        let second = a.process_text("tion> nope");
        let rest = a.flush();
        let all = format!("{}{}", second.text, rest.text);
        assert_eq!(all, "<xai:function> nope");
    }

    #[test]
    fn test_unterminated_call_dropped_on_flush() {
        let mut a = GrokAdapter::new("grok-4");
        let out = a.process_text(r#"<xai:function_call name="Read"><xai:parameter"#);
        assert!(out.text.is_empty());
        let rest = a.flush();
        assert!(rest.text.is_empty());
        assert!(rest.transformed);
    }

    #[test]
    fn test_effort_mapping_only_for_mini() {
        use claudish_core::{anthropic, openai as oai};

        let original = anthropic::MessagesRequest {
            model: "grok-3-mini".into(),
            messages: vec![],
            max_tokens: 1024,
            system: None,
            temperature: None,
            tools: None,
            tool_choice: None,
            stream: Some(true),
            thinking: Some(anthropic::ThinkingConfig {
                thinking_type: "enabled".into(),
                budget_tokens: Some(25_000),
            }),
            extra: None,
        };

        let mut mini = GrokAdapter::new("grok-3-mini");
        let mut req = oai::ChatCompletionRequest::new("grok-3-mini", vec![]);
        mini.prepare_request(&mut req, &original);
        assert_eq!(req.reasoning_effort.as_deref(), Some("high"));

        let mut low = GrokAdapter::new("grok-3-mini");
        let mut req2 = oai::ChatCompletionRequest::new("grok-3-mini", vec![]);
        let mut orig2 = original.clone();
        orig2.thinking.as_mut().unwrap().budget_tokens = Some(5_000);
        low.prepare_request(&mut req2, &orig2);
        assert_eq!(req2.reasoning_effort.as_deref(), Some("low"));

        let mut full = GrokAdapter::new("grok-4");
        let mut req3 = oai::ChatCompletionRequest::new("grok-4", vec![]);
        full.prepare_request(&mut req3, &original);
        assert!(req3.reasoning_effort.is_none());
    }
}
