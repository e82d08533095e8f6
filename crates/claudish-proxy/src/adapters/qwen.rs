//! Qwen adapter
//!
//! Local Qwen builds leak chat-template special tokens into answer text
//! (`<|im_start|>`, role tags, `<|endoftext|>`). Strip them, and hold back a
//! partial token at a chunk boundary so `<|im_st` + `art|>` doesn't slip
//! through in halves.

use super::{thinking_budget, ModelAdapter, TextOutcome};
use claudish_core::{anthropic, openai as oai};

const SPECIAL_TOKENS: &[&str] = &[
    "<|im_start|>assistant",
    "<|im_start|>user",
    "<|im_start|>system",
    "<|im_start|>",
    "<|im_end|>",
    "<|endoftext|>",
    "<|end|>",
];

#[derive(Default)]
pub struct QwenAdapter {
    /// Possible partial special token held from the previous chunk.
    tail: String,
    stripped_any: bool,
}

impl QwenAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn strip_tokens(text: &str) -> (String, bool) {
        let mut out = text.to_string();
        let mut stripped = false;
        for token in SPECIAL_TOKENS {
            if out.contains(token) {
                out = out.replace(token, "");
                stripped = true;
            }
        }
        (out, stripped)
    }

    /// Length of the longest suffix that is a prefix of any special token.
    fn partial_suffix_len(text: &str) -> usize {
        let max_probe = SPECIAL_TOKENS.iter().map(|t| t.len()).max().unwrap_or(0);
        let mut start = text.len().saturating_sub(max_probe);
        while start > 0 && !text.is_char_boundary(start) {
            start -= 1;
        }
        for (offset, c) in text[start..].char_indices() {
            if c != '<' {
                continue;
            }
            let suffix = &text[start + offset..];
            if SPECIAL_TOKENS
                .iter()
                .any(|t| t.starts_with(suffix) && suffix.len() < t.len())
            {
                return suffix.len();
            }
        }
        0
    }
}

impl ModelAdapter for QwenAdapter {
    fn name(&self) -> &'static str {
        "qwen"
    }

    fn reset(&mut self) {
        self.tail.clear();
        self.stripped_any = false;
    }

    fn prepare_request(
        &mut self,
        outbound: &mut oai::ChatCompletionRequest,
        original: &anthropic::MessagesRequest,
    ) {
        if let Some(budget) = thinking_budget(original) {
            outbound.set_extra("enable_thinking", serde_json::Value::Bool(true));
            outbound.set_extra("thinking_budget", serde_json::json!(budget));
        }
    }

    fn process_text(&mut self, chunk: &str) -> TextOutcome {
        let mut text = std::mem::take(&mut self.tail);
        text.push_str(chunk);

        // Hold a possible partial token before stripping, so a role tag split
        // as `<|im_start|>` + `assistant` can't leak its second half.
        let hold = Self::partial_suffix_len(&text);
        if hold > 0 {
            self.tail = text.split_off(text.len() - hold);
        }

        let (clean, stripped) = Self::strip_tokens(&text);
        self.stripped_any |= stripped;

        TextOutcome {
            transformed: self.stripped_any || !self.tail.is_empty(),
            text: clean,
            extracted_calls: Vec::new(),
        }
    }

    fn flush(&mut self) -> TextOutcome {
        // A held tail that never completed a special token is real text.
        let (text, stripped) = Self::strip_tokens(&std::mem::take(&mut self.tail));
        self.stripped_any |= stripped;
        TextOutcome {
            transformed: self.stripped_any,
            text,
            extracted_calls: Vec::new(),
        }
    }
}

pub fn matches(lower_model: &str) -> bool {
    lower_model.contains("qwen") || lower_model.contains("qwq")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> String {
        let mut a = QwenAdapter::new();
        let mut text = String::new();
        for chunk in chunks {
            text.push_str(&a.process_text(chunk).text);
        }
        text.push_str(&a.flush().text);
        text
    }

    #[test]
    fn test_special_tokens_stripped() {
        assert_eq!(
            run(&["<|im_start|>assistant\nHello there<|im_end|>"]),
            "\nHello there"
        );
        assert_eq!(run(&["done<|endoftext|>"]), "done");
    }

    #[test]
    fn test_token_split_across_chunks() {
        assert_eq!(run(&["Hello<|im_st", "art|>world"]), "Helloworld");
        assert_eq!(run(&["bye<|endo", "ftext|>"]), "bye");
    }

    #[test]
    fn test_false_partial_released_on_flush() {
        // "<|i" never completes; it must come out as literal text.
        assert_eq!(run(&["value is <|i"]), "value is <|i");
    }

    #[test]
    fn test_plain_text_untouched() {
        let mut a = QwenAdapter::new();
        let out = a.process_text("ordinary text with < and | chars");
        assert_eq!(out.text, "ordinary text with < and | chars");
        assert!(!a.flush().transformed);
    }

    #[test]
    fn test_thinking_budget_forwarded() {
        let original = anthropic::MessagesRequest {
            model: "qwen3".into(),
            messages: vec![],
            max_tokens: 512,
            system: None,
            temperature: None,
            tools: None,
            tool_choice: None,
            stream: Some(true),
            thinking: Some(anthropic::ThinkingConfig {
                thinking_type: "enabled".into(),
                budget_tokens: Some(9_000),
            }),
            extra: None,
        };

        let mut a = QwenAdapter::new();
        let mut req = oai::ChatCompletionRequest::new("qwen3", vec![]);
        a.prepare_request(&mut req, &original);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["enable_thinking"], true);
        assert_eq!(v["thinking_budget"], 9_000);
    }
}
