//! Per-model-family adapters
//!
//! An adapter owns two jobs for one model family: rewrite the outbound
//! request into the family's reasoning-parameter dialect, and clean the
//! inbound streamed text (leaked chat-template tokens, XML tool calls,
//! externalised chain-of-thought). Adapters hold per-request state and are
//! reset at the start of every request.
//!
//! Selection order matters: Grok and Gemini must be probed before OpenAI,
//! whose `o1`/`o3` matching would otherwise steal their models.

pub mod deepseek;
pub mod gemini;
pub mod grok;
pub mod minimax;
pub mod openai;
pub mod qwen;

pub use gemini::GeminiAdapter;
pub use grok::GrokAdapter;
pub use qwen::QwenAdapter;

use claudish_core::{anthropic, openai as oai};

/// A tool call recovered from streamed text rather than from structured
/// deltas (Grok XML, `<tool_call>` envelopes, bare JSON).
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Result of feeding one upstream text chunk through an adapter.
#[derive(Debug, Default, Clone)]
pub struct TextOutcome {
    /// Text safe to forward to the client (possibly empty while buffering).
    pub text: String,
    /// Tool calls recovered from the text.
    pub extracted_calls: Vec<ExtractedToolCall>,
    /// True when the adapter changed or withheld anything.
    pub transformed: bool,
}

impl TextOutcome {
    pub fn passthrough(text: &str) -> Self {
        Self {
            text: text.to_string(),
            extracted_calls: Vec::new(),
            transformed: false,
        }
    }
}

pub trait ModelAdapter: Send {
    fn name(&self) -> &'static str;

    /// Clear per-request state. Called before every request.
    fn reset(&mut self) {}

    /// Rewrite an outbound OpenAI-dialect request (reasoning parameters,
    /// dialect extras). `original` carries the client's thinking budget.
    fn prepare_request(
        &mut self,
        outbound: &mut oai::ChatCompletionRequest,
        original: &anthropic::MessagesRequest,
    ) {
        let _ = (outbound, original);
    }

    /// Clean one streamed text chunk. May buffer; buffered text surfaces on
    /// a later chunk or from [`flush`](ModelAdapter::flush).
    fn process_text(&mut self, chunk: &str) -> TextOutcome {
        TextOutcome::passthrough(chunk)
    }

    /// Drain whatever the adapter still buffers. Called at stream end.
    fn flush(&mut self) -> TextOutcome {
        TextOutcome::default()
    }
}

/// Identity adapter for families without quirks.
#[derive(Debug, Default)]
pub struct DefaultAdapter;

impl ModelAdapter for DefaultAdapter {
    fn name(&self) -> &'static str {
        "default"
    }
}

/// Pick the adapter for a model name. First match wins.
pub fn adapter_for(model: &str) -> Box<dyn ModelAdapter> {
    let lower = model.to_lowercase();
    if grok::matches(&lower) {
        Box::new(GrokAdapter::new(model))
    } else if gemini::matches(&lower) {
        Box::new(GeminiAdapter::new(model))
    } else if qwen::matches(&lower) {
        Box::new(QwenAdapter::new())
    } else if minimax::matches(&lower) {
        Box::new(minimax::MiniMaxAdapter)
    } else if deepseek::matches(&lower) {
        Box::new(deepseek::DeepSeekAdapter)
    } else if openai::matches(&lower) {
        Box::new(openai::OpenAiAdapter)
    } else {
        Box::new(DefaultAdapter)
    }
}

/// The client's thinking budget, if extended thinking was requested.
pub(crate) fn thinking_budget(req: &anthropic::MessagesRequest) -> Option<u32> {
    req.thinking.as_ref().and_then(|t| t.budget_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_order_grok_and_gemini_before_openai() {
        // "grok-3-mini" contains no o1/o3 trap, but "gemini-2.0" contains
        // nothing OpenAI either; the real trap is models like "o3-mini"
        // versus Grok minis. Check the family picks.
        assert_eq!(adapter_for("grok-4-fast").name(), "grok");
        assert_eq!(adapter_for("gemini-2.5-pro").name(), "gemini");
        assert_eq!(adapter_for("o3-mini").name(), "openai");
        assert_eq!(adapter_for("gpt-4.1").name(), "openai");
        assert_eq!(adapter_for("qwen3-coder").name(), "qwen");
        assert_eq!(adapter_for("MiniMax-M2").name(), "minimax");
        assert_eq!(adapter_for("deepseek-v3").name(), "deepseek");
        assert_eq!(adapter_for("devstral-2512").name(), "default");
    }

    #[test]
    fn test_google_prefixed_gemini_still_matches_gemini() {
        assert_eq!(adapter_for("google/gemini-2.5-flash").name(), "gemini");
    }
}
