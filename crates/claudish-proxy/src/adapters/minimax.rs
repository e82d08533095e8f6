//! MiniMax adapter
//!
//! MiniMax interleaves reasoning into `content` unless asked to split it
//! onto `reasoning_content`.

use super::ModelAdapter;
use claudish_core::{anthropic, openai as oai};

pub struct MiniMaxAdapter;

impl ModelAdapter for MiniMaxAdapter {
    fn name(&self) -> &'static str {
        "minimax"
    }

    fn prepare_request(
        &mut self,
        outbound: &mut oai::ChatCompletionRequest,
        _original: &anthropic::MessagesRequest,
    ) {
        outbound.set_extra("reasoning_split", serde_json::Value::Bool(true));
    }
}

pub fn matches(lower_model: &str) -> bool {
    lower_model.contains("minimax") || lower_model.contains("abab")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasoning_split_always_set() {
        let original = anthropic::MessagesRequest {
            model: "MiniMax-M2".into(),
            messages: vec![],
            max_tokens: 512,
            system: None,
            temperature: None,
            tools: None,
            tool_choice: None,
            stream: Some(true),
            thinking: None,
            extra: None,
        };
        let mut a = MiniMaxAdapter;
        let mut req = oai::ChatCompletionRequest::new("MiniMax-M2", vec![]);
        a.prepare_request(&mut req, &original);
        assert_eq!(serde_json::to_value(&req).unwrap()["reasoning_split"], true);
    }
}
