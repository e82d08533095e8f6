//! OpenAI adapter
//!
//! The o-series takes a coarse `reasoning_effort` instead of a token budget.

use super::{thinking_budget, ModelAdapter};
use claudish_core::{anthropic, openai as oai};

pub struct OpenAiAdapter;

/// Budget → effort thresholds: below the first is minimal, above the last is
/// high.
const THRESHOLDS: [(u32, &str); 3] = [(4_000, "minimal"), (16_000, "low"), (32_000, "medium")];

fn effort_for(budget: Option<u32>) -> &'static str {
    match budget {
        None => "medium",
        Some(b) => {
            for (limit, effort) in THRESHOLDS {
                if b < limit {
                    return effort;
                }
            }
            "high"
        }
    }
}

impl ModelAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn prepare_request(
        &mut self,
        outbound: &mut oai::ChatCompletionRequest,
        original: &anthropic::MessagesRequest,
    ) {
        if original.thinking.is_some() {
            outbound.reasoning_effort = Some(effort_for(thinking_budget(original)).to_string());
        }
    }
}

pub fn matches(lower_model: &str) -> bool {
    lower_model.contains("gpt")
        || lower_model.starts_with("o1")
        || lower_model.starts_with("o3")
        || lower_model.starts_with("o4")
        || lower_model.contains("codex")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effort_thresholds() {
        assert_eq!(effort_for(Some(1_000)), "minimal");
        assert_eq!(effort_for(Some(4_000)), "low");
        assert_eq!(effort_for(Some(15_999)), "low");
        assert_eq!(effort_for(Some(16_000)), "medium");
        assert_eq!(effort_for(Some(20_000)), "medium");
        assert_eq!(effort_for(Some(32_000)), "high");
        assert_eq!(effort_for(None), "medium");
    }

    #[test]
    fn test_budget_becomes_reasoning_effort_and_nothing_else() {
        let original = anthropic::MessagesRequest {
            model: "o3-mini".into(),
            messages: vec![],
            max_tokens: 1024,
            system: None,
            temperature: None,
            tools: None,
            tool_choice: None,
            stream: Some(true),
            thinking: Some(anthropic::ThinkingConfig {
                thinking_type: "enabled".into(),
                budget_tokens: Some(20_000),
            }),
            extra: None,
        };

        let mut a = OpenAiAdapter;
        let mut req = oai::ChatCompletionRequest::new("o3-mini", vec![]);
        a.prepare_request(&mut req, &original);
        assert_eq!(req.reasoning_effort.as_deref(), Some("medium"));
        // the Anthropic thinking field never appears in the payload
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("thinking").is_none());
    }
}
