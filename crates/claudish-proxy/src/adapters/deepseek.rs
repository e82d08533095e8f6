//! DeepSeek adapter
//!
//! DeepSeek rejects thinking parameters outright; the budget is dropped and
//! no reasoning dialect field is emitted.

use super::ModelAdapter;
use claudish_core::{anthropic, openai as oai};

pub struct DeepSeekAdapter;

impl ModelAdapter for DeepSeekAdapter {
    fn name(&self) -> &'static str {
        "deepseek"
    }

    fn prepare_request(
        &mut self,
        outbound: &mut oai::ChatCompletionRequest,
        _original: &anthropic::MessagesRequest,
    ) {
        outbound.reasoning_effort = None;
    }
}

pub fn matches(lower_model: &str) -> bool {
    lower_model.contains("deepseek")
}
