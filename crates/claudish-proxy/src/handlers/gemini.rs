//! Native Gemini handler
//!
//! Speaks `v1beta/models/{model}:streamGenerateContent?alt=sse`. Beyond the
//! wire shape, two Gemini-isms live here: the tool-call-id → name map
//! (functionResponse needs the name the Anthropic wire doesn't carry) and
//! thought-signature replay on later turns. The map is shared with the
//! stream generator so calls minted mid-stream resolve on the next turn.

use super::{sse_response, CompletionGuard, HandlerDeps};
use crate::adapters::{self, adapter_for, ExtractedToolCall};
use crate::ids::new_tool_id;
use crate::pruner;
use crate::registry::{ProviderSpec, Resolution};
use crate::retry::{classify_error_response, send_with_retry};
use crate::stream::{EventWriter, SseParser};
use crate::tokens::{ContextWindowSource, UsageTracker};
use axum::response::{IntoResponse, Json, Response};
use claudish_core::anthropic::{self, MessagesRequest};
use claudish_core::{gemini, openai as oai, GatewayError};
use claudish_translator::gemini::{
    anthropic_messages_to_gemini, anthropic_tools_to_gemini, system_to_gemini, ToolNameMap,
};
use claudish_translator::{prompts, ToolSummaryMode};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const GEMINI_WINDOW: u32 = 1_048_576;
const UPSTREAM_BRAND: &str = "Claude";

pub struct GeminiHandler {
    provider: ProviderSpec,
    model: String,
    deps: HandlerDeps,
    credential: Result<Option<String>, GatewayError>,
    pub(super) tracker: Arc<Mutex<UsageTracker>>,
    /// Session-long tool_use_id → (name, thought signature) map, shared
    /// with in-flight stream generators.
    name_map: Arc<Mutex<ToolNameMap>>,
}

impl GeminiHandler {
    pub fn new(resolution: Resolution, deps: HandlerDeps) -> Self {
        let Resolution {
            provider,
            model_name,
        } = resolution;
        let credential = provider.credential();
        let mut tracker = UsageTracker::new(&provider.name, &model_name, false, deps.port);
        match deps.settings.context_window_override {
            Some(w) => tracker.set_context_window(w, ContextWindowSource::Env),
            None => tracker.set_context_window(GEMINI_WINDOW, ContextWindowSource::Default),
        }
        Self {
            provider,
            model: model_name,
            deps,
            credential,
            tracker: Arc::new(Mutex::new(tracker)),
            name_map: Arc::new(Mutex::new(ToolNameMap::new())),
        }
    }

    fn credential(&self) -> Result<String, GatewayError> {
        match &self.credential {
            Ok(Some(key)) => Ok(key.clone()),
            Ok(None) => Err(GatewayError::Internal("gemini requires a credential".into())),
            Err(GatewayError::MissingCredential { env, hint }) => {
                Err(GatewayError::MissingCredential {
                    env: env.clone(),
                    hint: hint.clone(),
                })
            }
            Err(_) => Err(GatewayError::Internal("credential state corrupt".into())),
        }
    }

    fn endpoint(&self, streaming: bool) -> String {
        let verb = if streaming {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!(
            "{}{}/{}:{}",
            self.provider.base_url, self.provider.api_path, self.model, verb
        )
    }

    fn build_outbound(
        &self,
        request: &MessagesRequest,
        pruned: Option<usize>,
    ) -> gemini::GenerateContentRequest {
        let settings = &self.deps.settings;

        let contents = {
            let mut name_map = self.name_map.lock();
            anthropic_messages_to_gemini(&request.messages, &mut name_map)
        };

        let base_system = request
            .system
            .as_ref()
            .map(|s| s.to_text())
            .unwrap_or_default();
        let mut system = prompts::decorate_system(&base_system, &self.model, UPSTREAM_BRAND);
        if let Some(dropped) = pruned {
            system.push_str(&pruner::disclosure_note(dropped));
        }

        let budget = request.thinking.as_ref().and_then(|t| t.budget_tokens);

        gemini::GenerateContentRequest {
            contents,
            system_instruction: Some(system_to_gemini(&system)),
            tools: request
                .tools
                .as_ref()
                .filter(|t| !t.is_empty())
                .map(|t| anthropic_tools_to_gemini(t, ToolSummaryMode::Full)),
            generation_config: Some(gemini::GenerationConfig {
                temperature: settings.temperature.or(request.temperature),
                max_output_tokens: Some(request.max_tokens.min(settings.max_output_tokens)),
                thinking_config: adapters::gemini::map_thinking(&self.model, budget),
            }),
        }
    }

    pub async fn handle(&self, mut request: MessagesRequest) -> Result<Response, GatewayError> {
        let api_key = self.credential()?;

        let pruned = {
            let tracker = self.tracker.lock();
            pruner::should_prune(
                tracker.context_used(),
                tracker.context_window,
                request.messages.len(),
            )
        }
        .then(|| pruner::prune_messages(&mut request.messages))
        .filter(|o| o.pruned)
        .map(|o| o.dropped);

        let outbound = self.build_outbound(&request, pruned);
        let streaming = request.stream.unwrap_or(false);
        let url = self.endpoint(streaming);

        debug!("dispatching {} → {}", request.model, url);

        let http = self.deps.http.clone();
        let body = serde_json::to_value(&outbound)?;
        let resp = send_with_retry(&self.provider, move || {
            http.post(&url)
                .header("x-goog-api-key", &api_key)
                .header("Content-Type", "application/json")
                .json(&body)
        })
        .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_error_response(
                &self.provider,
                &self.model,
                status.as_u16(),
                &body,
            ));
        }

        if streaming {
            Ok(self.stream_response(resp, request))
        } else {
            self.json_response(resp).await
        }
    }

    fn stream_response(&self, resp: reqwest::Response, request: MessagesRequest) -> Response {
        let schemas = request.tools.clone().unwrap_or_default();
        let mut writer = EventWriter::new(&request.model, schemas, adapter_for(&self.model));
        let mut guard = CompletionGuard::new(self.tracker.clone());
        let middleware = self.deps.middleware.clone();
        let name_map = self.name_map.clone();

        let stream = async_stream::stream! {
            for f in writer.start() {
                yield Ok(f);
            }

            let mut parser = SseParser::new();
            let mut body = resp.bytes_stream();
            let mut last_activity = Instant::now();
            let mut ping = tokio::time::interval(Duration::from_secs(1));
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ping.tick().await;

            loop {
                tokio::select! {
                    chunk = body.next() => match chunk {
                        Some(Ok(bytes)) => {
                            last_activity = Instant::now();
                            for payload in parser.feed(&bytes) {
                                if payload == "[DONE]" {
                                    continue;
                                }
                                match serde_json::from_str::<gemini::GenerateContentResponse>(&payload) {
                                    Ok(frame) => {
                                        for f in apply_gemini_frame(&mut writer, &frame, &name_map) {
                                            yield Ok(f);
                                        }
                                    }
                                    // A malformed chunk must not tear down
                                    // the stream.
                                    Err(e) => warn!("skipping unparseable gemini chunk: {}", e),
                                }
                            }
                            let usage = writer.usage_or_estimate();
                            guard.observe(usage.input_tokens, usage.output_tokens);
                        }
                        Some(Err(e)) => {
                            warn!("gemini stream error: {}", e);
                            for f in writer.finalize_error("connection_error", &e.to_string()) {
                                yield Ok(f);
                            }
                            break;
                        }
                        None => {
                            for f in writer.finalize() {
                                yield Ok(f);
                            }
                            break;
                        }
                    },
                    _ = ping.tick() => {
                        if last_activity.elapsed() > Duration::from_secs(1) && writer.can_ping() {
                            yield Ok(writer.ping());
                        }
                    }
                }
            }

            middleware.after_stream_complete(&writer.metadata);
            let usage = writer.usage_or_estimate();
            guard.record(usage.input_tokens, usage.output_tokens);
        };

        sse_response(stream)
    }

    async fn json_response(&self, resp: reqwest::Response) -> Result<Response, GatewayError> {
        let frame: gemini::GenerateContentResponse =
            resp.json().await.map_err(|e| GatewayError::Api {
                status: 502,
                message: format!("unparseable gemini response: {}", e),
            })?;

        let mut content = Vec::new();
        let mut stop_reason = anthropic::StopReason::EndTurn;

        for candidate in &frame.candidates {
            if let Some(body) = &candidate.content {
                for part in &body.parts {
                    if let Some(call) = &part.function_call {
                        let id = new_tool_id();
                        {
                            let mut map = self.name_map.lock();
                            map.record(&id, &call.name);
                            if let Some(sig) = &part.thought_signature {
                                map.record_signature(&id, sig);
                            }
                        }
                        content.push(anthropic::ContentBlock::ToolUse {
                            id,
                            name: call.name.clone(),
                            input: call.args.clone(),
                        });
                        stop_reason = anthropic::StopReason::ToolUse;
                    } else if let Some(text) = &part.text {
                        if !part.thought.unwrap_or(false) && !text.is_empty() {
                            content.push(anthropic::ContentBlock::Text { text: text.clone() });
                        }
                    }
                }
            }
            if candidate.finish_reason.as_deref() == Some("MAX_TOKENS") {
                stop_reason = anthropic::StopReason::MaxTokens;
            }
        }

        let usage = frame.usage_metadata.unwrap_or_default();
        self.tracker
            .lock()
            .record(usage.prompt_token_count, usage.candidates_token_count);

        let response = anthropic::MessagesResponse {
            id: crate::ids::new_message_id(),
            response_type: "message".into(),
            role: anthropic::Role::Assistant,
            content,
            model: self.model.clone(),
            stop_reason: Some(stop_reason),
            usage: anthropic::Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            },
        };
        Ok(Json(response).into_response())
    }
}

/// Translate one streamed frame into writer calls, recording minted tool
/// ids (and any thought signatures) into the shared session map.
fn apply_gemini_frame(
    writer: &mut EventWriter,
    frame: &gemini::GenerateContentResponse,
    name_map: &Arc<Mutex<ToolNameMap>>,
) -> Vec<String> {
    let mut out = Vec::new();

    if let Some(usage) = &frame.usage_metadata {
        writer.set_usage(usage.prompt_token_count, usage.candidates_token_count);
    }

    for candidate in &frame.candidates {
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if let Some(call) = &part.function_call {
                    let id = new_tool_id();
                    {
                        let mut map = name_map.lock();
                        map.record(&id, &call.name);
                        if let Some(sig) = &part.thought_signature {
                            map.record_signature(&id, sig);
                        }
                    }
                    out.extend(writer.on_complete_tool_call(&ExtractedToolCall {
                        id,
                        name: call.name.clone(),
                        input: call.args.clone(),
                    }));
                } else if let Some(text) = &part.text {
                    if part.thought.unwrap_or(false) {
                        out.extend(writer.on_reasoning_text(text));
                    } else if !text.is_empty() {
                        out.extend(writer.on_text(text));
                    }
                }
            }
        }

        if let Some(reason) = &candidate.finish_reason {
            let mapped = match reason.as_str() {
                "MAX_TOKENS" => oai::FinishReason::Length,
                _ => oai::FinishReason::Stop,
            };
            out.extend(writer.on_finish(mapped));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::DefaultAdapter;
    use serde_json::json;

    fn frame_json(v: serde_json::Value) -> gemini::GenerateContentResponse {
        serde_json::from_value(v).expect("valid frame")
    }

    #[test]
    fn test_function_call_part_becomes_tool_use_and_records_name() {
        let name_map = Arc::new(Mutex::new(ToolNameMap::new()));
        let mut writer = EventWriter::new("g/gemini-2.5-pro", vec![], Box::new(DefaultAdapter));
        let _ = writer.start();

        let frame = frame_json(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{
                        "functionCall": {"name": "Read", "args": {"file_path": "/tmp/a"}},
                        "thoughtSignature": "c2lnbmF0dXJl"
                    }]
                }
            }]
        }));

        let frames = apply_gemini_frame(&mut writer, &frame, &name_map);
        let joined = frames.join("");
        assert!(joined.contains("tool_use"));
        assert!(joined.contains("Read"));

        // the minted id resolves names and signatures on later turns
        let map = name_map.lock();
        assert_eq!(map.len(), 1);
        let start = frames
            .iter()
            .find(|f| f.contains("content_block_start"))
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(
            start.lines().nth(1).unwrap().strip_prefix("data: ").unwrap(),
        )
        .unwrap();
        let id = v["content_block"]["id"].as_str().unwrap();
        assert_eq!(map.lookup(id), Some("Read"));
        assert_eq!(map.signature(id), Some("c2lnbmF0dXJl"));
    }

    #[test]
    fn test_thought_parts_become_thinking_deltas() {
        let name_map = Arc::new(Mutex::new(ToolNameMap::new()));
        let mut writer = EventWriter::new("g/gemini-2.5-pro", vec![], Box::new(DefaultAdapter));
        let _ = writer.start();

        let frame = frame_json(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "planning the answer", "thought": true},
                        {"text": "The answer is 4."}
                    ]
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5}
        }));

        let frames = apply_gemini_frame(&mut writer, &frame, &name_map);
        let joined = frames.join("");
        assert!(joined.contains("thinking_delta"));
        assert!(joined.contains("text_delta"));

        let usage = writer.usage_or_estimate();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
    }
}
