//! Anthropic-dialect handler
//!
//! Covers the native pass-through (api.anthropic.com, also the observer-mode
//! target) and the Anthropic-compatible aggregators (MiniMax, Kimi). The
//! body already speaks the right dialect; the native path forwards the
//! client's bytes untouched, the compat path only rewrites the model name
//! and applies hygiene no compat backend tolerates violations of.

use super::{sse_response, CompletionGuard, HandlerDeps};
use crate::registry::{ProviderSpec, Resolution};
use crate::retry::{classify_error_response, send_with_retry};
use crate::stream::SseParser;
use crate::tokens::{ContextWindowSource, UsageTracker};
use axum::http::{header, StatusCode};
use axum::response::Response;
use claudish_core::anthropic::{Content, ContentBlock, Message, MessagesRequest};
use claudish_core::GatewayError;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CLAUDE_WINDOW: u32 = 200_000;

pub struct AnthropicHandler {
    provider: ProviderSpec,
    model: String,
    deps: HandlerDeps,
    credential: Result<Option<String>, GatewayError>,
    pub(super) tracker: Arc<Mutex<UsageTracker>>,
}

impl AnthropicHandler {
    pub fn new(resolution: Resolution, deps: HandlerDeps) -> Self {
        let Resolution {
            provider,
            model_name,
        } = resolution;
        let credential = provider.credential();
        let mut tracker = UsageTracker::new(&provider.name, &model_name, false, deps.port);
        match deps.settings.context_window_override {
            Some(w) => tracker.set_context_window(w, ContextWindowSource::Env),
            None => tracker.set_context_window(CLAUDE_WINDOW, ContextWindowSource::Default),
        }
        Self {
            provider,
            model: model_name,
            deps,
            credential,
            tracker: Arc::new(Mutex::new(tracker)),
        }
    }

    pub fn is_native(&self) -> bool {
        self.provider.name == "anthropic"
    }

    fn credential(&self) -> Result<String, GatewayError> {
        match &self.credential {
            Ok(Some(key)) => Ok(key.clone()),
            Ok(None) => Err(GatewayError::Internal(
                "anthropic-compat requires a credential".into(),
            )),
            Err(GatewayError::MissingCredential { env, hint }) => {
                Err(GatewayError::MissingCredential {
                    env: env.clone(),
                    hint: hint.clone(),
                })
            }
            Err(_) => Err(GatewayError::Internal("credential state corrupt".into())),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}{}", self.provider.base_url, self.provider.api_path)
    }

    pub async fn handle(
        &self,
        request: MessagesRequest,
        raw_body: Bytes,
    ) -> Result<Response, GatewayError> {
        let api_key = self.credential()?;
        let streaming = request.stream.unwrap_or(false);

        // Native with an unchanged model name forwards the client's exact
        // bytes; anything else re-serialises with the rewritten model.
        let body = if self.is_native() && request.model == self.model {
            raw_body
        } else {
            let mut rewritten = request.clone();
            rewritten.model = self.model.clone();
            rewritten.max_tokens = rewritten
                .max_tokens
                .min(self.deps.settings.max_output_tokens);
            strip_unsigned_thinking_blocks(&mut rewritten.messages);
            Bytes::from(serde_json::to_vec(&rewritten)?)
        };

        debug!("dispatching {} → {}", request.model, self.messages_url());

        let http = self.deps.http.clone();
        let url = self.messages_url();
        let resp = send_with_retry(&self.provider, move || {
            http.post(&url)
                .header("x-api-key", &api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("Content-Type", "application/json")
                .body(body.clone())
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
            Ok(self.passthrough_stream(resp))
        } else {
            self.passthrough_json(resp).await
        }
    }

    /// Forward the SSE bytes untouched, skimming usage figures for the
    /// session counters as frames go by.
    fn passthrough_stream(&self, resp: reqwest::Response) -> Response {
        let mut guard = CompletionGuard::new(self.tracker.clone());

        let stream = async_stream::stream! {
            let mut parser = SseParser::new();
            let mut input_tokens = 0u32;
            let mut output_tokens = 0u32;
            let mut body = resp.bytes_stream();

            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        for payload in parser.feed(&bytes) {
                            if payload == "[DONE]" {
                                continue;
                            }
                            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&payload) {
                                match v["type"].as_str() {
                                    Some("message_start") => {
                                        if let Some(n) = v["message"]["usage"]["input_tokens"].as_u64() {
                                            input_tokens = n as u32;
                                        }
                                    }
                                    Some("message_delta") => {
                                        if let Some(n) = v["usage"]["output_tokens"].as_u64() {
                                            output_tokens = n as u32;
                                        }
                                    }
                                    _ => {}
                                }
                            }
                        }
                        guard.observe(input_tokens, output_tokens);
                        yield Ok(String::from_utf8_lossy(&bytes).into_owned());
                    }
                    Err(e) => {
                        warn!("passthrough stream error: {}", e);
                        let error = serde_json::json!({
                            "type": "error",
                            "error": {"type": "connection_error", "message": e.to_string()}
                        });
                        yield Ok(format!("event: error\ndata: {}\n\ndata: [DONE]\n\n", error));
                        break;
                    }
                }
            }

            guard.record(input_tokens, output_tokens);
        };

        sse_response(stream)
    }

    async fn passthrough_json(&self, resp: reqwest::Response) -> Result<Response, GatewayError> {
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| GatewayError::Api {
            status: 502,
            message: format!("error reading {} response: {}", self.provider.name, e),
        })?;

        if let Ok(v) = serde_json::from_slice::<serde_json::Value>(&body) {
            let input = v["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
            let output = v["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;
            if input > 0 || output > 0 {
                self.tracker.lock().record(input, output);
            }
        }

        Ok(Response::builder()
            .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK))
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(body))
            .expect("static response parts"))
    }

    /// Forward a count_tokens call verbatim (native only).
    pub async fn count_tokens(&self, raw_body: Bytes) -> Result<Response, GatewayError> {
        let api_key = self.credential()?;
        let url = format!("{}/v1/messages/count_tokens", self.provider.base_url);

        let http = self.deps.http.clone();
        let resp = send_with_retry(&self.provider, move || {
            http.post(&url)
                .header("x-api-key", &api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("Content-Type", "application/json")
                .body(raw_body.clone())
        })
        .await?;

        let status = resp.status();
        let body = resp.bytes().await.unwrap_or_default();
        Ok(Response::builder()
            .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK))
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(body))
            .expect("static response parts"))
    }
}

/// Thinking blocks without signatures come from non-Anthropic history (or
/// agent-side reconstruction); real Claude rejects them, so they are
/// stripped before forwarding.
fn strip_unsigned_thinking_blocks(messages: &mut [Message]) {
    for msg in messages.iter_mut() {
        if let Content::Blocks(blocks) = &mut msg.content {
            blocks.retain(|block| match block {
                ContentBlock::Thinking { signature, .. } => !signature.is_empty(),
                _ => true,
            });
        }
    }
}
