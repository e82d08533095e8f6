//! Per-provider handlers
//!
//! A handler is the long-lived object bound to one (provider, model) pair:
//! it owns the session token counters, the Gemini tool-name map, and the
//! per-request streaming drivers. Handlers are created lazily by the router
//! on first use and cached for the life of the process.

mod anthropic;
mod gemini;
mod openai;

pub use anthropic::AnthropicHandler;
pub use gemini::GeminiHandler;
pub use openai::OpenAiHandler;

use crate::config::Settings;
use crate::health::HealthCache;
use crate::middleware::MiddlewareChain;
use crate::model_cache::ModelMetadataCache;
use crate::registry::{Dialect, Resolution};
use crate::tokens::{StatusSnapshot, UsageTracker};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use claudish_core::anthropic::MessagesRequest;
use claudish_core::GatewayError;
use parking_lot::Mutex;
use std::sync::Arc;

/// Dependencies shared by every handler, injected at construction so the
/// streaming machinery stays testable with fakes.
#[derive(Clone)]
pub struct HandlerDeps {
    pub http: reqwest::Client,
    pub settings: Arc<Settings>,
    pub middleware: MiddlewareChain,
    pub health: Arc<HealthCache>,
    pub model_cache: Arc<ModelMetadataCache>,
    /// The port this proxy is bound to; keys the status file.
    pub port: u16,
}

pub enum Handler {
    OpenAi(OpenAiHandler),
    Gemini(GeminiHandler),
    Anthropic(AnthropicHandler),
}

impl Handler {
    pub fn new(resolution: Resolution, deps: HandlerDeps) -> Self {
        match resolution.provider.dialect {
            Dialect::OpenAi => Handler::OpenAi(OpenAiHandler::new(resolution, deps)),
            Dialect::Gemini => Handler::Gemini(GeminiHandler::new(resolution, deps)),
            Dialect::AnthropicCompat => Handler::Anthropic(AnthropicHandler::new(resolution, deps)),
        }
    }

    /// Serve one `/v1/messages` request. `raw_body` is the request exactly
    /// as the client sent it, for byte-exact passthrough.
    pub async fn handle(
        &self,
        request: MessagesRequest,
        raw_body: bytes::Bytes,
    ) -> Result<Response, GatewayError> {
        match self {
            Handler::OpenAi(h) => h.handle(request).await,
            Handler::Gemini(h) => h.handle(request).await,
            Handler::Anthropic(h) => h.handle(request, raw_body).await,
        }
    }

    pub fn usage_snapshot(&self) -> StatusSnapshot {
        self.tracker().lock().snapshot()
    }

    fn tracker(&self) -> &Arc<Mutex<UsageTracker>> {
        match self {
            Handler::OpenAi(h) => &h.tracker,
            Handler::Gemini(h) => &h.tracker,
            Handler::Anthropic(h) => &h.tracker,
        }
    }

    /// The native-Anthropic handler forwards count_tokens upstream; the
    /// others estimate.
    pub fn is_anthropic_native(&self) -> bool {
        matches!(self, Handler::Anthropic(h) if h.is_native())
    }

    pub async fn count_tokens_passthrough(
        &self,
        raw_body: bytes::Bytes,
    ) -> Result<Response, GatewayError> {
        match self {
            Handler::Anthropic(h) => h.count_tokens(raw_body).await,
            _ => Err(GatewayError::Internal(
                "count_tokens passthrough on non-anthropic handler".into(),
            )),
        }
    }
}

/// Build the SSE response wrapper around a frame stream.
pub(crate) fn sse_response(
    stream: impl futures::Stream<Item = Result<String, std::convert::Infallible>> + Send + 'static,
) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .expect("static response parts")
}

/// Records session usage exactly once per stream, including when the client
/// disconnects and the generator is dropped mid-flight.
pub(crate) struct CompletionGuard {
    tracker: Arc<Mutex<UsageTracker>>,
    /// Latest usage figures observed (estimate until upstream reports).
    pending: Option<(u32, u32)>,
    recorded: bool,
}

impl CompletionGuard {
    pub fn new(tracker: Arc<Mutex<UsageTracker>>) -> Self {
        Self {
            tracker,
            pending: None,
            recorded: false,
        }
    }

    /// Update the figures that would be recorded if the stream died now.
    pub fn observe(&mut self, input_tokens: u32, output_tokens: u32) {
        self.pending = Some((input_tokens, output_tokens));
    }

    /// Record final usage; later calls and the drop path become no-ops.
    pub fn record(&mut self, input_tokens: u32, output_tokens: u32) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        self.tracker.lock().record(input_tokens, output_tokens);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.recorded {
            if let Some((input, output)) = self.pending.take() {
                self.recorded = true;
                self.tracker.lock().record(input, output);
            }
        }
    }
}
