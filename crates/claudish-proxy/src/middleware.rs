//! Middleware chain
//!
//! Cross-cutting hooks around a request: `before_request` on the outbound
//! OpenAI-dialect body, `after_stream_chunk` per upstream delta, and
//! `after_stream_complete` once the stream finalises. Hooks run in
//! registration order, synchronously.
//!
//! The one concrete middleware replays Gemini's encrypted thought signatures:
//! OpenRouter 400s a tool-using Gemini conversation when the assistant turn
//! that made the calls comes back without its `reasoning_details`.

use claudish_core::openai as oai;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Per-stream scratch the middleware hooks write into. Owned by the
/// streaming machine, one per request.
#[derive(Debug, Default)]
pub struct StreamMetadata {
    /// The message id the proxy minted for this response.
    pub message_id: String,
    /// Every `reasoning_details` entry the upstream emitted, in order.
    pub reasoning_details: Vec<serde_json::Value>,
    /// Every tool-call id observed in the stream.
    pub tool_call_ids: HashSet<String>,
}

pub trait Middleware: Send + Sync {
    fn before_request(&self, request: &mut oai::ChatCompletionRequest) {
        let _ = request;
    }

    fn after_stream_chunk(&self, meta: &mut StreamMetadata, delta: &oai::ChunkDelta) {
        let _ = (meta, delta);
    }

    fn after_stream_complete(&self, meta: &StreamMetadata) {
        let _ = meta;
    }
}

#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn before_request(&self, request: &mut oai::ChatCompletionRequest) {
        for m in &self.middlewares {
            m.before_request(request);
        }
    }

    pub fn after_stream_chunk(&self, meta: &mut StreamMetadata, delta: &oai::ChunkDelta) {
        for m in &self.middlewares {
            m.after_stream_chunk(meta, delta);
        }
    }

    pub fn after_stream_complete(&self, meta: &StreamMetadata) {
        for m in &self.middlewares {
            m.after_stream_complete(meta);
        }
    }
}

// ============================================================================
// Gemini reasoning replay
// ============================================================================

#[derive(Debug, Clone)]
struct CachedReasoning {
    details: Vec<serde_json::Value>,
    tool_call_ids: HashSet<String>,
}

/// Process-wide cache of reasoning blobs keyed by generated message id.
/// Eviction is not required for correctness, but the cache is bounded so a
/// very long session can't grow it without limit.
#[derive(Default)]
pub struct ReasoningReplayCache {
    entries: Mutex<Vec<(String, CachedReasoning)>>,
}

const MAX_CACHED_MESSAGES: usize = 256;

impl ReasoningReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, message_id: String, cached: CachedReasoning) {
        let mut entries = self.entries.lock();
        if entries.len() >= MAX_CACHED_MESSAGES {
            entries.remove(0);
        }
        entries.push((message_id, cached));
    }

    /// The reasoning details cached for any assistant turn whose tool-call
    /// ids intersect `ids`.
    fn find_for_calls(&self, ids: &HashSet<&str>) -> Option<Vec<serde_json::Value>> {
        let entries = self.entries.lock();
        entries
            .iter()
            .rev()
            .find(|(_, cached)| {
                cached
                    .tool_call_ids
                    .iter()
                    .any(|id| ids.contains(id.as_str()))
            })
            .map(|(_, cached)| cached.details.clone())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

pub struct GeminiReasoningReplay {
    cache: Arc<ReasoningReplayCache>,
}

impl GeminiReasoningReplay {
    pub fn new(cache: Arc<ReasoningReplayCache>) -> Self {
        Self { cache }
    }
}

impl Middleware for GeminiReasoningReplay {
    fn before_request(&self, request: &mut oai::ChatCompletionRequest) {
        for msg in request.messages.iter_mut() {
            if msg.role != oai::Role::Assistant {
                continue;
            }
            let Some(tool_calls) = &msg.tool_calls else {
                continue;
            };
            let ids: HashSet<&str> = tool_calls.iter().map(|tc| tc.id.as_str()).collect();
            if ids.is_empty() {
                continue;
            }
            if let Some(details) = self.cache.find_for_calls(&ids) {
                msg.reasoning_details = Some(details);
            }
        }
    }

    fn after_stream_chunk(&self, meta: &mut StreamMetadata, delta: &oai::ChunkDelta) {
        if let Some(details) = &delta.reasoning_details {
            meta.reasoning_details.extend(details.iter().cloned());
        }
        if let Some(tool_calls) = &delta.tool_calls {
            for tc in tool_calls {
                if let Some(id) = &tc.id {
                    meta.tool_call_ids.insert(id.clone());
                }
            }
        }
    }

    fn after_stream_complete(&self, meta: &StreamMetadata) {
        // Only worth caching when the turn made tool calls: text-only turns
        // are never replayed with their signatures.
        if meta.reasoning_details.is_empty() || meta.tool_call_ids.is_empty() {
            return;
        }
        self.cache.store(
            meta.message_id.clone(),
            CachedReasoning {
                details: meta.reasoning_details.clone(),
                tool_call_ids: meta.tool_call_ids.clone(),
            },
        );
    }
}
