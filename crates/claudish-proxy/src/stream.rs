//! Streaming state machine
//!
//! Consumes upstream deltas and emits a well-formed Anthropic SSE stream:
//! `message_start → ping → content blocks → message_delta → message_stop →
//! [DONE]`. A single [`EventWriter`] per request enforces the block
//! interlock (text / thinking / tool_use never overlap, indices are
//! monotonic, every start gets a stop) and runs tool-call validation on the
//! way out.
//!
//! The writer is synchronous and returns ready-to-send SSE frames; the async
//! reader loops in the handlers drive it and own the socket. That keeps the
//! ordering guarantee trivial (one producer) and the machine testable
//! without a network.

use crate::adapters::{ExtractedToolCall, ModelAdapter, TextOutcome};
use crate::ids::new_message_id;
use crate::middleware::{MiddlewareChain, StreamMetadata};
use crate::recovery::{contains_tool_call_signature, extract_embedded_tool_calls, validate_tool_call};
use claudish_core::anthropic::{
    ContentBlockStart, ContentDelta, DeltaUsage, ErrorData, MessageDeltaData, MessageStart,
    Role, StopReason, StreamEvent, Tool, Usage,
};
use claudish_core::openai as oai;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Text buffers that look like a tool call being written out are withheld
/// only while they stay under this size; past it, it's prose.
const WITHHOLD_LIMIT: usize = 1_000;

/// Serialize one event as an SSE frame.
pub fn frame(event: &StreamEvent) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {}\n\n", event.event_name(), data)
}

/// The closing sentinel.
pub fn done_sentinel() -> String {
    "data: [DONE]\n\n".to_string()
}

// ============================================================================
// SSE parsing
// ============================================================================

/// Incremental parser for `data:`-framed SSE bodies. Upstream chunks split
/// frames arbitrarily; feed bytes in, take complete `data` payloads out.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut payloads = Vec::new();

        while let Some(end) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..end + 2).collect();
            for line in event.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    payloads.push(data.trim_start().to_string());
                }
            }
        }

        payloads
    }
}

// ============================================================================
// Per-stream tool state
// ============================================================================

#[derive(Debug)]
struct ToolBlockState {
    id: String,
    name: String,
    /// Anthropic-side block index, assigned when the block opens.
    block_index: Option<usize>,
    /// content_block_start has been emitted.
    started: bool,
    closed: bool,
    /// Accumulated argument JSON.
    args: String,
    /// With schemas available, args are held back for validation and the
    /// block opens only once the call is known good.
    buffered: bool,
}

/// How a stream ended, for the final message_delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpstreamFinish {
    Stop,
    Length,
    ToolCalls,
}

pub struct EventWriter {
    model: String,
    message_id: String,
    adapter: Box<dyn ModelAdapter>,
    schemas: Vec<Tool>,

    next_index: usize,
    text_index: Option<usize>,
    reasoning_index: Option<usize>,
    /// Reasoning never re-opens once answer text has started.
    text_seen: bool,
    tools: HashMap<usize, ToolBlockState>,

    /// All cleaned text, for signature checks, NL extraction, and token
    /// estimation.
    accumulated_text: String,
    /// Cleaned text not yet emitted (withheld pending signature resolution).
    unsent_text: String,
    withholding: bool,

    /// Structured calls already emitted, for dedup against the NL extractor.
    emitted_calls: Vec<(String, serde_json::Value)>,
    any_tool_use: bool,

    finish: Option<UpstreamFinish>,
    usage: Option<Usage>,
    finalized: bool,

    /// Middleware scratch for this stream.
    pub metadata: StreamMetadata,
}

impl EventWriter {
    pub fn new(model: &str, schemas: Vec<Tool>, adapter: Box<dyn ModelAdapter>) -> Self {
        let message_id = new_message_id();
        let mut metadata = StreamMetadata::default();
        metadata.message_id = message_id.clone();
        Self {
            model: model.to_string(),
            message_id,
            adapter,
            schemas,
            next_index: 0,
            text_index: None,
            reasoning_index: None,
            text_seen: false,
            tools: HashMap::new(),
            accumulated_text: String::new(),
            unsent_text: String::new(),
            withholding: false,
            emitted_calls: Vec::new(),
            any_tool_use: false,
            finish: None,
            usage: None,
            finalized: false,
            metadata,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Opening frames: message_start then the first ping.
    pub fn start(&mut self) -> Vec<String> {
        self.adapter.reset();
        vec![
            frame(&StreamEvent::MessageStart {
                message: MessageStart {
                    id: self.message_id.clone(),
                    message_type: "message".to_string(),
                    role: Role::Assistant,
                    content: vec![],
                    model: self.model.clone(),
                    stop_reason: None,
                    usage: Usage::default(),
                },
            }),
            frame(&StreamEvent::Ping),
        ]
    }

    pub fn ping(&self) -> String {
        frame(&StreamEvent::Ping)
    }

    /// Keep-alive pings go out only between blocks, never inside one.
    pub fn can_ping(&self) -> bool {
        !self.finalized
            && self.text_index.is_none()
            && self.reasoning_index.is_none()
            && !self.tools.values().any(|t| t.started && !t.closed)
    }

    // ------------------------------------------------------------------
    // Block plumbing
    // ------------------------------------------------------------------

    fn close_reasoning(&mut self, frames: &mut Vec<String>) {
        if let Some(idx) = self.reasoning_index.take() {
            frames.push(frame(&StreamEvent::ContentBlockStop { index: idx }));
        }
    }

    fn close_text(&mut self, frames: &mut Vec<String>) {
        if let Some(idx) = self.text_index.take() {
            frames.push(frame(&StreamEvent::ContentBlockStop { index: idx }));
        }
    }

    fn open_text(&mut self, frames: &mut Vec<String>) -> usize {
        if let Some(idx) = self.text_index {
            return idx;
        }
        self.close_reasoning(frames);
        let idx = self.next_index;
        self.next_index += 1;
        self.text_index = Some(idx);
        self.text_seen = true;
        frames.push(frame(&StreamEvent::ContentBlockStart {
            index: idx,
            content_block: ContentBlockStart::Text {
                text: String::new(),
            },
        }));
        idx
    }

    fn open_reasoning(&mut self, frames: &mut Vec<String>) -> Option<usize> {
        if let Some(idx) = self.reasoning_index {
            return Some(idx);
        }
        if self.text_seen {
            // The interlock forbids reasoning after answer text.
            return None;
        }
        let idx = self.next_index;
        self.next_index += 1;
        self.reasoning_index = Some(idx);
        frames.push(frame(&StreamEvent::ContentBlockStart {
            index: idx,
            content_block: ContentBlockStart::Thinking {
                thinking: String::new(),
                signature: String::new(),
            },
        }));
        Some(idx)
    }

    // ------------------------------------------------------------------
    // Text path
    // ------------------------------------------------------------------

    /// Feed one upstream text delta through the adapter and out to the
    /// client, unless the buffer looks like a tool call being typed out.
    pub fn on_text(&mut self, raw: &str) -> Vec<String> {
        let outcome = self.adapter.process_text(raw);
        self.apply_text_outcome(outcome)
    }

    fn apply_text_outcome(&mut self, outcome: TextOutcome) -> Vec<String> {
        let mut frames = Vec::new();

        for call in outcome.extracted_calls {
            self.emit_complete_tool_call(&call, &mut frames);
        }

        if !outcome.text.is_empty() {
            self.accumulated_text.push_str(&outcome.text);
            self.unsent_text.push_str(&outcome.text);
        }

        // Structured-signature check over everything seen so far. Small
        // buffers that look like a call get withheld and resolved at
        // finalise; big ones are prose that mentions the syntax.
        if !self.withholding
            && self.accumulated_text.len() < WITHHOLD_LIMIT
            && contains_tool_call_signature(&self.accumulated_text, &self.schemas)
        {
            self.withholding = true;
            debug!("withholding text: tool-call signature in buffer");
        }
        if self.withholding && self.accumulated_text.len() >= WITHHOLD_LIMIT {
            self.withholding = false;
        }

        if !self.withholding && !self.unsent_text.is_empty() {
            let text = std::mem::take(&mut self.unsent_text);
            let idx = self.open_text(&mut frames);
            frames.push(frame(&StreamEvent::ContentBlockDelta {
                index: idx,
                delta: ContentDelta::TextDelta { text },
            }));
        }

        frames
    }

    // ------------------------------------------------------------------
    // Reasoning path
    // ------------------------------------------------------------------

    /// Visible reasoning (reasoning_content, reasoning.text details, Gemini
    /// thought parts) becomes a thinking block.
    pub fn on_reasoning_text(&mut self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        let mut frames = Vec::new();
        match self.open_reasoning(&mut frames) {
            Some(idx) => {
                frames.push(frame(&StreamEvent::ContentBlockDelta {
                    index: idx,
                    delta: ContentDelta::ThinkingDelta {
                        thinking: text.to_string(),
                    },
                }));
            }
            None => debug!("dropping late reasoning after answer text"),
        }
        frames
    }

    // ------------------------------------------------------------------
    // Structured tool-call path
    // ------------------------------------------------------------------

    /// One upstream tool-call delta: a new name materialises an entry,
    /// argument fragments accumulate (streamed through only when no schema
    /// is available to validate against).
    pub fn on_tool_delta(
        &mut self,
        upstream_index: usize,
        id: Option<&str>,
        name: Option<&str>,
        args: Option<&str>,
    ) -> Vec<String> {
        let mut frames = Vec::new();

        if let Some(name) = name {
            if !self.tools.contains_key(&upstream_index) {
                self.close_text(&mut frames);
                self.close_reasoning(&mut frames);

                let buffered = !self.schemas.is_empty();
                let id = id
                    .map(str::to_string)
                    .unwrap_or_else(crate::ids::new_tool_id);

                let mut entry = ToolBlockState {
                    id,
                    name: name.to_string(),
                    block_index: None,
                    started: false,
                    closed: false,
                    args: String::new(),
                    buffered,
                };

                if !buffered {
                    // No schema to validate against: stream as it comes.
                    let idx = self.next_index;
                    self.next_index += 1;
                    entry.block_index = Some(idx);
                    entry.started = true;
                    frames.push(frame(&StreamEvent::ContentBlockStart {
                        index: idx,
                        content_block: ContentBlockStart::ToolUse {
                            id: entry.id.clone(),
                            name: entry.name.clone(),
                            input: serde_json::json!({}),
                        },
                    }));
                }

                self.tools.insert(upstream_index, entry);
            }
        }

        if let Some(args) = args {
            if !args.is_empty() {
                if let Some(entry) = self.tools.get_mut(&upstream_index) {
                    entry.args.push_str(args);
                    if entry.started && !entry.buffered && !entry.closed {
                        let idx = entry.block_index.expect("started entry has index");
                        frames.push(frame(&StreamEvent::ContentBlockDelta {
                            index: idx,
                            delta: ContentDelta::InputJsonDelta {
                                partial_json: args.to_string(),
                            },
                        }));
                    }
                } else {
                    warn!("tool args for unknown upstream index {}", upstream_index);
                }
            }
        }

        frames
    }

    /// A call that arrived whole (Gemini functionCall parts): validate and
    /// emit as one open/delta/stop triple.
    pub fn on_complete_tool_call(&mut self, call: &ExtractedToolCall) -> Vec<String> {
        let mut frames = Vec::new();
        self.emit_complete_tool_call(call, &mut frames);
        frames
    }

    /// Emit a complete, adapter- or extractor-recovered call as one block.
    fn emit_complete_tool_call(&mut self, call: &ExtractedToolCall, frames: &mut Vec<String>) {
        let args_json = call.input.to_string();
        let outcome =
            validate_tool_call(&call.name, &args_json, &self.schemas, &self.accumulated_text);

        if !outcome.valid {
            self.emit_validation_failure(&call.name, &outcome.missing_params, frames);
            return;
        }

        self.close_text(frames);
        self.close_reasoning(frames);

        let idx = self.next_index;
        self.next_index += 1;
        frames.push(frame(&StreamEvent::ContentBlockStart {
            index: idx,
            content_block: ContentBlockStart::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: serde_json::json!({}),
            },
        }));
        frames.push(frame(&StreamEvent::ContentBlockDelta {
            index: idx,
            delta: ContentDelta::InputJsonDelta {
                partial_json: outcome.args.to_string(),
            },
        }));
        frames.push(frame(&StreamEvent::ContentBlockStop { index: idx }));

        self.emitted_calls
            .push((call.name.clone(), outcome.args.clone()));
        self.any_tool_use = true;
    }

    /// A user-visible note replacing a broken call that couldn't be
    /// repaired; the call itself is never forwarded.
    fn emit_validation_failure(
        &mut self,
        name: &str,
        missing: &[String],
        frames: &mut Vec<String>,
    ) {
        let message = format!(
            "\n[tool call `{}` dropped: missing required parameters: {}]\n",
            name,
            missing.join(", ")
        );
        warn!("dropping invalid tool call {}: missing {:?}", name, missing);

        // A dedicated text block, closed immediately.
        self.close_text(frames);
        self.close_reasoning(frames);
        let idx = self.next_index;
        self.next_index += 1;
        frames.push(frame(&StreamEvent::ContentBlockStart {
            index: idx,
            content_block: ContentBlockStart::Text {
                text: String::new(),
            },
        }));
        frames.push(frame(&StreamEvent::ContentBlockDelta {
            index: idx,
            delta: ContentDelta::TextDelta { text: message },
        }));
        frames.push(frame(&StreamEvent::ContentBlockStop { index: idx }));
    }

    /// Resolve every pending tool entry: validate, repair, emit or drop.
    fn resolve_tool_entries(&mut self, frames: &mut Vec<String>) {
        let mut indices: Vec<usize> = self.tools.keys().copied().collect();
        indices.sort_unstable();

        for upstream_idx in indices {
            let (name, id, args, started, closed, block_index) = {
                let entry = &self.tools[&upstream_idx];
                (
                    entry.name.clone(),
                    entry.id.clone(),
                    entry.args.clone(),
                    entry.started,
                    entry.closed,
                    entry.block_index,
                )
            };
            if closed {
                continue;
            }

            if started {
                // Args already streamed; just close.
                let idx = block_index.expect("started entry has index");
                frames.push(frame(&StreamEvent::ContentBlockStop { index: idx }));
                if let Some(entry) = self.tools.get_mut(&upstream_idx) {
                    entry.closed = true;
                }
                self.any_tool_use = true;
                if let Ok(v) = serde_json::from_str(&args) {
                    self.emitted_calls.push((name, v));
                }
                continue;
            }

            // Buffered entry: validate against the schema, repairing from
            // the surrounding text when parameters are missing.
            let outcome = validate_tool_call(&name, &args, &self.schemas, &self.accumulated_text);
            if outcome.valid {
                self.close_text(frames);
                self.close_reasoning(frames);
                let idx = self.next_index;
                self.next_index += 1;
                frames.push(frame(&StreamEvent::ContentBlockStart {
                    index: idx,
                    content_block: ContentBlockStart::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: serde_json::json!({}),
                    },
                }));
                frames.push(frame(&StreamEvent::ContentBlockDelta {
                    index: idx,
                    delta: ContentDelta::InputJsonDelta {
                        partial_json: outcome.args.to_string(),
                    },
                }));
                frames.push(frame(&StreamEvent::ContentBlockStop { index: idx }));
                self.any_tool_use = true;
                self.emitted_calls.push((name, outcome.args));
            } else {
                self.emit_validation_failure(&name, &outcome.missing_params, frames);
            }

            if let Some(entry) = self.tools.get_mut(&upstream_idx) {
                entry.closed = true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Stream end
    // ------------------------------------------------------------------

    pub fn on_finish(&mut self, reason: oai::FinishReason) -> Vec<String> {
        let mut frames = Vec::new();
        self.finish = Some(match reason {
            oai::FinishReason::Stop | oai::FinishReason::ContentFilter => UpstreamFinish::Stop,
            oai::FinishReason::Length => UpstreamFinish::Length,
            oai::FinishReason::ToolCalls => UpstreamFinish::ToolCalls,
        });
        if reason == oai::FinishReason::ToolCalls {
            self.resolve_tool_entries(&mut frames);
        }
        frames
    }

    pub fn set_usage(&mut self, input_tokens: u32, output_tokens: u32) {
        self.usage = Some(Usage {
            input_tokens,
            output_tokens,
        });
    }

    /// Reported usage, or an estimate from the text length when the
    /// upstream omitted it.
    pub fn usage_or_estimate(&self) -> Usage {
        self.usage.unwrap_or(Usage {
            input_tokens: 0,
            output_tokens: crate::tokens::estimate_tokens(self.accumulated_text.len()),
        })
    }

    /// Handle one parsed OpenAI chunk end to end, middleware included.
    pub fn on_openai_chunk(
        &mut self,
        chunk: &oai::ChatCompletionChunk,
        middleware: &MiddlewareChain,
    ) -> Vec<String> {
        let mut frames = Vec::new();

        if let Some(usage) = &chunk.usage {
            self.set_usage(usage.prompt_tokens, usage.completion_tokens);
        }

        for choice in &chunk.choices {
            let delta = &choice.delta;

            middleware.after_stream_chunk(&mut self.metadata, delta);

            if let Some(reasoning) = &delta.reasoning_content {
                frames.extend(self.on_reasoning_text(reasoning));
            }

            if let Some(details) = &delta.reasoning_details {
                for raw in details {
                    let detail = oai::ReasoningDetail(raw);
                    match detail.kind() {
                        oai::ReasoningKind::Text | oai::ReasoningKind::Summary => {
                            if let Some(text) = detail.text() {
                                frames.extend(self.on_reasoning_text(text));
                            }
                        }
                        // Encrypted entries never reach the client; the
                        // middleware captured them above for replay.
                        oai::ReasoningKind::Encrypted | oai::ReasoningKind::Other => {}
                    }
                }
            }

            if let Some(content) = &delta.content {
                if !content.is_empty() {
                    frames.extend(self.on_text(content));
                }
            }

            if let Some(tool_calls) = &delta.tool_calls {
                for tc in tool_calls {
                    frames.extend(self.on_tool_delta(
                        tc.index,
                        tc.id.as_deref(),
                        tc.function.as_ref().and_then(|f| f.name.as_deref()),
                        tc.function.as_ref().and_then(|f| f.arguments.as_deref()),
                    ));
                }
            }

            if let Some(reason) = choice.finish_reason {
                frames.extend(self.on_finish(reason));
            }
        }

        frames
    }

    /// Normal finalisation: drain the adapter, run the text-embedded
    /// extractor, close everything, and emit the tail frames. Idempotent.
    pub fn finalize(&mut self) -> Vec<String> {
        if self.finalized {
            return Vec::new();
        }
        self.finalized = true;

        let mut frames = Vec::new();

        // Drain whatever the adapter still buffers.
        let leftover = self.adapter.flush();
        for call in leftover.extracted_calls.clone() {
            self.emit_complete_tool_call(&call, &mut frames);
        }
        if !leftover.text.is_empty() {
            self.accumulated_text.push_str(&leftover.text);
            self.unsent_text.push_str(&leftover.text);
        }

        // Any tool entries the upstream never resolved with a finish_reason.
        self.resolve_tool_entries(&mut frames);

        // Finalise-time extraction of calls written out as text. The
        // structured path is authoritative; identical calls are skipped.
        if !self.schemas.is_empty() {
            let extracted = extract_embedded_tool_calls(&self.accumulated_text, &self.schemas);
            let mut converted_any = false;
            for call in extracted {
                let duplicate = self
                    .emitted_calls
                    .iter()
                    .any(|(name, args)| *name == call.name && *args == call.input);
                if duplicate {
                    continue;
                }
                self.close_text(&mut frames);
                self.emit_complete_tool_call(&call, &mut frames);
                converted_any = true;
            }
            if converted_any {
                // The withheld writeout was converted; don't echo it as text.
                self.unsent_text.clear();
            }
        }

        // Withheld text that never turned into a call is real content.
        if !self.unsent_text.is_empty() {
            let text = std::mem::take(&mut self.unsent_text);
            let idx = self.open_text(&mut frames);
            frames.push(frame(&StreamEvent::ContentBlockDelta {
                index: idx,
                delta: ContentDelta::TextDelta { text },
            }));
        }

        self.close_text(&mut frames);
        self.close_reasoning(&mut frames);

        // tool_use only when tool blocks actually reached the client; a
        // dropped broken call must not leave the agent waiting for results.
        let stop_reason = if self.any_tool_use {
            StopReason::ToolUse
        } else {
            match self.finish {
                Some(UpstreamFinish::Length) => StopReason::MaxTokens,
                _ => StopReason::EndTurn,
            }
        };

        let usage = self.usage_or_estimate();
        frames.push(frame(&StreamEvent::MessageDelta {
            delta: MessageDeltaData {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens: usage.output_tokens,
            },
        }));
        frames.push(frame(&StreamEvent::MessageStop));
        frames.push(done_sentinel());

        frames
    }

    /// Error finalisation: close open blocks, emit the error event and the
    /// sentinel. Idempotent like [`finalize`](Self::finalize).
    pub fn finalize_error(&mut self, error_type: &str, message: &str) -> Vec<String> {
        if self.finalized {
            return Vec::new();
        }
        self.finalized = true;

        let mut frames = Vec::new();
        self.close_text(&mut frames);
        self.close_reasoning(&mut frames);
        for entry in self.tools.values_mut() {
            if entry.started && !entry.closed {
                frames.push(frame(&StreamEvent::ContentBlockStop {
                    index: entry.block_index.expect("started entry has index"),
                }));
                entry.closed = true;
            }
        }

        frames.push(frame(&StreamEvent::Error {
            error: ErrorData {
                error_type: error_type.to_string(),
                message: message.to_string(),
            },
        }));
        frames.push(done_sentinel());
        frames
    }

    /// Total cleaned text seen this stream.
    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }
}
