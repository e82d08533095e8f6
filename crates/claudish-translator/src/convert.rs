//! Anthropic → OpenAI conversion
//!
//! Flattens Anthropic content-block messages into the OpenAI chat shape:
//! tool results become `tool` role messages, images become data-URL content
//! parts, assistant tool uses become `tool_calls`. The reverse direction is
//! handled chunk-wise by the streaming machine; only finish-reason mapping
//! lives here.

use claudish_core::{anthropic, openai};
use std::collections::HashSet;

use crate::tools::{prepare_tool, ToolSummaryMode};

/// Convert a full Anthropic conversation to OpenAI messages.
///
/// `system` is the already-decorated system prompt (see [`crate::prompts`]).
/// With `simple_format` set, the output degrades to plain-text user messages
/// for backends that reject content-part arrays and `tool` roles.
pub fn anthropic_request_to_openai(
    messages: &[anthropic::Message],
    system: Option<&str>,
    simple_format: bool,
) -> Vec<openai::Message> {
    let mut result = Vec::with_capacity(messages.len() + 1);

    if let Some(sys) = system {
        result.push(openai::Message::text(openai::Role::System, sys));
    }

    for msg in messages {
        match msg.role {
            anthropic::Role::User => {
                result.extend(user_message_to_openai(&msg.content.blocks(), simple_format));
            }
            anthropic::Role::Assistant => {
                if let Some(m) = assistant_message_to_openai(&msg.content.blocks()) {
                    result.push(m);
                }
            }
        }
    }

    result
}

/// A user turn splits into tool-result messages (one per unique tool_use_id)
/// followed by a single user message carrying the interleaved text and
/// image parts.
fn user_message_to_openai(
    blocks: &[anthropic::ContentBlock],
    simple_format: bool,
) -> Vec<openai::Message> {
    if simple_format {
        return vec![user_message_simple(blocks)];
    }

    let mut messages = Vec::new();
    let mut parts: Vec<openai::ContentPart> = Vec::new();
    let mut seen_results: HashSet<&str> = HashSet::new();

    for block in blocks {
        match block {
            anthropic::ContentBlock::Text { text } => {
                parts.push(openai::ContentPart::Text { text: text.clone() });
            }
            anthropic::ContentBlock::Image { source } => {
                parts.push(openai::ContentPart::ImageUrl {
                    image_url: openai::ImageUrl {
                        url: format!("data:{};base64,{}", source.media_type, source.data),
                        detail: None,
                    },
                });
            }
            anthropic::ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                // The agent occasionally duplicates a result block; upstreams
                // reject a second message for the same call id.
                if !seen_results.insert(tool_use_id.as_str()) {
                    continue;
                }
                messages.push(openai::Message {
                    role: openai::Role::Tool,
                    content: Some(openai::Content::Text(content.to_text())),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                    name: None,
                    reasoning_details: None,
                });
            }
            // tool_use / thinking never legitimately appear on user turns
            _ => {}
        }
    }

    if !parts.is_empty() {
        let content = if parts.len() == 1 {
            // Single text part collapses to a plain string; some local
            // servers only accept strings here.
            match &parts[0] {
                openai::ContentPart::Text { text } => openai::Content::Text(text.clone()),
                _ => openai::Content::Parts(parts),
            }
        } else {
            openai::Content::Parts(parts)
        };
        messages.push(openai::Message {
            role: openai::Role::User,
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            reasoning_details: None,
        });
    }

    messages
}

/// Degraded form: everything flattened into one plain-text user message,
/// images dropped.
fn user_message_simple(blocks: &[anthropic::ContentBlock]) -> openai::Message {
    let mut lines = Vec::new();
    let mut seen_results: HashSet<&str> = HashSet::new();

    for block in blocks {
        match block {
            anthropic::ContentBlock::Text { text } => lines.push(text.clone()),
            anthropic::ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                if seen_results.insert(tool_use_id.as_str()) {
                    lines.push(format!("[Tool Result]: {}", content.to_text()));
                }
            }
            _ => {}
        }
    }

    openai::Message::text(openai::Role::User, lines.join("\n"))
}

/// An assistant turn becomes exactly one OpenAI message: text blocks joined
/// with single spaces, tool uses collected into `tool_calls` (deduped by id),
/// `content: None` when only tool calls are present. Thinking blocks are
/// internal and never forwarded.
fn assistant_message_to_openai(blocks: &[anthropic::ContentBlock]) -> Option<openai::Message> {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<openai::ToolCall> = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();

    for block in blocks {
        match block {
            anthropic::ContentBlock::Text { text } => text_parts.push(text),
            anthropic::ContentBlock::ToolUse { id, name, input } => {
                if !seen_ids.insert(id.as_str()) {
                    continue;
                }
                tool_calls.push(openai::ToolCall {
                    id: id.clone(),
                    call_type: Some("function".to_string()),
                    function: openai::FunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".into()),
                    },
                    index: None,
                });
            }
            _ => {}
        }
    }

    if text_parts.is_empty() && tool_calls.is_empty() {
        return None;
    }

    let content = if text_parts.is_empty() {
        None
    } else {
        Some(openai::Content::Text(text_parts.join(" ")))
    };

    Some(openai::Message {
        role: openai::Role::Assistant,
        content,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
        name: None,
        reasoning_details: None,
    })
}

/// Convert Anthropic tools to OpenAI function definitions.
pub fn anthropic_tools_to_openai(
    tools: &[anthropic::Tool],
    mode: ToolSummaryMode,
) -> Vec<openai::Tool> {
    tools
        .iter()
        .map(|t| {
            let (description, parameters) = prepare_tool(&t.description, &t.input_schema, mode);
            openai::Tool {
                tool_type: "function".to_string(),
                function: openai::FunctionDef {
                    name: t.name.clone(),
                    description,
                    parameters,
                },
            }
        })
        .collect()
}

pub fn anthropic_tool_choice_to_openai(choice: &anthropic::ToolChoice) -> openai::ToolChoice {
    match choice {
        anthropic::ToolChoice::Auto => openai::ToolChoice::Mode("auto".into()),
        anthropic::ToolChoice::None => openai::ToolChoice::Mode("none".into()),
        anthropic::ToolChoice::Any => openai::ToolChoice::Mode("required".into()),
        anthropic::ToolChoice::Tool { name } => openai::ToolChoice::Function {
            choice_type: "function".into(),
            function: openai::ToolChoiceFunction { name: name.clone() },
        },
    }
}

pub fn finish_reason_to_stop(reason: openai::FinishReason) -> anthropic::StopReason {
    match reason {
        openai::FinishReason::Stop => anthropic::StopReason::EndTurn,
        openai::FinishReason::Length => anthropic::StopReason::MaxTokens,
        openai::FinishReason::ToolCalls => anthropic::StopReason::ToolUse,
        openai::FinishReason::ContentFilter => anthropic::StopReason::EndTurn,
    }
}

// ============================================================================
// Conversation-shape safeguards
// ============================================================================

/// Tool messages can only follow an assistant message carrying tool_calls.
/// Rewind/prune can orphan them; orphans are demoted to user text so strict
/// backends (Mistral and friends) don't reject the conversation.
pub fn fix_orphaned_tool_messages(messages: &mut [openai::Message]) {
    let mut in_tool_block = false;
    for msg in messages.iter_mut() {
        match msg.role {
            openai::Role::Assistant => {
                in_tool_block = msg
                    .tool_calls
                    .as_ref()
                    .map(|tc| !tc.is_empty())
                    .unwrap_or(false);
            }
            openai::Role::Tool => {
                if !in_tool_block {
                    let id = msg.tool_call_id.take().unwrap_or_default();
                    let body = match msg.content.take() {
                        Some(openai::Content::Text(t)) => t,
                        Some(openai::Content::Parts(_)) => "[complex content]".to_string(),
                        None => "[empty]".to_string(),
                    };
                    tracing::info!("demoting orphaned tool message for call {}", id);
                    *msg = openai::Message::text(
                        openai::Role::User,
                        format!("[Tool result for {}]: {}", id, body),
                    );
                }
                // stay in the block: several tool messages may follow one call
            }
            _ => in_tool_block = false,
        }
    }
}

/// Some OpenAI-compatible APIs require the conversation to end on a user or
/// tool turn. Appends a continuation prompt when it ends on assistant.
pub fn ensure_trailing_user_turn(messages: &mut Vec<openai::Message>) {
    if matches!(
        messages.last().map(|m| m.role),
        Some(openai::Role::Assistant)
    ) {
        messages.push(openai::Message::text(openai::Role::User, "Continue."));
    }
}
