//! Anthropic → Gemini conversion
//!
//! Gemini wants `contents[]` with roles user/model and typed `parts[]`. The
//! awkward part of the mapping: `functionResponse` requires the function
//! *name*, which the Anthropic tool_result block doesn't carry. The caller
//! owns a [`ToolNameMap`] that is fed every tool use and consulted for every
//! tool result.

use claudish_core::{anthropic, gemini};
use std::collections::HashMap;

use crate::tools::{prepare_tool, ToolSummaryMode};

/// tool_use_id → function name (and the thought signature Gemini attached to
/// the call, which must be replayed verbatim). Lives for the whole
/// conversation, i.e. the handler's lifetime. Entries are never evicted: a
/// rewound conversation may reference calls from many turns back.
#[derive(Debug, Default, Clone)]
pub struct ToolNameMap {
    names: HashMap<String, String>,
    signatures: HashMap<String, String>,
}

impl ToolNameMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, tool_use_id: &str, name: &str) {
        self.names
            .insert(tool_use_id.to_string(), name.to_string());
    }

    pub fn record_signature(&mut self, tool_use_id: &str, signature: &str) {
        if !signature.is_empty() {
            self.signatures
                .insert(tool_use_id.to_string(), signature.to_string());
        }
    }

    pub fn lookup(&self, tool_use_id: &str) -> Option<&str> {
        self.names.get(tool_use_id).map(String::as_str)
    }

    pub fn signature(&self, tool_use_id: &str) -> Option<&str> {
        self.signatures.get(tool_use_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Convert the conversation to Gemini `contents`, recording tool-use names
/// into `name_map` and resolving tool-result names out of it. A tool result
/// whose call id is unknown (conversation was rewound past our memory) is
/// dropped with a warning rather than sent nameless.
pub fn anthropic_messages_to_gemini(
    messages: &[anthropic::Message],
    name_map: &mut ToolNameMap,
) -> Vec<gemini::Content> {
    let mut contents = Vec::with_capacity(messages.len());

    for msg in messages {
        let role = match msg.role {
            anthropic::Role::User => "user",
            anthropic::Role::Assistant => "model",
        };

        let mut parts = Vec::new();
        for block in msg.content.blocks() {
            match block {
                anthropic::ContentBlock::Text { text } => {
                    parts.push(gemini::Part::text(text));
                }
                anthropic::ContentBlock::Image { source } => {
                    parts.push(gemini::Part {
                        inline_data: Some(gemini::InlineData {
                            mime_type: source.media_type,
                            data: source.data,
                        }),
                        ..Default::default()
                    });
                }
                anthropic::ContentBlock::ToolUse { id, name, input } => {
                    name_map.record(&id, &name);
                    parts.push(gemini::Part {
                        function_call: Some(gemini::FunctionCall {
                            name,
                            args: input,
                        }),
                        thought_signature: name_map.signature(&id).map(str::to_string),
                        ..Default::default()
                    });
                }
                anthropic::ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => match name_map.lookup(&tool_use_id) {
                    Some(name) => {
                        parts.push(gemini::Part {
                            function_response: Some(gemini::FunctionResponse {
                                name: name.to_string(),
                                response: serde_json::json!({
                                    "content": content.to_text()
                                }),
                            }),
                            ..Default::default()
                        });
                    }
                    None => {
                        tracing::warn!(
                            "dropping tool result for unknown call id {} (conversation rewound?)",
                            tool_use_id
                        );
                    }
                },
                // Thinking stays internal.
                anthropic::ContentBlock::Thinking { .. } => {}
            }
        }

        if !parts.is_empty() {
            contents.push(gemini::Content {
                role: role.to_string(),
                parts,
            });
        }
    }

    contents
}

pub fn system_to_gemini(system_text: &str) -> gemini::Content {
    gemini::Content {
        role: "user".to_string(),
        parts: vec![gemini::Part::text(system_text)],
    }
}

pub fn anthropic_tools_to_gemini(
    tools: &[anthropic::Tool],
    mode: ToolSummaryMode,
) -> Vec<gemini::Tool> {
    let declarations = tools
        .iter()
        .map(|t| {
            let (description, parameters) = prepare_tool(&t.description, &t.input_schema, mode);
            gemini::FunctionDeclaration {
                name: t.name.clone(),
                description,
                parameters,
            }
        })
        .collect();

    vec![gemini::Tool {
        function_declarations: declarations,
    }]
}
