//! Integration tests for the translator

#![cfg(test)]

mod openai_conversion {
    use crate::convert::*;
    use crate::tools::ToolSummaryMode;
    use claudish_core::{anthropic, openai};
    use serde_json::json;

    fn user_blocks(blocks: Vec<anthropic::ContentBlock>) -> anthropic::Message {
        anthropic::Message {
            role: anthropic::Role::User,
            content: anthropic::Content::Blocks(blocks),
        }
    }

    fn assistant_blocks(blocks: Vec<anthropic::ContentBlock>) -> anthropic::Message {
        anthropic::Message {
            role: anthropic::Role::Assistant,
            content: anthropic::Content::Blocks(blocks),
        }
    }

    #[test]
    fn test_system_message_comes_first() {
        let messages = vec![anthropic::Message {
            role: anthropic::Role::User,
            content: anthropic::Content::Text("hi".into()),
        }];

        let out = anthropic_request_to_openai(&messages, Some("be helpful"), false);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, openai::Role::System);
        assert_eq!(out[1].role, openai::Role::User);
    }

    #[test]
    fn test_user_turn_splits_tool_results_from_text() {
        let messages = vec![user_blocks(vec![
            anthropic::ContentBlock::ToolResult {
                tool_use_id: "toolu_01".into(),
                content: anthropic::ToolResultContent::Text("file contents".into()),
                is_error: None,
            },
            anthropic::ContentBlock::Text {
                text: "now fix the bug".into(),
            },
        ])];

        let out = anthropic_request_to_openai(&messages, None, false);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, openai::Role::Tool);
        assert_eq!(out[0].tool_call_id.as_deref(), Some("toolu_01"));
        assert_eq!(out[1].role, openai::Role::User);
    }

    #[test]
    fn test_duplicate_tool_results_deduped_by_id() {
        let messages = vec![user_blocks(vec![
            anthropic::ContentBlock::ToolResult {
                tool_use_id: "toolu_01".into(),
                content: anthropic::ToolResultContent::Text("a".into()),
                is_error: None,
            },
            anthropic::ContentBlock::ToolResult {
                tool_use_id: "toolu_01".into(),
                content: anthropic::ToolResultContent::Text("a again".into()),
                is_error: None,
            },
        ])];

        let out = anthropic_request_to_openai(&messages, None, false);
        assert_eq!(out.len(), 1, "second result for the same id must be dropped");
    }

    #[test]
    fn test_images_become_data_urls() {
        let messages = vec![user_blocks(vec![
            anthropic::ContentBlock::Text {
                text: "what is this".into(),
            },
            anthropic::ContentBlock::Image {
                source: anthropic::ImageSource {
                    source_type: "base64".into(),
                    media_type: "image/png".into(),
                    data: "iVBORw0KGgo=".into(),
                },
            },
        ])];

        let out = anthropic_request_to_openai(&messages, None, false);
        let parts = match out[0].content.as_ref().unwrap() {
            openai::Content::Parts(p) => p,
            other => panic!("expected parts, got {:?}", other),
        };
        assert_eq!(parts.len(), 2);
        match &parts[1] {
            openai::ContentPart::ImageUrl { image_url } => {
                assert!(image_url.url.starts_with("data:image/png;base64,"));
            }
            other => panic!("expected image part, got {:?}", other),
        }
    }

    #[test]
    fn test_simple_format_flattens_and_drops_images() {
        let messages = vec![user_blocks(vec![
            anthropic::ContentBlock::Text {
                text: "look:".into(),
            },
            anthropic::ContentBlock::Image {
                source: anthropic::ImageSource {
                    source_type: "base64".into(),
                    media_type: "image/png".into(),
                    data: "xxxx".into(),
                },
            },
            anthropic::ContentBlock::ToolResult {
                tool_use_id: "toolu_01".into(),
                content: anthropic::ToolResultContent::Text("exit 0".into()),
                is_error: None,
            },
        ])];

        let out = anthropic_request_to_openai(&messages, None, true);
        assert_eq!(out.len(), 1);
        let text = match out[0].content.as_ref().unwrap() {
            openai::Content::Text(t) => t,
            other => panic!("expected text, got {:?}", other),
        };
        assert!(text.contains("look:"));
        assert!(text.contains("[Tool Result]: exit 0"));
        assert!(!text.contains("xxxx"));
    }

    #[test]
    fn test_assistant_text_joined_with_single_spaces() {
        let messages = vec![assistant_blocks(vec![
            anthropic::ContentBlock::Text {
                text: "First part.".into(),
            },
            anthropic::ContentBlock::Text {
                text: "Second part.".into(),
            },
        ])];

        let out = anthropic_request_to_openai(&messages, None, false);
        match out[0].content.as_ref().unwrap() {
            openai::Content::Text(t) => assert_eq!(t, "First part. Second part."),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_assistant_tool_calls_only_has_null_content() {
        let messages = vec![assistant_blocks(vec![anthropic::ContentBlock::ToolUse {
            id: "toolu_01".into(),
            name: "Read".into(),
            input: json!({"file_path": "/tmp/a"}),
        }])];

        let out = anthropic_request_to_openai(&messages, None, false);
        assert!(out[0].content.is_none());
        let calls = out[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "Read");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&calls[0].function.arguments).unwrap(),
            json!({"file_path": "/tmp/a"})
        );
    }

    #[test]
    fn test_thinking_blocks_never_forwarded() {
        let messages = vec![assistant_blocks(vec![
            anthropic::ContentBlock::Thinking {
                thinking: "secret plan".into(),
                signature: "".into(),
            },
            anthropic::ContentBlock::Text {
                text: "the answer".into(),
            },
        ])];

        let out = anthropic_request_to_openai(&messages, None, false);
        match out[0].content.as_ref().unwrap() {
            openai::Content::Text(t) => {
                assert_eq!(t, "the answer");
                assert!(!t.contains("secret plan"));
            }
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_orphaned_tool_message_demoted_to_user() {
        let mut messages = vec![
            openai::Message::text(openai::Role::User, "hi"),
            openai::Message {
                role: openai::Role::Tool,
                content: Some(openai::Content::Text("stale result".into())),
                tool_calls: None,
                tool_call_id: Some("call_9".into()),
                name: None,
                reasoning_details: None,
            },
        ];

        fix_orphaned_tool_messages(&mut messages);
        assert_eq!(messages[1].role, openai::Role::User);
        match messages[1].content.as_ref().unwrap() {
            openai::Content::Text(t) => assert!(t.contains("call_9")),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_message_after_tool_calls_kept() {
        let mut messages = vec![
            openai::Message {
                role: openai::Role::Assistant,
                content: None,
                tool_calls: Some(vec![openai::ToolCall {
                    id: "call_1".into(),
                    call_type: Some("function".into()),
                    function: openai::FunctionCall {
                        name: "Bash".into(),
                        arguments: "{}".into(),
                    },
                    index: None,
                }]),
                tool_call_id: None,
                name: None,
                reasoning_details: None,
            },
            openai::Message {
                role: openai::Role::Tool,
                content: Some(openai::Content::Text("ok".into())),
                tool_calls: None,
                tool_call_id: Some("call_1".into()),
                name: None,
                reasoning_details: None,
            },
        ];

        fix_orphaned_tool_messages(&mut messages);
        assert_eq!(messages[1].role, openai::Role::Tool);
    }

    #[test]
    fn test_trailing_assistant_gets_continuation() {
        let mut messages = vec![
            openai::Message::text(openai::Role::User, "hi"),
            openai::Message::text(openai::Role::Assistant, "partial"),
        ];
        ensure_trailing_user_turn(&mut messages);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].role, openai::Role::User);
    }

    #[test]
    fn test_tool_schema_passthrough_keeps_required() {
        let tools = vec![anthropic::Tool {
            name: "Bash".into(),
            description: "Run a command".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"]
            }),
        }];

        let out = anthropic_tools_to_openai(&tools, ToolSummaryMode::Full);
        assert_eq!(out[0].function.name, "Bash");
        assert_eq!(out[0].function.parameters["required"], json!(["command"]));
    }
}

mod gemini_conversion {
    use crate::gemini::*;
    use claudish_core::anthropic;
    use serde_json::json;

    #[test]
    fn test_roles_map_to_user_and_model() {
        let messages = vec![
            anthropic::Message {
                role: anthropic::Role::User,
                content: anthropic::Content::Text("hi".into()),
            },
            anthropic::Message {
                role: anthropic::Role::Assistant,
                content: anthropic::Content::Text("hello".into()),
            },
        ];

        let mut names = ToolNameMap::new();
        let contents = anthropic_messages_to_gemini(&messages, &mut names);
        assert_eq!(contents[0].role, "user");
        assert_eq!(contents[1].role, "model");
    }

    #[test]
    fn test_tool_round_trip_resolves_function_response_name() {
        // Assistant calls a tool, user returns the result; Gemini must see a
        // functionResponse with the matching function name.
        let messages = vec![
            anthropic::Message {
                role: anthropic::Role::Assistant,
                content: anthropic::Content::Blocks(vec![anthropic::ContentBlock::ToolUse {
                    id: "toolu_abc".into(),
                    name: "Read".into(),
                    input: json!({"file_path": "/tmp/a"}),
                }]),
            },
            anthropic::Message {
                role: anthropic::Role::User,
                content: anthropic::Content::Blocks(vec![anthropic::ContentBlock::ToolResult {
                    tool_use_id: "toolu_abc".into(),
                    content: anthropic::ToolResultContent::Text("contents".into()),
                    is_error: None,
                }]),
            },
        ];

        let mut names = ToolNameMap::new();
        let contents = anthropic_messages_to_gemini(&messages, &mut names);

        let response = contents[1].parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.name, "Read");
        assert_eq!(response.response["content"], "contents");
    }

    #[test]
    fn test_name_map_survives_across_conversions() {
        // Turn 1: only the assistant tool use.
        let turn1 = vec![anthropic::Message {
            role: anthropic::Role::Assistant,
            content: anthropic::Content::Blocks(vec![anthropic::ContentBlock::ToolUse {
                id: "toolu_xyz".into(),
                name: "Bash".into(),
                input: json!({"command": "ls"}),
            }]),
        }];

        let mut names = ToolNameMap::new();
        anthropic_messages_to_gemini(&turn1, &mut names);
        assert_eq!(names.lookup("toolu_xyz"), Some("Bash"));

        // Turn 2 re-sends history plus the result; the map still resolves.
        let turn2 = vec![anthropic::Message {
            role: anthropic::Role::User,
            content: anthropic::Content::Blocks(vec![anthropic::ContentBlock::ToolResult {
                tool_use_id: "toolu_xyz".into(),
                content: anthropic::ToolResultContent::Text("ok".into()),
                is_error: None,
            }]),
        }];
        let contents = anthropic_messages_to_gemini(&turn2, &mut names);
        assert_eq!(
            contents[0].parts[0].function_response.as_ref().unwrap().name,
            "Bash"
        );
    }

    #[test]
    fn test_unknown_tool_result_dropped() {
        let messages = vec![anthropic::Message {
            role: anthropic::Role::User,
            content: anthropic::Content::Blocks(vec![anthropic::ContentBlock::ToolResult {
                tool_use_id: "toolu_never_seen".into(),
                content: anthropic::ToolResultContent::Text("orphan".into()),
                is_error: None,
            }]),
        }];

        let mut names = ToolNameMap::new();
        let contents = anthropic_messages_to_gemini(&messages, &mut names);
        assert!(contents.is_empty(), "message with only a dropped block is omitted");
    }

    #[test]
    fn test_images_become_inline_data() {
        let messages = vec![anthropic::Message {
            role: anthropic::Role::User,
            content: anthropic::Content::Blocks(vec![anthropic::ContentBlock::Image {
                source: anthropic::ImageSource {
                    source_type: "base64".into(),
                    media_type: "image/jpeg".into(),
                    data: "abcd".into(),
                },
            }]),
        }];

        let mut names = ToolNameMap::new();
        let contents = anthropic_messages_to_gemini(&messages, &mut names);
        let inline = contents[0].parts[0].inline_data.as_ref().unwrap();
        assert_eq!(inline.mime_type, "image/jpeg");
    }

    #[test]
    fn test_tools_become_function_declarations() {
        let tools = vec![anthropic::Tool {
            name: "Grep".into(),
            description: "Search files".into(),
            input_schema: json!({"type": "object", "properties": {"pattern": {"type": "string", "format": "uri"}}}),
        }];

        let out = anthropic_tools_to_gemini(&tools, crate::tools::ToolSummaryMode::Full);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].function_declarations[0].name, "Grep");
        // format: "uri" is sanitised away for Gemini too
        assert!(out[0].function_declarations[0].parameters["properties"]["pattern"]
            .get("format")
            .is_none());
    }
}
