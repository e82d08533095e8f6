//! Claudish Core - shared wire types for API translation
//!
//! This crate defines the message formats for the three upstream dialects the
//! gateway speaks (Anthropic Messages, OpenAI chat/completions, Gemini
//! generateContent), enabling bidirectional translation between them.

pub mod anthropic;
pub mod error;
pub mod gemini;
pub mod openai;

pub use error::GatewayError;

#[cfg(test)]
mod tests {
    use super::anthropic::*;
    use serde_json::json;

    #[test]
    fn test_string_content_normalises_to_single_text_block() {
        let msg: Message = serde_json::from_value(json!({
            "role": "user",
            "content": "hello"
        }))
        .expect("should deserialize");

        let blocks = msg.content.into_blocks();
        assert_eq!(blocks.len(), 1);
        assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "hello"));
    }

    #[test]
    fn test_thinking_block_without_signature_deserializes() {
        let content = json!([
            {"type": "thinking", "thinking": "Let me think about this..."},
            {"type": "text", "text": "Here's my response"}
        ]);

        let blocks: Vec<ContentBlock> =
            serde_json::from_value(content).expect("should deserialize");
        assert_eq!(blocks.len(), 2);

        match &blocks[0] {
            ContentBlock::Thinking { thinking, signature } => {
                assert_eq!(thinking, "Let me think about this...");
                assert_eq!(signature, "");
            }
            _ => panic!("expected Thinking block"),
        }
    }

    #[test]
    fn test_tool_choice_variants_deserialize() {
        let auto: ToolChoice = serde_json::from_value(json!({"type": "auto"})).unwrap();
        assert!(matches!(auto, ToolChoice::Auto));

        let named: ToolChoice =
            serde_json::from_value(json!({"type": "tool", "name": "Bash"})).unwrap();
        match named {
            ToolChoice::Tool { name } => assert_eq!(name, "Bash"),
            _ => panic!("expected named tool choice"),
        }
    }

    #[test]
    fn test_stream_event_serializes_with_type_tag() {
        let evt = StreamEvent::ContentBlockStop { index: 3 };
        let v = serde_json::to_value(&evt).unwrap();
        assert_eq!(v["type"], "content_block_stop");
        assert_eq!(v["index"], 3);
    }
}
