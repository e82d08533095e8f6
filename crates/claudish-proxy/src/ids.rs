//! Wire-format id minting

use uuid::Uuid;

fn hex24() -> String {
    Uuid::new_v4().to_string().replace('-', "")[..24].to_string()
}

/// Anthropic-shaped message id (`msg_` + 24 hex chars).
pub fn new_message_id() -> String {
    format!("msg_{}", hex24())
}

/// Anthropic-shaped tool-use id, minted when an upstream didn't provide one
/// (Grok XML calls, text-embedded calls).
pub fn new_tool_id() -> String {
    format!("toolu_{}", hex24())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_shapes() {
        let msg = new_message_id();
        assert!(msg.starts_with("msg_"));
        assert_eq!(msg.len(), 4 + 24);

        let tool = new_tool_id();
        assert!(tool.starts_with("toolu_"));
        assert_ne!(new_tool_id(), tool);
    }
}
