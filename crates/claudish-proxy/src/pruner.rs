//! Conversation pruner
//!
//! When the session is close to the model's context window, drop
//! mid-conversation turns instead of letting the backend truncate blindly.
//! Kept: the leading message, the first user message, the trailing window,
//! and a sample of assistant/tool-result pairs from the middle. Tool pairs
//! are never split: a retained tool result always keeps its assistant
//! parent.

use claudish_core::anthropic::{ContentBlock, Message, Role};
use std::collections::HashSet;
use tracing::info;

/// Fraction of the context window that triggers pruning.
const PRUNE_THRESHOLD: f64 = 0.8;
/// The trailing window always kept intact.
const KEEP_RECENT: usize = 12;
/// One in every N middle tool pairs survives.
const PAIR_SAMPLE_RATE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneOutcome {
    pub pruned: bool,
    pub dropped: usize,
}

/// Pruning is worth it only when we're over the threshold and the
/// conversation is long enough to have a middle.
pub fn should_prune(context_used: u32, context_window: u32, message_count: usize) -> bool {
    if context_window == 0 || message_count <= 5 {
        return false;
    }
    (context_used as f64) > PRUNE_THRESHOLD * (context_window as f64)
}

/// Ids of tool_use blocks on an assistant message.
fn tool_use_ids(msg: &Message) -> Vec<String> {
    if msg.role != Role::Assistant {
        return Vec::new();
    }
    msg.content
        .blocks()
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, .. } => Some(id),
            _ => None,
        })
        .collect()
}

/// Ids referenced by tool_result blocks on a user message.
fn tool_result_ids(msg: &Message) -> Vec<String> {
    if msg.role != Role::User {
        return Vec::new();
    }
    msg.content
        .blocks()
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id),
            _ => None,
        })
        .collect()
}

/// Drop middle turns, returning how many were removed. The caller is
/// responsible for the one-shot disclosure note in the system prompt.
pub fn prune_messages(messages: &mut Vec<Message>) -> PruneOutcome {
    let len = messages.len();
    if len <= KEEP_RECENT + 2 {
        return PruneOutcome {
            pruned: false,
            dropped: 0,
        };
    }

    let recent_start = len - KEEP_RECENT;
    let mut keep: HashSet<usize> = HashSet::new();

    // Leading message and the first user turn.
    keep.insert(0);
    if let Some(first_user) = messages.iter().position(|m| m.role == Role::User) {
        keep.insert(first_user);
    }

    // The trailing window, intact.
    keep.extend(recent_start..len);

    // Sample every Nth assistant/tool-result pair from the middle.
    let middle_start = 1;
    let mut pair_index = 0usize;
    let mut i = middle_start;
    while i < recent_start {
        let ids = tool_use_ids(&messages[i]);
        if ids.is_empty() {
            i += 1;
            continue;
        }
        // trailing result messages referencing this assistant's calls
        let mut results = Vec::new();
        let mut j = i + 1;
        while j < recent_start {
            let refs = tool_result_ids(&messages[j]);
            if refs.is_empty() || !refs.iter().any(|r| ids.contains(r)) {
                break;
            }
            results.push(j);
            j += 1;
        }

        if pair_index % PAIR_SAMPLE_RATE == 0 {
            keep.insert(i);
            keep.extend(results.iter().copied());
        }
        pair_index += 1;
        i = j.max(i + 1);
    }

    // A retained tool result must keep its assistant parent; walk backwards
    // from every kept result to the turn that issued the call.
    let kept_snapshot: Vec<usize> = keep.iter().copied().collect();
    for idx in kept_snapshot {
        for result_id in tool_result_ids(&messages[idx]) {
            for parent in (0..idx).rev() {
                if tool_use_ids(&messages[parent]).contains(&result_id) {
                    keep.insert(parent);
                    break;
                }
            }
        }
    }

    let dropped = len - keep.len();
    if dropped == 0 {
        return PruneOutcome {
            pruned: false,
            dropped: 0,
        };
    }

    let mut index = 0;
    messages.retain(|_| {
        let kept = keep.contains(&index);
        index += 1;
        kept
    });

    info!(
        "pruned conversation: dropped {} of {} messages ({} kept)",
        dropped,
        len,
        messages.len()
    );

    PruneOutcome {
        pruned: true,
        dropped,
    }
}

/// The one-shot note appended to the system prompt after a prune.
pub fn disclosure_note(dropped: usize) -> String {
    format!(
        "\n\nNote: {} earlier conversation turns were omitted to fit the model's \
context window. Recent messages and key tool interactions are preserved.",
        dropped
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use claudish_core::anthropic::{Content, ToolResultContent};
    use serde_json::json;

    fn text_msg(role: Role, text: &str) -> Message {
        Message {
            role,
            content: Content::Text(text.into()),
        }
    }

    fn tool_use_msg(id: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: Content::Blocks(vec![ContentBlock::ToolUse {
                id: id.into(),
                name: "Bash".into(),
                input: json!({"command": "ls"}),
            }]),
        }
    }

    fn tool_result_msg(id: &str) -> Message {
        Message {
            role: Role::User,
            content: Content::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: id.into(),
                content: ToolResultContent::Text("ok".into()),
                is_error: None,
            }]),
        }
    }

    /// 20 messages; 3/7/11 are assistant tool uses, 4/8/12 their results.
    fn scenario() -> Vec<Message> {
        let mut msgs = Vec::new();
        for i in 0..20 {
            let msg = match i {
                3 | 7 | 11 => tool_use_msg(&format!("toolu_{}", i)),
                4 | 8 | 12 => tool_result_msg(&format!("toolu_{}", i - 1)),
                _ => {
                    let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                    text_msg(role, &format!("message {}", i))
                }
            };
            msgs.push(msg);
        }
        msgs
    }

    #[test]
    fn test_threshold() {
        assert!(should_prune(81_000, 100_000, 20));
        assert!(!should_prune(79_000, 100_000, 20));
        assert!(!should_prune(99_000, 100_000, 5), "short conversations never pruned");
        assert!(!should_prune(1, 0, 20), "unknown window never triggers");
    }

    #[test]
    fn test_scenario_keeps_head_sampled_pair_and_recent_window() {
        let mut msgs = scenario();
        let outcome = prune_messages(&mut msgs);
        assert!(outcome.pruned);

        let texts: Vec<String> = msgs
            .iter()
            .map(|m| match &m.content {
                Content::Text(t) => t.clone(),
                Content::Blocks(blocks) => match &blocks[0] {
                    ContentBlock::ToolUse { id, .. } => format!("use:{}", id),
                    ContentBlock::ToolResult { tool_use_id, .. } => {
                        format!("result:{}", tool_use_id)
                    }
                    _ => "block".into(),
                },
                _ => "?".into(),
            })
            .collect();

        // head
        assert!(texts.contains(&"message 0".to_string()));
        // first sampled pair (3, 4)
        assert!(texts.contains(&"use:toolu_3".to_string()));
        assert!(texts.contains(&"result:toolu_3".to_string()));
        // last 12 (indices 8..19)
        for i in [9, 10, 13, 14, 19] {
            assert!(
                texts.contains(&format!("message {}", i)),
                "recent message {} must be kept",
                i
            );
        }
        // middle filler dropped
        for i in [2, 5, 6] {
            assert!(
                !texts.contains(&format!("message {}", i)),
                "middle message {} must be dropped",
                i
            );
        }
    }

    #[test]
    fn test_no_tool_result_without_parent() {
        let mut msgs = scenario();
        prune_messages(&mut msgs);

        for (idx, msg) in msgs.iter().enumerate() {
            for result_id in tool_result_ids(msg) {
                let has_parent = msgs[..idx]
                    .iter()
                    .any(|m| tool_use_ids(m).contains(&result_id));
                assert!(has_parent, "result {} at {} has no parent", result_id, idx);
            }
        }
    }

    #[test]
    fn test_pair_straddling_recent_window_keeps_parent() {
        // assistant at 7 with result at 8; the window starts at 8, so the
        // parent sits just outside and must be pulled in.
        let mut msgs = scenario();
        prune_messages(&mut msgs);

        let has_parent_7 = msgs.iter().any(|m| tool_use_ids(m).contains(&"toolu_7".to_string()));
        let has_result_7 = msgs
            .iter()
            .any(|m| tool_result_ids(m).contains(&"toolu_7".to_string()));
        assert!(has_result_7, "result at index 8 is inside the recent window");
        assert!(has_parent_7, "its parent at index 7 must be retained with it");
    }

    #[test]
    fn test_short_conversation_untouched() {
        let mut msgs: Vec<Message> = (0..10)
            .map(|i| text_msg(if i % 2 == 0 { Role::User } else { Role::Assistant }, "x"))
            .collect();
        let before = msgs.len();
        let outcome = prune_messages(&mut msgs);
        assert!(!outcome.pruned);
        assert_eq!(msgs.len(), before);
    }

    #[test]
    fn test_ordering_preserved() {
        let mut msgs = scenario();
        prune_messages(&mut msgs);
        // first kept message is index 0, last is index 19
        assert!(matches!(&msgs[0].content, Content::Text(t) if t == "message 0"));
        assert!(matches!(&msgs.last().unwrap().content, Content::Text(t) if t == "message 19"));
    }
}
