//! System-prompt decoration data
//!
//! The identity scrub and the per-family guidance are injections into a
//! free-text system prompt. Downstream model behaviour depends on their exact
//! wording, and they are brittle against upstream agent changes, so they live
//! here as data tables rather than inline strings scattered through the
//! request path.

/// Phrase replacements applied to the agent's system prompt before it leaves
/// for a non-Anthropic backend. Ordered: longer, more specific phrases first
/// so the generic ones don't clobber them.
pub const IDENTITY_REPLACEMENTS: &[(&str, &str)] = &[
    (
        "Claude Code, Anthropic's official CLI for Claude",
        "a command-line coding agent",
    ),
    ("Anthropic's official CLI", "a command-line coding tool"),
    ("Claude Code", "the coding agent"),
    ("claude.ai", "the assistant's website"),
    ("Anthropic", "the model vendor"),
    ("Claude", "the assistant"),
];

/// Guidance appended for Grok-family targets: Grok sometimes falls back to
/// its XML function-call dialect when the prompt mentions tools loosely.
pub const GROK_GUIDANCE: &str = "\n\nWhen calling tools, always use the standard OpenAI tool_calls mechanism. \
Never write <xai:function_call> XML or describe tool invocations in prose.";

/// Guidance appended for Gemini-family targets: Gemini tends to leak its
/// planning monologue into answer text.
pub const GEMINI_GUIDANCE: &str = "\n\nKeep all reasoning and planning internal. Respond only with the final \
answer or tool calls; do not narrate what you are about to do.";

/// The "you are not the upstream brand" preamble. Placed first so it wins
/// against any identity claims later in the prompt.
pub fn not_brand_preamble(brand: &str) -> String {
    format!(
        "IMPORTANT: You are NOT {brand}. You are the model actually serving this \
session. Never claim to be {brand} or speak on its vendor's behalf.\n\n"
    )
}

/// Scrub identity phrases and prepend the brand disclaimer.
pub fn scrub_identity(system_text: &str, upstream_brand: &str) -> String {
    let mut text = system_text.to_string();
    for (from, to) in IDENTITY_REPLACEMENTS {
        if text.contains(from) {
            text = text.replace(from, to);
        }
    }
    format!("{}{}", not_brand_preamble(upstream_brand), text)
}

/// Full decoration: scrub plus family-specific guidance chosen by model name.
pub fn decorate_system(system_text: &str, model: &str, upstream_brand: &str) -> String {
    let mut text = scrub_identity(system_text, upstream_brand);
    let lower = model.to_lowercase();
    if lower.contains("grok") {
        text.push_str(GROK_GUIDANCE);
    } else if lower.contains("gemini") {
        text.push_str(GEMINI_GUIDANCE);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_replaces_identity_phrases() {
        let scrubbed = scrub_identity("You are Claude Code, made by Anthropic.", "Claude");
        assert!(!scrubbed.contains("Claude Code"));
        assert!(!scrubbed.contains("Anthropic"));
        assert!(scrubbed.starts_with("IMPORTANT: You are NOT Claude"));
    }

    #[test]
    fn test_longer_phrases_win_over_generic() {
        let scrubbed = scrub_identity(
            "You are Claude Code, Anthropic's official CLI for Claude.",
            "Claude",
        );
        assert!(scrubbed.contains("a command-line coding agent"));
    }

    #[test]
    fn test_family_guidance_appended_by_model_name() {
        let grok = decorate_system("base", "grok-4-fast", "Claude");
        assert!(grok.contains("tool_calls mechanism"));

        let gemini = decorate_system("base", "gemini-2.5-pro", "Claude");
        assert!(gemini.contains("reasoning and planning internal"));

        let plain = decorate_system("base", "qwen3-coder", "Claude");
        assert!(!plain.contains("tool_calls mechanism"));
        assert!(!plain.contains("planning internal"));
    }
}
