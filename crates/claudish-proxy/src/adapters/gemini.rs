//! Gemini adapter
//!
//! Gemini models leak their planning monologue into answer text ("Wait, I'm
//! checking the file first.", "Let me verify...", numbered plans). The
//! adapter filters those lines while a reasoning block is open; the block
//! closes on the first substantive line that matches nothing.
//!
//! Request prep maps the client's thinking budget onto whichever dialect the
//! target generation speaks: next-gen models take a coarse `thinkingLevel`,
//! older ones a `thinkingConfig.thinkingBudget`.

use super::{thinking_budget, ModelAdapter, TextOutcome};
use claudish_core::{anthropic, gemini, openai as oai};
use regex::RegexSet;
use std::sync::OnceLock;

/// Budget at or above which next-gen Gemini runs at high thinking level.
const LEVEL_THRESHOLD: u32 = 16_000;
/// Hard upstream cap on the classic thinking budget.
const MAX_THINKING_BUDGET: u32 = 24_576;
/// A non-matching line longer than this closes the reasoning block.
const SUBSTANTIVE_LINE_LEN: usize = 20;

/// Lines that open (or continue opening) a reasoning block.
fn opener_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"^Wait, I'?m \w+ing\b",
            r"^Wait[,.]",
            r"^Let me (think|check|see|look|verify|trace|examine|figure|re-?read)\b",
            r"^I'?ll \w+",
            r"^I need to \w+",
            r"^Okay,? so\b",
            r"^(Step )?\d+[.)] ",
            r"^The goal is\b",
            r"^(First|Next|Then|Finally),? I\b",
            r"^Looking at\b",
            r"^Hmm[,.]",
        ])
        .expect("gemini opener patterns")
    })
}

/// Lines that keep a reasoning block open once it has started.
fn continuation_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"^And then\b",
            r"^Actually\b",
            r"^(Since|Because|If)\b",
            r"^So\b",
            r"^That (means|way)\b",
        ])
        .expect("gemini continuation patterns")
    })
}

pub struct GeminiAdapter {
    #[allow(dead_code)]
    model: String,
    /// Currently inside a leaked-reasoning run.
    suppressing: bool,
    /// Incomplete trailing line awaiting its newline.
    line_buffer: String,
    /// Whether anything was filtered this request.
    filtered_any: bool,
}

impl GeminiAdapter {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            suppressing: false,
            line_buffer: String::new(),
            filtered_any: false,
        }
    }

    /// Filter one complete line. Returns the line (with its newline) when it
    /// should reach the client.
    fn filter_line(&mut self, line: &str, newline: bool) -> Option<String> {
        let trimmed = line.trim_start();

        if opener_patterns().is_match(trimmed) {
            self.suppressing = true;
            self.filtered_any = true;
            return None;
        }

        if self.suppressing {
            if continuation_patterns().is_match(trimmed) {
                self.filtered_any = true;
                return None;
            }
            if trimmed.len() <= SUBSTANTIVE_LINE_LEN {
                // Short fragments inside a reasoning run go with it.
                self.filtered_any = true;
                return None;
            }
            self.suppressing = false;
        }

        let mut out = line.to_string();
        if newline {
            out.push('\n');
        }
        Some(out)
    }

    fn run_filter(&mut self, flush: bool) -> String {
        let mut emitted = String::new();

        while let Some(pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if let Some(kept) = self.filter_line(line, true) {
                emitted.push_str(&kept);
            }
        }

        if flush && !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            if let Some(kept) = self.filter_line(&line, false) {
                emitted.push_str(&kept);
            }
        }

        emitted
    }
}

impl ModelAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn reset(&mut self) {
        self.suppressing = false;
        self.line_buffer.clear();
        self.filtered_any = false;
    }

    fn prepare_request(
        &mut self,
        outbound: &mut oai::ChatCompletionRequest,
        original: &anthropic::MessagesRequest,
    ) {
        // Gemini routed through an OpenAI-compatible aggregator: the thinking
        // budget rides as a dialect extra the aggregator forwards.
        if let Some(cfg) = map_thinking(&outbound.model, thinking_budget(original)) {
            if let Ok(v) = serde_json::to_value(&cfg) {
                outbound.set_extra("thinkingConfig", v);
            }
        }
    }

    fn process_text(&mut self, chunk: &str) -> TextOutcome {
        self.line_buffer.push_str(chunk);
        let text = self.run_filter(false);
        TextOutcome {
            transformed: self.filtered_any || !self.line_buffer.is_empty(),
            text,
            extracted_calls: Vec::new(),
        }
    }

    fn flush(&mut self) -> TextOutcome {
        let text = self.run_filter(true);
        TextOutcome {
            transformed: self.filtered_any,
            text,
            extracted_calls: Vec::new(),
        }
    }
}

/// True for next-gen Gemini generations that take `thinkingLevel` instead of
/// a numeric budget.
fn takes_thinking_level(model: &str) -> bool {
    let lower = model.to_lowercase();
    lower.contains("gemini-3") || lower.contains("gemini-exp")
}

/// Map the Anthropic budget onto the right Gemini thinking dialect.
pub fn map_thinking(model: &str, budget: Option<u32>) -> Option<gemini::ThinkingConfig> {
    let budget = budget?;
    if takes_thinking_level(model) {
        let level = if budget >= LEVEL_THRESHOLD { "high" } else { "low" };
        Some(gemini::ThinkingConfig {
            thinking_budget: None,
            thinking_level: Some(level.to_string()),
        })
    } else {
        Some(gemini::ThinkingConfig {
            thinking_budget: Some(budget.min(MAX_THINKING_BUDGET)),
            thinking_level: None,
        })
    }
}

pub fn matches(lower_model: &str) -> bool {
    lower_model.contains("gemini")
}
