//! Token and cost accounting
//!
//! Per-handler session counters plus the status file the external status
//! line polls. Local backends report the full conversation context as
//! `input_tokens` on every request, so the tracker replaces the running
//! input instead of accumulating it; cloud backends accumulate both sides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::warn;

/// $ per million tokens, (input, output). Matched by provider family first,
/// then model substring; first hit wins.
const PRICES: &[(&str, &str, f64, f64)] = &[
    ("anthropic", "opus", 15.0, 75.0),
    ("anthropic", "sonnet", 3.0, 15.0),
    ("anthropic", "haiku", 0.8, 4.0),
    ("openai", "gpt-4.1-mini", 0.4, 1.6),
    ("openai", "gpt-4.1", 2.0, 8.0),
    ("openai", "o3-mini", 1.1, 4.4),
    ("openai", "o3", 2.0, 8.0),
    ("openrouter", "gemini-2.5-pro", 1.25, 10.0),
    ("openrouter", "grok", 3.0, 15.0),
    ("openrouter", "deepseek", 0.3, 1.2),
    ("gemini", "flash", 0.3, 2.5),
    ("gemini", "pro", 1.25, 10.0),
    ("zhipu", "glm-4.5-air", 0.2, 1.1),
    ("zhipu", "glm", 0.6, 2.2),
    ("minimax", "", 0.3, 1.2),
    ("moonshot", "", 0.6, 2.5),
];

/// Per-provider fallback for models missing from the table.
const DEFAULT_PRICES: &[(&str, f64, f64)] = &[
    ("anthropic", 3.0, 15.0),
    ("openai", 2.0, 8.0),
    ("openrouter", 1.0, 3.0),
    ("gemini", 1.25, 10.0),
    ("zhipu", 0.6, 2.2),
    ("minimax", 0.3, 1.2),
    ("moonshot", 0.6, 2.5),
];

/// Price per Mtok for a (provider, model). Local backends are free.
pub fn price_for(provider: &str, model: &str) -> (f64, f64) {
    let model_lower = model.to_lowercase();
    for (prov, substr, input, output) in PRICES {
        if provider == *prov && (substr.is_empty() || model_lower.contains(substr)) {
            return (*input, *output);
        }
    }
    for (prov, input, output) in DEFAULT_PRICES {
        if provider == *prov {
            return (*input, *output);
        }
    }
    (0.0, 0.0)
}

/// Rough token estimate when an upstream omits usage: one token per four
/// bytes of text.
pub fn estimate_tokens(text_len: usize) -> u32 {
    text_len.div_ceil(4) as u32
}

/// Where the context-window figure came from, for the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextWindowSource {
    Env,
    Cache,
    Probed,
    Default,
}

/// The JSON shape polled by the external status line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub context_window: u32,
    pub context_left_percent: f64,
    pub updated_at: String,
}

#[derive(Debug)]
pub struct UsageTracker {
    provider: String,
    local: bool,
    input_price: f64,
    output_price: f64,
    status_path: Option<PathBuf>,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: f64,
    pub context_window: u32,
    pub context_window_source: ContextWindowSource,
}

impl UsageTracker {
    pub fn new(provider: &str, model: &str, local: bool, port: u16) -> Self {
        let (input_price, output_price) = if local {
            (0.0, 0.0)
        } else {
            price_for(provider, model)
        };
        let status_path = dirs::home_dir().map(|h| h.join(".claudish").join(format!("tokens-{}.json", port)));
        Self {
            provider: provider.to_string(),
            local,
            input_price,
            output_price,
            status_path,
            input_tokens: 0,
            output_tokens: 0,
            total_cost: 0.0,
            context_window: 0,
            context_window_source: ContextWindowSource::Default,
        }
    }

    /// Keep accounting in memory only (tests, or a missing home dir).
    pub fn disable_status_file(&mut self) {
        self.status_path = None;
    }

    pub fn set_context_window(&mut self, window: u32, source: ContextWindowSource) {
        self.context_window = window;
        self.context_window_source = source;
    }

    /// Record one completed request's usage and refresh the status file.
    pub fn record(&mut self, input_tokens: u32, output_tokens: u32) {
        if self.local {
            // Local servers report the whole context each time.
            self.input_tokens = input_tokens as u64;
        } else {
            self.input_tokens += input_tokens as u64;
        }
        self.output_tokens += output_tokens as u64;
        self.total_cost += (input_tokens as f64 * self.input_price
            + output_tokens as f64 * self.output_price)
            / 1_000_000.0;

        if let Err(e) = self.write_status() {
            warn!("failed to write status file for {}: {}", self.provider, e);
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let total = self.input_tokens + self.output_tokens;
        let left = if self.context_window == 0 {
            100.0
        } else {
            let used = (self.input_tokens as f64 / self.context_window as f64).min(1.0);
            ((1.0 - used) * 100.0 * 10.0).round() / 10.0
        };
        StatusSnapshot {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: total,
            total_cost: (self.total_cost * 10_000.0).round() / 10_000.0,
            context_window: self.context_window,
            context_left_percent: left,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Whole-file write then rename, so the status-line poller never reads a
    /// torn file.
    fn write_status(&self) -> io::Result<()> {
        let Some(path) = &self.status_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&self.snapshot())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Fraction of the context window currently used, 0.0 when unknown.
    pub fn context_used(&self) -> u32 {
        self.input_tokens.min(u32::MAX as u64) as u32
    }
}
