/// Pricing for a Claude model, per million tokens.
#[derive(Clone, Debug)]
pub struct ClaudeModelInfo {
    pub name: &'static str,
    pub max_output: u32,
    pub input_cost_per_mtok: f64,
    pub output_cost_per_mtok: f64,
}

impl ClaudeModelInfo {
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input = input_tokens as f64 / 1_000_000.0 * self.input_cost_per_mtok;
        let output = output_tokens as f64 / 1_000_000.0 * self.output_cost_per_mtok;
        input + output
    }
}

pub static CLAUDE_OPUS_4_6: ClaudeModelInfo = ClaudeModelInfo {
    name: "claude-opus-4-6",
    max_output: 128_000,
    input_cost_per_mtok: 15.0,
    output_cost_per_mtok: 75.0,
};

pub static CLAUDE_SONNET_4_5: ClaudeModelInfo = ClaudeModelInfo {
    name: "claude-sonnet-4-5-20250929",
    max_output: 64_000,
    input_cost_per_mtok: 3.0,
    output_cost_per_mtok: 15.0,
};

pub static CLAUDE_SONNET_4: ClaudeModelInfo = ClaudeModelInfo {
    name: "claude-sonnet-4-20250514",
    max_output: 64_000,
    input_cost_per_mtok: 3.0,
    output_cost_per_mtok: 15.0,
};

pub static CLAUDE_HAIKU_4_5: ClaudeModelInfo = ClaudeModelInfo {
    name: "claude-haiku-4-5-20251001",
    max_output: 64_000,
    input_cost_per_mtok: 0.80,
    output_cost_per_mtok: 4.0,
};

static ALL_MODELS: &[&ClaudeModelInfo] = &[
    &CLAUDE_OPUS_4_6,
    &CLAUDE_SONNET_4_5,
    &CLAUDE_SONNET_4,
    &CLAUDE_HAIKU_4_5,
];

pub fn find_model(name: &str) -> Option<&'static ClaudeModelInfo> {
    ALL_MODELS.iter().find(|m| m.name == name).copied()
}

/// Cost of a call, or zero for a model without a price entry.
pub fn cost_for(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    find_model(model).map_or(0.0, |m| m.calculate_cost(input_tokens, output_tokens))
}
