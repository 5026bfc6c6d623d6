//! Token budget estimation for a single generator call.

use serde::Serialize;

/// Context window and output cap for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelLimits {
    pub context: u32,
    pub max_output: u32,
}

pub const DEFAULT_LIMITS: ModelLimits = ModelLimits {
    context: 200_000,
    max_output: 16_384,
};

const MODEL_LIMITS: [(&str, ModelLimits); 3] = [
    (
        "claude-sonnet-4-5",
        ModelLimits {
            context: 200_000,
            max_output: 64_000,
        },
    ),
    (
        "claude-opus-4-1",
        ModelLimits {
            context: 200_000,
            max_output: 32_000,
        },
    ),
    (
        "claude-3-5-haiku",
        ModelLimits {
            context: 200_000,
            max_output: 8_192,
        },
    ),
];

/// Output tokens kept free below the remaining context.
const OUTPUT_HEADROOM: u32 = 1_000;
/// Floor for the requested output size.
pub const MIN_OUTPUT_TOKENS: u32 = 1_024;
pub const WARN_UTILIZATION_PCT: f64 = 60.0;
pub const ESCALATE_UTILIZATION_PCT: f64 = 80.0;

/// Limits for `model`, matched by prefix so dated snapshots resolve to their family.
pub fn model_limits(model: &str) -> ModelLimits {
    MODEL_LIMITS
        .iter()
        .find(|(name, _)| model.starts_with(name))
        .map_or(DEFAULT_LIMITS, |(_, limits)| *limits)
}

/// Rough token count: four characters per token.
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count() / 4).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetLevel {
    Normal,
    Warn,
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TokenBudget {
    pub system_tokens: u32,
    pub user_tokens: u32,
    pub input_total: u32,
    pub available_for_output: u32,
    pub safe_max_tokens: u32,
    /// Input share of the context window, rounded to one decimal.
    pub utilization_pct: f64,
}

impl TokenBudget {
    pub fn calculate(system: &str, user: &str, model: &str, mode_ceiling: Option<u32>) -> Self {
        let limits = model_limits(model);
        let system_tokens = estimate_tokens(system);
        let user_tokens = estimate_tokens(user);
        let input_total = system_tokens.saturating_add(user_tokens);
        let available_for_output = limits.context.saturating_sub(input_total);
        let safe_max_tokens = limits
            .max_output
            .min(available_for_output.saturating_sub(OUTPUT_HEADROOM))
            .min(mode_ceiling.unwrap_or(u32::MAX))
            .max(MIN_OUTPUT_TOKENS);
        let utilization_pct =
            (f64::from(input_total) / f64::from(limits.context) * 1000.0).round() / 10.0;
        Self {
            system_tokens,
            user_tokens,
            input_total,
            available_for_output,
            safe_max_tokens,
            utilization_pct,
        }
    }

    pub fn level(&self) -> BudgetLevel {
        if self.utilization_pct > ESCALATE_UTILIZATION_PCT {
            BudgetLevel::Escalate
        } else if self.utilization_pct > WARN_UTILIZATION_PCT {
            BudgetLevel::Warn
        } else {
            BudgetLevel::Normal
        }
    }

    /// Output cap to request: `safe_max_tokens`, halved against the remaining
    /// context once utilization escalates.
    pub fn effective_max_tokens(&self) -> u32 {
        match self.level() {
            BudgetLevel::Escalate => self
                .safe_max_tokens
                .min(self.available_for_output / 2)
                .max(MIN_OUTPUT_TOKENS),
            BudgetLevel::Normal | BudgetLevel::Warn => self.safe_max_tokens,
        }
    }
}
