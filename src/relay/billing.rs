//! Quota arithmetic and ratio lookups.
//!
//! One quota unit is one token at ratio 1.0. A call's cost is its token count
//! scaled by the model ratio and the account group's ratio; completion tokens
//! are additionally scaled by the model's completion ratio.

use std::collections::HashMap;

use super::request::Usage;

/// Read-only price tables.
pub trait ModelRatioProvider: Send + Sync {
    /// Price multiplier of a model.
    fn ratio_of(&self, model: &str) -> f64;

    /// Price multiplier of an account group.
    fn group_ratio_of(&self, group: &str) -> f64;

    /// Multiplier applied to completion tokens relative to prompt tokens.
    fn completion_ratio_of(&self, _model: &str) -> f64 {
        1.0
    }
}

/// In-memory [`ModelRatioProvider`] built at startup.
#[derive(Debug, Clone)]
pub struct RatioTable {
    model: HashMap<String, f64>,
    completion: HashMap<String, f64>,
    group: HashMap<String, f64>,
    default_model_ratio: f64,
}

impl Default for RatioTable {
    fn default() -> Self {
        Self {
            model: HashMap::new(),
            completion: HashMap::new(),
            group: HashMap::new(),
            default_model_ratio: 30.0,
        }
    }
}

impl RatioTable {
    /// Empty table; unknown models cost the default ratio.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ratio charged for models missing from the table.
    pub fn with_default_model_ratio(mut self, ratio: f64) -> Self {
        self.default_model_ratio = ratio;
        self
    }

    /// Add or replace a model ratio.
    pub fn with_model(mut self, model: &str, ratio: f64) -> Self {
        self.model.insert(model.to_string(), ratio);
        self
    }

    /// Add or replace a completion ratio.
    pub fn with_completion(mut self, model: &str, ratio: f64) -> Self {
        self.completion.insert(model.to_string(), ratio);
        self
    }

    /// Add or replace a group ratio.
    pub fn with_group(mut self, group: &str, ratio: f64) -> Self {
        self.group.insert(group.to_string(), ratio);
        self
    }

    /// Build from raw tables.
    pub fn from_tables(
        model: HashMap<String, f64>,
        completion: HashMap<String, f64>,
        group: HashMap<String, f64>,
        default_model_ratio: f64,
    ) -> Self {
        Self {
            model,
            completion,
            group,
            default_model_ratio,
        }
    }
}

impl ModelRatioProvider for RatioTable {
    fn ratio_of(&self, model: &str) -> f64 {
        match self.model.get(model) {
            Some(ratio) => *ratio,
            None => {
                tracing::warn!(model, "Model ratio not found, using default {}", self.default_model_ratio);
                self.default_model_ratio
            },
        }
    }

    fn group_ratio_of(&self, group: &str) -> f64 {
        self.group.get(group).copied().unwrap_or(1.0)
    }

    fn completion_ratio_of(&self, model: &str) -> f64 {
        self.completion.get(model).copied().unwrap_or(1.0)
    }
}

/// Ratios resolved once per call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceSnapshot {
    /// Model ratio.
    pub model_ratio: f64,
    /// Group ratio.
    pub group_ratio: f64,
    /// Completion ratio.
    pub completion_ratio: f64,
}

impl PriceSnapshot {
    /// Resolve all ratios for a model and group.
    pub fn resolve(ratios: &dyn ModelRatioProvider, model: &str, group: &str) -> Self {
        Self {
            model_ratio: ratios.ratio_of(model),
            group_ratio: ratios.group_ratio_of(group),
            completion_ratio: ratios.completion_ratio_of(model),
        }
    }

    /// Combined multiplier.
    pub fn ratio(&self) -> f64 {
        self.model_ratio * self.group_ratio
    }

    /// Quota reserved before the call.
    ///
    /// `margin` is a fixed token allowance for the unknown completion; a
    /// requested `max_tokens` is added on top.
    pub fn pre_consumed_quota(&self, prompt_tokens: i64, max_tokens: i64, margin: i64) -> i64 {
        let tokens = margin + prompt_tokens + max_tokens.max(0);
        (tokens as f64 * self.ratio()).ceil() as i64
    }

    /// Quota actually owed for the reported usage.
    pub fn final_quota(&self, usage: &Usage) -> i64 {
        if usage.prompt_tokens + usage.completion_tokens == 0 {
            return 0;
        }

        let ratio = self.ratio();
        let weighted =
            usage.prompt_tokens as f64 + usage.completion_tokens as f64 * self.completion_ratio;
        let quota = (weighted * ratio).ceil() as i64;

        if ratio != 0.0 && quota <= 0 {
            1
        } else {
            quota
        }
    }
}
