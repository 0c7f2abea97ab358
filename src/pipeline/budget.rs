//! Deterministic budget-allocation rules.
//!
//! Tier selection and dollar math are business logic, not generator
//! output: the generator only proposes the percentage split, and that
//! split is validated here before anything is persisted.
//!
//! Tier boundaries use the strict `<` convention at 30 / 60 / 120 USD,
//! so a $20 budget selects exactly the essentials tier.

use std::collections::BTreeMap;

use crate::errors::PipelineError;

/// Every product category the pipeline knows about, in priority order.
pub const ALL_CATEGORIES: &[&str] = &[
    "facial_wash",
    "moisturizer",
    "sunscreen",
    "treatment",
    "toner",
    "serum",
    "eye_cream",
    "exfoliant",
    "mask",
    "essence",
    "ampoule",
];

const TIER_ESSENTIALS: &[&str] = &["facial_wash", "moisturizer", "sunscreen"];
const TIER_ADDONS: &[&str] = &["facial_wash", "moisturizer", "sunscreen", "treatment"];
const TIER_BOOSTERS: &[&str] = &[
    "facial_wash",
    "moisturizer",
    "sunscreen",
    "treatment",
    "toner",
    "serum",
];

/// Allocation percentages must sum to 100 within this rounding tolerance.
const SUM_TOLERANCE: f64 = 1.0;

/// Parse a free-text dollar budget like `"$20"` or `" 45.50 "`.
pub fn parse_budget(raw: &str) -> Result<f64, PipelineError> {
    let cleaned = raw.trim().trim_start_matches('$').trim();
    let amount: f64 = cleaned
        .parse()
        .map_err(|_| PipelineError::InvalidBudget(raw.to_string()))?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(PipelineError::InvalidBudget(raw.to_string()));
    }
    Ok(amount)
}

/// Category set for a total budget. Four fixed tiers, strict `<` bounds.
pub fn allowed_categories(total: f64) -> &'static [&'static str] {
    if total < 30.0 {
        TIER_ESSENTIALS
    } else if total < 60.0 {
        TIER_ADDONS
    } else if total < 120.0 {
        TIER_BOOSTERS
    } else {
        ALL_CATEGORIES
    }
}

/// Validate a generator-proposed percentage split: only allowed
/// categories, and a total of 100 within tolerance.
pub fn validate_allocation(
    allocation: &BTreeMap<String, f64>,
    allowed: &[&str],
) -> Result<(), PipelineError> {
    for category in allocation.keys() {
        if !allowed.contains(&category.as_str()) {
            return Err(PipelineError::UnknownCategory(category.clone()));
        }
    }
    let sum: f64 = allocation.values().sum();
    if (sum - 100.0).abs() > SUM_TOLERANCE {
        return Err(PipelineError::InvalidAllocation { sum });
    }
    Ok(())
}

/// Per-category dollars: `round(total * percent / 100, 2)`.
pub fn category_budgets(
    allocation: &BTreeMap<String, f64>,
    total: f64,
) -> BTreeMap<String, f64> {
    allocation
        .iter()
        .map(|(category, percent)| (category.clone(), round2(total * percent / 100.0)))
        .collect()
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
