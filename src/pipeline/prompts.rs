//! Prompt builders for the generator collaborator.
//!
//! The text here is collaborator input, not core logic: every response is
//! re-validated on the way back in. Prompts ask for bare JSON so the
//! fence-stripping in `genai::parse` is a fallback, not a requirement.

use crate::models::{IntakeForm, SkinAnalysis};

fn profile_block(form: &IntakeForm) -> String {
    let experiences: Vec<String> = form
        .product_experiences
        .iter()
        .map(|p| format!("{} ({:?})", p.product, p.experience))
        .collect();
    format!(
        "User profile:\n\
         - Skin type: {}\n\
         - Skin conditions: {}\n\
         - Allergies: {}\n\
         - Product experiences: {}\n\
         - Goals: {}\n\
         - Budget: {}",
        form.skin_type.join(", "),
        form.skin_conditions.join(", "),
        form.allergies.join(", "),
        experiences.join(", "),
        form.all_goals().join(", "),
        form.budget,
    )
}

fn analysis_block(analysis: &SkinAnalysis) -> String {
    match serde_json::to_string_pretty(analysis) {
        Ok(json) => format!("Skin analysis results:\n{}", json),
        Err(_) => String::new(),
    }
}

/// Phase 2: structured facial-image assessment.
pub fn image_analysis() -> &'static str {
    r#"You are a skincare analysis assistant. Analyze the attached face image and return a JSON object with exactly these fields:

{
  "redness_irritation": "none | mild | moderate | severe",
  "acne_breakouts": {"severity": "none | mild | moderate | severe", "count_estimate": number, "location": ["forehead", "cheeks", "chin"]},
  "blackheads_whiteheads": {"presence": true, "location": []},
  "oiliness_shine": {"level": "low | medium | high", "location": []},
  "dryness_flaking": {"presence": false, "location": []},
  "uneven_skin_tone": "none | mild | moderate | severe",
  "dark_spots_scars": {"presence": false, "description": "short summary"},
  "pores_size": {"level": "small | medium | large", "location": []},
  "hormonal_acne_signs": "yes | no | uncertain",
  "stress_related_flareups": "yes | no",
  "dehydrated_skin_signs": "yes | no",
  "fine_lines_wrinkles": {"presence": false, "areas": []},
  "skin_elasticity": "low | average | high"
}

Respond with the JSON object only, no markdown and no commentary."#
}

/// Phase 3, step 1: percentage split over the allowed categories.
pub fn budget_allocation(form: &IntakeForm, allowed: &[&str]) -> String {
    format!(
        "You are a skincare budget planner. Split the user's total budget into \
         percentages per product category.\n\n\
         Only use these categories: {}\n\n\
         {}\n\n\
         Instructions:\n\
         - Output a JSON object mapping category names to numbers.\n\
         - The values must be raw numbers and must sum to exactly 100.\n\
         - No notes, no explanations, no markdown. JSON only.",
        allowed.join(", "),
        profile_block(form),
    )
}

/// Phase 3, step 2: product picks for one category within its budget.
pub fn category_products(
    category: &str,
    budget: f64,
    form: &IntakeForm,
    analysis: &SkinAnalysis,
) -> String {
    format!(
        "You are a skincare product recommendation expert. Recommend specific \
         {category} products within a ${budget:.2} budget.\n\n\
         {}\n\n\
         {}\n\n\
         Instructions:\n\
         - Recommend 3-5 real {category} products within ${budget:.2}.\n\
         - Avoid ingredients the user is allergic to.\n\
         - Output a JSON array of objects with \"name\" and \"price\" fields.\n\
         - Prices are strings like \"$25.99\".\n\
         - JSON only, no markdown.",
        profile_block(form),
        analysis_block(analysis),
    )
}

/// Phase 3, step 3: categories to grow into once budget allows.
pub fn future_recommendations(
    form: &IntakeForm,
    current: &[&str],
    future: &[&str],
    analysis: &SkinAnalysis,
) -> String {
    format!(
        "Recommend future skincare categories the user should add to their \
         routine when budget allows.\n\n\
         {}\n\
         - Current categories: {}\n\
         - Available future categories: {}\n\n\
         {}\n\n\
         Instructions:\n\
         - Pick 2-3 categories from the available list.\n\
         - Suggest 2-3 specific products for each, with \"name\" and \"price\".\n\
         - Output a JSON array of objects with \"category\" and \"products\" fields.\n\
         - JSON only, no markdown.",
        profile_block(form),
        current.join(", "),
        future.join(", "),
        analysis_block(analysis),
    )
}

/// Phase 4: ordered routine steps from the recommended products.
pub fn routine(form: &IntakeForm, products_json: &str) -> String {
    format!(
        "You are a skincare assistant creating a personalized routine.\n\n\
         {}\n\n\
         Products:\n{}\n\n\
         Instructions:\n\
         - For each product, produce one step with step-by-step usage instructions.\n\
         - Each step is an object with: \"name\", \"tag\", \"description\", \
           \"instructions\" (array of strings), \"duration\" (seconds), \
           \"waiting_time\" (seconds before the next product), \
           \"days\" (object mapping weekday names to booleans), \
           \"time\" (array like [\"morning\", \"night\"]).\n\
         - Output a JSON array of steps in application order.\n\
         - JSON only, no markdown.",
        profile_block(form),
        products_json,
    )
}
