//! Domain types shared across the pipeline, store, and API layers.
//!
//! Every phase result is a closed variant of [`PhasePayload`]; ad hoc maps
//! never cross the orchestrator boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Phases ────────────────────────────────────────────────────────────

/// One of the four ordered steps in the recommendation workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intake,
    Analysis,
    Recommendation,
    Routine,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Analysis => "analysis",
            Self::Recommendation => "recommendation",
            Self::Routine => "routine",
        }
    }

    /// 1-based position in the workflow.
    pub fn number(&self) -> u8 {
        match self {
            Self::Intake => 1,
            Self::Analysis => 2,
            Self::Recommendation => 3,
            Self::Routine => 4,
        }
    }

    pub fn all() -> [Phase; 4] {
        [
            Self::Intake,
            Self::Analysis,
            Self::Recommendation,
            Self::Routine,
        ]
    }

    /// Phases that must have a saved, non-expired payload before this one
    /// may be computed. Intake has none; it allocates the session instead.
    pub fn prerequisites(&self) -> &'static [Phase] {
        match self {
            Self::Intake => &[],
            Self::Analysis => &[Phase::Intake],
            Self::Recommendation => &[Phase::Intake, Phase::Analysis],
            Self::Routine => &[Phase::Intake, Phase::Recommendation],
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intake" => Ok(Self::Intake),
            "analysis" => Ok(Self::Analysis),
            "recommendation" => Ok(Self::Recommendation),
            "routine" => Ok(Self::Routine),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

// ── Phase 1: intake form ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceKind {
    Good,
    Bad,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductExperience {
    pub product: String,
    pub experience: ExperienceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Validated user intake form, the phase-1 payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeForm {
    pub skin_type: Vec<String>,
    pub skin_conditions: Vec<String>,
    /// Free-text dollar amount, e.g. `"$20"` or `"45"`.
    pub budget: String,
    pub allergies: Vec<String>,
    #[serde(default)]
    pub product_experiences: Vec<ProductExperience>,
    pub goals: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_goal: Option<String>,
}

impl IntakeForm {
    /// All goals including the free-text one, for prompt building.
    pub fn all_goals(&self) -> Vec<String> {
        let mut goals = self.goals.clone();
        if let Some(custom) = &self.custom_goal {
            goals.push(custom.clone());
        }
        goals
    }
}

// ── Phase 2: skin analysis ────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcneBreakouts {
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub count_estimate: Option<u32>,
    #[serde(default)]
    pub location: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocatedPresence {
    #[serde(default)]
    pub presence: bool,
    #[serde(default)]
    pub location: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocatedLevel {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub location: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DarkSpots {
    #[serde(default)]
    pub presence: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FineLines {
    #[serde(default)]
    pub presence: bool,
    #[serde(default)]
    pub areas: Vec<String>,
}

/// Structured facial-image assessment, the phase-2 payload. Every field is
/// optional: the generator is untrusted and partial output is still useful.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkinAnalysis {
    #[serde(default)]
    pub redness_irritation: Option<String>,
    #[serde(default)]
    pub acne_breakouts: Option<AcneBreakouts>,
    #[serde(default)]
    pub blackheads_whiteheads: Option<LocatedPresence>,
    #[serde(default)]
    pub oiliness_shine: Option<LocatedLevel>,
    #[serde(default)]
    pub dryness_flaking: Option<LocatedPresence>,
    #[serde(default)]
    pub uneven_skin_tone: Option<String>,
    #[serde(default)]
    pub dark_spots_scars: Option<DarkSpots>,
    #[serde(default)]
    pub pores_size: Option<LocatedLevel>,
    #[serde(default)]
    pub hormonal_acne_signs: Option<String>,
    #[serde(default)]
    pub stress_related_flareups: Option<String>,
    #[serde(default)]
    pub dehydrated_skin_signs: Option<String>,
    #[serde(default)]
    pub fine_lines_wrinkles: Option<FineLines>,
    #[serde(default)]
    pub skin_elasticity: Option<String>,
}

// ── Phase 3: recommendation ───────────────────────────────────────────

/// A single AI-suggested product, before enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductPick {
    pub name: String,
    pub price: String,
}

/// An AI-suggested product joined with its resolved marketplace record,
/// when resolution succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedProduct {
    pub name: String,
    pub price: String,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<CachedProduct>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FutureRecommendation {
    pub category: String,
    pub products: Vec<EnrichedProduct>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentSummary {
    pub searched: usize,
    pub resolved: usize,
    pub failed: usize,
}

/// Budget allocation plus enriched per-category product lists, the
/// phase-3 payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationResult {
    /// Percentage split over the allowed categories, summing to 100.
    pub allocation: BTreeMap<String, f64>,
    /// Per-category dollars, `round(total * percent / 100, 2)`.
    pub category_budgets: BTreeMap<String, f64>,
    pub total_budget: f64,
    pub products: BTreeMap<String, Vec<EnrichedProduct>>,
    pub future_recommendations: Vec<FutureRecommendation>,
    pub enrichment: EnrichmentSummary,
}

// ── Phase 4: routine ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineStep {
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub instructions: Vec<String>,
    /// Application time in seconds.
    #[serde(default)]
    pub duration: u32,
    /// Wait before the next product, in seconds.
    #[serde(default)]
    pub waiting_time: u32,
    #[serde(default)]
    pub days: BTreeMap<String, bool>,
    /// Times of day, e.g. `["morning", "night"]`.
    #[serde(default)]
    pub time: Vec<String>,
}

/// Ordered routine steps, the phase-4 payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineResult {
    pub routine: Vec<RoutineStep>,
}

// ── Phase payload sum ─────────────────────────────────────────────────

/// Closed sum of the four phase-result shapes. The tag matches
/// [`Phase::as_str`], so a stored record is self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", content = "data", rename_all = "snake_case")]
pub enum PhasePayload {
    Intake(IntakeForm),
    Analysis(SkinAnalysis),
    Recommendation(RecommendationResult),
    Routine(RoutineResult),
}

impl PhasePayload {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Intake(_) => Phase::Intake,
            Self::Analysis(_) => Phase::Analysis,
            Self::Recommendation(_) => Phase::Recommendation,
            Self::Routine(_) => Phase::Routine,
        }
    }
}

// ── Product cache and provenance ──────────────────────────────────────

/// Extra fields from the follow-up detail fetch. Kept separate from the
/// search fields so the merge rule is explicit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductDetail {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ingredients: Option<String>,
    #[serde(default)]
    pub directions: Option<String>,
    #[serde(default)]
    pub warnings: Option<String>,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub reviews: Option<u64>,
    #[serde(default)]
    pub variants: Vec<Value>,
    #[serde(default)]
    pub sellers: Vec<Value>,
}

/// One marketplace record per normalized query, shared across sessions.
/// No TTL; refreshed only by an explicit re-fetch (last-write-wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedProduct {
    /// Normalized query text, the cache key.
    pub query: String,
    pub title: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub reviews: Option<u64>,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ProductDetail>,
    pub fetched_at: DateTime<Utc>,
}

/// Why a product was resolved on behalf of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendationContext {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub recommended_price: Option<String>,
    #[serde(default)]
    pub ai_recommended: bool,
    #[serde(default)]
    pub future_recommendation: bool,
}

/// Session-scoped audit entry linking a session to a resolved product.
/// Many sessions may reference the same cached product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub session_id: String,
    /// Normalized query, referencing the cached product.
    pub query: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub recommended_price: Option<String>,
    #[serde(default)]
    pub ai_recommended: bool,
    #[serde(default)]
    pub future_recommendation: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Provenance joined with the shared cache entry, for listing endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendedProduct {
    pub provenance: ProvenanceRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<CachedProduct>,
}

// ── Session bookkeeping ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub exists: bool,
    /// Completion flag per phase name.
    pub phases: BTreeMap<String, bool>,
    pub completed_phases: usize,
    pub total_phases: usize,
    pub progress_percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub session_id: String,
    pub deleted_phases: Vec<String>,
    pub total_deleted: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub deleted_by_phase: BTreeMap<String, u64>,
    pub total_deleted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub total: u64,
    pub recent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub products_cache: CollectionStats,
    pub user_recommendations: CollectionStats,
    pub generated_at: DateTime<Utc>,
}
