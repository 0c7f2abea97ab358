//! Four-phase orchestrator.
//!
//! Enforces the workflow ordering (intake → analysis → recommendation →
//! routine), combines prior-phase outputs into the next phase's input,
//! invokes the generator collaborator, and triggers product enrichment.
//! A phase computation fails atomically: nothing is persisted unless the
//! whole phase succeeded, so a failed run leaves earlier records intact.

pub mod budget;
pub mod prompts;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::PipelineError;
use crate::genai::{GenerationRequest, InlineImage, TextGenerator, parse};
use crate::models::{
    EnrichedProduct, EnrichmentSummary, FutureRecommendation, IntakeForm, Phase, PhasePayload,
    ProductPick, RecommendationContext, RecommendationResult, RoutineResult, RoutineStep,
    SkinAnalysis,
};
use crate::products::{ProductCache, ResolveOutcome};
use crate::sessions::PhaseStore;

/// Shape of one future-recommendation entry as proposed by the generator.
#[derive(Debug, Deserialize)]
struct FutureCategoryPick {
    category: String,
    #[serde(default)]
    products: Vec<ProductPick>,
}

pub struct Pipeline {
    phases: PhaseStore,
    products: Arc<ProductCache>,
    generator: Arc<dyn TextGenerator>,
}

impl Pipeline {
    pub fn new(
        phases: PhaseStore,
        products: Arc<ProductCache>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            phases,
            products,
            generator,
        }
    }

    /// Load a prerequisite phase or fail with a typed precondition error
    /// naming the missing phase. Never proceeds with partial data.
    async fn require_phase(
        &self,
        session_id: &str,
        requested: Phase,
        needed: Phase,
    ) -> Result<PhasePayload, PipelineError> {
        self.phases
            .load_phase(session_id, needed)
            .await?
            .ok_or(PipelineError::PreconditionFailed {
                requested,
                missing: needed,
            })
    }

    async fn require_intake(
        &self,
        session_id: &str,
        requested: Phase,
    ) -> Result<IntakeForm, PipelineError> {
        match self.require_phase(session_id, requested, Phase::Intake).await? {
            PhasePayload::Intake(form) => Ok(form),
            other => Err(crate::errors::StoreError::Corrupt(format!(
                "intake record holds a {} payload",
                other.phase()
            ))
            .into()),
        }
    }

    /// Phase 1: validate and persist the intake form, allocating a new
    /// session id.
    pub async fn run_intake(
        &self,
        form: IntakeForm,
    ) -> Result<(String, IntakeForm), PipelineError> {
        // Fail fast on a budget phase 3 could never use.
        budget::parse_budget(&form.budget)?;

        let session_id = PhaseStore::new_session_id();
        self.phases
            .save_phase(&session_id, &PhasePayload::Intake(form.clone()))
            .await?;
        info!(session = %session_id, "intake saved");
        Ok((session_id, form))
    }

    /// Phase 2: facial-image analysis via the generator collaborator.
    pub async fn run_analysis(
        &self,
        session_id: &str,
        image: InlineImage,
    ) -> Result<SkinAnalysis, PipelineError> {
        self.require_phase(session_id, Phase::Analysis, Phase::Intake)
            .await?;

        let raw = self
            .generator
            .generate(GenerationRequest::with_image(prompts::image_analysis(), image))
            .await?;
        let analysis: SkinAnalysis = parse::parse_payload(&raw)?;

        self.phases
            .save_phase(session_id, &PhasePayload::Analysis(analysis.clone()))
            .await?;
        info!(session = %session_id, "analysis saved");
        Ok(analysis)
    }

    /// Phase 3: budget allocation, per-category product picks, future
    /// recommendations, and marketplace enrichment.
    pub async fn run_recommendation(
        &self,
        session_id: &str,
    ) -> Result<RecommendationResult, PipelineError> {
        let form = self.require_intake(session_id, Phase::Recommendation).await?;
        let analysis = match self
            .require_phase(session_id, Phase::Recommendation, Phase::Analysis)
            .await?
        {
            PhasePayload::Analysis(analysis) => analysis,
            other => {
                return Err(crate::errors::StoreError::Corrupt(format!(
                    "analysis record holds a {} payload",
                    other.phase()
                ))
                .into());
            }
        };

        let total_budget = budget::parse_budget(&form.budget)?;
        let allowed = budget::allowed_categories(total_budget);
        let allocation = self.request_allocation(&form, allowed).await?;
        let category_budgets = budget::category_budgets(&allocation, total_budget);

        // Generator calls all happen before any enrichment or persistence
        // so a failure here writes nothing.
        let mut picks_by_category: BTreeMap<String, Vec<ProductPick>> = BTreeMap::new();
        for (category, amount) in &category_budgets {
            let raw = self
                .generator
                .generate(GenerationRequest::text(prompts::category_products(
                    category, *amount, &form, &analysis,
                )))
                .await?;
            let picks: Vec<ProductPick> = parse::parse_payload(&raw)?;
            picks_by_category.insert(category.clone(), picks);
        }

        let current: Vec<&str> = category_budgets.keys().map(String::as_str).collect();
        let future_categories: Vec<&str> = budget::ALL_CATEGORIES
            .iter()
            .copied()
            .filter(|c| !current.contains(c))
            .collect();
        let future_picks: Vec<FutureCategoryPick> = if future_categories.is_empty() {
            Vec::new()
        } else {
            let raw = self
                .generator
                .generate(GenerationRequest::text(prompts::future_recommendations(
                    &form,
                    &current,
                    &future_categories,
                    &analysis,
                )))
                .await?;
            parse::parse_payload(&raw)?
        };

        let mut summary = EnrichmentSummary::default();
        let mut products = BTreeMap::new();
        for (category, picks) in picks_by_category {
            let context = RecommendationContext {
                category: Some(category.clone()),
                ai_recommended: true,
                ..Default::default()
            };
            let enriched = self
                .enrich_picks(session_id, picks, &context, &mut summary)
                .await;
            products.insert(category, enriched);
        }

        let mut future_recommendations = Vec::new();
        for pick in future_picks {
            let context = RecommendationContext {
                category: Some(pick.category.clone()),
                ai_recommended: true,
                future_recommendation: true,
                ..Default::default()
            };
            let enriched = self
                .enrich_picks(session_id, pick.products, &context, &mut summary)
                .await;
            future_recommendations.push(FutureRecommendation {
                category: pick.category,
                products: enriched,
            });
        }

        let result = RecommendationResult {
            allocation,
            category_budgets,
            total_budget,
            products,
            future_recommendations,
            enrichment: summary,
        };
        self.phases
            .save_phase(session_id, &PhasePayload::Recommendation(result.clone()))
            .await?;
        info!(
            session = %session_id,
            searched = result.enrichment.searched,
            resolved = result.enrichment.resolved,
            "recommendation saved"
        );
        Ok(result)
    }

    /// Phase 4: ordered routine steps derived from the phase-3 products.
    pub async fn run_routine(&self, session_id: &str) -> Result<RoutineResult, PipelineError> {
        let form = self.require_intake(session_id, Phase::Routine).await?;
        let recommendation = match self
            .require_phase(session_id, Phase::Routine, Phase::Recommendation)
            .await?
        {
            PhasePayload::Recommendation(r) => r,
            other => {
                return Err(crate::errors::StoreError::Corrupt(format!(
                    "recommendation record holds a {} payload",
                    other.phase()
                ))
                .into());
            }
        };

        // Hand the generator just the names and prices, not the full
        // enriched records.
        let slim: BTreeMap<&str, Vec<serde_json::Value>> = recommendation
            .products
            .iter()
            .map(|(category, picks)| {
                let entries = picks
                    .iter()
                    .map(|p| serde_json::json!({"name": p.name, "price": p.price}))
                    .collect();
                (category.as_str(), entries)
            })
            .collect();
        let products_json = serde_json::to_string_pretty(&slim)
            .map_err(|e| crate::errors::StoreError::Corrupt(e.to_string()))?;

        let raw = self
            .generator
            .generate(GenerationRequest::text(prompts::routine(&form, &products_json)))
            .await?;
        let routine = RoutineResult {
            routine: parse_routine_steps(&raw)?,
        };

        self.phases
            .save_phase(session_id, &PhasePayload::Routine(routine.clone()))
            .await?;
        info!(session = %session_id, steps = routine.routine.len(), "routine saved");
        Ok(routine)
    }

    /// Ask the generator for a percentage split, validating the result.
    /// Malformed-but-parsable output (bad sum, stray category) gets one
    /// re-request; unparsable output is surfaced immediately.
    async fn request_allocation(
        &self,
        form: &IntakeForm,
        allowed: &[&str],
    ) -> Result<BTreeMap<String, f64>, PipelineError> {
        let prompt = prompts::budget_allocation(form, allowed);
        let allocation = self.generate_allocation(&prompt).await?;
        match budget::validate_allocation(&allocation, allowed) {
            Ok(()) => Ok(allocation),
            Err(issue) => {
                warn!(%issue, "allocation rejected, re-requesting");
                let retry = self.generate_allocation(&prompt).await?;
                budget::validate_allocation(&retry, allowed)?;
                Ok(retry)
            }
        }
    }

    async fn generate_allocation(
        &self,
        prompt: &str,
    ) -> Result<BTreeMap<String, f64>, PipelineError> {
        let raw = self
            .generator
            .generate(GenerationRequest::text(prompt))
            .await?;
        Ok(parse::parse_payload(&raw)?)
    }

    async fn enrich_picks(
        &self,
        session_id: &str,
        picks: Vec<ProductPick>,
        context: &RecommendationContext,
        summary: &mut EnrichmentSummary,
    ) -> Vec<EnrichedProduct> {
        let queries: Vec<String> = picks.iter().map(|p| p.name.clone()).collect();
        let outcomes = self
            .products
            .resolve_many(&queries, Some(session_id), Some(context))
            .await;

        picks
            .into_iter()
            .zip(outcomes)
            .map(|(pick, (_, outcome))| {
                summary.searched += 1;
                let product = match outcome {
                    ResolveOutcome::Resolved(product) => {
                        summary.resolved += 1;
                        Some(product)
                    }
                    ResolveOutcome::NotFound => None,
                    ResolveOutcome::Failed { .. } => {
                        summary.failed += 1;
                        None
                    }
                };
                EnrichedProduct {
                    name: pick.name,
                    price: pick.price,
                    resolved: product.is_some(),
                    product,
                }
            })
            .collect()
    }
}

/// The generator sometimes returns the routine as an array of steps and
/// sometimes as an object keyed by product type; accept both.
fn parse_routine_steps(raw: &str) -> Result<Vec<RoutineStep>, PipelineError> {
    let value = parse::extract_json(raw)?;
    let steps = match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<RoutineStep>, _>>(),
        serde_json::Value::Object(map) => map
            .into_values()
            .map(serde_json::from_value)
            .collect::<Result<Vec<RoutineStep>, _>>(),
        _ => {
            return Err(crate::errors::GenerationError::Parse(
                "routine is neither an array nor an object".into(),
            )
            .into());
        }
    };
    steps.map_err(|e| crate::errors::GenerationError::Parse(e.to_string()).into())
}
