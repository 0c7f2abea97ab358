//! Cache-aside product resolution.
//!
//! Resolves free-text product names to enriched marketplace records at
//! minimum external-call cost. Product facts are shared across sessions
//! in the `products_cache` collection (query-keyed, no TTL); who asked
//! for what is recorded per session in `user_recommended_products`
//! (session-keyed, one-year TTL). Splitting the two lets many sessions
//! amortize one external call while keeping a per-user audit trail.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::errors::{ResolveError, StoreError};
use crate::models::{
    CacheStats, CachedProduct, CollectionStats, ProductDetail, ProvenanceRecord,
    RecommendationContext, RecommendedProduct,
};
use crate::shopping::{SearchHit, ShoppingSearch};
use crate::store::StoreHandle;

pub const PRODUCTS_CACHE: &str = "products_cache";
pub const USER_RECOMMENDED: &str = "user_recommended_products";
pub const RESOLVE_LEASES: &str = "resolve_leases";

/// Provenance rows outlive phase data: kept for a year.
const PROVENANCE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How long a single-flight lease shields a normalized key. A holder that
/// dies mid-fetch stalls other resolvers at most this long.
const LEASE_TTL: Duration = Duration::from_secs(10);
const LEASE_POLL: Duration = Duration::from_millis(200);

/// Instructional phrases the generator tends to append to product names;
/// they only confuse the marketplace search.
const QUERY_DENYLIST: &[&str] = &[
    "patch test only",
    "use sparingly",
    "for sensitive skin",
    "apply at night",
    "morning use only",
    "evening use only",
];

static PARENTHETICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^)]*\)").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Normalize a product query into its cache key: case-fold, strip
/// parenthetical annotations and denylisted phrases, collapse whitespace.
/// A pure text transform, no lookups.
pub fn normalize_query(query: &str) -> String {
    let mut text = query.to_lowercase();
    text = PARENTHETICAL.replace_all(&text, "").into_owned();
    for phrase in QUERY_DENYLIST {
        text = text.replace(phrase, "");
    }
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Outcome of one item in a batch resolution. Failures are collected per
/// item; they never abort sibling resolutions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolveOutcome {
    Resolved(CachedProduct),
    NotFound,
    Failed { error: String },
}

impl ResolveOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

pub struct ProductCache {
    store: StoreHandle,
    search: Arc<dyn ShoppingSearch>,
    concurrency: usize,
}

impl ProductCache {
    pub fn new(store: StoreHandle, search: Arc<dyn ShoppingSearch>, concurrency: usize) -> Self {
        Self {
            store,
            search,
            concurrency: concurrency.max(1),
        }
    }

    /// Resolve a free-text product name to an enriched record.
    ///
    /// Cache-aside: the store is consulted first; on miss the external
    /// collaborator is called behind a single-flight lease and the result
    /// written through. Empty search results are never cached. When a
    /// session id is given, a provenance row is written unconditionally:
    /// it records intent-to-recommend, not fetch success.
    pub async fn resolve(
        &self,
        query: &str,
        session_id: Option<&str>,
        context: Option<&RecommendationContext>,
    ) -> Result<Option<CachedProduct>, ResolveError> {
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return Ok(None);
        }

        if let Some(session) = session_id {
            self.record_provenance(session, &normalized, context).await?;
        }

        if let Some(product) = self.lookup(&normalized).await? {
            debug!(query = %normalized, "resolve: cache hit");
            return Ok(Some(product));
        }

        self.fetch_with_lease(&normalized).await
    }

    /// Resolve a batch of queries with bounded concurrency. The result is
    /// parallel to the input: one outcome per query, in order. One item's
    /// failure or empty result never cancels its siblings.
    pub async fn resolve_many(
        &self,
        queries: &[String],
        session_id: Option<&str>,
        shared_context: Option<&RecommendationContext>,
    ) -> Vec<(String, ResolveOutcome)> {
        stream::iter(queries.iter().cloned())
            .map(|query| {
                let session = session_id.map(str::to_string);
                let context = shared_context.cloned();
                async move {
                    let outcome = match self
                        .resolve(&query, session.as_deref(), context.as_ref())
                        .await
                    {
                        Ok(Some(product)) => ResolveOutcome::Resolved(product),
                        Ok(None) => ResolveOutcome::NotFound,
                        Err(e) => {
                            warn!(%query, error = %e, "resolve_many: item failed");
                            ResolveOutcome::Failed {
                                error: e.to_string(),
                            }
                        }
                    };
                    (query, outcome)
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }

    /// All provenance rows for a session, joined with the shared cache.
    pub async fn list_recommended(
        &self,
        session_id: &str,
    ) -> Result<Vec<RecommendedProduct>, StoreError> {
        let prefix = format!("{}:", session_id);
        self.store
            .call(move |s| {
                let mut out = Vec::new();
                for key in s.scan_keys(USER_RECOMMENDED, Some(&prefix))? {
                    let Some(value) = s.get(USER_RECOMMENDED, &key)? else {
                        continue;
                    };
                    let provenance: ProvenanceRecord = serde_json::from_value(value)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                    let product = s
                        .get(PRODUCTS_CACHE, &provenance.query)?
                        .map(serde_json::from_value)
                        .transpose()
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                    out.push(RecommendedProduct {
                        provenance,
                        product,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Totals and last-7-days activity for both collections.
    pub async fn cache_stats(&self) -> Result<CacheStats, StoreError> {
        let week_ago = Utc::now() - chrono::Duration::days(7);
        self.store
            .call(move |s| {
                Ok(CacheStats {
                    products_cache: CollectionStats {
                        total: s.count(PRODUCTS_CACHE, None)?,
                        recent: s.count(PRODUCTS_CACHE, Some(week_ago))?,
                    },
                    user_recommendations: CollectionStats {
                        total: s.count(USER_RECOMMENDED, None)?,
                        recent: s.count(USER_RECOMMENDED, Some(week_ago))?,
                    },
                    generated_at: Utc::now(),
                })
            })
            .await
    }

    async fn lookup(&self, normalized: &str) -> Result<Option<CachedProduct>, StoreError> {
        let key = normalized.to_string();
        let value = self.store.call(move |s| s.get(PRODUCTS_CACHE, &key)).await?;
        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    /// Miss path. The first resolver to claim the lease performs the
    /// external calls; concurrent resolvers for the same key poll the
    /// cache until the winner lands its result or the lease expires.
    /// Best-effort only: a dead lease holder costs a duplicate call,
    /// never a wrong result.
    async fn fetch_with_lease(
        &self,
        normalized: &str,
    ) -> Result<Option<CachedProduct>, ResolveError> {
        let deadline = tokio::time::Instant::now() + LEASE_TTL;
        loop {
            let key = normalized.to_string();
            let acquired = self
                .store
                .call(move |s| {
                    s.put_if_absent(
                        RESOLVE_LEASES,
                        &key,
                        &json!({"acquired_at": Utc::now()}),
                        Some(LEASE_TTL),
                    )
                })
                .await?;

            if acquired {
                let result = self.fetch_and_cache(normalized).await;
                let key = normalized.to_string();
                // Release even on failure so waiters stop stalling.
                if let Err(e) = self.store.call(move |s| s.delete(RESOLVE_LEASES, &key)).await {
                    warn!(query = %normalized, error = %e, "failed to release resolve lease");
                }
                return result;
            }

            debug!(query = %normalized, "resolve: waiting on in-flight fetch");
            tokio::time::sleep(LEASE_POLL).await;
            if let Some(product) = self.lookup(normalized).await? {
                return Ok(Some(product));
            }
            if tokio::time::Instant::now() >= deadline {
                // Lease holder died or found nothing; fetch ourselves.
                return self.fetch_and_cache(normalized).await;
            }
        }
    }

    async fn fetch_and_cache(
        &self,
        normalized: &str,
    ) -> Result<Option<CachedProduct>, ResolveError> {
        let Some(hit) = self.search.search(normalized).await? else {
            // Negative results are not cached; a nonexistent product will
            // re-trigger a search on its next resolution.
            info!(query = %normalized, "resolve: no marketplace result");
            return Ok(None);
        };

        let detail = match &hit.detail_ref {
            Some(detail_ref) => match self.search.detail(detail_ref).await {
                Ok(detail) => Some(detail),
                Err(e) => {
                    // A failed detail fetch must not lose the primary hit.
                    warn!(query = %normalized, error = %e, "detail fetch failed, keeping search hit");
                    None
                }
            },
            None => None,
        };

        let product = merge_product(normalized, hit, detail);
        let key = normalized.to_string();
        let value = serde_json::to_value(&product)
            .map_err(|e| ResolveError::Store(StoreError::Corrupt(e.to_string())))?;
        self.store
            .call(move |s| s.put(PRODUCTS_CACHE, &key, &value, None))
            .await?;
        info!(query = %normalized, "resolve: fetched and cached");
        Ok(Some(product))
    }

    async fn record_provenance(
        &self,
        session_id: &str,
        normalized: &str,
        context: Option<&RecommendationContext>,
    ) -> Result<(), StoreError> {
        let context = context.cloned().unwrap_or_default();
        let record = ProvenanceRecord {
            session_id: session_id.to_string(),
            query: normalized.to_string(),
            category: context.category,
            recommended_price: context.recommended_price,
            ai_recommended: context.ai_recommended,
            future_recommendation: context.future_recommendation,
            recorded_at: Utc::now(),
        };
        let key = format!("{}:{}", session_id, normalized);
        let value = serde_json::to_value(&record)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.store
            .call(move |s| s.put(USER_RECOMMENDED, &key, &value, Some(PROVENANCE_TTL)))
            .await
    }
}

/// Purge expired provenance rows and stale leases. Returns the number of
/// records removed.
pub async fn sweep_expired(store: &StoreHandle) -> Result<u64, StoreError> {
    store
        .call(|s| {
            let provenance = s.purge_expired(USER_RECOMMENDED)?.len() as u64;
            let leases = s.purge_expired(RESOLVE_LEASES)?.len() as u64;
            Ok(provenance + leases)
        })
        .await
}

/// Combine the search hit with the optional detail fetch. The merge never
/// overwrites a truthy field with an empty or absent one.
fn merge_product(normalized: &str, hit: SearchHit, detail: Option<ProductDetail>) -> CachedProduct {
    let detail_description = detail
        .as_ref()
        .and_then(|d| d.description.clone())
        .filter(|s| !s.is_empty());
    let detail_rating = detail.as_ref().and_then(|d| d.rating);
    let detail_reviews = detail.as_ref().and_then(|d| d.reviews);

    CachedProduct {
        query: normalized.to_string(),
        title: hit.title,
        price: hit.price,
        rating: detail_rating.or(hit.rating),
        reviews: detail_reviews.or(hit.reviews),
        store: hit.store,
        thumbnail: hit.thumbnail,
        link: hit.link,
        description: detail_description.or(hit.snippet),
        detail,
        fetched_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FetchError;
    use crate::store::Store;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSearch {
        calls: AtomicUsize,
        detail_calls: AtomicUsize,
        hit: Option<SearchHit>,
        detail: Option<ProductDetail>,
        fail_query: Option<String>,
    }

    impl FakeSearch {
        fn with_hit(hit: SearchHit) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                detail_calls: AtomicUsize::new(0),
                hit: Some(hit),
                detail: None,
                fail_query: None,
            }
        }

        fn empty() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                detail_calls: AtomicUsize::new(0),
                hit: None,
                detail: None,
                fail_query: None,
            }
        }

        fn search_calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ShoppingSearch for FakeSearch {
        async fn search(&self, query: &str) -> Result<Option<SearchHit>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_query.as_deref() == Some(query) {
                return Err(FetchError::Malformed("boom".into()));
            }
            Ok(self.hit.clone())
        }

        async fn detail(&self, _detail_ref: &str) -> Result<ProductDetail, FetchError> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.detail.clone().unwrap_or_default())
        }
    }

    fn hit(title: &str) -> SearchHit {
        SearchHit {
            title: title.to_string(),
            price: Some("$12.99".into()),
            rating: Some(4.5),
            reviews: Some(120),
            store: Some("DermStore".into()),
            snippet: Some("basic snippet".into()),
            ..Default::default()
        }
    }

    fn cache_with(search: Arc<FakeSearch>) -> ProductCache {
        let store = StoreHandle::new(Store::open_in_memory().unwrap());
        ProductCache::new(store, search, 4)
    }

    #[test]
    fn normalization_case_folds_and_trims() {
        assert_eq!(normalize_query("  CeraVe Cleanser "), "cerave cleanser");
        assert_eq!(
            normalize_query("CeraVe Cleanser"),
            normalize_query(" cerave  cleanser ")
        );
    }

    #[test]
    fn normalization_strips_parentheticals_and_denylist() {
        assert_eq!(
            normalize_query("The Ordinary AHA (patch test only)"),
            "the ordinary aha"
        );
        assert_eq!(
            normalize_query("Retinol Serum apply at night"),
            "retinol serum"
        );
    }

    #[tokio::test]
    async fn first_resolve_calls_search_once_then_serves_from_cache() {
        let search = Arc::new(FakeSearch::with_hit(hit("CeraVe Foaming Cleanser")));
        let cache = cache_with(search.clone());

        let first = cache.resolve("CeraVe Cleanser", None, None).await.unwrap();
        assert_eq!(first.unwrap().title, "CeraVe Foaming Cleanser");
        assert_eq!(search.search_calls(), 1);

        // Different surface text, same normalized key: zero new calls.
        let second = cache.resolve(" cerave  cleanser ", None, None).await.unwrap();
        assert_eq!(second.unwrap().title, "CeraVe Foaming Cleanser");
        assert_eq!(search.search_calls(), 1);
    }

    #[tokio::test]
    async fn negative_results_are_not_cached() {
        let search = Arc::new(FakeSearch::empty());
        let cache = cache_with(search.clone());

        assert!(cache.resolve("ghost product", None, None).await.unwrap().is_none());
        assert!(cache.resolve("ghost product", None, None).await.unwrap().is_none());
        assert_eq!(search.search_calls(), 2);
    }

    #[tokio::test]
    async fn provenance_rows_are_per_session_and_share_one_cache_entry() {
        let search = Arc::new(FakeSearch::with_hit(hit("CeraVe Foaming Cleanser")));
        let cache = cache_with(search.clone());

        cache
            .resolve("CeraVe Cleanser", Some("session-a"), None)
            .await
            .unwrap();
        cache
            .resolve("CeraVe Cleanser", Some("session-b"), None)
            .await
            .unwrap();

        assert_eq!(search.search_calls(), 1);

        let a = cache.list_recommended("session-a").await.unwrap();
        let b = cache.list_recommended("session-b").await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].provenance.session_id, "session-a");
        assert_eq!(b[0].provenance.session_id, "session-b");
        assert_eq!(a[0].provenance.query, b[0].provenance.query);
        assert!(a[0].product.is_some());
    }

    #[tokio::test]
    async fn provenance_is_written_even_when_nothing_resolves() {
        let search = Arc::new(FakeSearch::empty());
        let cache = cache_with(search);

        let resolved = cache
            .resolve("ghost product", Some("session-x"), None)
            .await
            .unwrap();
        assert!(resolved.is_none());

        let listed = cache.list_recommended("session-x").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].product.is_none());
    }

    #[tokio::test]
    async fn resolve_many_isolates_per_item_failures() {
        let mut search = FakeSearch::with_hit(hit("CeraVe Foaming Cleanser"));
        search.fail_query = Some("broken query".to_string());
        let cache = cache_with(Arc::new(search));

        let queries = vec![
            "CeraVe Cleanser".to_string(),
            "broken query".to_string(),
            "CeraVe Cleanser ".to_string(),
        ];
        let outcomes = cache.resolve_many(&queries, Some("s"), None).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].0, "CeraVe Cleanser");
        assert!(outcomes[0].1.is_resolved());
        assert!(matches!(outcomes[1].1, ResolveOutcome::Failed { .. }));
        // Third entry normalizes to the first's key: served from cache.
        assert!(outcomes[2].1.is_resolved());
    }

    #[tokio::test]
    async fn batch_duplicates_cost_one_external_call() {
        let search = Arc::new(FakeSearch::with_hit(hit("CeraVe Foaming Cleanser")));
        let cache = cache_with(search.clone());

        let queries = vec![
            "CeraVe Cleanser".to_string(),
            "CeraVe Cleanser ".to_string(),
        ];
        let outcomes = cache.resolve_many(&queries, Some("s"), None).await;
        assert!(outcomes.iter().all(|(_, o)| o.is_resolved()));
        assert_eq!(search.search_calls(), 1);

        // Both surface forms collapse to one cache entry and one
        // provenance row for the session.
        let listed = cache.list_recommended("s").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn waiter_picks_up_winner_result_without_calling_search() {
        let search = Arc::new(FakeSearch::with_hit(hit("should not be fetched")));
        let store = StoreHandle::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(ProductCache::new(store.clone(), search.clone(), 4));

        // Simulate another resolver holding the lease.
        store
            .call(|s| {
                s.put_if_absent(
                    RESOLVE_LEASES,
                    "contested",
                    &json!({"acquired_at": Utc::now()}),
                    Some(Duration::from_secs(10)),
                )
                .map(|_| ())
            })
            .await
            .unwrap();

        let resolver = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.resolve("contested", None, None).await })
        };

        // The winner lands its result while the waiter polls.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let winner = merge_product("contested", hit("Winner Product"), None);
        let value = serde_json::to_value(&winner).unwrap();
        store
            .call(move |s| s.put(PRODUCTS_CACHE, "contested", &value, None))
            .await
            .unwrap();

        let resolved = resolver.await.unwrap().unwrap().unwrap();
        assert_eq!(resolved.title, "Winner Product");
        assert_eq!(search.search_calls(), 0);
    }

    #[test]
    fn merge_keeps_truthy_search_fields_over_empty_detail() {
        let detail = ProductDetail {
            description: Some(String::new()),
            rating: None,
            reviews: None,
            ..Default::default()
        };
        let merged = merge_product("q", hit("Title"), Some(detail));
        // Empty detail description must not erase the snippet; absent
        // detail rating must not erase the search rating.
        assert_eq!(merged.description.as_deref(), Some("basic snippet"));
        assert_eq!(merged.rating, Some(4.5));
        assert_eq!(merged.reviews, Some(120));
    }

    #[test]
    fn merge_prefers_present_detail_fields() {
        let detail = ProductDetail {
            description: Some("full description".into()),
            rating: Some(4.8),
            reviews: Some(999),
            ..Default::default()
        };
        let merged = merge_product("q", hit("Title"), Some(detail));
        assert_eq!(merged.description.as_deref(), Some("full description"));
        assert_eq!(merged.rating, Some(4.8));
        assert_eq!(merged.reviews, Some(999));
    }

    #[tokio::test]
    async fn cache_stats_counts_both_collections() {
        let search = Arc::new(FakeSearch::with_hit(hit("Product")));
        let cache = cache_with(search);

        cache.resolve("product one", Some("s"), None).await.unwrap();
        cache.resolve("product two", Some("s"), None).await.unwrap();

        let stats = cache.cache_stats().await.unwrap();
        assert_eq!(stats.products_cache.total, 2);
        assert_eq!(stats.products_cache.recent, 2);
        assert_eq!(stats.user_recommendations.total, 2);
    }
}
