//! Shopping-search collaborator interface.
//!
//! Two calls: a primary shopping search returning the best hit, and an
//! optional follow-up detail fetch through an opaque reference the first
//! call hands back. Both carry bounded timeouts; a timeout is a typed
//! failure, never a hang.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::FetchError;
use crate::models::ProductDetail;

/// Best result of a shopping search, before any detail enrichment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchHit {
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
    pub snippet: Option<String>,
    /// Opaque reference for the follow-up detail fetch, if offered.
    #[serde(default)]
    pub detail_ref: Option<String>,
}

/// The shopping-search collaborator.
#[async_trait]
pub trait ShoppingSearch: Send + Sync {
    /// `Ok(None)` means the marketplace has no result for this query; it
    /// is a legitimate empty outcome, distinct from a fetch failure.
    async fn search(&self, query: &str) -> Result<Option<SearchHit>, FetchError>;

    async fn detail(&self, detail_ref: &str) -> Result<ProductDetail, FetchError>;
}

/// SerpAPI Google-Shopping binding.
pub struct SerpShoppingClient {
    http: Client,
    api_key: String,
    base_url: String,
    language: String,
    country: String,
    timeout: Duration,
}

impl SerpShoppingClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        language: impl Into<String>,
        country: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FetchError::Network)?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
            language: language.into(),
            country: country.into(),
            timeout,
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Network(e)
        }
    }

    async fn get_json(&self, url: &str, params: &[(&str, &str)]) -> Result<Value, FetchError> {
        let response = self
            .http
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FetchError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?;

        // SerpAPI reports failures inside a 200 body.
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            return Err(FetchError::Api {
                status: status.as_u16(),
                message: error.to_string(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl ShoppingSearch for SerpShoppingClient {
    async fn search(&self, query: &str) -> Result<Option<SearchHit>, FetchError> {
        debug!(%query, "search: called");
        let url = format!("{}/search.json", self.base_url.trim_end_matches('/'));
        let body = self
            .get_json(
                &url,
                &[
                    ("engine", "google_shopping"),
                    ("q", query),
                    ("api_key", self.api_key.as_str()),
                    ("hl", self.language.as_str()),
                    ("gl", self.country.as_str()),
                ],
            )
            .await?;

        let Some(first) = body
            .get("shopping_results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
        else {
            debug!(%query, "search: no shopping results");
            return Ok(None);
        };

        let Some(title) = first.get("title").and_then(Value::as_str) else {
            return Err(FetchError::Malformed("shopping result without title".into()));
        };

        Ok(Some(SearchHit {
            title: title.to_string(),
            price: str_field(first, "price"),
            rating: first.get("rating").and_then(Value::as_f64),
            reviews: first.get("reviews").and_then(Value::as_u64),
            store: str_field(first, "source").or_else(|| str_field(first, "merchant")),
            thumbnail: str_field(first, "thumbnail"),
            link: str_field(first, "product_link").or_else(|| str_field(first, "link")),
            snippet: str_field(first, "snippet"),
            detail_ref: str_field(first, "serpapi_product_api"),
        }))
    }

    async fn detail(&self, detail_ref: &str) -> Result<ProductDetail, FetchError> {
        debug!(%detail_ref, "detail: called");
        let body = self
            .get_json(detail_ref, &[("api_key", self.api_key.as_str())])
            .await?;

        let results = body.get("product_results").cloned().unwrap_or(Value::Null);
        if results.is_null() {
            warn!("detail: response missing product_results");
            return Ok(ProductDetail::default());
        }

        Ok(ProductDetail {
            description: str_field(&results, "description")
                .or_else(|| str_field(&results, "about_this_item"))
                .or_else(|| str_field(&results, "product_description")),
            ingredients: str_field(&results, "ingredients"),
            directions: str_field(&results, "directions"),
            warnings: str_field(&results, "warnings"),
            highlights: results
                .get("highlights")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            rating: results.get("rating").and_then(Value::as_f64),
            reviews: results.get("reviews").and_then(Value::as_u64),
            variants: array_field(&results, "variants"),
            sellers: array_field(&results, "sellers"),
        })
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn array_field(value: &Value, key: &str) -> Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}
