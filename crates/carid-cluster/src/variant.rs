//! Canonical variant lookup, bounded by a timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const BUILTIN_VARIANTS: &str = include_str!("../../../rules/variants.yaml");

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("failed to parse variant table: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("variant backend failed: {0}")]
    Backend(String),
}

/// `(make, model, raw spec text) -> variant id`, `None` meaning unknown.
#[async_trait]
pub trait VariantLookup: Send + Sync {
    async fn lookup(
        &self,
        make: &str,
        model: &str,
        spec_text: &str,
    ) -> Result<Option<String>, LookupError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRule {
    pub make: String,
    pub model: String,
    pub variant_id: String,
    #[serde(default)]
    pub contains_any: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticVariantTable {
    pub variants: Vec<VariantRule>,
}

impl StaticVariantTable {
    pub fn builtin() -> Result<Self, LookupError> {
        Self::from_yaml_str(BUILTIN_VARIANTS)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, LookupError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn resolve(&self, make: &str, model: &str, spec_text: &str) -> Option<String> {
        let spec = spec_text.to_lowercase();
        let mut rules: Vec<&VariantRule> = self
            .variants
            .iter()
            .filter(|r| r.make.eq_ignore_ascii_case(make) && r.model.eq_ignore_ascii_case(model))
            .collect();
        // Keyword rules before fallbacks; table order otherwise.
        rules.sort_by_key(|r| r.contains_any.is_empty());
        rules
            .into_iter()
            .find(|r| {
                r.contains_any.is_empty()
                    || r
                        .contains_any
                        .iter()
                        .any(|needle| spec.contains(&needle.to_lowercase()))
            })
            .map(|r| r.variant_id.clone())
    }
}

#[async_trait]
impl VariantLookup for StaticVariantTable {
    async fn lookup(
        &self,
        make: &str,
        model: &str,
        spec_text: &str,
    ) -> Result<Option<String>, LookupError> {
        Ok(self.resolve(make, model, spec_text))
    }
}

/// Wraps any lookup so the pipeline never waits longer than `timeout`.
#[derive(Clone)]
pub struct BoundedLookup {
    inner: Arc<dyn VariantLookup>,
    timeout: Duration,
}

impl BoundedLookup {
    pub fn new(inner: Arc<dyn VariantLookup>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Unknown make/model, a failure, or a timeout all fall back to `None`.
    pub async fn resolve(
        &self,
        make: Option<&str>,
        model: Option<&str>,
        spec_text: &str,
    ) -> Option<String> {
        let (Some(make), Some(model)) = (make, model) else {
            return None;
        };
        match tokio::time::timeout(self.timeout, self.inner.lookup(make, model, spec_text)).await {
            Ok(Ok(variant)) => variant,
            Ok(Err(err)) => {
                warn!(make, model, error = %err, "variant lookup failed; using unknown");
                None
            }
            Err(_) => {
                warn!(
                    make,
                    model,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "variant lookup timed out; using unknown"
                );
                None
            }
        }
    }
}
