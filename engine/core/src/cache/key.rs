//! Cache keys
//!
//! A key is `{namespace}:{business_id}:{sha256 hex}`. The digest covers the
//! normalized request and the routing version (model set + weights), so a
//! model reload or weight swap moves every request onto fresh keys. The
//! business id stays readable so invalidation can target one business with a
//! glob pattern.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::request::NormalizedRequest;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an existing key string
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Fingerprint a normalized request
    #[must_use]
    pub fn for_request(namespace: &str, request: &NormalizedRequest, routing_version: &str) -> Self {
        let digest = fingerprint(request, routing_version);
        Self(format!("{namespace}:{}:{digest}", request.business_id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex digest segment
    #[must_use]
    pub fn digest(&self) -> &str {
        self.0.rsplit(':').next().unwrap_or_default()
    }

    /// Business id segment, when the key has the standard shape
    #[must_use]
    pub fn business_id(&self) -> Option<&str> {
        let mut parts = self.0.splitn(3, ':');
        let _namespace = parts.next()?;
        let business = parts.next()?;
        parts.next()?;
        Some(business)
    }

    /// Glob pattern matching every key of one business
    #[must_use]
    pub fn business_pattern(namespace: &str, business_id: &str) -> String {
        format!("{namespace}:{}:*", business_id.trim().to_ascii_lowercase())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tag shared by every entry of a business
#[must_use]
pub fn business_tag(business_id: &str) -> String {
    format!("business:{business_id}")
}

/// Tag shared by every entry computed with one routing version
#[must_use]
pub fn routing_tag(routing_version: &str) -> String {
    format!("routing:{routing_version}")
}

/// SHA-256 over a length-prefixed encoding of every result-affecting field
fn fingerprint(request: &NormalizedRequest, routing_version: &str) -> String {
    let mut hasher = Sha256::new();

    let mut text = |label: &str, value: &str| {
        hasher.update(label.as_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    };
    text("routing", routing_version);
    text("business_id", &request.business_id);
    text("business_name", &request.business_name);
    text("country", &request.country);
    text("industry", &request.industry);
    text("model_type", request.model_type.as_str());

    hasher.update(b"horizons");
    hasher.update((request.horizons.len() as u64).to_le_bytes());
    for horizon in &request.horizons {
        hasher.update(horizon.get().to_le_bytes());
    }

    hasher.update([
        u8::from(request.include_uncertainty),
        u8::from(request.include_model_comparison),
    ]);

    let s = &request.signals;
    for value in [
        s.annual_revenue,
        s.years_in_business,
        s.employee_count,
        s.avg_payment_delay_days,
        s.debt_to_equity,
        s.credit_utilization,
        s.industry_risk,
        s.prior_defaults,
    ] {
        match value {
            Some(v) => {
                hasher.update([1u8]);
                hasher.update(v.to_bits().to_le_bytes());
            }
            None => hasher.update([0u8]),
        }
    }
    hasher.update((s.payment_history.len() as u64).to_le_bytes());
    for v in &s.payment_history {
        hasher.update(v.to_bits().to_le_bytes());
    }

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestLimits, RiskAssessmentRequest};

    fn key_for(request: RiskAssessmentRequest, version: &str) -> CacheKey {
        let normalized = request.normalize(&RequestLimits::default()).unwrap();
        CacheKey::for_request("risk", &normalized, version)
    }

    #[test]
    fn test_equivalent_requests_share_a_key() {
        let a = RiskAssessmentRequest::new("ACME", [12, 3]).with_force_refresh(true);
        let b = RiskAssessmentRequest::new(" acme ", [3, 12, 3])
            .with_metadata("trace_id", serde_json::json!("abc"));
        assert_eq!(key_for(a, "v1"), key_for(b, "v1"));
    }

    #[test]
    fn test_key_changes_with_inputs_and_version() {
        let base = key_for(RiskAssessmentRequest::new("acme", [3]), "v1");
        assert_ne!(base, key_for(RiskAssessmentRequest::new("acme", [3]), "v2"));
        assert_ne!(base, key_for(RiskAssessmentRequest::new("acme", [6]), "v1"));
        assert_ne!(
            base,
            key_for(RiskAssessmentRequest::new("acme", [3]).with_uncertainty(true), "v1")
        );
    }

    #[test]
    fn test_key_shape() {
        let key = key_for(RiskAssessmentRequest::new("Acme-42", [3]), "v1");
        assert_eq!(key.business_id(), Some("acme-42"));
        assert_eq!(key.digest().len(), 64);
        assert!(key.as_str().starts_with("risk:acme-42:"));
        assert_eq!(CacheKey::business_pattern("risk", " Acme-42"), "risk:acme-42:*");
    }
}
