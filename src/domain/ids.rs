//! Content-addressed identifiers and vector similarity.
//!
//! Mirrors the original service's `hashlib.sha256(canonical_json(payload)).hexdigest()[:16]`
//! scheme, consolidated into one helper instead of the three near-identical
//! copies the original kept in its decision/builder/retrieval modules.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Canonicalize `value` to JSON with sorted keys, hash it, and return a
/// `prefix_`-prepended 16-hex-char id.
///
/// `serde_json` serializes maps built from a `BTreeMap`/`serde_json::Map`
/// with `preserve_order` disabled in insertion order, so callers that need
/// deterministic ids across runs must pass pre-sorted structures (the
/// extractor does, by construction).
pub fn content_id(prefix: &str, value: &impl Serialize) -> String {
    let digest = full_hash(value);
    format!("{prefix}_{}", &digest[..16])
}

/// Full sha256 hex digest of the canonical JSON encoding of `value`.
pub fn full_hash(value: &impl Serialize) -> String {
    let canonical = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}

/// Cosine similarity between two vectors. Returns 0.0 if either vector has
/// zero norm. Callers are responsible for skipping dimension-mismatched pairs
/// before calling this — it does not check lengths itself beyond what
/// `zip` silently truncates to, which would silently produce a wrong result,
/// so always gate on `a.len() == b.len()` first.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_id_is_deterministic() {
        let payload = json!({"a": 1, "b": "x"});
        assert_eq!(content_id("ref", &payload), content_id("ref", &payload));
    }

    #[test]
    fn content_id_differs_by_prefix() {
        let payload = json!({"a": 1});
        assert_ne!(content_id("ref", &payload), content_id("artifact", &payload));
    }

    #[test]
    fn cosine_similarity_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_zero_vector_is_zero() {
        let a = vec![1.0, 0.0];
        let zero = vec![0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &zero), 0.0);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }
}
