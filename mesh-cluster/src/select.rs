//! Weighted random selection (§4.9 step 3, GLOSSARY).

use rand::Rng;

/// Picks one `(node, weight)` entry out of `candidates`, sampling in
/// proportion to weight. Stable ordering is not required, but every entry
/// must be covered by the walk.
pub fn weighted_random_pick(candidates: &[(String, f64)]) -> Option<&str> {
    if candidates.is_empty() {
        return None;
    }
    let total: f64 = candidates.iter().map(|(_, w)| w.max(0.0)).sum();
    if total <= 0.0 {
        // Degenerate all-zero-weight case: fall back to uniform choice so a
        // service with only zero-weight entries is still reachable.
        let idx = rand::rng().random_range(0..candidates.len());
        return Some(candidates[idx].0.as_str());
    }
    let target = rand::rng().random_range(0.0..total);
    let mut running = 0.0;
    for (node, weight) in candidates {
        running += weight.max(0.0);
        if running >= target {
            return Some(node.as_str());
        }
    }
    // Floating point rounding can leave `running` a hair under `target`;
    // the last entry is always the correct fallback.
    candidates.last().map(|(node, _)| node.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn distribution_matches_weights_within_tolerance() {
        let candidates = vec![("b".to_string(), 1.0), ("c".to_string(), 3.0)];
        let mut counts: HashMap<&str, u32> = HashMap::new();
        for _ in 0..10_000 {
            let picked = weighted_random_pick(&candidates).unwrap();
            *counts.entry(picked).or_default() += 1;
        }
        let b_ratio = *counts.get("b").unwrap_or(&0) as f64 / 10_000.0;
        let c_ratio = *counts.get("c").unwrap_or(&0) as f64 / 10_000.0;
        assert!((b_ratio - 0.25).abs() < 0.03, "b_ratio={b_ratio}");
        assert!((c_ratio - 0.75).abs() < 0.03, "c_ratio={c_ratio}");
    }

    #[test]
    fn empty_candidates_yields_none() {
        assert!(weighted_random_pick(&[]).is_none());
    }
}
