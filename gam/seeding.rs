//! Starting points for the smoothing-parameter search.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Log-lambda values are kept inside this interval during seeding and search.
pub const RHO_BOUNDS: (f64, f64) = (-12.0, 12.0);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedStrategy {
    /// Shared values every 4 units plus one-axis-dominant seeds.
    Light,
    /// Only `rho = 0`.
    Single,
}

/// Candidate `rho` vectors: a diagonal sweep with every penalty sharing one value,
/// then seeds that make one axis much smoother than the rest. The second group
/// matters for anisotropic smooths, where the optimum often has very different
/// smoothing parameters per axis. Duplicates are dropped.
pub fn generate_rho_candidates(num_penalties: usize, strategy: SeedStrategy) -> Vec<Array1<f64>> {
    let (lo, hi) = RHO_BOUNDS;
    let mut seeds = Vec::new();

    match strategy {
        SeedStrategy::Single => seeds.push(Array1::zeros(num_penalties)),
        SeedStrategy::Light => {
            let mut v = hi;
            while v >= lo - 1e-9 {
                seeds.push(Array1::from_elem(num_penalties, v));
                v -= 4.0;
            }
            if num_penalties >= 2 {
                for idx in 0..num_penalties {
                    for &(own, rest) in &[(8.0, -4.0), (-4.0, 8.0)] {
                        let mut seed = Array1::from_elem(num_penalties, rest);
                        seed[idx] = own;
                        seeds.push(seed);
                    }
                }
            }
        }
    }

    let mut seen: HashSet<Vec<u64>> = HashSet::new();
    seeds
        .into_iter()
        .filter(|s| seen.insert(s.iter().map(|v| v.to_bits()).collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_strategy_covers_bounds_and_axes() {
        let seeds = generate_rho_candidates(2, SeedStrategy::Light);
        assert!(seeds.iter().any(|s| s.iter().all(|&v| v == 12.0)));
        assert!(seeds.iter().any(|s| s.iter().all(|&v| v == -12.0)));
        assert!(seeds.iter().any(|s| s[0] == 8.0 && s[1] == -4.0));
        assert!(seeds.iter().any(|s| s[0] == -4.0 && s[1] == 8.0));
        assert!(seeds.iter().flatten().all(|&v| (RHO_BOUNDS.0..=RHO_BOUNDS.1).contains(&v)));
    }

    #[test]
    fn seeds_are_unique() {
        let seeds = generate_rho_candidates(2, SeedStrategy::Light);
        let keys: HashSet<Vec<u64>> = seeds
            .iter()
            .map(|s| s.iter().map(|v| v.to_bits()).collect())
            .collect();
        assert_eq!(keys.len(), seeds.len());
    }

    #[test]
    fn single_strategy_is_origin() {
        let seeds = generate_rho_candidates(3, SeedStrategy::Single);
        assert_eq!(seeds.len(), 1);
        assert!(seeds[0].iter().all(|&v| v == 0.0));
    }
}
