//! Population of candidate solutions.
//!
//! A population couples a shared problem with parallel vectors of decision
//! vectors and their fitness values. Populations have value semantics: the
//! adapters take one by value and return a new one, leaving the caller's
//! copy untouched. The problem object itself is shared by reference and is
//! never mutated by this crate.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::problem::{compare_fc, Problem};

/// A collection of decision vectors with their evaluated fitness.
#[derive(Clone)]
pub struct Population {
    problem: Arc<dyn Problem>,
    xs: Vec<Vec<f64>>,
    fs: Vec<Vec<f64>>,
}

impl Population {
    /// Create an empty population over `problem`.
    pub fn empty(problem: Arc<dyn Problem>) -> Self {
        Population {
            problem,
            xs: Vec::new(),
            fs: Vec::new(),
        }
    }

    /// Create a population of `size` individuals drawn uniformly within the
    /// problem bounds, using an explicit seed so runs are reproducible.
    pub fn random(problem: Arc<dyn Problem>, size: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let (lb, ub) = problem.bounds();
        let mut pop = Population::empty(problem);
        for _ in 0..size {
            let x: Vec<f64> = lb
                .iter()
                .zip(&ub)
                .map(|(&lo, &hi)| if lo < hi { rng.gen_range(lo..hi) } else { lo })
                .collect();
            pop.push(x);
        }
        pop
    }

    /// Append an individual, evaluating its fitness.
    pub fn push(&mut self, x: Vec<f64>) {
        let f = self.problem.fitness(&x);
        self.xs.push(x);
        self.fs.push(f);
    }

    /// Overwrite individual `i` with an already-evaluated pair.
    pub fn set_xf(&mut self, i: usize, x: Vec<f64>, f: Vec<f64>) {
        self.xs[i] = x;
        self.fs[i] = f;
    }

    /// The shared problem.
    pub fn problem(&self) -> &Arc<dyn Problem> {
        &self.problem
    }

    /// Number of individuals.
    pub fn len(&self) -> usize {
        self.xs.len()
    }

    /// Whether the population holds no individuals.
    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    /// Decision-vector dimension.
    pub fn dim(&self) -> usize {
        self.problem.dim()
    }

    /// Decision vector of individual `i`.
    pub fn x(&self, i: usize) -> &[f64] {
        &self.xs[i]
    }

    /// Fitness vector of individual `i`.
    pub fn f(&self, i: usize) -> &[f64] {
        &self.fs[i]
    }

    /// Index of the best individual under feasible-first comparison.
    /// Returns `None` for an empty population.
    pub fn best_idx(&self) -> Option<usize> {
        self.extreme_idx(true)
    }

    /// Index of the worst individual under feasible-first comparison.
    /// Returns `None` for an empty population.
    pub fn worst_idx(&self) -> Option<usize> {
        self.extreme_idx(false)
    }

    fn extreme_idx(&self, best: bool) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let nec = self.problem.nec();
        let tol = self.problem.c_tol();
        let mut idx = 0usize;
        for i in 1..self.len() {
            let beats = compare_fc(&self.fs[i], &self.fs[idx], nec, &tol);
            if beats == best {
                idx = i;
            }
        }
        Some(idx)
    }
}

impl std::fmt::Debug for Population {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Population")
            .field("problem", &self.problem.name())
            .field("size", &self.len())
            .field("dim", &self.dim())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sphere;

    impl Problem for Sphere {
        fn dim(&self) -> usize {
            2
        }
        fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![-1.0, -1.0], vec![1.0, 1.0])
        }
        fn fitness(&self, x: &[f64]) -> Vec<f64> {
            vec![x.iter().map(|v| v * v).sum()]
        }
    }

    #[test]
    fn random_init_respects_bounds_and_seed() {
        let a = Population::random(Arc::new(Sphere), 10, 42);
        let b = Population::random(Arc::new(Sphere), 10, 42);
        let c = Population::random(Arc::new(Sphere), 10, 43);
        assert_eq!(a.len(), 10);
        for i in 0..a.len() {
            assert_eq!(a.x(i), b.x(i));
            for &v in a.x(i) {
                assert!((-1.0..=1.0).contains(&v));
            }
        }
        // A different seed produces a different draw.
        assert!((0..c.len()).any(|i| a.x(i) != c.x(i)));
    }

    #[test]
    fn fitness_is_evaluated_on_push() {
        let mut pop = Population::empty(Arc::new(Sphere));
        pop.push(vec![0.5, 0.5]);
        assert_eq!(pop.f(0), &[0.5]);
    }

    #[test]
    fn best_and_worst_follow_objective_for_unconstrained() {
        let mut pop = Population::empty(Arc::new(Sphere));
        pop.push(vec![1.0, 1.0]); // f = 2.0
        pop.push(vec![0.0, 0.0]); // f = 0.0
        pop.push(vec![0.5, 0.0]); // f = 0.25
        assert_eq!(pop.best_idx(), Some(1));
        assert_eq!(pop.worst_idx(), Some(0));
    }

    #[test]
    fn empty_population_has_no_extremes() {
        let pop = Population::empty(Arc::new(Sphere));
        assert_eq!(pop.best_idx(), None);
        assert_eq!(pop.worst_idx(), None);
    }
}
