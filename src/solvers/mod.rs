//! Solver Adapters
//!
//! Each adapter wraps one vendor library behind the host framework's
//! algorithm interface: `evolve` hands a single individual of the input
//! population to the vendor solver and re-inserts the optimised individual
//! if it improves on the selected one. Which individual is selected and
//! which is replaced is configurable per adapter.
//!
//! Adapters bind their vendor library at construction time; a bad library
//! path or a missing entry point is reported by the constructor, never by a
//! later `evolve`.

pub mod snopt7;
pub mod worhp;

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use thiserror::Error;

use crate::population::Population;
use crate::problem::{feasible, violations, Problem};
use crate::PluginError;

/// A failure reported during or around a vendor solve.
#[derive(Debug, Clone, Error)]
pub enum SolveError {
    /// The vendor call finished with a failure status.
    #[error("vendor solver returned status {code}: {message}")]
    Status {
        /// Raw status as reported by the vendor.
        code: i32,
        /// Human-readable description of the status.
        message: String,
    },

    /// The problem in the population is outside the solver's capabilities.
    #[error("{0}")]
    Unsupported(String),

    /// The vendor interface rejected an option.
    #[error("option '{name}' rejected by the vendor interface: {detail}")]
    InvalidOption {
        /// The offending option name.
        name: String,
        /// What went wrong.
        detail: String,
    },

    /// The problem's own fitness or gradient failed mid-solve.
    #[error("user-defined problem failed during the vendor call: {0}")]
    UserFunction(String),

    /// The vendor call produced NaN or infinite fitness output.
    #[error("vendor call produced a non-finite fitness value")]
    NonFinite,

    /// Nonzero verbosity requested while vendor screen output is active.
    #[error("cannot set a nonzero verbosity while vendor screen output is active")]
    ScreenOutput,

    /// A fixed selection/replacement index does not fit the population.
    #[error("individual index {index} out of range for population of size {size}")]
    IndexOutOfRange {
        /// The configured index.
        index: usize,
        /// The population size it was applied to.
        size: usize,
    },
}

/// The algorithm capability interface every adapter satisfies.
pub trait Algorithm {
    /// Run the wrapped solver on one individual of `pop` and return the
    /// updated population. Input value semantics: the caller's population
    /// is consumed and a new one returned; the shared problem object is
    /// never modified.
    fn evolve(&self, pop: Population) -> Result<Population, PluginError>;

    /// Name identifying the wrapped solver.
    fn name(&self) -> String;

    /// Human-readable dump of the adapter's configuration: resolved library
    /// path, verbosity, and the current option snapshot.
    fn extra_info(&self) -> String;

    /// Set the log verbosity: every `level` objective evaluations a log
    /// line is printed and recorded. Zero disables logging. Fails if vendor
    /// screen output was requested at construction.
    fn set_verbosity(&mut self, level: u32) -> Result<(), PluginError>;

    /// Current verbosity level.
    fn verbosity(&self) -> u32;
}

/// Which individual of a population to select for optimisation, or to
/// replace with the optimised result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndividualPolicy {
    /// The best individual under feasible-first comparison.
    Best,
    /// The worst individual under feasible-first comparison.
    Worst,
    /// A uniformly random individual (adapter-seeded RNG).
    Random,
    /// A fixed index.
    Index(usize),
}

/// One line of the optimisation log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    /// Objective evaluations made so far.
    pub objevals: u64,
    /// Objective value at the current decision vector.
    pub objval: f64,
    /// Number of violated constraints.
    pub violated: usize,
    /// L2 norm of the constraint violation.
    pub viol_norm: f64,
    /// Whether the current decision vector is feasible.
    pub feasible: bool,
}

/// Verbosity-gated evaluation logger used from inside vendor callbacks.
pub(crate) struct EvalLogger {
    verbosity: u32,
    count: u64,
    lines: Vec<LogLine>,
}

impl EvalLogger {
    pub(crate) fn new(verbosity: u32) -> Self {
        EvalLogger {
            verbosity,
            count: 0,
            lines: Vec::new(),
        }
    }

    /// Record one objective evaluation; prints and logs every
    /// `verbosity` evaluations.
    pub(crate) fn observe(&mut self, fit: &[f64], prob: &dyn Problem) {
        if self.verbosity != 0 && self.count % u64::from(self.verbosity) == 0 {
            let tol = prob.c_tol();
            let (violated, viol_norm) = violations(fit, prob.nec(), &tol);
            let feas = feasible(fit, prob.nec(), &tol);
            if (self.count / u64::from(self.verbosity)) % 50 == 0 {
                println!(
                    "\n{:>10} {:>15} {:>15} {:>15}",
                    "objevals:", "objval:", "violated:", "viol. norm:"
                );
            }
            println!(
                "{:>10} {:>15} {:>15} {:>15}{}",
                self.count + 1,
                fit[0],
                violated,
                viol_norm,
                if feas { "" } else { " i" }
            );
            self.lines.push(LogLine {
                objevals: self.count + 1,
                objval: fit[0],
                violated,
                viol_norm,
                feasible: feas,
            });
        }
        self.count += 1;
    }

    pub(crate) fn into_lines(self) -> Vec<LogLine> {
        self.lines
    }
}

/// Reject problems the wrapped solvers cannot handle.
pub(crate) fn check_problem_suitable(
    pop: &Population,
    solver: &str,
) -> Result<(), SolveError> {
    let prob = pop.problem();
    if prob.nobj() != 1 {
        return Err(SolveError::Unsupported(format!(
            "multiple objectives detected in {}; {} cannot deal with them",
            prob.name(),
            solver
        )));
    }
    if prob.is_stochastic() {
        return Err(SolveError::Unsupported(format!(
            "the problem {} appears to be stochastic; {} cannot deal with it",
            prob.name(),
            solver
        )));
    }
    Ok(())
}

/// Pick the individual handed to the vendor solver.
pub(crate) fn select_individual(
    pop: &Population,
    policy: IndividualPolicy,
    rng: &mut ChaCha8Rng,
) -> Result<(Vec<f64>, Vec<f64>), SolveError> {
    let idx = policy_index(pop, policy, rng)?;
    Ok((pop.x(idx).to_vec(), pop.f(idx).to_vec()))
}

/// Replace the configured individual with an optimised result.
pub(crate) fn replace_individual(
    pop: &mut Population,
    policy: IndividualPolicy,
    rng: &mut ChaCha8Rng,
    x: Vec<f64>,
    f: Vec<f64>,
) -> Result<(), SolveError> {
    let idx = policy_index(pop, policy, rng)?;
    pop.set_xf(idx, x, f);
    Ok(())
}

fn policy_index(
    pop: &Population,
    policy: IndividualPolicy,
    rng: &mut ChaCha8Rng,
) -> Result<usize, SolveError> {
    // Callers have already returned early on empty populations, so the
    // unwraps on best/worst cannot be reached with len() == 0.
    match policy {
        IndividualPolicy::Best => Ok(pop.best_idx().unwrap_or(0)),
        IndividualPolicy::Worst => Ok(pop.worst_idx().unwrap_or(0)),
        IndividualPolicy::Random => Ok(rng.gen_range(0..pop.len())),
        IndividualPolicy::Index(idx) => {
            if idx < pop.len() {
                Ok(idx)
            } else {
                Err(SolveError::IndexOutOfRange {
                    index: idx,
                    size: pop.len(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::Problem;
    use rand::SeedableRng;
    use std::sync::Arc;

    struct Line;

    impl Problem for Line {
        fn dim(&self) -> usize {
            1
        }
        fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![0.0], vec![10.0])
        }
        fn fitness(&self, x: &[f64]) -> Vec<f64> {
            vec![x[0]]
        }
    }

    fn three() -> Population {
        let mut pop = Population::empty(Arc::new(Line));
        pop.push(vec![5.0]);
        pop.push(vec![1.0]);
        pop.push(vec![9.0]);
        pop
    }

    #[test]
    fn selection_policies_pick_the_expected_individual() {
        let pop = three();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let (x, _) = select_individual(&pop, IndividualPolicy::Best, &mut rng).unwrap();
        assert_eq!(x, vec![1.0]);
        let (x, _) = select_individual(&pop, IndividualPolicy::Worst, &mut rng).unwrap();
        assert_eq!(x, vec![9.0]);
        let (x, _) = select_individual(&pop, IndividualPolicy::Index(0), &mut rng).unwrap();
        assert_eq!(x, vec![5.0]);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let pop = three();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let err = select_individual(&pop, IndividualPolicy::Index(3), &mut rng).unwrap_err();
        assert!(matches!(
            err,
            SolveError::IndexOutOfRange { index: 3, size: 3 }
        ));
    }

    #[test]
    fn random_selection_is_reproducible_per_seed() {
        let pop = three();
        let mut a = ChaCha8Rng::seed_from_u64(123);
        let mut b = ChaCha8Rng::seed_from_u64(123);
        let pick_a = select_individual(&pop, IndividualPolicy::Random, &mut a).unwrap();
        let pick_b = select_individual(&pop, IndividualPolicy::Random, &mut b).unwrap();
        assert_eq!(pick_a, pick_b);
    }

    #[test]
    fn replacement_overwrites_the_policy_target() {
        let mut pop = three();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        replace_individual(
            &mut pop,
            IndividualPolicy::Worst,
            &mut rng,
            vec![0.5],
            vec![0.5],
        )
        .unwrap();
        assert_eq!(pop.x(2), &[0.5]);
        assert_eq!(pop.len(), 3);
    }

    #[test]
    fn logger_records_every_nth_evaluation() {
        let prob = Line;
        let mut logger = EvalLogger::new(2);
        for i in 0..6 {
            logger.observe(&[f64::from(i)], &prob);
        }
        let lines = logger.into_lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].objevals, 1);
        assert_eq!(lines[1].objevals, 3);
        assert_eq!(lines[2].objevals, 5);
        assert!(lines.iter().all(|l| l.feasible));
    }

    #[test]
    fn zero_verbosity_logs_nothing() {
        let prob = Line;
        let mut logger = EvalLogger::new(0);
        for _ in 0..10 {
            logger.observe(&[1.0], &prob);
        }
        assert!(logger.into_lines().is_empty());
    }
}
