//! Solver Plugins - Commercial NLP Solvers as Runtime Plugins
//!
//! Adapters that load the proprietary SNOPT7 and WORHP nonlinear
//! programming solvers from vendor shared libraries at run time and expose
//! them behind a common algorithm interface. Neither library is linked at
//! build time: each adapter locates the library on disk, opens it and
//! resolves the vendor entry points when it is constructed, so a missing
//! or broken installation is reported immediately instead of mid-solve.
//!
//! # Features
//!
//! - **Run-time binding**: vendor libraries are located by explicit path or
//!   searched by name, opened once and reference counted across adapters
//! - **Fail-fast construction**: a bad path or missing symbol is an error
//!   at adapter construction, never during a solve
//! - **Typed option stores**: solver options keep the type of their first
//!   write and apply last-write-wins on updates
//! - **Policy-driven evolve**: which individual is optimised and which is
//!   replaced is configurable (best, worst, random, fixed index)
//! - **Structured logging**: every N objective evaluations a log line with
//!   objective value and constraint violation is printed and recorded
//!
//! # Example
//!
//! ```no_run
//! use solver_plugins::solvers::snopt7::Snopt7;
//! use solver_plugins::solvers::Algorithm;
//! use solver_plugins::population::Population;
//! use solver_plugins::problem::Problem;
//! use std::sync::Arc;
//!
//! struct Sphere;
//!
//! impl Problem for Sphere {
//!     fn dim(&self) -> usize { 2 }
//!     fn bounds(&self) -> (Vec<f64>, Vec<f64>) { (vec![-1.0; 2], vec![1.0; 2]) }
//!     fn fitness(&self, x: &[f64]) -> Vec<f64> { vec![x.iter().map(|v| v * v).sum()] }
//! }
//!
//! # fn main() -> Result<(), solver_plugins::PluginError> {
//! let uda = Snopt7::new("/opt/snopt7/libsnopt7_c.so", false, 7)?;
//! let pop = Population::random(Arc::new(Sphere), 20, 32);
//! let pop = uda.evolve(pop)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   resolve    ┌──────────────┐   dlopen/dlsym
//! │ LibrarySpec  │ ───────────► │    bind()    │ ─────────────────┐
//! │ (path/name)  │              │ SymbolTable  │                  ▼
//! └──────────────┘              └──────┬───────┘          ┌───────────────┐
//!                                      │ transmute        │ SharedLibrary │
//!                                      ▼                  │  (refcounted) │
//!                               ┌──────────────┐          └───────────────┘
//!                               │  Snopt7Api / │
//!                               │  WorhpApi    │  typed entry points
//!                               └──────┬───────┘
//!                                      │
//!                                      ▼
//!                               ┌──────────────┐  evolve(Population)
//!                               │   Adapter    │ ◄──────────────────
//!                               │ Snopt7/Worhp │  options, policies,
//!                               └──────────────┘  verbosity, log
//! ```

pub mod bind;
pub mod config;
pub mod locate;
pub mod options;
pub mod population;
pub mod problem;
pub mod solvers;

use thiserror::Error;

pub use bind::{bind, open_count, BindError, SharedLibrary, SymbolTable};
pub use config::{ConfigError, PluginConfig};
pub use locate::{LibrarySpec, NotFoundError};
pub use options::{OptionKind, OptionStore, OptionTypeError, OptionValue};
pub use population::Population;
pub use problem::{Problem, SparsityPattern};
pub use solvers::snopt7::Snopt7;
pub use solvers::worhp::Worhp;
pub use solvers::{Algorithm, IndividualPolicy, LogLine, SolveError};

/// Any failure an adapter can report.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The vendor library could not be found on disk.
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    /// The library was found but could not be opened or bound.
    #[error(transparent)]
    Bind(#[from] BindError),

    /// An option was re-set with an incompatible type.
    #[error(transparent)]
    OptionType(#[from] OptionTypeError),

    /// The solve itself failed.
    #[error(transparent)]
    Solve(#[from] SolveError),

    /// `evolve` was called while another solve was running on the same
    /// adapter. Vendor workspaces are not re-entrant.
    #[error("an optimisation is already running on this adapter")]
    Reentrancy,
}

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_wired_to_the_manifest() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn errors_convert_into_the_umbrella_type() {
        let err: PluginError = NotFoundError {
            name: "snopt7_c".to_string(),
            probed: vec![],
        }
        .into();
        assert!(matches!(err, PluginError::NotFound(_)));
        assert!(err.to_string().contains("snopt7_c"));
    }
}
