//! SNOPT7 adapter.
//!
//! Wraps the commercial SNOPT7 sparse SQP solver through its C interface
//! (`snopt7_c`). The library is located and bound when the adapter is
//! constructed; `evolve` marshals one individual of the population into the
//! `snOptA` calling convention, runs the solve, and re-inserts the result if
//! it improves on the selected individual.
//!
//! The adapter smuggles a pointer to its callback context through the
//! vendor's integer user workspace (`iu`), the channel `snOptA` hands back
//! to the user function on every evaluation.

use std::ffi::CString;
use std::fmt::Write as _;
use std::os::raw::{c_char, c_double, c_int};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::bind::{bind, BindError, SymbolTable};
use crate::locate::LibrarySpec;
use crate::options::{OptionStore, OptionTypeError};
use crate::population::Population;
use crate::problem::compare_fc;
use crate::solvers::{
    check_problem_suitable, replace_individual, select_individual, Algorithm, EvalLogger,
    IndividualPolicy, LogLine, SolveError,
};
use crate::PluginError;

/// The `snOptA` user function: evaluates the fitness vector `F` (and the
/// nonzero gradient entries `G`) at `x`.
pub type SnFunA = unsafe extern "C" fn(
    status: *mut c_int,
    n: *mut c_int,
    x: *mut c_double,
    need_f: *mut c_int,
    nf: *mut c_int,
    f: *mut c_double,
    need_g: *mut c_int,
    neg: *mut c_int,
    g: *mut c_double,
    cu: *mut c_char,
    lencu: *mut c_int,
    iu: *mut c_int,
    leniu: *mut c_int,
    ru: *mut c_double,
    lenru: *mut c_int,
);

/// The vendor workspace handed to every `snopt7_c` entry point.
///
/// Field order matches the `snProblem` struct of the C interface; only
/// `iu`/`leniu` are used by the adapter, the rest is owned by the vendor.
#[repr(C)]
pub struct SnProblem {
    name: *mut c_char,

    mem_called: c_int,
    init_called: c_int,

    sn_stop: *const std::ffi::c_void,
    sn_log: *const std::ffi::c_void,
    sn_log2: *const std::ffi::c_void,
    sq_log: *const std::ffi::c_void,

    lenrw: c_int,
    leniw: c_int,
    iw: *mut c_int,
    rw: *mut c_double,

    lenru: c_int,
    leniu: c_int,
    iu: *mut c_int,
    ru: *mut c_double,
}

impl SnProblem {
    fn zeroed(name: *mut c_char) -> Self {
        SnProblem {
            name,
            mem_called: 0,
            init_called: 0,
            sn_stop: std::ptr::null(),
            sn_log: std::ptr::null(),
            sn_log2: std::ptr::null(),
            sq_log: std::ptr::null(),
            lenrw: 0,
            leniw: 0,
            iw: std::ptr::null_mut(),
            rw: std::ptr::null_mut(),
            lenru: 0,
            leniu: 0,
            iu: std::ptr::null_mut(),
            ru: std::ptr::null_mut(),
        }
    }
}

type SnInitFn = unsafe extern "C" fn(*mut SnProblem, *mut c_char, *mut c_char, c_int);
type SetIntParameterFn = unsafe extern "C" fn(*mut SnProblem, *mut c_char, c_int) -> c_int;
type SetRealParameterFn = unsafe extern "C" fn(*mut SnProblem, *mut c_char, c_double) -> c_int;
type DeleteSnoptFn = unsafe extern "C" fn(*mut SnProblem);
#[allow(clippy::type_complexity)]
type SolveAFn = unsafe extern "C" fn(
    prob: *mut SnProblem,
    start: c_int,
    nf: c_int,
    n: c_int,
    obj_add: c_double,
    obj_row: c_int,
    usrfun: SnFunA,
    ne_a: c_int,
    i_afun: *mut c_int,
    j_avar: *mut c_int,
    a: *mut c_double,
    ne_g: c_int,
    i_gfun: *mut c_int,
    j_gvar: *mut c_int,
    xlow: *mut c_double,
    xupp: *mut c_double,
    flow: *mut c_double,
    fupp: *mut c_double,
    x: *mut c_double,
    xstate: *mut c_int,
    xmul: *mut c_double,
    f: *mut c_double,
    fstate: *mut c_int,
    fmul: *mut c_double,
    n_s: *mut c_int,
    n_inf: *mut c_int,
    s_inf: *mut c_double,
) -> c_int;

/// Typed entry points of the `snopt7_c` interface.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Snopt7Api {
    pub(crate) sn_init: SnInitFn,
    pub(crate) set_int_parameter: SetIntParameterFn,
    pub(crate) set_real_parameter: SetRealParameterFn,
    pub(crate) delete_snopt: DeleteSnoptFn,
    pub(crate) solve_a: SolveAFn,
}

impl Snopt7Api {
    /// Every symbol the adapter needs. Resolved atomically at bind time.
    pub(crate) const REQUIRED_SYMBOLS: &'static [&'static str] = &[
        "snInit",
        "setIntParameter",
        "setRealParameter",
        "deleteSNOPT",
        "solveA",
    ];

    /// Reinterpret the bound addresses as typed entry points.
    ///
    /// The caller vouches, by having bound the table against
    /// [`Self::REQUIRED_SYMBOLS`], that the addresses really carry the
    /// `snopt7_c` signatures.
    pub(crate) fn from_table(table: &SymbolTable) -> Result<Self, BindError> {
        unsafe {
            Ok(Snopt7Api {
                sn_init: std::mem::transmute::<usize, SnInitFn>(table.require("snInit")?),
                set_int_parameter: std::mem::transmute::<usize, SetIntParameterFn>(
                    table.require("setIntParameter")?,
                ),
                set_real_parameter: std::mem::transmute::<usize, SetRealParameterFn>(
                    table.require("setRealParameter")?,
                ),
                delete_snopt: std::mem::transmute::<usize, DeleteSnoptFn>(
                    table.require("deleteSNOPT")?,
                ),
                solve_a: std::mem::transmute::<usize, SolveAFn>(table.require("solveA")?),
            })
        }
    }
}

/// Human-readable description of a `snOptA` return code.
pub fn result_message(code: i32) -> &'static str {
    match code {
        0 => "None",
        1 => "Finished successfully - optimality conditions satisfied",
        2 => "Finished successfully - feasible point found",
        3 => "Finished successfully - requested accuracy could not be achieved",
        5 => "Finished successfully - elastic objective minimized",
        6 => "Finished successfully - elastic infeasibilities minimized",
        11 => "The problem appears to be infeasible - infeasible linear constraints",
        12 => "The problem appears to be infeasible - infeasible linear equality constraints",
        13 => "The problem appears to be infeasible - nonlinear infeasibilities minimized",
        14 => "The problem appears to be infeasible - linear infeasibilities minimized",
        15 => "The problem appears to be infeasible - infeasible linear constraints in QP subproblem",
        16 => "The problem appears to be infeasible - infeasible nonelastic constraints",
        21 => "The problem appears to be unbounded - unbounded objective",
        22 => "The problem appears to be unbounded - constraint violation limit reached",
        31 => "Resource limit error - iteration limit reached",
        32 => "Resource limit error - major iteration limit reached",
        33 => "Resource limit error - the superbasics limit is too small",
        34 => "Resource limit error - time limit reached",
        41 => "Terminated after numerical difficulties - current point cannot be improved",
        42 => "Terminated after numerical difficulties - singular basis",
        43 => "Terminated after numerical difficulties - cannot satisfy the general constraints",
        44 => "Terminated after numerical difficulties - ill-conditioned null-space basis",
        45 => "Terminated after numerical difficulties - unable to compute acceptable LU factors",
        51 => "Error in the user-supplied functions - incorrect objective derivatives",
        52 => "Error in the user-supplied functions - incorrect constraint derivatives",
        56 => "Error in the user-supplied functions - irregular or badly scaled problem functions",
        61 => "Undefined user-supplied functions - undefined function at the first feasible point",
        62 => "Undefined user-supplied functions - undefined function at the initial point",
        63 => "Undefined user-supplied functions - unable to proceed into undefined region",
        71 => "User requested termination - terminated during function evaluation",
        74 => "User requested termination - terminated from monitor routine",
        81 => "Insufficient storage allocated - work arrays must have at least 500 elements",
        82 => "Insufficient storage allocated - not enough character storage",
        83 => "Insufficient storage allocated - not enough integer storage",
        84 => "Insufficient storage allocated - not enough real storage",
        91 => "Input arguments out of range - invalid input argument",
        92 => "Input arguments out of range - basis file dimensions do not match this problem",
        141 => "System error - wrong number of basic variables",
        142 => "System error - error in basis package",
        _ => "Unknown SNOPT7 return code",
    }
}

fn is_success(code: i32) -> bool {
    matches!(code, 0 | 1 | 2 | 3 | 5 | 6)
}

/// Everything the user function needs, reachable from the vendor callback
/// through the pointer hidden in `SnProblem::iu`.
struct CallbackCtx<'a> {
    problem: &'a dyn crate::problem::Problem,
    dv: Vec<f64>,
    logger: EvalLogger,
    error: Option<SolveError>,
}

/// The `snOptA` user function. Recovers the context from the integer user
/// workspace, evaluates fitness and gradient, and reports failure through
/// the status the vendor checks after each call (negative aborts the run).
unsafe extern "C" fn usrfun(
    status: *mut c_int,
    _n: *mut c_int,
    x: *mut c_double,
    need_f: *mut c_int,
    nf: *mut c_int,
    f: *mut c_double,
    need_g: *mut c_int,
    neg: *mut c_int,
    g: *mut c_double,
    _cu: *mut c_char,
    _lencu: *mut c_int,
    iu: *mut c_int,
    _leniu: *mut c_int,
    _ru: *mut c_double,
    _lenru: *mut c_int,
) {
    let ctx = &mut *(iu as *mut CallbackCtx<'_>);
    if ctx.error.is_some() {
        // A previous evaluation already failed; keep telling the vendor
        // to stop in case it ignored the first report.
        *status = -100;
        return;
    }

    let dim = ctx.dv.len();
    ctx.dv.copy_from_slice(std::slice::from_raw_parts(x, dim));
    let want_f = *need_f > 0;
    let want_g = *need_g > 0;
    let f_out = std::slice::from_raw_parts_mut(f, *nf as usize);
    let g_out = std::slice::from_raw_parts_mut(g, *neg as usize);

    // The problem implementation is user code; a panic must not unwind
    // into the vendor's frames.
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        if want_f {
            let fit = ctx.problem.fitness(&ctx.dv);
            if fit.iter().any(|v| !v.is_finite()) {
                return Err(SolveError::NonFinite);
            }
            f_out.copy_from_slice(&fit[..f_out.len()]);
            ctx.logger.observe(&fit, ctx.problem);
        }
        if want_g && ctx.problem.has_gradient() {
            let grad = ctx.problem.gradient(&ctx.dv);
            g_out.copy_from_slice(&grad[..g_out.len()]);
        }
        Ok(())
    }));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            ctx.error = Some(err);
            *status = -100;
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "fitness evaluation panicked".to_string());
            ctx.error = Some(SolveError::UserFunction(msg));
            *status = -100;
        }
    }
}

/// Calls `deleteSNOPT` on drop, releasing whatever workspace `snInit`
/// allocated, on every exit path of the solve.
struct WorkspaceGuard<'a> {
    api: &'a Snopt7Api,
    prob: *mut SnProblem,
}

impl Drop for WorkspaceGuard<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.delete_snopt)(self.prob) };
    }
}

/// Clears the in-flight flag when the evolve frame unwinds or returns.
struct EvolveGuard<'a>(&'a AtomicBool);

impl Drop for EvolveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The SNOPT7 user-defined algorithm.
#[derive(Debug)]
pub struct Snopt7 {
    api: Snopt7Api,
    // Keeps the vendor image open for the adapter's lifetime. Absent only
    // for adapters built around an injected API in tests.
    _table: Option<SymbolTable>,
    path: PathBuf,
    minor_version: u32,
    screen_output: bool,
    verbosity: u32,
    selection: IndividualPolicy,
    replacement: IndividualPolicy,
    options: OptionStore,
    rng: Mutex<ChaCha8Rng>,
    last_opt_result: Mutex<i32>,
    log: Mutex<Vec<LogLine>>,
    evolving: AtomicBool,
}

impl Snopt7 {
    /// Locate, open and bind the `snopt7_c` library described by `spec`.
    ///
    /// With `screen_output` the vendor's own summary output goes to the
    /// terminal; it is mutually exclusive with a nonzero verbosity.
    /// `minor_version` records which 7.x interface the library declares.
    ///
    /// Fails here, not in [`Algorithm::evolve`], when the library cannot be
    /// found or lacks a required entry point.
    pub fn new(
        spec: impl Into<LibrarySpec>,
        screen_output: bool,
        minor_version: u32,
    ) -> Result<Self, PluginError> {
        let path = spec.into().resolve()?;
        let table = bind(&path, Snopt7Api::REQUIRED_SYMBOLS)?;
        let api = Snopt7Api::from_table(&table)?;
        Ok(Self::from_parts(api, Some(table), path, screen_output, minor_version))
    }

    #[cfg(test)]
    pub(crate) fn with_api(api: Snopt7Api, screen_output: bool) -> Self {
        Self::from_parts(api, None, PathBuf::from("<in-process stub>"), screen_output, 7)
    }

    fn from_parts(
        api: Snopt7Api,
        table: Option<SymbolTable>,
        path: PathBuf,
        screen_output: bool,
        minor_version: u32,
    ) -> Self {
        Snopt7 {
            api,
            _table: table,
            path,
            minor_version,
            screen_output,
            verbosity: 0,
            selection: IndividualPolicy::Best,
            replacement: IndividualPolicy::Best,
            options: OptionStore::new(),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(0)),
            last_opt_result: Mutex::new(0),
            log: Mutex::new(Vec::new()),
            evolving: AtomicBool::new(false),
        }
    }

    /// Path of the bound vendor library.
    pub fn library_path(&self) -> &Path {
        &self.path
    }

    /// Reseed the RNG driving the `Random` selection/replacement policies.
    pub fn set_seed(&self, seed: u64) {
        *self.rng.lock() = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Which individual is handed to the solver.
    pub fn set_selection(&mut self, policy: IndividualPolicy) {
        self.selection = policy;
    }

    /// Which individual the optimised result replaces.
    pub fn set_replacement(&mut self, policy: IndividualPolicy) {
        self.replacement = policy;
    }

    pub fn selection(&self) -> IndividualPolicy {
        self.selection
    }

    pub fn replacement(&self) -> IndividualPolicy {
        self.replacement
    }

    /// Stage an integer option for the next solve. Last write wins; the
    /// option keeps the type of its first write.
    pub fn set_integer_option(&mut self, name: &str, value: i32) -> Result<(), OptionTypeError> {
        self.options.set_integer(name, value)
    }

    /// Stage a numeric option for the next solve.
    pub fn set_numeric_option(&mut self, name: &str, value: f64) -> Result<(), OptionTypeError> {
        self.options.set_numeric(name, value)
    }

    /// Stage several integer options at once. Stops at the first
    /// type conflict, keeping the options staged so far.
    pub fn set_integer_options(&mut self, opts: &[(&str, i32)]) -> Result<(), OptionTypeError> {
        for &(name, value) in opts {
            self.options.set_integer(name, value)?;
        }
        Ok(())
    }

    /// Stage several numeric options at once.
    pub fn set_numeric_options(&mut self, opts: &[(&str, f64)]) -> Result<(), OptionTypeError> {
        for &(name, value) in opts {
            self.options.set_numeric(name, value)?;
        }
        Ok(())
    }

    /// The staged integer options, in insertion order.
    pub fn integer_options(&self) -> Vec<(String, i32)> {
        self.options
            .integers()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    /// The staged numeric options, in insertion order.
    pub fn numeric_options(&self) -> Vec<(String, f64)> {
        self.options
            .numerics()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    /// The currently staged options.
    pub fn options(&self) -> &OptionStore {
        &self.options
    }

    /// Drop all staged integer options.
    pub fn reset_integer_options(&mut self) {
        self.options.reset(crate::options::OptionKind::Integer);
    }

    /// Drop all staged numeric options.
    pub fn reset_numeric_options(&mut self) {
        self.options.reset(crate::options::OptionKind::Real);
    }

    /// Raw return code of the last solve, 0 before any solve ran.
    pub fn last_opt_result(&self) -> i32 {
        *self.last_opt_result.lock()
    }

    /// The log lines recorded by the last solve at the current verbosity.
    pub fn log(&self) -> Vec<LogLine> {
        self.log.lock().clone()
    }

    fn solve(&self, mut pop: Population) -> Result<Population, PluginError> {
        let prob = pop.problem().clone();
        let dim = prob.dim();
        let (lb, ub) = prob.bounds();
        let nf = prob.nf();
        let nec = prob.nec();
        let nic = prob.nic();
        let ctol = prob.c_tol();

        check_problem_suitable(&pop, "SNOPT7")?;
        if pop.is_empty() {
            return Ok(pop);
        }
        // The interface derives this option from has_gradient(); a user
        // value would silently fight that.
        if self.options.contains("Derivative option") {
            return Err(SolveError::InvalidOption {
                name: "Derivative option".to_string(),
                detail: "set automatically from the problem's has_gradient() (true -> 3, \
                         false -> 0) and cannot be overridden"
                    .to_string(),
            }
            .into());
        }

        let name = CString::new(prob.name()).unwrap_or_default();
        let mut empty = [0 as c_char; 1];
        let mut snopt7_problem = SnProblem::zeroed(name.as_ptr() as *mut c_char);
        unsafe {
            (self.api.sn_init)(
                &mut snopt7_problem,
                name.as_ptr() as *mut c_char,
                empty.as_mut_ptr(),
                c_int::from(self.screen_output),
            );
        }
        let _workspace = WorkspaceGuard {
            api: &self.api,
            prob: &mut snopt7_problem,
        };

        // Feasibility tolerance: an explicit user option wins; otherwise
        // the smallest positive problem tolerance, if any, replaces the
        // vendor default.
        if prob.nc() > 0 && !self.options.contains("Major feasibility tolerance") {
            let min_tol = ctol.iter().copied().fold(f64::INFINITY, f64::min);
            if min_tol > 0.0 && min_tol.is_finite() {
                self.set_real(&mut snopt7_problem, "Major feasibility tolerance", min_tol)?;
            }
        }
        for (opt_name, value) in self.options.numerics() {
            self.set_real(&mut snopt7_problem, opt_name, value)?;
        }
        for (opt_name, value) in self.options.integers() {
            self.set_int(&mut snopt7_problem, opt_name, value)?;
        }
        let derivative_option = if prob.has_gradient() { 3 } else { 0 };
        self.set_int(&mut snopt7_problem, "Derivative option", derivative_option)?;

        // Bounds on x and on the fitness vector: the objective row is
        // unbounded, equality constraints are pinned to zero, inequality
        // constraints live in (-inf, 0].
        let mut xlow = lb.clone();
        let mut xupp = ub.clone();
        let mut flow = vec![-f64::MAX; nf];
        let mut fupp = vec![f64::MAX; nf];
        for i in 0..nec {
            flow[1 + i] = 0.0;
            fupp[1 + i] = 0.0;
        }
        for i in 0..nic {
            fupp[1 + nec + i] = 0.0;
        }

        let (x0, fit0) = {
            let mut rng = self.rng.lock();
            select_individual(&pop, self.selection, &mut rng)?
        };
        let mut x = x0.clone();
        let mut xstate = vec![0 as c_int; dim];
        let mut xmul = vec![0.0; dim];
        let mut f = fit0.clone();
        let mut fstate = vec![0 as c_int; nf];
        let mut fmul = vec![0.0; nf];

        // The linear part of the fitness is unused; length one is the
        // minimum the interface accepts.
        let mut i_afun = vec![0 as c_int; 1];
        let mut j_avar = vec![0 as c_int; 1];
        let mut a = vec![0.0; 1];

        let sparsity = prob.gradient_sparsity();
        let ne_g = sparsity.len();
        let mut i_gfun: Vec<c_int> = sparsity.iter().map(|&(r, _)| r as c_int).collect();
        let mut j_gvar: Vec<c_int> = sparsity.iter().map(|&(_, c)| c as c_int).collect();

        if self.verbosity > 0 {
            println!("SNOPT7 plugin:");
            if prob.has_gradient_sparsity() {
                println!(
                    "The gradient sparsity is provided by the user: {} components detected.",
                    ne_g
                );
            } else {
                println!(
                    "The gradient sparsity is assumed dense: {} components detected.",
                    ne_g
                );
            }
            if prob.has_gradient() {
                println!("The gradient is provided by the user.");
            } else {
                println!("The gradient is computed numerically by SNOPT7.");
            }
        }

        let mut ctx = CallbackCtx {
            problem: prob.as_ref(),
            dv: vec![0.0; dim],
            logger: EvalLogger::new(self.verbosity),
            error: None,
        };
        snopt7_problem.iu = &mut ctx as *mut CallbackCtx<'_> as *mut c_int;

        let (mut n_s, mut n_inf) = (0 as c_int, 0 as c_int);
        let mut s_inf = 0.0;
        let code = unsafe {
            (self.api.solve_a)(
                &mut snopt7_problem,
                0, // cold start
                nf as c_int,
                dim as c_int,
                0.0, // no constant objective offset
                0,   // the objective is fitness row zero
                usrfun,
                0, // linear part switched off
                i_afun.as_mut_ptr(),
                j_avar.as_mut_ptr(),
                a.as_mut_ptr(),
                ne_g as c_int,
                i_gfun.as_mut_ptr(),
                j_gvar.as_mut_ptr(),
                xlow.as_mut_ptr(),
                xupp.as_mut_ptr(),
                flow.as_mut_ptr(),
                fupp.as_mut_ptr(),
                x.as_mut_ptr(),
                xstate.as_mut_ptr(),
                xmul.as_mut_ptr(),
                f.as_mut_ptr(),
                fstate.as_mut_ptr(),
                fmul.as_mut_ptr(),
                &mut n_s,
                &mut n_inf,
                &mut s_inf,
            )
        };

        *self.last_opt_result.lock() = code;
        *self.log.lock() = ctx.logger.into_lines();
        if self.verbosity > 0 {
            println!("\n{}", result_message(code));
        }

        if let Some(err) = ctx.error {
            return Err(err.into());
        }
        if !is_success(code) {
            return Err(SolveError::Status {
                code,
                message: result_message(code).to_string(),
            }
            .into());
        }

        // Re-insert only if the solver actually improved on the selected
        // individual.
        if compare_fc(&f, &fit0, nec, &ctol) {
            let mut rng = self.rng.lock();
            replace_individual(&mut pop, self.replacement, &mut rng, x, f)?;
        }
        Ok(pop)
    }

    fn set_int(
        &self,
        prob: &mut SnProblem,
        name: &str,
        value: i32,
    ) -> Result<(), SolveError> {
        let c_name = CString::new(name).map_err(|_| SolveError::InvalidOption {
            name: name.to_string(),
            detail: "option name contains an interior NUL byte".to_string(),
        })?;
        let res =
            unsafe { (self.api.set_int_parameter)(prob, c_name.as_ptr() as *mut c_char, value) };
        if res > 0 {
            return Err(SolveError::InvalidOption {
                name: name.to_string(),
                detail: format!(
                    "the SNOPT7 interface rejected the integer value {value}; \
                     did you misspell the option name?"
                ),
            });
        }
        Ok(())
    }

    fn set_real(
        &self,
        prob: &mut SnProblem,
        name: &str,
        value: f64,
    ) -> Result<(), SolveError> {
        let c_name = CString::new(name).map_err(|_| SolveError::InvalidOption {
            name: name.to_string(),
            detail: "option name contains an interior NUL byte".to_string(),
        })?;
        let res =
            unsafe { (self.api.set_real_parameter)(prob, c_name.as_ptr() as *mut c_char, value) };
        if res > 0 {
            return Err(SolveError::InvalidOption {
                name: name.to_string(),
                detail: format!(
                    "the SNOPT7 interface rejected the numeric value {value}; \
                     did you misspell the option name?"
                ),
            });
        }
        Ok(())
    }
}

impl Algorithm for Snopt7 {
    fn evolve(&self, pop: Population) -> Result<Population, PluginError> {
        if self
            .evolving
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(PluginError::Reentrancy);
        }
        let _guard = EvolveGuard(&self.evolving);
        self.solve(pop)
    }

    fn name(&self) -> String {
        "SNOPT7".to_string()
    }

    fn extra_info(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "\tName of the snopt7_c library: {}", self.path.display());
        let _ = writeln!(out, "\tLibrary version declared: 7.{}", self.minor_version);
        if self.screen_output {
            let _ = writeln!(out, "\tScreen output: (snopt7)");
        } else {
            let _ = writeln!(out, "\tScreen output: verbosity {}", self.verbosity);
        }
        let _ = writeln!(
            out,
            "\tLast optimisation return code: {}",
            result_message(self.last_opt_result())
        );
        let _ = writeln!(out, "\tIndividual selection policy: {:?}", self.selection);
        let _ = writeln!(out, "\tIndividual replacement policy: {:?}", self.replacement);
        if !self.options.is_empty() {
            let _ = writeln!(out, "\tOptions: {:?}", self.options.entries());
        }
        out
    }

    fn set_verbosity(&mut self, level: u32) -> Result<(), PluginError> {
        if self.screen_output && level != 0 {
            return Err(SolveError::ScreenOutput.into());
        }
        self.verbosity = level;
        Ok(())
    }

    fn verbosity(&self) -> u32 {
        self.verbosity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::Problem;
    use std::ffi::CStr;
    use std::sync::Arc;

    // In-process stand-ins for the vendor entry points, mirroring what a
    // test build of the snopt7_c interface does: parameter setters reject
    // two magic names, the solve calls the user function once on the
    // incoming point and leaves it untouched.

    unsafe extern "C" fn stub_sn_init(
        _prob: *mut SnProblem,
        _name: *mut c_char,
        _prtfile: *mut c_char,
        _summ_on: c_int,
    ) {
    }

    unsafe extern "C" fn stub_set_int(
        _prob: *mut SnProblem,
        name: *mut c_char,
        _value: c_int,
    ) -> c_int {
        c_int::from(CStr::from_ptr(name).to_bytes() == b"invalid_integer_option")
    }

    unsafe extern "C" fn stub_set_real(
        _prob: *mut SnProblem,
        name: *mut c_char,
        _value: c_double,
    ) -> c_int {
        c_int::from(CStr::from_ptr(name).to_bytes() == b"invalid_numeric_option")
    }

    unsafe extern "C" fn stub_delete(_prob: *mut SnProblem) {}

    #[allow(clippy::too_many_arguments)]
    unsafe extern "C" fn stub_solve_identity(
        prob: *mut SnProblem,
        _start: c_int,
        nf: c_int,
        n: c_int,
        _obj_add: c_double,
        _obj_row: c_int,
        usrfun: SnFunA,
        _ne_a: c_int,
        _i_afun: *mut c_int,
        _j_avar: *mut c_int,
        _a: *mut c_double,
        ne_g: c_int,
        _i_gfun: *mut c_int,
        _j_gvar: *mut c_int,
        _xlow: *mut c_double,
        _xupp: *mut c_double,
        _flow: *mut c_double,
        _fupp: *mut c_double,
        x: *mut c_double,
        _xstate: *mut c_int,
        _xmul: *mut c_double,
        f: *mut c_double,
        _fstate: *mut c_int,
        _fmul: *mut c_double,
        _n_s: *mut c_int,
        _n_inf: *mut c_int,
        _s_inf: *mut c_double,
    ) -> c_int {
        let mut status = 0 as c_int;
        let mut need_f = 1 as c_int;
        let mut need_g = 1 as c_int;
        let mut nf = nf;
        let mut n = n;
        let mut ne_g = ne_g;
        let mut g = vec![0.0 as c_double; ne_g as usize];
        let mut cu = [0 as c_char; 1];
        let mut lencu = 0 as c_int;
        let p = &mut *prob;
        usrfun(
            &mut status,
            &mut n,
            x,
            &mut need_f,
            &mut nf,
            f,
            &mut need_g,
            &mut ne_g,
            g.as_mut_ptr(),
            cu.as_mut_ptr(),
            &mut lencu,
            p.iu,
            &mut p.leniu,
            p.ru,
            &mut p.lenru,
        );
        if status < 0 {
            71
        } else {
            1
        }
    }

    #[allow(clippy::too_many_arguments)]
    unsafe extern "C" fn stub_solve_infeasible(
        _prob: *mut SnProblem,
        _start: c_int,
        _nf: c_int,
        _n: c_int,
        _obj_add: c_double,
        _obj_row: c_int,
        _usrfun: SnFunA,
        _ne_a: c_int,
        _i_afun: *mut c_int,
        _j_avar: *mut c_int,
        _a: *mut c_double,
        _ne_g: c_int,
        _i_gfun: *mut c_int,
        _j_gvar: *mut c_int,
        _xlow: *mut c_double,
        _xupp: *mut c_double,
        _flow: *mut c_double,
        _fupp: *mut c_double,
        _x: *mut c_double,
        _xstate: *mut c_int,
        _xmul: *mut c_double,
        _f: *mut c_double,
        _fstate: *mut c_int,
        _fmul: *mut c_double,
        _n_s: *mut c_int,
        _n_inf: *mut c_int,
        _s_inf: *mut c_double,
    ) -> c_int {
        11
    }

    #[allow(clippy::too_many_arguments)]
    unsafe extern "C" fn stub_solve_slow(
        prob: *mut SnProblem,
        start: c_int,
        nf: c_int,
        n: c_int,
        obj_add: c_double,
        obj_row: c_int,
        usrfun: SnFunA,
        ne_a: c_int,
        i_afun: *mut c_int,
        j_avar: *mut c_int,
        a: *mut c_double,
        ne_g: c_int,
        i_gfun: *mut c_int,
        j_gvar: *mut c_int,
        xlow: *mut c_double,
        xupp: *mut c_double,
        flow: *mut c_double,
        fupp: *mut c_double,
        x: *mut c_double,
        xstate: *mut c_int,
        xmul: *mut c_double,
        f: *mut c_double,
        fstate: *mut c_int,
        fmul: *mut c_double,
        n_s: *mut c_int,
        n_inf: *mut c_int,
        s_inf: *mut c_double,
    ) -> c_int {
        std::thread::sleep(std::time::Duration::from_millis(200));
        stub_solve_identity(
            prob, start, nf, n, obj_add, obj_row, usrfun, ne_a, i_afun, j_avar, a, ne_g,
            i_gfun, j_gvar, xlow, xupp, flow, fupp, x, xstate, xmul, f, fstate, fmul, n_s,
            n_inf, s_inf,
        )
    }

    fn stub_api(solve: SolveAFn) -> Snopt7Api {
        Snopt7Api {
            sn_init: stub_sn_init,
            set_int_parameter: stub_set_int,
            set_real_parameter: stub_set_real,
            delete_snopt: stub_delete,
            solve_a: solve,
        }
    }

    struct Rosenbrock;

    impl Problem for Rosenbrock {
        fn dim(&self) -> usize {
            10
        }
        fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![-5.0; 10], vec![10.0; 10])
        }
        fn fitness(&self, x: &[f64]) -> Vec<f64> {
            let mut obj = 0.0;
            for i in 0..x.len() - 1 {
                obj += 100.0 * (x[i + 1] - x[i] * x[i]).powi(2) + (1.0 - x[i]).powi(2);
            }
            vec![obj]
        }
        fn has_gradient(&self) -> bool {
            true
        }
        fn gradient(&self, x: &[f64]) -> Vec<f64> {
            let n = x.len();
            let mut g = vec![0.0; n];
            for i in 0..n - 1 {
                g[i] += -400.0 * x[i] * (x[i + 1] - x[i] * x[i]) - 2.0 * (1.0 - x[i]);
                g[i + 1] += 200.0 * (x[i + 1] - x[i] * x[i]);
            }
            g
        }
        fn name(&self) -> String {
            "Rosenbrock".to_string()
        }
    }

    // Behaves until armed, so a population can be built before the
    // vendor-callback path is made to fail.
    #[derive(Default)]
    struct Panicking {
        armed: AtomicBool,
    }

    impl Problem for Panicking {
        fn dim(&self) -> usize {
            2
        }
        fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![0.0; 2], vec![1.0; 2])
        }
        fn fitness(&self, x: &[f64]) -> Vec<f64> {
            if self.armed.load(Ordering::Relaxed) {
                panic!("deliberate fitness failure");
            }
            vec![x[0] + x[1]]
        }
    }

    fn rosenbrock_pop(size: usize) -> Population {
        Population::random(Arc::new(Rosenbrock), size, 42)
    }

    #[test]
    fn identity_solve_round_trips_the_population() {
        let uda = Snopt7::with_api(stub_api(stub_solve_identity), false);
        let pop = rosenbrock_pop(5);
        let before: Vec<Vec<f64>> = (0..pop.len()).map(|i| pop.x(i).to_vec()).collect();
        let after = uda.evolve(pop).unwrap();
        assert_eq!(after.len(), 5);
        assert_eq!(after.problem().dim(), 10);
        for (i, x) in before.iter().enumerate() {
            assert_eq!(after.x(i), x.as_slice());
        }
        assert_eq!(uda.last_opt_result(), 1);
    }

    #[test]
    fn single_individual_solve_produces_finite_fitness() {
        let uda = Snopt7::with_api(stub_api(stub_solve_identity), false);
        let after = uda.evolve(rosenbrock_pop(1)).unwrap();
        assert_eq!(after.len(), 1);
        assert!(after.f(0).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn empty_population_is_returned_untouched() {
        let uda = Snopt7::with_api(stub_api(stub_solve_identity), false);
        let after = uda
            .evolve(Population::empty(Arc::new(Rosenbrock)))
            .unwrap();
        assert!(after.is_empty());
        // No solve ran, so the recorded result stays at its initial value.
        assert_eq!(uda.last_opt_result(), 0);
    }

    #[test]
    fn rejected_integer_option_aborts_the_solve() {
        let mut uda = Snopt7::with_api(stub_api(stub_solve_identity), false);
        uda.set_integer_option("invalid_integer_option", 3).unwrap();
        let err = uda.evolve(rosenbrock_pop(2)).unwrap_err();
        match err {
            PluginError::Solve(SolveError::InvalidOption { name, .. }) => {
                assert_eq!(name, "invalid_integer_option");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejected_numeric_option_aborts_the_solve() {
        let mut uda = Snopt7::with_api(stub_api(stub_solve_identity), false);
        uda.set_numeric_option("invalid_numeric_option", 1e-4).unwrap();
        let err = uda.evolve(rosenbrock_pop(2)).unwrap_err();
        assert!(matches!(
            err,
            PluginError::Solve(SolveError::InvalidOption { .. })
        ));
    }

    #[test]
    fn derivative_option_cannot_be_set_by_the_user() {
        let mut uda = Snopt7::with_api(stub_api(stub_solve_identity), false);
        uda.set_integer_option("Derivative option", 1).unwrap();
        let err = uda.evolve(rosenbrock_pop(2)).unwrap_err();
        match err {
            PluginError::Solve(SolveError::InvalidOption { name, .. }) => {
                assert_eq!(name, "Derivative option");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fitness_panic_is_contained_and_reported() {
        let uda = Snopt7::with_api(stub_api(stub_solve_identity), false);
        let problem = Arc::new(Panicking::default());
        let mut pop = Population::empty(problem.clone() as Arc<dyn Problem>);
        pop.push(vec![0.2, 0.4]);
        pop.push(vec![0.6, 0.8]);
        problem.armed.store(true, Ordering::Relaxed);
        let err = uda.evolve(pop).unwrap_err();
        match err {
            PluginError::Solve(SolveError::UserFunction(msg)) => {
                assert!(msg.contains("deliberate fitness failure"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The adapter is usable again after the failure.
        let ok = Snopt7::with_api(stub_api(stub_solve_identity), false)
            .evolve(rosenbrock_pop(1));
        assert!(ok.is_ok());
    }

    #[test]
    fn failure_status_maps_to_a_described_error() {
        let uda = Snopt7::with_api(stub_api(stub_solve_infeasible), false);
        let err = uda.evolve(rosenbrock_pop(2)).unwrap_err();
        match err {
            PluginError::Solve(SolveError::Status { code, message }) => {
                assert_eq!(code, 11);
                assert!(message.contains("infeasible"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(uda.last_opt_result(), 11);
    }

    #[test]
    fn concurrent_evolve_is_refused() {
        let uda = Arc::new(Snopt7::with_api(stub_api(stub_solve_slow), false));
        let background = {
            let uda = Arc::clone(&uda);
            std::thread::spawn(move || uda.evolve(rosenbrock_pop(2)))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        let err = uda.evolve(rosenbrock_pop(2)).unwrap_err();
        assert!(matches!(err, PluginError::Reentrancy));
        assert!(background.join().unwrap().is_ok());
        // The flag clears once the in-flight solve finishes.
        assert!(uda.evolve(rosenbrock_pop(2)).is_ok());
    }

    #[test]
    fn verbosity_and_vendor_screen_output_are_mutually_exclusive() {
        let mut uda = Snopt7::with_api(stub_api(stub_solve_identity), true);
        let err = uda.set_verbosity(1).unwrap_err();
        assert!(matches!(err, PluginError::Solve(SolveError::ScreenOutput)));
        uda.set_verbosity(0).unwrap();

        let mut quiet = Snopt7::with_api(stub_api(stub_solve_identity), false);
        quiet.set_verbosity(3).unwrap();
        assert_eq!(quiet.verbosity(), 3);
    }

    #[test]
    fn verbosity_records_a_log_line_per_evaluation() {
        let mut uda = Snopt7::with_api(stub_api(stub_solve_identity), false);
        uda.set_verbosity(1).unwrap();
        uda.evolve(rosenbrock_pop(3)).unwrap();
        let log = uda.log();
        assert_eq!(log.len(), 1); // the identity stub evaluates once
        assert_eq!(log[0].objevals, 1);
        assert!(log[0].feasible); // unconstrained problem
    }

    #[test]
    fn batch_option_setters_stage_and_report_in_order() {
        let mut uda = Snopt7::with_api(stub_api(stub_solve_identity), false);
        uda.set_integer_options(&[("Major iterations limit", 500), ("Iterations limit", 2000)])
            .unwrap();
        uda.set_numeric_options(&[("Major optimality tolerance", 1e-5)])
            .unwrap();
        assert_eq!(
            uda.integer_options(),
            vec![
                ("Major iterations limit".to_string(), 500),
                ("Iterations limit".to_string(), 2000),
            ]
        );
        assert_eq!(
            uda.numeric_options(),
            vec![("Major optimality tolerance".to_string(), 1e-5)]
        );

        // A type conflict inside a batch keeps the earlier entries.
        let err = uda
            .set_numeric_options(&[("Minor feasibility tolerance", 1e-6), ("Iterations limit", 1.0)])
            .unwrap_err();
        assert_eq!(err.key, "Iterations limit");
        assert_eq!(uda.numeric_options().len(), 2);
    }

    #[test]
    fn result_messages_cover_the_documented_codes() {
        assert_eq!(
            result_message(1),
            "Finished successfully - optimality conditions satisfied"
        );
        assert_eq!(
            result_message(71),
            "User requested termination - terminated during function evaluation"
        );
        assert_eq!(result_message(9999), "Unknown SNOPT7 return code");
        assert!(is_success(0) && is_success(6));
        assert!(!is_success(11) && !is_success(71));
    }

    #[test]
    fn extra_info_names_the_library_and_policies() {
        let uda = Snopt7::with_api(stub_api(stub_solve_identity), false);
        let info = uda.extra_info();
        assert!(info.contains("snopt7_c library"));
        assert!(info.contains("7.7"));
        assert!(info.contains("Best"));
    }
}
