//! WORHP adapter.
//!
//! Wraps the commercial WORHP NLP solver through its Unified Solver
//! Interface (USI). Unlike SNOPT7's callback style, WORHP uses reverse
//! communication: its main routine returns control whenever it needs an
//! evaluation, the caller polls `GetUserAction`, performs the requested
//! work (objective, constraints, derivatives, finite differences) and
//! hands control back until the status crosses a termination threshold.
//!
//! WORHP wants sparse structures in coordinate format with Fortran
//! indexing, column-major ordered, and a single hessian for the whole
//! Lagrangian with the strict lower triangle first and the full diagonal
//! (zeros included) last. The marshaling here translates the row-major
//! per-component patterns of [`Problem`] into that layout.

use std::collections::{BTreeSet, HashMap};
use std::ffi::{CStr, CString};
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
use crate::options::{OptionKind, OptionStore, OptionTypeError};
use crate::population::Population;
use crate::problem::{compare_fc, dense_hessian, Problem, SparsityPattern};
use crate::solvers::{
    check_problem_suitable, replace_individual, select_individual, Algorithm, EvalLogger,
    IndividualPolicy, LogLine, SolveError,
};
use crate::PluginError;

/// The interface version this adapter speaks.
pub const SUPPORTED_MAJOR: i32 = 1;
pub const SUPPORTED_MINOR: i32 = 12;

/// Length of the patch buffer `WorhpVersion` writes into.
pub const PATCH_STRING_LENGTH: usize = 8;

/// Status threshold at or above which the solver finished successfully.
pub const TERMINATE_SUCCESS: c_int = 1000;
/// Status threshold at or below which the solver failed.
pub const TERMINATE_ERROR: c_int = -1000;

// User actions polled through GetUserAction during reverse communication.
pub const CALL_WORHP: c_int = 1 << 0;
pub const ITER_OUTPUT: c_int = 1 << 1;
pub const EVAL_F: c_int = 1 << 2;
pub const EVAL_G: c_int = 1 << 3;
pub const EVAL_DF: c_int = 1 << 4;
pub const EVAL_DG: c_int = 1 << 5;
pub const EVAL_HM: c_int = 1 << 6;
pub const FIDIF: c_int = 1 << 7;

/// A sparse matrix slot of the WORHP workspace, coordinate format.
///
/// `nnz` is set by the caller before `WorhpInit`; the library allocates
/// the arrays and reports through `need_structure` whether it expects the
/// caller to fill in the coordinates.
#[repr(C)]
pub struct WorhpMatrix {
    pub nnz: c_int,
    pub need_structure: bool,
    pub row: *mut c_int,
    pub col: *mut c_int,
    pub val: *mut c_double,
}

impl WorhpMatrix {
    fn empty() -> Self {
        WorhpMatrix {
            nnz: 0,
            need_structure: false,
            row: std::ptr::null_mut(),
            col: std::ptr::null_mut(),
            val: std::ptr::null_mut(),
        }
    }
}

/// The optimisation variables: dimensions, current iterate, multipliers
/// and bounds. All arrays are owned by the library between `WorhpInit`
/// and `WorhpFree`.
#[repr(C)]
pub struct OptVar {
    pub n: c_int,
    pub m: c_int,
    pub x: *mut c_double,
    pub f: c_double,
    pub g: *mut c_double,
    pub lambda: *mut c_double,
    pub mu: *mut c_double,
    pub xl: *mut c_double,
    pub xu: *mut c_double,
    pub gl: *mut c_double,
    pub gu: *mut c_double,
}

impl OptVar {
    fn empty() -> Self {
        OptVar {
            n: 0,
            m: 0,
            x: std::ptr::null_mut(),
            f: 0.0,
            g: std::ptr::null_mut(),
            lambda: std::ptr::null_mut(),
            mu: std::ptr::null_mut(),
            xl: std::ptr::null_mut(),
            xu: std::ptr::null_mut(),
            gl: std::ptr::null_mut(),
            gu: std::ptr::null_mut(),
        }
    }
}

/// Solver workspace: objective scaling and the three derivative matrices.
#[repr(C)]
pub struct Workspace {
    pub scale_obj: c_double,
    pub df: WorhpMatrix,
    pub dg: WorhpMatrix,
    pub hm: WorhpMatrix,
}

impl Workspace {
    fn empty() -> Self {
        Workspace {
            scale_obj: 1.0,
            df: WorhpMatrix::empty(),
            dg: WorhpMatrix::empty(),
            hm: WorhpMatrix::empty(),
        }
    }
}

/// Solver parameters; the named fields are the ones the adapter sets
/// directly, everything else goes through the typed parameter setters.
#[repr(C)]
pub struct Params {
    pub infty: c_double,
    pub fg_together: bool,
    pub user_df: bool,
    pub user_dg: bool,
    pub user_hm: bool,
}

impl Params {
    fn empty() -> Self {
        Params {
            infty: 1e20,
            fg_together: false,
            user_df: false,
            user_dg: false,
            user_hm: false,
        }
    }
}

/// Reverse-communication control: the solver status drives the loop.
#[repr(C)]
pub struct Control {
    pub status: c_int,
}

/// Receiver for the library's own print stream.
pub type WorhpPrintFn = unsafe extern "C" fn(c_int, *const c_char);

unsafe extern "C" fn silent_print(_level: c_int, _message: *const c_char) {}

type UsiFn = unsafe extern "C" fn(*mut OptVar, *mut Workspace, *mut Params, *mut Control);
type ReadParamsFn = unsafe extern "C" fn(*mut c_int, *const c_char, *mut Params);
type SetWorhpPrintFn = unsafe extern "C" fn(WorhpPrintFn);
type GetUserActionFn = unsafe extern "C" fn(*const Control, c_int) -> bool;
type DoneUserActionFn = unsafe extern "C" fn(*mut Control, c_int);
type StatusMsgStringFn =
    unsafe extern "C" fn(*mut OptVar, *mut Workspace, *mut Params, *mut Control, *mut c_char);
type SetBoolParamFn = unsafe extern "C" fn(*mut Params, *const c_char, bool) -> bool;
type SetIntParamFn = unsafe extern "C" fn(*mut Params, *const c_char, c_int) -> bool;
type SetDoubleParamFn = unsafe extern "C" fn(*mut Params, *const c_char, c_double) -> bool;
type VersionFn = unsafe extern "C" fn(*mut c_int, *mut c_int, *mut c_char);

/// Typed entry points of the WORHP library.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WorhpApi {
    pub(crate) pre_init: UsiFn,
    pub(crate) init: UsiFn,
    pub(crate) read_params: ReadParamsFn,
    pub(crate) set_print: SetWorhpPrintFn,
    pub(crate) get_user_action: GetUserActionFn,
    pub(crate) done_user_action: DoneUserActionFn,
    pub(crate) iteration_output: UsiFn,
    pub(crate) worhp: UsiFn,
    pub(crate) status_msg: UsiFn,
    pub(crate) status_msg_string: StatusMsgStringFn,
    pub(crate) set_bool_param: SetBoolParamFn,
    pub(crate) set_int_param: SetIntParamFn,
    pub(crate) set_double_param: SetDoubleParamFn,
    pub(crate) free: UsiFn,
    pub(crate) fidif: UsiFn,
    pub(crate) version: VersionFn,
}

impl WorhpApi {
    pub(crate) const REQUIRED_SYMBOLS: &'static [&'static str] = &[
        "WorhpPreInit",
        "WorhpInit",
        "ReadParams",
        "SetWorhpPrint",
        "GetUserAction",
        "DoneUserAction",
        "IterationOutput",
        "Worhp",
        "StatusMsg",
        "StatusMsgString",
        "WorhpSetBoolParam",
        "WorhpSetIntParam",
        "WorhpSetDoubleParam",
        "WorhpFree",
        "WorhpFidif",
        "WorhpVersion",
    ];

    /// Reinterpret the bound addresses as typed entry points. The table
    /// must have been bound against [`Self::REQUIRED_SYMBOLS`].
    pub(crate) fn from_table(table: &SymbolTable) -> Result<Self, BindError> {
        unsafe {
            Ok(WorhpApi {
                pre_init: std::mem::transmute::<usize, UsiFn>(table.require("WorhpPreInit")?),
                init: std::mem::transmute::<usize, UsiFn>(table.require("WorhpInit")?),
                read_params: std::mem::transmute::<usize, ReadParamsFn>(
                    table.require("ReadParams")?,
                ),
                set_print: std::mem::transmute::<usize, SetWorhpPrintFn>(
                    table.require("SetWorhpPrint")?,
                ),
                get_user_action: std::mem::transmute::<usize, GetUserActionFn>(
                    table.require("GetUserAction")?,
                ),
                done_user_action: std::mem::transmute::<usize, DoneUserActionFn>(
                    table.require("DoneUserAction")?,
                ),
                iteration_output: std::mem::transmute::<usize, UsiFn>(
                    table.require("IterationOutput")?,
                ),
                worhp: std::mem::transmute::<usize, UsiFn>(table.require("Worhp")?),
                status_msg: std::mem::transmute::<usize, UsiFn>(table.require("StatusMsg")?),
                status_msg_string: std::mem::transmute::<usize, StatusMsgStringFn>(
                    table.require("StatusMsgString")?,
                ),
                set_bool_param: std::mem::transmute::<usize, SetBoolParamFn>(
                    table.require("WorhpSetBoolParam")?,
                ),
                set_int_param: std::mem::transmute::<usize, SetIntParamFn>(
                    table.require("WorhpSetIntParam")?,
                ),
                set_double_param: std::mem::transmute::<usize, SetDoubleParamFn>(
                    table.require("WorhpSetDoubleParam")?,
                ),
                free: std::mem::transmute::<usize, UsiFn>(table.require("WorhpFree")?),
                fidif: std::mem::transmute::<usize, UsiFn>(table.require("WorhpFidif")?),
                version: std::mem::transmute::<usize, VersionFn>(table.require("WorhpVersion")?),
            })
        }
    }
}

/// Calls `WorhpFree` on drop so the library workspace is released on
/// every exit path, the error ones included.
struct WorkspaceGuard<'a> {
    api: &'a WorhpApi,
    opt: *mut OptVar,
    wsp: *mut Workspace,
    par: *mut Params,
    cnt: *mut Control,
}

impl Drop for WorkspaceGuard<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.free)(self.opt, self.wsp, self.par, self.cnt) };
    }
}

struct EvolveGuard<'a>(&'a AtomicBool);

impl Drop for EvolveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// Column-major ordering over a row-major pattern, as an index map.
// Lexicographic from the right: (1,0), (2,0), (0,1), ...
fn col_major_order(pattern: &[(usize, usize)]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..pattern.len()).collect();
    idx.sort_by(|&a, &b| {
        pattern[a]
            .1
            .cmp(&pattern[b].1)
            .then(pattern[a].0.cmp(&pattern[b].0))
    });
    idx
}

// The last fitness/gradient evaluation, re-served when WORHP asks for the
// same point again from a different user action.
struct EvalCache {
    x: Vec<f64>,
    value: Vec<f64>,
}

fn cached_eval(
    cache: &mut Option<EvalCache>,
    x: &[f64],
    eval: impl FnOnce(&[f64]) -> Vec<f64>,
) -> Result<Vec<f64>, SolveError> {
    if let Some(hit) = cache.as_ref().filter(|c| c.x == x) {
        return Ok(hit.value.clone());
    }
    let value = catch_unwind(AssertUnwindSafe(|| eval(x))).map_err(|panic| {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "problem evaluation panicked".to_string());
        SolveError::UserFunction(msg)
    })?;
    if value.iter().any(|v| !v.is_finite()) {
        return Err(SolveError::NonFinite);
    }
    *cache = Some(EvalCache {
        x: x.to_vec(),
        value: value.clone(),
    });
    Ok(value)
}

/// The WORHP user-defined algorithm.
#[derive(Debug)]
pub struct Worhp {
    api: WorhpApi,
    // Keeps the vendor image open for the adapter's lifetime. Absent only
    // for adapters built around an injected API in tests.
    _table: Option<SymbolTable>,
    path: PathBuf,
    screen_output: bool,
    verbosity: u32,
    selection: IndividualPolicy,
    replacement: IndividualPolicy,
    options: OptionStore,
    rng: Mutex<ChaCha8Rng>,
    last_opt_result: Mutex<String>,
    log: Mutex<Vec<LogLine>>,
    evolving: AtomicBool,
}

impl Worhp {
    /// Locate, open and bind the WORHP library described by `spec`, then
    /// verify that it declares the supported interface version.
    ///
    /// Fails here, not in [`Algorithm::evolve`], when the library cannot
    /// be found, lacks a required entry point, or declares a different
    /// major.minor version than {`SUPPORTED_MAJOR`}.{`SUPPORTED_MINOR`}.
    pub fn new(spec: impl Into<LibrarySpec>, screen_output: bool) -> Result<Self, PluginError> {
        let path = spec.into().resolve()?;
        let table = bind(&path, WorhpApi::REQUIRED_SYMBOLS)?;
        let api = WorhpApi::from_table(&table)?;
        check_version(&api, &path)?;
        Ok(Self::from_parts(api, Some(table), path, screen_output))
    }

    #[cfg(test)]
    pub(crate) fn with_api(api: WorhpApi, screen_output: bool) -> Result<Self, PluginError> {
        let path = PathBuf::from("<in-process stub>");
        check_version(&api, &path)?;
        Ok(Self::from_parts(api, None, path, screen_output))
    }

    fn from_parts(
        api: WorhpApi,
        table: Option<SymbolTable>,
        path: PathBuf,
        screen_output: bool,
    ) -> Self {
        Worhp {
            api,
            _table: table,
            path,
            screen_output,
            verbosity: 0,
            selection: IndividualPolicy::Best,
            replacement: IndividualPolicy::Best,
            options: OptionStore::new(),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(0)),
            last_opt_result: Mutex::new(String::new()),
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

    /// Stage a boolean option for the next solve. Boolean options exist
    /// only on this adapter; SNOPT7 has no such parameter class.
    pub fn set_bool_option(&mut self, name: &str, value: bool) -> Result<(), OptionTypeError> {
        self.options.set_bool(name, value)
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

    /// Stage several boolean options at once.
    pub fn set_bool_options(&mut self, opts: &[(&str, bool)]) -> Result<(), OptionTypeError> {
        for &(name, value) in opts {
            self.options.set_bool(name, value)?;
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

    /// The staged boolean options, in insertion order.
    pub fn bool_options(&self) -> Vec<(String, bool)> {
        self.options
            .bools()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    /// The currently staged options.
    pub fn options(&self) -> &OptionStore {
        &self.options
    }

    pub fn reset_integer_options(&mut self) {
        self.options.reset(OptionKind::Integer);
    }

    pub fn reset_numeric_options(&mut self) {
        self.options.reset(OptionKind::Real);
    }

    pub fn reset_bool_options(&mut self) {
        self.options.reset(OptionKind::Bool);
    }

    /// The status message of the last solve, empty before any solve ran.
    pub fn last_opt_result(&self) -> String {
        self.last_opt_result.lock().clone()
    }

    /// The log lines recorded by the last solve at the current verbosity.
    pub fn log(&self) -> Vec<LogLine> {
        self.log.lock().clone()
    }

    #[allow(clippy::too_many_lines)]
    fn solve(&self, mut pop: Population) -> Result<Population, PluginError> {
        let prob = pop.problem().clone();
        let dim = prob.dim();
        let (lb, ub) = prob.bounds();
        let nec = prob.nec();
        let nc = prob.nc();
        let ctol = prob.c_tol();

        check_problem_suitable(&pop, "WORHP")?;
        if pop.is_empty() {
            return Ok(pop);
        }

        // Split the fitness gradient sparsity into the objective part
        // (row 0) and the constraints part (rows 1..), then build the
        // column-major index map WORHP wants for the constraint jacobian.
        let sparsity = prob.gradient_sparsity();
        let split = sparsity.partition_point(|&(row, _)| row < 1);
        let (fs, gs) = sparsity.split_at(split);
        let gs_idx_map = col_major_order(gs);

        // WORHP takes one sparsity pattern for the hessian of the whole
        // Lagrangian; the per-component patterns are merged into it.
        let hs = prob.hessians_sparsity();
        let merged_hs: SparsityPattern = if prob.has_hessians_sparsity() {
            let mut union: BTreeSet<(usize, usize)> = BTreeSet::new();
            for pattern in &hs {
                union.extend(pattern.iter().copied());
            }
            union.into_iter().collect()
        } else {
            dense_hessian(dim)
        };
        // Strict lower triangle in column-major order; the diagonal is
        // appended separately, zeros included.
        let mut hs_idx_map = col_major_order(&merged_hs);
        hs_idx_map.retain(|&i| merged_hs[i].0 != merged_hs[i].1);

        let mut opt = OptVar::empty();
        let mut wsp = Workspace::empty();
        let mut par = Params::empty();
        let mut cnt = Control { status: 0 };
        unsafe { (self.api.pre_init)(&mut opt, &mut wsp, &mut par, &mut cnt) };

        // Parameters come from the xml file first (defaults where absent);
        // everything the adapter sets below overrides them.
        let param_file = CString::new("param.xml").expect("static file name");
        let mut n_xml_param = 0 as c_int;
        if !self.screen_output || self.verbosity != 0 {
            unsafe { (self.api.set_print)(silent_print) };
        }
        unsafe { (self.api.read_params)(&mut n_xml_param, param_file.as_ptr(), &mut par) };

        opt.n = dim as c_int;
        opt.m = nc as c_int;
        wsp.df.nnz = fs.len() as c_int;
        wsp.dg.nnz = gs.len() as c_int;
        wsp.hm.nnz = (hs_idx_map.len() + dim) as c_int;

        unsafe { (self.api.init)(&mut opt, &mut wsp, &mut par, &mut cnt) };
        let _workspace = WorkspaceGuard {
            api: &self.api,
            opt: &mut opt,
            wsp: &mut wsp,
            par: &mut par,
            cnt: &mut cnt,
        };

        // The fitness always evaluates objective and constraints in one
        // call; for constrained problems this tells WORHP not to split
        // them (on unconstrained ones the flag only triggers a warning).
        if nc > 0 {
            par.fg_together = true;
        }
        let has_gradient = prob.has_gradient();
        self.set_bool(&mut par, "UserDF", has_gradient)?;
        self.set_bool(&mut par, "UserDG", has_gradient)?;
        self.set_bool(&mut par, "UserHM", prob.has_hessians())?;

        // An explicit TolFeas option wins; otherwise the smallest positive
        // problem tolerance replaces the vendor default, with the
        // acceptable tolerance at half of it.
        if nc > 0 && !self.options.contains("TolFeas") {
            let min_tol = ctol.iter().copied().fold(f64::INFINITY, f64::min);
            if min_tol > 0.0 && min_tol.is_finite() {
                self.set_double(&mut par, "TolFeas", min_tol)?;
                self.set_double(&mut par, "AcceptTolFeas", min_tol / 2.0)?;
            }
        }
        for (name, value) in self.options.numerics() {
            self.set_double(&mut par, name, value)?;
        }
        for (name, value) in self.options.integers() {
            self.set_int(&mut par, name, value)?;
        }
        for (name, value) in self.options.bools() {
            self.set_bool(&mut par, name, value)?;
        }

        // Initial point and bounds. The arrays were allocated by the
        // library in WorhpInit.
        let (x0, fit0) = {
            let mut rng = self.rng.lock();
            select_individual(&pop, self.selection, &mut rng)?
        };
        unsafe {
            let x = std::slice::from_raw_parts_mut(opt.x, dim);
            let xl = std::slice::from_raw_parts_mut(opt.xl, dim);
            let xu = std::slice::from_raw_parts_mut(opt.xu, dim);
            let lambda = std::slice::from_raw_parts_mut(opt.lambda, dim);
            x.copy_from_slice(&x0);
            xl.copy_from_slice(&lb);
            xu.copy_from_slice(&ub);
            lambda.fill(0.0);
            opt.f = wsp.scale_obj * fit0[0];
            if nc > 0 {
                let g = std::slice::from_raw_parts_mut(opt.g, nc);
                let mu = std::slice::from_raw_parts_mut(opt.mu, nc);
                let gl = std::slice::from_raw_parts_mut(opt.gl, nc);
                let gu = std::slice::from_raw_parts_mut(opt.gu, nc);
                g.copy_from_slice(&fit0[1..=nc]);
                mu.fill(0.0);
                for i in 0..nec {
                    gl[i] = 0.0;
                    gu[i] = 0.0;
                }
                for i in nec..nc {
                    gl[i] = -par.infty;
                    gu[i] = 0.0;
                }
            }
        }

        // Coordinate structures, in Fortran indexing, only where the
        // library asks for them.
        unsafe {
            if wsp.df.need_structure {
                let row = std::slice::from_raw_parts_mut(wsp.df.row, fs.len());
                for (slot, &(_, col)) in row.iter_mut().zip(fs) {
                    *slot = (col + 1) as c_int;
                }
            }
            if wsp.dg.need_structure {
                let row = std::slice::from_raw_parts_mut(wsp.dg.row, gs.len());
                let col = std::slice::from_raw_parts_mut(wsp.dg.col, gs.len());
                for (i, &idx) in gs_idx_map.iter().enumerate() {
                    // Constraint rows drop the objective, so the row index
                    // is already the 1-based one WORHP wants.
                    row[i] = gs[idx].0 as c_int;
                    col[i] = (gs[idx].1 + 1) as c_int;
                }
            }
            if wsp.hm.need_structure {
                let nnz = hs_idx_map.len() + dim;
                let row = std::slice::from_raw_parts_mut(wsp.hm.row, nnz);
                let col = std::slice::from_raw_parts_mut(wsp.hm.col, nnz);
                for (i, &idx) in hs_idx_map.iter().enumerate() {
                    row[i] = (merged_hs[idx].0 + 1) as c_int;
                    col[i] = (merged_hs[idx].1 + 1) as c_int;
                }
                for i in 0..dim {
                    row[hs_idx_map.len() + i] = (i + 1) as c_int;
                    col[hs_idx_map.len() + i] = (i + 1) as c_int;
                }
            }
        }

        if self.verbosity > 0 {
            println!("WORHP plugin:");
            if prob.has_gradient_sparsity() {
                println!(
                    "\tThe gradient sparsity is provided by the user: {} components detected.",
                    sparsity.len()
                );
            } else {
                println!(
                    "\tThe gradient sparsity is assumed dense: {} components detected.",
                    sparsity.len()
                );
            }
            if has_gradient {
                println!("\tThe gradient is provided by the user.");
            } else {
                println!("\tThe gradient is computed numerically by WORHP.");
            }
            println!(
                "\tThe hessian of the lagrangian sparsity has: {} components.",
                merged_hs.len()
            );
            if prob.has_hessians() {
                println!("\tThe hessians are provided by the user.");
            } else {
                println!("\tThe hessian of the lagrangian is computed numerically by WORHP.");
            }
        }

        // Reverse communication: poll for the requested action, do it and
        // acknowledge, until a termination status is reached. callWorhp
        // and fidif are acknowledged by the library itself.
        let mut logger = EvalLogger::new(self.verbosity);
        let mut f_cache: Option<EvalCache> = None;
        let mut g_cache: Option<EvalCache> = None;
        let mut callback_error: Option<SolveError> = None;

        'rc: while cnt.status < TERMINATE_SUCCESS && cnt.status > TERMINATE_ERROR {
            unsafe {
                if (self.api.get_user_action)(&cnt, CALL_WORHP) {
                    (self.api.worhp)(&mut opt, &mut wsp, &mut par, &mut cnt);
                }
                if (self.api.get_user_action)(&cnt, ITER_OUTPUT) {
                    (self.api.iteration_output)(&mut opt, &mut wsp, &mut par, &mut cnt);
                    (self.api.done_user_action)(&mut cnt, ITER_OUTPUT);
                }
                if (self.api.get_user_action)(&cnt, EVAL_F) {
                    let x = std::slice::from_raw_parts(opt.x, dim);
                    // A cache hit re-serves the last evaluation; only a
                    // fresh point counts as an objective evaluation.
                    let fresh = f_cache.as_ref().map_or(true, |c| c.x != x);
                    match cached_eval(&mut f_cache, x, |x| prob.fitness(x)) {
                        Ok(fit) => {
                            if fresh {
                                logger.observe(&fit, prob.as_ref());
                            }
                            opt.f = wsp.scale_obj * fit[0];
                        }
                        Err(err) => {
                            callback_error = Some(err);
                            break 'rc;
                        }
                    }
                    (self.api.done_user_action)(&mut cnt, EVAL_F);
                }
                if (self.api.get_user_action)(&cnt, EVAL_G) {
                    let x = std::slice::from_raw_parts(opt.x, dim);
                    match cached_eval(&mut f_cache, x, |x| prob.fitness(x)) {
                        Ok(fit) => {
                            let g = std::slice::from_raw_parts_mut(opt.g, nc);
                            g.copy_from_slice(&fit[1..=nc]);
                        }
                        Err(err) => {
                            callback_error = Some(err);
                            break 'rc;
                        }
                    }
                    (self.api.done_user_action)(&mut cnt, EVAL_G);
                }
                if (self.api.get_user_action)(&cnt, EVAL_DF) {
                    let x = std::slice::from_raw_parts(opt.x, dim);
                    match cached_eval(&mut g_cache, x, |x| prob.gradient(x)) {
                        Ok(grad) => {
                            let val = std::slice::from_raw_parts_mut(wsp.df.val, fs.len());
                            val.copy_from_slice(&grad[..fs.len()]);
                        }
                        Err(err) => {
                            callback_error = Some(err);
                            break 'rc;
                        }
                    }
                    (self.api.done_user_action)(&mut cnt, EVAL_DF);
                }
                if (self.api.get_user_action)(&cnt, EVAL_HM) {
                    let x = std::slice::from_raw_parts(opt.x, dim);
                    match catch_unwind(AssertUnwindSafe(|| prob.hessians(x))) {
                        Ok(hessians) => {
                            self.assemble_lagrangian_hessian(
                                &opt, &wsp, &hs, &merged_hs, &hs_idx_map, &hessians, dim, nc,
                            );
                        }
                        Err(_) => {
                            callback_error = Some(SolveError::UserFunction(
                                "hessian evaluation panicked".to_string(),
                            ));
                            break 'rc;
                        }
                    }
                    (self.api.done_user_action)(&mut cnt, EVAL_HM);
                }
                if (self.api.get_user_action)(&cnt, EVAL_DG) {
                    let x = std::slice::from_raw_parts(opt.x, dim);
                    match cached_eval(&mut g_cache, x, |x| prob.gradient(x)) {
                        Ok(grad) => {
                            let val = std::slice::from_raw_parts_mut(wsp.dg.val, gs.len());
                            for (i, &idx) in gs_idx_map.iter().enumerate() {
                                val[i] = grad[fs.len() + idx];
                            }
                        }
                        Err(err) => {
                            callback_error = Some(err);
                            break 'rc;
                        }
                    }
                    (self.api.done_user_action)(&mut cnt, EVAL_DG);
                }
                if (self.api.get_user_action)(&cnt, FIDIF) {
                    (self.api.fidif)(&mut opt, &mut wsp, &mut par, &mut cnt);
                }
            }
        }

        // The status message, recorded on every outcome.
        let mut msg_buf = [0 as c_char; 1024];
        unsafe {
            (self.api.status_msg_string)(
                &mut opt,
                &mut wsp,
                &mut par,
                &mut cnt,
                msg_buf.as_mut_ptr(),
            );
        }
        let message = unsafe { CStr::from_ptr(msg_buf.as_ptr()) }
            .to_string_lossy()
            .trim()
            .to_string();
        *self.last_opt_result.lock() = message.clone();
        *self.log.lock() = logger.into_lines();
        if self.verbosity > 0 {
            println!("{message}");
        } else if self.screen_output {
            unsafe { (self.api.status_msg)(&mut opt, &mut wsp, &mut par, &mut cnt) };
        }

        if let Some(err) = callback_error {
            return Err(err.into());
        }
        if cnt.status <= TERMINATE_ERROR {
            return Err(SolveError::Status {
                code: cnt.status,
                message,
            }
            .into());
        }

        // Re-evaluate the final iterate and re-insert it only if it
        // improves on the selected individual.
        let x_final = unsafe { std::slice::from_raw_parts(opt.x, dim) }.to_vec();
        let f_final = cached_eval(&mut f_cache, &x_final, |x| prob.fitness(x))
            .map_err(PluginError::from)?;
        if compare_fc(&f_final, &fit0, nec, &ctol) {
            let mut rng = self.rng.lock();
            replace_individual(&mut pop, self.replacement, &mut rng, x_final, f_final)?;
        }
        Ok(pop)
    }

    // Hessian of the Lagrangian L = ScaleObj * f + mu . g, assembled from
    // the per-component hessians and written in WORHP's layout: strict
    // lower triangle in column-major order, then the full diagonal.
    #[allow(clippy::too_many_arguments)]
    fn assemble_lagrangian_hessian(
        &self,
        opt: &OptVar,
        wsp: &Workspace,
        hs: &[SparsityPattern],
        merged_hs: &[(usize, usize)],
        hs_idx_map: &[usize],
        hessians: &[Vec<f64>],
        dim: usize,
        nc: usize,
    ) {
        let mut merged: HashMap<(usize, usize), f64> = HashMap::new();
        for (j, &key) in hs[0].iter().enumerate() {
            merged.insert(key, hessians[0][j] * wsp.scale_obj);
        }
        let mu = if nc > 0 {
            unsafe { std::slice::from_raw_parts(opt.mu, nc) }
        } else {
            &[]
        };
        for i in 1..hs.len() {
            for (j, &key) in hs[i].iter().enumerate() {
                *merged.entry(key).or_insert(0.0) += hessians[i][j] * mu[i - 1];
            }
        }
        let nnz = hs_idx_map.len() + dim;
        let val = unsafe { std::slice::from_raw_parts_mut(wsp.hm.val, nnz) };
        for (i, &idx) in hs_idx_map.iter().enumerate() {
            val[i] = merged.get(&merged_hs[idx]).copied().unwrap_or(0.0);
        }
        for i in 0..dim {
            val[hs_idx_map.len() + i] = merged.get(&(i, i)).copied().unwrap_or(0.0);
        }
    }

    fn set_bool(&self, par: &mut Params, name: &str, value: bool) -> Result<(), SolveError> {
        let c_name = self.option_name(name)?;
        let ok = unsafe { (self.api.set_bool_param)(par, c_name.as_ptr(), value) };
        if !ok {
            return Err(self.rejected(name, &format!("bool value {value}")));
        }
        Ok(())
    }

    fn set_int(&self, par: &mut Params, name: &str, value: i32) -> Result<(), SolveError> {
        let c_name = self.option_name(name)?;
        let ok = unsafe { (self.api.set_int_param)(par, c_name.as_ptr(), value) };
        if !ok {
            return Err(self.rejected(name, &format!("integer value {value}")));
        }
        Ok(())
    }

    fn set_double(&self, par: &mut Params, name: &str, value: f64) -> Result<(), SolveError> {
        let c_name = self.option_name(name)?;
        let ok = unsafe { (self.api.set_double_param)(par, c_name.as_ptr(), value) };
        if !ok {
            return Err(self.rejected(name, &format!("numeric value {value}")));
        }
        Ok(())
    }

    fn option_name(&self, name: &str) -> Result<CString, SolveError> {
        CString::new(name).map_err(|_| SolveError::InvalidOption {
            name: name.to_string(),
            detail: "option name contains an interior NUL byte".to_string(),
        })
    }

    fn rejected(&self, name: &str, what: &str) -> SolveError {
        SolveError::InvalidOption {
            name: name.to_string(),
            detail: format!(
                "the WORHP interface rejected the {what}; did you misspell the option name?"
            ),
        }
    }
}

/// Query the library version and refuse anything but the supported one.
fn check_version(api: &WorhpApi, path: &Path) -> Result<(), BindError> {
    let mut major = 0 as c_int;
    let mut minor = 0 as c_int;
    let mut patch = [0 as c_char; PATCH_STRING_LENGTH];
    unsafe { (api.version)(&mut major, &mut minor, patch.as_mut_ptr()) };
    if major != SUPPORTED_MAJOR || minor != SUPPORTED_MINOR {
        return Err(BindError::VersionMismatch {
            path: path.to_path_buf(),
            found: format!("{major}.{minor}"),
            supported: format!("{SUPPORTED_MAJOR}.{SUPPORTED_MINOR}"),
        });
    }
    Ok(())
}

impl Algorithm for Worhp {
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
        "WORHP".to_string()
    }

    fn extra_info(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "\tWorhp library filename: {}", self.path.display());
        if self.screen_output {
            let _ = writeln!(out, "\tScreen output: (worhp)");
        } else {
            let _ = writeln!(out, "\tScreen output: verbosity {}", self.verbosity);
        }
        let _ = writeln!(out, "\tIndividual selection policy: {:?}", self.selection);
        let _ = writeln!(out, "\tIndividual replacement policy: {:?}", self.replacement);
        if !self.options.is_empty() {
            let _ = writeln!(out, "\tOptions: {:?}", self.options.entries());
        }
        let _ = writeln!(out, "\tLast optimisation result: {}", self.last_opt_result());
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
