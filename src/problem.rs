//! Host Problem Interface
//!
//! The capability surface the adapters need from the host framework's
//! problem object: dimensions, bounds, fitness, and optional derivative
//! information. Fitness vectors use the layout
//! `[objective, equality constraints..., inequality constraints...]`.
//!
//! Gradient-based vendor solvers call back into these methods from inside
//! the solve; implementations must therefore be callable through `&self`
//! and free of interior state that a re-entrant call could corrupt.

/// A sparsity pattern: `(row, column)` pairs in lexicographic order.
pub type SparsityPattern = Vec<(usize, usize)>;

/// The optimisation problem handed to a vendor solver.
pub trait Problem: Send + Sync {
    /// Dimension of the decision vector.
    fn dim(&self) -> usize;

    /// Lower and upper box bounds, each of length [`Problem::dim`].
    fn bounds(&self) -> (Vec<f64>, Vec<f64>);

    /// Fitness of a decision vector: objective first, then equality
    /// constraints, then inequality constraints (`g(x) <= 0` convention).
    fn fitness(&self, x: &[f64]) -> Vec<f64>;

    /// Number of objectives. The wrapped solvers only support 1.
    fn nobj(&self) -> usize {
        1
    }

    /// Number of equality constraints.
    fn nec(&self) -> usize {
        0
    }

    /// Number of inequality constraints.
    fn nic(&self) -> usize {
        0
    }

    /// Total fitness dimension.
    fn nf(&self) -> usize {
        self.nobj() + self.nec() + self.nic()
    }

    /// Total constraint count.
    fn nc(&self) -> usize {
        self.nec() + self.nic()
    }

    /// Whether [`Problem::gradient`] is implemented. When false the vendor
    /// solver approximates derivatives numerically.
    fn has_gradient(&self) -> bool {
        false
    }

    /// Fitness gradient, flattened in the order given by
    /// [`Problem::gradient_sparsity`].
    fn gradient(&self, _x: &[f64]) -> Vec<f64> {
        Vec::new()
    }

    /// Whether the gradient sparsity is user-provided (dense otherwise).
    fn has_gradient_sparsity(&self) -> bool {
        false
    }

    /// Sparsity of the fitness gradient; dense by default.
    fn gradient_sparsity(&self) -> SparsityPattern {
        dense_sparsity(self.nf(), self.dim())
    }

    /// Whether [`Problem::hessians`] is implemented (WORHP only).
    fn has_hessians(&self) -> bool {
        false
    }

    /// Hessians of the fitness components, each flattened in the order
    /// given by [`Problem::hessians_sparsity`].
    fn hessians(&self, _x: &[f64]) -> Vec<Vec<f64>> {
        Vec::new()
    }

    /// Whether the hessians sparsity is user-provided (dense otherwise).
    fn has_hessians_sparsity(&self) -> bool {
        false
    }

    /// Sparsity of each fitness component's hessian: the lower triangular
    /// part including the diagonal, dense by default.
    fn hessians_sparsity(&self) -> Vec<SparsityPattern> {
        (0..self.nf()).map(|_| dense_hessian(self.dim())).collect()
    }

    /// Per-constraint feasibility tolerances, length [`Problem::nc`].
    fn c_tol(&self) -> Vec<f64> {
        vec![0.0; self.nc()]
    }

    /// Whether the fitness is stochastic. The wrapped solvers reject
    /// stochastic problems.
    fn is_stochastic(&self) -> bool {
        false
    }

    /// Human-readable problem name.
    fn name(&self) -> String {
        "unnamed problem".to_string()
    }
}

/// Dense gradient sparsity: every fitness component depends on every
/// decision variable.
pub fn dense_sparsity(nf: usize, nx: usize) -> SparsityPattern {
    let mut pattern = Vec::with_capacity(nf * nx);
    for i in 0..nf {
        for j in 0..nx {
            pattern.push((i, j));
        }
    }
    pattern
}

/// Dense lower-triangular hessian sparsity (diagonal included).
pub fn dense_hessian(nx: usize) -> SparsityPattern {
    let mut pattern = Vec::new();
    for i in 0..nx {
        for j in 0..=i {
            pattern.push((i, j));
        }
    }
    pattern
}

/// Number of violated constraints and the L2 norm of the violation, for a
/// fitness vector `f = [obj, eq..., ineq...]` against tolerances `tol`.
pub fn violations(f: &[f64], nec: usize, tol: &[f64]) -> (usize, f64) {
    let mut violated = 0usize;
    let mut norm_sq = 0.0f64;
    for (i, &c) in f[1..].iter().enumerate() {
        let t = tol.get(i).copied().unwrap_or(0.0);
        let excess = if i < nec {
            (c.abs() - t).max(0.0)
        } else {
            (c - t).max(0.0)
        };
        if excess > 0.0 {
            violated += 1;
            norm_sq += excess * excess;
        }
    }
    (violated, norm_sq.sqrt())
}

/// Whether `f1` is better than `f2` under feasible-first ordering: fewer
/// violated constraints first, then smaller violation norm, then smaller
/// objective. NaN objectives always lose.
pub fn compare_fc(f1: &[f64], f2: &[f64], nec: usize, tol: &[f64]) -> bool {
    let (v1, n1) = violations(f1, nec, tol);
    let (v2, n2) = violations(f2, nec, tol);
    if v1 != v2 {
        return v1 < v2;
    }
    if n1 != n2 {
        return n1 < n2;
    }
    if f1[0].is_nan() {
        return false;
    }
    if f2[0].is_nan() {
        return true;
    }
    f1[0] < f2[0]
}

/// Whether a fitness vector is feasible within the given tolerances.
pub fn feasible(f: &[f64], nec: usize, tol: &[f64]) -> bool {
    violations(f, nec, tol).0 == 0
}
