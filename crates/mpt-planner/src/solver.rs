//! OSQP adapter
//!
//! Wraps the external OSQP solver behind the lifecycle the optimizer needs:
//! CSC construction from dense matrices, workspace reuse with value-only
//! updates while the sparsity pattern is unchanged, warm starting, and a
//! wall-clock budget per solve.

use std::borrow::Cow;
use std::time::Duration;

use log::{debug, warn};
use nalgebra::DMatrix;
use osqp::{CscMatrix, Problem, Settings, Status};
use thiserror::Error;

/// Stand-in for unbounded constraint rows
pub const OSQP_INF: f64 = 1e30;

/// QP solver errors
#[derive(Debug, Error)]
pub enum QpError {
    #[error("problem is primal or dual infeasible")]
    Infeasible,
    #[error("iteration limit reached before convergence")]
    MaxIterExceeded,
    #[error("time limit reached before convergence")]
    TimeExceeded,
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("solver failure: {0}")]
    SolverInternal(String),
}

/// Primal/dual solution with solve statistics
#[derive(Debug, Clone)]
pub struct QpSolution {
    pub primal: Vec<f64>,
    pub dual: Vec<f64>,
    pub iterations: u32,
    pub solve_time: Duration,
}

/// Dense to CSC conversion, column-major scan, zeros dropped
pub fn calc_csc_matrix(mat: &DMatrix<f64>) -> CscMatrix<'static> {
    csc_from_dense(mat, |_, _| true)
}

/// CSC of the upper-triangular part only; the form P must be passed in for a
/// symmetric objective matrix
pub fn calc_csc_matrix_trapezoidal(mat: &DMatrix<f64>) -> CscMatrix<'static> {
    csc_from_dense(mat, |row, col| row <= col)
}

fn csc_from_dense(mat: &DMatrix<f64>, keep: impl Fn(usize, usize) -> bool) -> CscMatrix<'static> {
    let (nrows, ncols) = mat.shape();
    let mut indptr = Vec::with_capacity(ncols + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();

    indptr.push(0);
    for col in 0..ncols {
        for row in 0..nrows {
            let v = mat[(row, col)];
            if v != 0.0 && keep(row, col) {
                indices.push(row);
                data.push(v);
            }
        }
        indptr.push(indices.len());
    }

    CscMatrix {
        nrows,
        ncols,
        indptr: Cow::Owned(indptr),
        indices: Cow::Owned(indices),
        data: Cow::Owned(data),
    }
}

/// Dense reconstruction, the inverse of [`calc_csc_matrix`]
pub fn dense_from_csc(csc: &CscMatrix) -> DMatrix<f64> {
    let mut mat = DMatrix::zeros(csc.nrows, csc.ncols);
    for col in 0..csc.ncols {
        for idx in csc.indptr[col]..csc.indptr[col + 1] {
            mat[(csc.indices[idx], col)] = csc.data[idx];
        }
    }
    mat
}

#[derive(Debug, Clone, PartialEq)]
struct SparsityPattern {
    nrows: usize,
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
}

impl SparsityPattern {
    fn of(csc: &CscMatrix) -> Self {
        Self {
            nrows: csc.nrows,
            ncols: csc.ncols,
            indptr: csc.indptr.to_vec(),
            indices: csc.indices.to_vec(),
        }
    }
}

/// Owns the OSQP workspace across planning ticks.
///
/// The workspace is constructed on the first [`OsqpInterface::setup`] and
/// kept alive while the problem keeps its dimensions and sparsity pattern,
/// so subsequent ticks only push new values and reuse the factorization.
pub struct OsqpInterface {
    eps_abs: f64,
    max_iter: u32,
    time_limit: Option<Duration>,

    problem: Option<Problem>,
    p_pattern: Option<SparsityPattern>,
    a_pattern: Option<SparsityPattern>,
    num_vars: usize,
    num_constraints: usize,
}

impl OsqpInterface {
    pub fn new(eps_abs: f64, max_iter: u32, time_limit: Option<Duration>) -> Self {
        Self {
            eps_abs,
            max_iter,
            time_limit,
            problem: None,
            p_pattern: None,
            a_pattern: None,
            num_vars: 0,
            num_constraints: 0,
        }
    }

    /// Number of decision variables of the current workspace
    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    /// Whether the next solve reuses an existing workspace
    pub fn has_workspace(&self) -> bool {
        self.problem.is_some()
    }

    /// Install the problem data, reusing the workspace when the sparsity
    /// pattern of both P and A is unchanged.
    pub fn setup(
        &mut self,
        p: &CscMatrix<'static>,
        a: &CscMatrix<'static>,
        q: &[f64],
        l: &[f64],
        u: &[f64],
    ) -> Result<(), QpError> {
        let n = p.ncols;
        let m = a.nrows;
        if q.len() != n {
            return Err(QpError::DimensionMismatch(format!(
                "q has {} entries for {} variables",
                q.len(),
                n
            )));
        }
        if l.len() != m || u.len() != m {
            return Err(QpError::DimensionMismatch(format!(
                "bounds have {}/{} entries for {} constraints",
                l.len(),
                u.len(),
                m
            )));
        }

        let p_pattern = SparsityPattern::of(p);
        let a_pattern = SparsityPattern::of(a);

        let reusable = self.problem.is_some()
            && self.p_pattern.as_ref() == Some(&p_pattern)
            && self.a_pattern.as_ref() == Some(&a_pattern);

        if reusable {
            let problem = self.problem.as_mut().unwrap();
            problem.update_P_A(p.clone(), a.clone());
            problem.update_lin_cost(q);
            problem.update_bounds(l, u);
            debug!("osqp workspace reused ({} vars, {} rows)", n, m);
        } else {
            let settings = Settings::default()
                .verbose(false)
                .eps_abs(self.eps_abs)
                .eps_rel(self.eps_abs)
                .max_iter(self.max_iter)
                .warm_start(true)
                .polish(true)
                .time_limit(self.time_limit);

            let problem = Problem::new(p.clone(), q, a.clone(), l, u, &settings)
                .map_err(|e| QpError::SolverInternal(format!("setup failed: {:?}", e)))?;
            self.problem = Some(problem);
            debug!("osqp workspace rebuilt ({} vars, {} rows)", n, m);
        }

        self.p_pattern = Some(p_pattern);
        self.a_pattern = Some(a_pattern);
        self.num_vars = n;
        self.num_constraints = m;
        Ok(())
    }

    /// Value-only update of the linear cost; always allowed
    pub fn update_q(&mut self, q: &[f64]) -> Result<(), QpError> {
        let problem = self
            .problem
            .as_mut()
            .ok_or_else(|| QpError::SolverInternal("update before setup".into()))?;
        if q.len() != self.num_vars {
            return Err(QpError::DimensionMismatch(format!(
                "q has {} entries for {} variables",
                q.len(),
                self.num_vars
            )));
        }
        problem.update_lin_cost(q);
        Ok(())
    }

    /// Value-only update of the constraint bounds; always allowed
    pub fn update_bounds(&mut self, l: &[f64], u: &[f64]) -> Result<(), QpError> {
        let problem = self
            .problem
            .as_mut()
            .ok_or_else(|| QpError::SolverInternal("update before setup".into()))?;
        if l.len() != self.num_constraints || u.len() != self.num_constraints {
            return Err(QpError::DimensionMismatch(format!(
                "bounds have {}/{} entries for {} constraints",
                l.len(),
                u.len(),
                self.num_constraints
            )));
        }
        problem.update_bounds(l, u);
        Ok(())
    }

    /// Seed the solver with a primal (and optionally dual) guess
    pub fn set_warm_start(&mut self, primal: &[f64], dual: Option<&[f64]>) -> Result<(), QpError> {
        let problem = self
            .problem
            .as_mut()
            .ok_or_else(|| QpError::SolverInternal("warm start before setup".into()))?;
        if primal.len() != self.num_vars {
            return Err(QpError::DimensionMismatch(format!(
                "warm start has {} entries for {} variables",
                primal.len(),
                self.num_vars
            )));
        }
        match dual {
            Some(y) if y.len() == self.num_constraints => problem.warm_start(primal, y),
            _ => problem.warm_start_x(primal),
        }
        Ok(())
    }

    /// Run the solver on the installed problem
    pub fn optimize(&mut self) -> Result<QpSolution, QpError> {
        let problem = self
            .problem
            .as_mut()
            .ok_or_else(|| QpError::SolverInternal("optimize before setup".into()))?;

        match problem.solve() {
            Status::Solved(sol) | Status::SolvedInaccurate(sol) => Ok(QpSolution {
                primal: sol.x().to_vec(),
                dual: sol.y().to_vec(),
                iterations: sol.iter(),
                solve_time: sol.solve_time(),
            }),
            Status::MaxIterationsReached(_) => {
                warn!("osqp hit the iteration limit");
                Err(QpError::MaxIterExceeded)
            }
            Status::TimeLimitReached(_) => {
                warn!("osqp hit the time limit");
                Err(QpError::TimeExceeded)
            }
            Status::PrimalInfeasible(_)
            | Status::PrimalInfeasibleInaccurate(_)
            | Status::DualInfeasible(_)
            | Status::DualInfeasibleInaccurate(_) => Err(QpError::Infeasible),
            _ => Err(QpError::SolverInternal("unexpected solver status".into())),
        }
    }

    /// Drop the workspace; the next setup rebuilds from scratch
    pub fn reset(&mut self) {
        self.problem = None;
        self.p_pattern = None;
        self.a_pattern = None;
        self.num_vars = 0;
        self.num_constraints = 0;
    }
}

impl std::fmt::Debug for OsqpInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsqpInterface")
            .field("eps_abs", &self.eps_abs)
            .field("num_vars", &self.num_vars)
            .field("num_constraints", &self.num_constraints)
            .field("has_workspace", &self.problem.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dmatrix;

    #[test]
    fn test_csc_round_trip_general() {
        let m = dmatrix![
            1.0, 0.0, 2.0;
            0.0, 0.0, -3.0;
            4.0, 5.0, 0.0;
        ];
        let csc = calc_csc_matrix(&m);
        let back = dense_from_csc(&csc);
        assert_relative_eq!(m, back);
    }

    #[test]
    fn test_csc_trapezoidal_keeps_upper_triangle() {
        let m = dmatrix![
            2.0, 1.0, 0.5;
            1.0, 3.0, -1.0;
            0.5, -1.0, 4.0;
        ];
        let csc = calc_csc_matrix_trapezoidal(&m);
        let back = dense_from_csc(&csc);
        for row in 0..3 {
            for col in 0..3 {
                let expected = if row <= col { m[(row, col)] } else { 0.0 };
                assert_relative_eq!(back[(row, col)], expected);
            }
        }
    }

    #[test]
    fn test_solve_small_qp() {
        // min 0.5 x'Px + q'x with P = diag(2, 2), q = (-2, -4),
        // subject to 0 <= x <= 10; optimum at (1, 2)
        let p = dmatrix![2.0, 0.0; 0.0, 2.0];
        let a = dmatrix![1.0, 0.0; 0.0, 1.0];
        let q = [-2.0, -4.0];
        let l = [0.0, 0.0];
        let u = [10.0, 10.0];

        let mut solver = OsqpInterface::new(1e-6, 20_000, None);
        solver
            .setup(
                &calc_csc_matrix_trapezoidal(&p),
                &calc_csc_matrix(&a),
                &q,
                &l,
                &u,
            )
            .unwrap();
        let sol = solver.optimize().unwrap();
        assert_relative_eq!(sol.primal[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(sol.primal[1], 2.0, epsilon = 1e-3);
    }

    #[test]
    fn test_workspace_reuse_and_warm_start() {
        let p = dmatrix![2.0, 0.0; 0.0, 2.0];
        let a = dmatrix![1.0, 0.0; 0.0, 1.0];
        let q = [-2.0, -4.0];
        let l = [0.0, 0.0];
        let u = [10.0, 10.0];

        let mut solver = OsqpInterface::new(1e-6, 20_000, None);
        let p_csc = calc_csc_matrix_trapezoidal(&p);
        let a_csc = calc_csc_matrix(&a);
        solver.setup(&p_csc, &a_csc, &q, &l, &u).unwrap();
        let cold = solver.optimize().unwrap();

        // Same pattern: the workspace is kept and the previous solution
        // warm-starts the next solve
        solver.setup(&p_csc, &a_csc, &q, &l, &u).unwrap();
        assert!(solver.has_workspace());
        solver.set_warm_start(&cold.primal, Some(&cold.dual)).unwrap();
        let warm = solver.optimize().unwrap();

        assert_relative_eq!(warm.primal[0], cold.primal[0], epsilon = 1e-4);
        assert!(warm.iterations <= cold.iterations);
    }

    #[test]
    fn test_value_only_updates() {
        let p = dmatrix![2.0, 0.0; 0.0, 2.0];
        let a = dmatrix![1.0, 0.0; 0.0, 1.0];
        let q = [-2.0, -4.0];
        let l = [0.0, 0.0];
        let u = [10.0, 10.0];

        let mut solver = OsqpInterface::new(1e-6, 20_000, None);
        solver
            .setup(&calc_csc_matrix_trapezoidal(&p), &calc_csc_matrix(&a), &q, &l, &u)
            .unwrap();
        solver.optimize().unwrap();

        // Move the optimum to (3, 2) without touching the matrices
        solver.update_q(&[-6.0, -4.0]).unwrap();
        solver.update_bounds(&[0.0, 0.0], &[5.0, 5.0]).unwrap();
        let sol = solver.optimize().unwrap();
        assert_relative_eq!(sol.primal[0], 3.0, epsilon = 1e-3);
        assert_relative_eq!(sol.primal[1], 2.0, epsilon = 1e-3);
    }

    #[test]
    fn test_infeasible_problem_reports_error() {
        // x <= -1 and x >= 1 cannot both hold
        let p = dmatrix![1.0];
        let a = dmatrix![1.0; 1.0];
        let q = [0.0];
        let l = [-OSQP_INF, 1.0];
        let u = [-1.0, OSQP_INF];

        let mut solver = OsqpInterface::new(1e-6, 20_000, None);
        solver
            .setup(&calc_csc_matrix_trapezoidal(&p), &calc_csc_matrix(&a), &q, &l, &u)
            .unwrap();
        assert!(matches!(solver.optimize(), Err(QpError::Infeasible)));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let p = dmatrix![1.0];
        let a = dmatrix![1.0];
        let mut solver = OsqpInterface::new(1e-6, 100, None);
        let err = solver.setup(
            &calc_csc_matrix_trapezoidal(&p),
            &calc_csc_matrix(&a),
            &[0.0, 0.0],
            &[0.0],
            &[1.0],
        );
        assert!(matches!(err, Err(QpError::DimensionMismatch(_))));
    }
}
