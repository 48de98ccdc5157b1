//! Horizon state equation
//!
//! Stacks the per-segment bicycle linearization into block-dense matrices so
//! that the whole horizon satisfies `X = B * U + W`, with the anchor state
//! absorbed into W. The block subdiagonal A is kept for prediction and for
//! propagating the anchor state.

use nalgebra::{DMatrix, DVector, Vector2};

use mpt_core::bicycle::KinematicBicycle;

use crate::reference::{KinematicState, ReferencePoint};

/// Stacked horizon matrices
#[derive(Debug, Clone)]
pub struct StateEquationMatrix {
    /// Block subdiagonal of one-step transition matrices (Nx x Nx)
    pub a: DMatrix<f64>,
    /// Input response (Nx x Nu)
    pub b: DMatrix<f64>,
    /// Affine offset (Nx)
    pub w: DVector<f64>,
}

/// Builds the horizon state equation from reference points
#[derive(Debug, Clone)]
pub struct StateEquationGenerator {
    model: KinematicBicycle,
}

impl StateEquationGenerator {
    pub fn new(wheelbase: f64, max_steer_rad: f64) -> Self {
        Self {
            model: KinematicBicycle::new(wheelbase, max_steer_rad),
        }
    }

    pub fn dim_x(&self) -> usize {
        KinematicBicycle::DIM_X
    }

    pub fn dim_u(&self) -> usize {
        KinematicBicycle::DIM_U
    }

    /// Assemble (A, B, W) over the horizon by the recurrence
    /// `X[i] = Ad * X[i-1] + Bd * U[i-1] + Wd`.
    ///
    /// Every one-step triple comes from the zero-curvature linearization of
    /// its segment, which keeps the recurrence well conditioned; at zero
    /// reference steering the drift term vanishes. W starts from a zero
    /// anchor state, see [`Self::absorb_initial_state`].
    pub fn calc_matrix(&self, ref_points: &[ReferencePoint]) -> StateEquationMatrix {
        let d_x = self.dim_x();
        let d_u = self.dim_u();
        let n_ref = ref_points.len();
        let n_x = n_ref * d_x;
        let n_u = n_ref.saturating_sub(1) * d_u;

        let mut a = DMatrix::zeros(n_x, n_x);
        let mut b = DMatrix::zeros(n_x, n_u);
        let mut w = DVector::zeros(n_x);

        for i in 1..n_ref {
            let ds = ref_points[i].delta_arc_length;

            // Curvature 0.0 for the one-step matrices, for stability
            let (ad, bd, wd) = self.model.linearize(0.0, ds);

            // W[i] = Ad * W[i-1] + Wd
            let w_prev = Vector2::new(w[(i - 1) * d_x], w[(i - 1) * d_x + 1]);
            let w_next = ad * w_prev + wd;
            w[i * d_x] = w_next[0];
            w[i * d_x + 1] = w_next[1];

            // B[i, k] = Ad * B[i-1, k] for k < i-1, then B[i, i-1] = Bd
            for k in 0..i.saturating_sub(1) {
                let prev = ad * b.fixed_view::<2, 1>((i - 1) * d_x, k * d_u).into_owned();
                b.fixed_view_mut::<2, 1>(i * d_x, k * d_u).copy_from(&prev);
            }
            b.fixed_view_mut::<2, 1>(i * d_x, (i - 1) * d_u).copy_from(&bd);

            a.fixed_view_mut::<2, 2>(i * d_x, (i - 1) * d_x).copy_from(&ad);
        }

        StateEquationMatrix { a, b, w }
    }

    /// Lift the anchor state into W so that `X = B * U + W` carries the ego
    /// state from `anchor` forward through the stored transition blocks.
    pub fn absorb_initial_state(
        &self,
        mat: &mut StateEquationMatrix,
        anchor: usize,
        state: &KinematicState,
    ) {
        let d_x = self.dim_x();
        let n_ref = mat.w.len() / d_x;
        if anchor >= n_ref {
            return;
        }

        let mut cum = Vector2::new(state.lat, state.yaw);
        mat.w[anchor * d_x] += cum[0];
        mat.w[anchor * d_x + 1] += cum[1];
        for i in anchor + 1..n_ref {
            let ad = mat.a.fixed_view::<2, 2>(i * d_x, (i - 1) * d_x).into_owned();
            cum = ad * cum;
            mat.w[i * d_x] += cum[0];
            mat.w[i * d_x + 1] += cum[1];
        }
    }

    /// Evaluate the state equation: `X = B * U + W`
    pub fn predict(&self, mat: &StateEquationMatrix, u: &DVector<f64>) -> DVector<f64> {
        &mat.b * u + &mat.w
    }
}
