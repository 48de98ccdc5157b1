//! Natural cubic spline interpolation
//!
//! One-dimensional splines are fit with the Thomas algorithm under natural
//! boundary conditions (zero second derivative at both ends). A 2D arc-length
//! parameterization is layered on top for path resampling; it provides
//! position, heading and curvature as functions of arc length.

/// Piecewise cubic polynomial s(t) = a + b*dt + c*dt^2 + d*dt^3 on each knot
/// interval. Knots must be strictly increasing.
///
/// Out-of-range queries clamp to the nearest knot, so `interpolate` returns
/// the endpoint value, `derivative` the endpoint slope and
/// `second_derivative` zero (natural boundary).
#[derive(Debug, Clone, Default)]
pub struct CubicSpline {
    x: Vec<f64>,
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
    d: Vec<f64>,
}

impl CubicSpline {
    /// Fit spline coefficients. Fewer than two knots produces an empty spline
    /// that evaluates to zero everywhere; exactly two degenerates to linear
    /// interpolation.
    pub fn new(x: &[f64], y: &[f64]) -> Self {
        let n = x.len().min(y.len());
        if n < 2 {
            return Self::default();
        }

        let x = x[..n].to_vec();
        let a = y[..n].to_vec();
        let mut b = vec![0.0; n];
        let mut c = vec![0.0; n];
        let mut d = vec![0.0; n];

        if n == 2 {
            b[0] = (a[1] - a[0]) / (x[1] - x[0]);
            return Self { x, a, b, c, d };
        }

        let h: Vec<f64> = (0..n - 1).map(|i| x[i + 1] - x[i]).collect();

        let mut alpha = vec![0.0; n];
        for i in 1..n - 1 {
            alpha[i] = 3.0 / h[i] * (a[i + 1] - a[i]) - 3.0 / h[i - 1] * (a[i] - a[i - 1]);
        }

        // Thomas algorithm; l[0] = l[n-1] = 1 encodes c_0 = c_{n-1} = 0
        let mut l = vec![0.0; n];
        let mut mu = vec![0.0; n];
        let mut z = vec![0.0; n];
        l[0] = 1.0;
        for i in 1..n - 1 {
            l[i] = 2.0 * (x[i + 1] - x[i - 1]) - h[i - 1] * mu[i - 1];
            mu[i] = h[i] / l[i];
            z[i] = (alpha[i] - h[i - 1] * z[i - 1]) / l[i];
        }
        l[n - 1] = 1.0;

        for i in (0..n - 1).rev() {
            c[i] = z[i] - mu[i] * c[i + 1];
            b[i] = (a[i + 1] - a[i]) / h[i] - h[i] * (c[i + 1] + 2.0 * c[i]) / 3.0;
            d[i] = (c[i + 1] - c[i]) / (3.0 * h[i]);
        }

        Self { x, a, b, c, d }
    }

    /// Spline value at `t`
    pub fn interpolate(&self, t: f64) -> f64 {
        if self.x.is_empty() {
            return 0.0;
        }
        let (i, dt) = self.locate(t);
        self.a[i] + self.b[i] * dt + self.c[i] * dt * dt + self.d[i] * dt * dt * dt
    }

    /// First derivative at `t`
    pub fn derivative(&self, t: f64) -> f64 {
        if self.x.is_empty() {
            return 0.0;
        }
        let (i, dt) = self.locate(t);
        self.b[i] + 2.0 * self.c[i] * dt + 3.0 * self.d[i] * dt * dt
    }

    /// Second derivative at `t`
    pub fn second_derivative(&self, t: f64) -> f64 {
        if self.x.is_empty() {
            return 0.0;
        }
        let (i, dt) = self.locate(t);
        2.0 * self.c[i] + 6.0 * self.d[i] * dt
    }

    /// Segment index and local offset for a query clamped into the knot range
    fn locate(&self, t: f64) -> (usize, f64) {
        let n = self.x.len();
        let t = t.clamp(self.x[0], self.x[n - 1]);
        // partition_point returns the first knot greater than t
        let i = self.x.partition_point(|&xk| xk <= t).saturating_sub(1).min(n - 2);
        (i, t - self.x[i])
    }
}

/// 2D path spline parameterized by cumulative arc length.
///
/// x and y are each fit as a 1D spline of arc length, which gives heading and
/// curvature from the first and second derivatives.
#[derive(Debug, Clone)]
pub struct Spline2D {
    s: Vec<f64>,
    sx: CubicSpline,
    sy: CubicSpline,
}

impl Spline2D {
    pub fn new(x: &[f64], y: &[f64]) -> Self {
        let n = x.len().min(y.len());
        let mut s = Vec::with_capacity(n);
        s.push(0.0);
        for i in 1..n {
            let dx = x[i] - x[i - 1];
            let dy = y[i] - y[i - 1];
            s.push(s[i - 1] + dx.hypot(dy));
        }
        let sx = CubicSpline::new(&s, &x[..n]);
        let sy = CubicSpline::new(&s, &y[..n]);
        Self { s, sx, sy }
    }

    /// Total arc length of the underlying polyline
    pub fn total_length(&self) -> f64 {
        self.s.last().copied().unwrap_or(0.0)
    }

    /// Knot arc lengths
    pub fn knots(&self) -> &[f64] {
        &self.s
    }

    pub fn position(&self, s: f64) -> (f64, f64) {
        (self.sx.interpolate(s), self.sy.interpolate(s))
    }

    pub fn yaw(&self, s: f64) -> f64 {
        let dx = self.sx.derivative(s);
        let dy = self.sy.derivative(s);
        dy.atan2(dx)
    }

    /// Signed curvature, positive for left turns
    pub fn curvature(&self, s: f64) -> f64 {
        let dx = self.sx.derivative(s);
        let dy = self.sy.derivative(s);
        let ddx = self.sx.second_derivative(s);
        let ddy = self.sy.second_derivative(s);
        let denom = (dx * dx + dy * dy).powf(1.5);
        if denom < 1e-10 {
            return 0.0;
        }
        (ddy * dx - ddx * dy) / denom
    }
}
