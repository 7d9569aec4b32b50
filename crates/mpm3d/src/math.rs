//! Small 3x3 matrix decompositions used by the constitutive model.
//!
//! `glam` has no SVD or polar decomposition, so both are built here: a Jacobi
//! eigensolver on the Gram matrix gives V and the singular values, and the
//! left factor is recovered as U = F V / sigma. The polar factors follow as
//! R = U V^T, S = V diag(sigma) V^T.

use glam::{Mat3, Vec3};

/// Frobenius inner product: sum of elementwise products.
#[inline]
pub fn double_dot(a: &Mat3, b: &Mat3) -> f32 {
    a.x_axis.dot(b.x_axis) + a.y_axis.dot(b.y_axis) + a.z_axis.dot(b.z_axis)
}

/// Outer product a * b^T.
#[inline]
pub fn outer(a: Vec3, b: Vec3) -> Mat3 {
    Mat3::from_cols(a * b.x, a * b.y, a * b.z)
}

#[inline]
fn el(m: &Mat3, row: usize, col: usize) -> f32 {
    m.col(col)[row]
}

/// Result of a singular value decomposition M = U * diag(sigma) * V^T.
///
/// `u` and `v` are rotations (det = +1). If det(M) < 0 the smallest singular
/// value carries the sign instead.
#[derive(Clone, Copy, Debug)]
pub struct Svd3 {
    /// Left singular vectors.
    pub u: Mat3,
    /// Singular values, descending.
    pub sigma: Vec3,
    /// Right singular vectors.
    pub v: Mat3,
}

impl Svd3 {
    /// Rebuild U * diag(sigma) * V^T.
    pub fn reconstruct(&self) -> Mat3 {
        self.u * Mat3::from_diagonal(self.sigma) * self.v.transpose()
    }
}

const JACOBI_SWEEPS: usize = 12;
const JACOBI_EPS: f32 = 1e-12;

/// Jacobi eigendecomposition of a symmetric matrix.
/// Returns (eigenvalues, eigenvector columns), unsorted.
fn jacobi_eigen(m: &Mat3) -> (Vec3, Mat3) {
    let mut a = [
        [el(m, 0, 0), el(m, 0, 1), el(m, 0, 2)],
        [el(m, 1, 0), el(m, 1, 1), el(m, 1, 2)],
        [el(m, 2, 0), el(m, 2, 1), el(m, 2, 2)],
    ];
    let mut v = [[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

    for _ in 0..JACOBI_SWEEPS {
        let off = a[0][1] * a[0][1] + a[0][2] * a[0][2] + a[1][2] * a[1][2];
        if off < JACOBI_EPS {
            break;
        }

        for (p, q) in [(0usize, 1usize), (0, 2), (1, 2)] {
            let apq = a[p][q];
            if apq.abs() < 1e-20 {
                continue;
            }
            let theta = (a[q][q] - a[p][p]) / (2.0 * apq);
            let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
            let c = 1.0 / (t * t + 1.0).sqrt();
            let s = t * c;

            // Rotate rows/columns p and q of A.
            for k in 0..3 {
                let akp = a[k][p];
                let akq = a[k][q];
                a[k][p] = c * akp - s * akq;
                a[k][q] = s * akp + c * akq;
            }
            for k in 0..3 {
                let apk = a[p][k];
                let aqk = a[q][k];
                a[p][k] = c * apk - s * aqk;
                a[q][k] = s * apk + c * aqk;
            }

            // Accumulate the rotation into V.
            for k in 0..3 {
                let vkp = v[k][p];
                let vkq = v[k][q];
                v[k][p] = c * vkp - s * vkq;
                v[k][q] = s * vkp + c * vkq;
            }
        }
    }

    let eigenvalues = Vec3::new(a[0][0], a[1][1], a[2][2]);
    let eigenvectors = Mat3::from_cols(
        Vec3::new(v[0][0], v[1][0], v[2][0]),
        Vec3::new(v[0][1], v[1][1], v[2][1]),
        Vec3::new(v[0][2], v[1][2], v[2][2]),
    );
    (eigenvalues, eigenvectors)
}

/// Singular value decomposition of an arbitrary 3x3 matrix.
pub fn svd3(m: &Mat3) -> Svd3 {
    let gram = m.transpose() * *m;
    let (evals, evecs) = jacobi_eigen(&gram);

    // Sort eigenpairs descending.
    let mut pairs = [
        (evals.x, evecs.x_axis),
        (evals.y, evecs.y_axis),
        (evals.z, evecs.z_axis),
    ];
    pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut v = Mat3::from_cols(pairs[0].1, pairs[1].1, pairs[2].1);
    if v.determinant() < 0.0 {
        v.z_axis = -v.z_axis;
    }

    let mut sigma = Vec3::new(
        pairs[0].0.max(0.0).sqrt(),
        pairs[1].0.max(0.0).sqrt(),
        pairs[2].0.max(0.0).sqrt(),
    );

    // U columns from M V / sigma; rebuild near-null columns orthogonally.
    let mut u_cols = [Vec3::X, Vec3::Y, Vec3::Z];
    for i in 0..3 {
        let mv = *m * v.col(i);
        if sigma[i] > 1e-8 {
            u_cols[i] = mv / sigma[i];
        } else {
            u_cols[i] = Vec3::ZERO;
        }
    }
    if u_cols[2].length_squared() < 0.5 {
        u_cols[2] = u_cols[0].cross(u_cols[1]).normalize_or_zero();
    }
    if u_cols[1].length_squared() < 0.5 {
        u_cols[1] = u_cols[2].cross(u_cols[0]).normalize_or_zero();
    }

    let mut u = Mat3::from_cols(u_cols[0], u_cols[1], u_cols[2]);
    if u.determinant() < 0.0 {
        u.z_axis = -u.z_axis;
        sigma.z = -sigma.z;
    }

    Svd3 { u, sigma, v }
}

/// Polar factors of F = R * S.
#[derive(Clone, Copy, Debug)]
pub struct Polar {
    /// Rotation part (orthonormal, det +1).
    pub rotation: Mat3,
    /// Symmetric stretch part.
    pub stretch: Mat3,
}

/// Polar decomposition via the SVD: R = U V^T, S = V diag(sigma) V^T.
pub fn polar_decomposition(m: &Mat3) -> Polar {
    let svd = svd3(m);
    let rotation = svd.u * svd.v.transpose();
    let stretch = svd.v * Mat3::from_diagonal(svd.sigma) * svd.v.transpose();
    Polar { rotation, stretch }
}

/// Differential of the rotation factor of a polar decomposition.
///
/// With F = R S and a perturbation dF, R^T dR is the skew matrix with
/// parameters w = (w01, w02, w12) solving G w = (M01, M02, M12) where
/// M = R^T dF - dF^T R and G is assembled from the entries of S.
///
/// A near-singular G (repeated or vanishing singular values of S) is
/// regularized by adding a small multiple of the identity before inverting.
pub fn rotation_differential(df: &Mat3, r: &Mat3, s: &Mat3) -> Mat3 {
    let m = r.transpose() * *df - df.transpose() * *r;
    let rhs = Vec3::new(el(&m, 0, 1), el(&m, 0, 2), el(&m, 1, 2));

    let s00 = el(s, 0, 0);
    let s11 = el(s, 1, 1);
    let s22 = el(s, 2, 2);
    let s01 = el(s, 0, 1);
    let s02 = el(s, 0, 2);
    let s12 = el(s, 1, 2);

    let mut g = Mat3::from_cols(
        Vec3::new(s00 + s11, s12, -s02),
        Vec3::new(s12, s00 + s22, s01),
        Vec3::new(-s02, s01, s11 + s22),
    );

    if g.determinant().abs() < 1e-8 {
        let bump = 1e-4 * (s00 + s11 + s22).abs().max(1.0);
        g.x_axis.x += bump;
        g.y_axis.y += bump;
        g.z_axis.z += bump;
    }

    let w = g.inverse() * rhs;

    let rt_dr = Mat3::from_cols(
        Vec3::new(0.0, -w.x, -w.y),
        Vec3::new(w.x, 0.0, -w.z),
        Vec3::new(w.y, w.z, 0.0),
    );
    *r * rt_dr
}
