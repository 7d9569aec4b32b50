//! Matrix-free implicit velocity solve.
//!
//! The semi-implicit update solves (M - dt^2 K) v = M v* with K the elastic
//! stiffness at the current configuration. The operator is only available as
//! a matrix-vector product, so the system is handed to a conjugate residuals
//! iteration, which tolerates the indefinite spectrum the stiffness can have
//! under compression.

use glam::Vec3;
use rayon::prelude::*;

use crate::forces::calculate_force_differentials;
use crate::grid::Grid;
use crate::particle::ParticleSet;
use crate::snow::ConstitutiveModel;

/// A symmetric linear operator on grid velocity fields, with an optional
/// subspace projection for constrained degrees of freedom.
pub trait SymmetricOperator: Sync {
    /// out = A * v.
    fn apply(&self, v: &[Vec3], out: &mut Vec<Vec3>);

    /// Project `v` onto the feasible subspace. Default: no constraint.
    fn project(&self, _v: &mut [Vec3]) {}
}

/// The implicit MPM update operator:
/// A v |_i = m_i v_i - dt * df_i(dt * v) on nodes with mass, zero elsewhere.
///
/// Collided nodes are constrained to their contact tangent plane: the
/// projection removes the normal component, and `apply` projects its output
/// so the solve never reintroduces normal motion. It borrows grid and
/// particle state only for the duration of the solve.
pub struct ImplicitOperator<'a> {
    /// Grid carrying masses and collision flags.
    pub grid: &'a Grid,
    /// Particle state the stiffness is evaluated at.
    pub particles: &'a ParticleSet,
    /// Material providing the stress differential.
    pub model: &'a dyn ConstitutiveModel,
    /// Timestep of the implicit update.
    pub dt: f32,
}

impl SymmetricOperator for ImplicitOperator<'_> {
    fn apply(&self, v: &[Vec3], out: &mut Vec<Vec3>) {
        let dx: Vec<Vec3> = v.iter().map(|vi| *vi * self.dt).collect();
        let mut df = Vec::new();
        calculate_force_differentials(self.grid, self.particles, self.model, &dx, &mut df);

        out.clear();
        out.resize(v.len(), Vec3::ZERO);
        out.par_iter_mut().enumerate().for_each(|(idx, out_i)| {
            let m = self.grid.mass[idx];
            *out_i = if m > 0.0 {
                m * v[idx] - self.dt * df[idx]
            } else {
                Vec3::ZERO
            };
        });

        self.project(out);
    }

    fn project(&self, v: &mut [Vec3]) {
        v.par_iter_mut().enumerate().for_each(|(idx, vi)| {
            if self.grid.collided[idx] {
                let n = self.grid.collision_normal[idx];
                *vi -= n * n.dot(*vi);
            }
        });
    }
}

/// Pluggable stopping rule for the iteration.
pub trait Termination {
    /// Whether the iterate with squared residual norm `residual_norm2` at
    /// `iteration` is good enough.
    fn converged(&self, iteration: usize, residual_norm2: f32) -> bool;

    /// Hard iteration cap.
    fn max_iterations(&self) -> usize;
}

/// Stop when |r|^2 drops below tolerance^2 or the iteration cap is hit.
#[derive(Clone, Copy, Debug)]
pub struct SquareMagnitudeTermination {
    /// Iteration cap.
    pub max_iterations: usize,
    /// Tolerance on the residual norm.
    pub tolerance: f32,
}

impl Termination for SquareMagnitudeTermination {
    fn converged(&self, _iteration: usize, residual_norm2: f32) -> bool {
        residual_norm2 <= self.tolerance * self.tolerance
    }

    fn max_iterations(&self) -> usize {
        self.max_iterations
    }
}

/// Outcome of one solve.
#[derive(Clone, Debug, Default)]
pub struct ConvergenceReport {
    /// Iterations actually run.
    pub iterations: usize,
    /// Residual norm of the returned iterate.
    pub residual: f32,
    /// Whether the termination rule was satisfied.
    pub converged: bool,
    /// Residual per iteration, recorded when history is enabled.
    pub residuals: Vec<Vec<Vec3>>,
    /// Search direction per iteration, recorded when history is enabled.
    pub search_directions: Vec<Vec<Vec3>>,
}

/// Conjugate residuals iteration for symmetric, possibly indefinite systems.
///
/// Compared to conjugate gradients, CR minimizes |A x - b| over the Krylov
/// space, which keeps the residual norms non-increasing even when A has
/// negative eigenvalues. Residuals are A-orthogonal and the images A p of
/// the search directions mutually orthogonal.
pub struct ConjugateResiduals<T = SquareMagnitudeTermination> {
    termination: T,
    record_history: bool,
}

fn dot(a: &[Vec3], b: &[Vec3]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x.dot(*y)).sum()
}

fn norm2(a: &[Vec3]) -> f32 {
    dot(a, a)
}

impl<T: Termination> ConjugateResiduals<T> {
    /// Solver with the given stopping rule.
    pub fn new(termination: T) -> Self {
        Self {
            termination,
            record_history: false,
        }
    }

    /// Record residuals and search directions into the report. Test use.
    pub fn with_history(mut self) -> Self {
        self.record_history = true;
        self
    }

    /// Solve A x = b starting from the iterate in `x`.
    ///
    /// On stall or residual growth the best iterate seen so far is restored
    /// and reported with `converged = false`.
    pub fn solve<A: SymmetricOperator + ?Sized>(
        &self,
        a: &A,
        b: &[Vec3],
        x: &mut Vec<Vec3>,
    ) -> ConvergenceReport {
        let n = b.len();
        x.resize(n, Vec3::ZERO);

        let mut report = ConvergenceReport::default();

        let mut r = Vec::new();
        a.apply(x, &mut r);
        for (ri, bi) in r.iter_mut().zip(b) {
            *ri = *bi - *ri;
        }
        a.project(&mut r);

        let mut ar = Vec::new();
        a.apply(&r, &mut ar);

        let mut p = r.clone();
        let mut ap = ar.clone();
        let mut rho = dot(&r, &ar);

        let mut best_r2 = norm2(&r);
        let mut best_x = x.clone();

        loop {
            let r2 = norm2(&r);
            if self.termination.converged(report.iterations, r2) {
                report.converged = true;
                break;
            }
            if report.iterations >= self.termination.max_iterations() {
                break;
            }

            let ap2 = dot(&ap, &ap);
            if !(ap2 > 1e-30) {
                // Krylov space exhausted; nothing left to extract.
                break;
            }

            if self.record_history {
                report.residuals.push(r.clone());
                report.search_directions.push(p.clone());
            }

            let alpha = rho / ap2;
            for i in 0..n {
                x[i] += alpha * p[i];
                r[i] -= alpha * ap[i];
            }
            a.project(&mut r);
            report.iterations += 1;

            let r2_new = norm2(&r);
            if r2_new < best_r2 {
                best_r2 = r2_new;
                best_x.copy_from_slice(x);
            }

            a.apply(&r, &mut ar);
            let rho_new = dot(&r, &ar);
            let beta = rho_new / rho;
            for i in 0..n {
                p[i] = r[i] + beta * p[i];
                ap[i] = ar[i] + beta * ap[i];
            }
            rho = rho_new;
        }

        // Keep the best iterate if the last one regressed.
        let final_r2 = norm2(&r);
        if final_r2 > best_r2 {
            x.copy_from_slice(&best_x);
            report.residual = best_r2.sqrt();
        } else {
            report.residual = final_r2.sqrt();
        }

        if !report.converged {
            log::debug!(
                "conjugate residuals stopped after {} iterations at residual {:.3e}",
                report.iterations,
                report.residual
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A dense symmetric matrix over flattened Vec3 blocks.
    struct DenseOperator {
        size: usize,
        entries: Vec<f32>,
    }

    impl DenseOperator {
        fn symmetric(seed_values: &[f32], size: usize) -> Self {
            let mut entries = vec![0.0; size * size];
            for i in 0..size {
                for j in 0..=i {
                    let v = seed_values[(i * size + j) % seed_values.len()];
                    entries[i * size + j] = v;
                    entries[j * size + i] = v;
                }
            }
            Self { size, entries }
        }
    }

    impl SymmetricOperator for DenseOperator {
        fn apply(&self, v: &[Vec3], out: &mut Vec<Vec3>) {
            let flat: Vec<f32> = v.iter().flat_map(|v| [v.x, v.y, v.z]).collect();
            out.clear();
            out.resize(v.len(), Vec3::ZERO);
            for i in 0..self.size {
                let mut acc = 0.0;
                for j in 0..self.size {
                    acc += self.entries[i * self.size + j] * flat[j];
                }
                out[i / 3][i % 3] = acc;
            }
        }
    }

    #[test]
    fn test_identity_system_converges_immediately() {
        let a = DenseOperator {
            size: 6,
            entries: {
                let mut e = vec![0.0; 36];
                for i in 0..6 {
                    e[i * 6 + i] = 1.0;
                }
                e
            },
        };
        let b = vec![Vec3::new(1.0, -2.0, 3.0), Vec3::new(0.5, 0.0, -1.0)];
        let mut x = vec![Vec3::ZERO; 2];

        let solver = ConjugateResiduals::new(SquareMagnitudeTermination {
            max_iterations: 10,
            tolerance: 1e-6,
        });
        let report = solver.solve(&a, &b, &mut x);

        assert!(report.converged);
        assert!(report.iterations <= 1);
        assert!((x[0] - b[0]).length() < 1e-5);
        assert!((x[1] - b[1]).length() < 1e-5);
    }

    #[test]
    fn test_projection_keeps_constrained_component_zero() {
        struct Projected(DenseOperator);
        impl SymmetricOperator for Projected {
            fn apply(&self, v: &[Vec3], out: &mut Vec<Vec3>) {
                self.0.apply(v, out);
                self.project(out);
            }
            fn project(&self, v: &mut [Vec3]) {
                // Constrain the y component of the first block.
                v[0].y = 0.0;
            }
        }

        let a = Projected(DenseOperator::symmetric(
            &[2.0, 0.3, -0.4, 1.5, 0.2, 2.5, -0.3, 0.7, 1.8],
            6,
        ));
        let mut b = vec![Vec3::new(1.0, 5.0, -0.5), Vec3::new(0.2, 0.4, 0.8)];
        a.project(&mut b);
        let mut x = vec![Vec3::ZERO; 2];

        let solver = ConjugateResiduals::new(SquareMagnitudeTermination {
            max_iterations: 30,
            tolerance: 1e-5,
        });
        solver.solve(&a, &b, &mut x);

        assert!(x[0].y.abs() < 1e-6, "constrained DOF moved: {}", x[0].y);
    }
}
