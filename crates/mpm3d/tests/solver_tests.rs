//! Conjugate residuals property tests on dense symmetric indefinite systems.
//!
//! The solver must converge within n iterations, keep residual norms
//! monotone, produce A-orthogonal residuals, and keep the images of the
//! search directions mutually orthogonal.

use glam::Vec3;
use mpm3d::{ConjugateResiduals, SquareMagnitudeTermination, SymmetricOperator};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Dense symmetric matrix acting on flattened Vec3 blocks.
struct DenseMatrix {
    size: usize,
    entries: Vec<f32>,
}

impl DenseMatrix {
    /// Random symmetric matrix with eigenvalues of both signs:
    /// A = Q D Q^T with alternating-sign diagonal D and Q a product of
    /// random Givens rotations.
    fn random_indefinite(size: usize, rng: &mut ChaCha8Rng) -> Self {
        let mut a = vec![0.0f32; size * size];
        for i in 0..size {
            let magnitude = rng.gen_range(0.5..3.0);
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            a[i * size + i] = sign * magnitude;
        }

        // Conjugate by random plane rotations; symmetry and the spectrum
        // are preserved exactly.
        for _ in 0..4 * size {
            let p = rng.gen_range(0..size);
            let mut q = rng.gen_range(0..size);
            if p == q {
                q = (q + 1) % size;
            }
            let angle: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
            let (s, c) = angle.sin_cos();

            // A <- G A G^T for the rotation G in the (p, q) plane.
            for k in 0..size {
                let akp = a[k * size + p];
                let akq = a[k * size + q];
                a[k * size + p] = c * akp - s * akq;
                a[k * size + q] = s * akp + c * akq;
            }
            for k in 0..size {
                let apk = a[p * size + k];
                let aqk = a[q * size + k];
                a[p * size + k] = c * apk - s * aqk;
                a[q * size + k] = s * apk + c * aqk;
            }
        }

        Self { size, entries: a }
    }

    fn mul_flat(&self, v: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; self.size];
        for i in 0..self.size {
            for j in 0..self.size {
                out[i] += self.entries[i * self.size + j] * v[j];
            }
        }
        out
    }

    fn mul_blocks(&self, v: &[Vec3]) -> Vec<Vec3> {
        let flat: Vec<f32> = v.iter().flat_map(|v| [v.x, v.y, v.z]).collect();
        unflatten(&self.mul_flat(&flat))
    }
}

impl SymmetricOperator for DenseMatrix {
    fn apply(&self, v: &[Vec3], out: &mut Vec<Vec3>) {
        *out = self.mul_blocks(v);
    }
}

fn unflatten(flat: &[f32]) -> Vec<Vec3> {
    flat.chunks(3)
        .map(|c| Vec3::new(c[0], c[1], c[2]))
        .collect()
}

fn random_rhs(size: usize, rng: &mut ChaCha8Rng) -> Vec<Vec3> {
    let flat: Vec<f32> = (0..size).map(|_| rng.gen_range(-1.0..1.0)).collect();
    unflatten(&flat)
}

fn norm(v: &[Vec3]) -> f32 {
    v.iter().map(|x| x.length_squared()).sum::<f32>().sqrt()
}

fn dot(a: &[Vec3], b: &[Vec3]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x.dot(*y)).sum()
}

#[test]
fn test_solves_symmetric_indefinite_system_in_n_iterations() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let size = 6;
    let a = DenseMatrix::random_indefinite(size, &mut rng);
    let b = random_rhs(size, &mut rng);
    let mut x = vec![Vec3::ZERO; size / 3];

    // Zero tolerance: run the full n iterations, like the exactness bound.
    let solver = ConjugateResiduals::new(SquareMagnitudeTermination {
        max_iterations: size,
        tolerance: 0.0,
    });
    let report = solver.solve(&a, &b, &mut x);
    assert!(report.iterations <= size);

    let residual: Vec<Vec3> = a
        .mul_blocks(&x)
        .iter()
        .zip(&b)
        .map(|(ax, b)| *ax - *b)
        .collect();
    assert!(
        norm(&residual) < 1e-3 * norm(&b).max(1.0),
        "residual after {} iterations: {}",
        size,
        norm(&residual)
    );
}

#[test]
fn test_residual_norms_decrease_monotonically() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let size = 6;
    let a = DenseMatrix::random_indefinite(size, &mut rng);
    let b = random_rhs(size, &mut rng);
    let mut x = vec![Vec3::ZERO; size / 3];

    let solver = ConjugateResiduals::new(SquareMagnitudeTermination {
        max_iterations: size,
        tolerance: 0.0,
    })
    .with_history();
    let report = solver.solve(&a, &b, &mut x);

    for i in 1..report.residuals.len() {
        let prev = norm(&report.residuals[i - 1]);
        let curr = norm(&report.residuals[i]);
        assert!(
            curr < prev,
            "residual grew at iteration {}: {} -> {}",
            i,
            prev,
            curr
        );
    }
}

#[test]
fn test_residuals_are_a_orthogonal() {
    let mut rng = ChaCha8Rng::seed_from_u64(13);
    let size = 6;
    let a = DenseMatrix::random_indefinite(size, &mut rng);
    let b = random_rhs(size, &mut rng);
    let mut x = vec![Vec3::ZERO; size / 3];

    let solver = ConjugateResiduals::new(SquareMagnitudeTermination {
        max_iterations: size,
        tolerance: 0.0,
    })
    .with_history();
    let report = solver.solve(&a, &b, &mut x);

    for i in 0..report.residuals.len() {
        for j in 0..report.residuals.len() {
            if i == j {
                continue;
            }
            let f = dot(&report.residuals[i], &a.mul_blocks(&report.residuals[j])).abs();
            assert!(f < 1e-4, "r_{} . A r_{} = {}", i, j, f);
        }
    }
}

#[test]
fn test_search_direction_images_are_orthogonal() {
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let size = 6;
    let a = DenseMatrix::random_indefinite(size, &mut rng);
    let b = random_rhs(size, &mut rng);
    let mut x = vec![Vec3::ZERO; size / 3];

    let solver = ConjugateResiduals::new(SquareMagnitudeTermination {
        max_iterations: size,
        tolerance: 0.0,
    })
    .with_history();
    let report = solver.solve(&a, &b, &mut x);

    for i in 0..report.search_directions.len() {
        for j in 0..report.search_directions.len() {
            if i == j {
                continue;
            }
            let api = a.mul_blocks(&report.search_directions[i]);
            let apj = a.mul_blocks(&report.search_directions[j]);
            let f = dot(&api, &apj).abs();
            assert!(f < 1e-4, "(A p_{}) . (A p_{}) = {}", i, j, f);
        }
    }
}

#[test]
fn test_larger_system_converges_to_relative_tolerance() {
    let mut rng = ChaCha8Rng::seed_from_u64(23);
    let size = 12;
    let a = DenseMatrix::random_indefinite(size, &mut rng);
    let b = random_rhs(size, &mut rng);
    let mut x = vec![Vec3::ZERO; size / 3];

    let solver = ConjugateResiduals::new(SquareMagnitudeTermination {
        max_iterations: size,
        tolerance: 1e-4 * norm(&b),
    });
    let report = solver.solve(&a, &b, &mut x);

    assert!(
        report.iterations <= size,
        "took {} iterations",
        report.iterations
    );
    let residual: Vec<Vec3> = a
        .mul_blocks(&x)
        .iter()
        .zip(&b)
        .map(|(ax, b)| *ax - *b)
        .collect();
    assert!(norm(&residual) < 1e-3 * norm(&b));
}

#[test]
fn test_warm_start_preserves_exact_solution() {
    let mut rng = ChaCha8Rng::seed_from_u64(29);
    let size = 6;
    let a = DenseMatrix::random_indefinite(size, &mut rng);

    // Build b so the solution is known, then start from it.
    let x_true = random_rhs(size, &mut rng);
    let b = a.mul_blocks(&x_true);
    let mut x = x_true.clone();

    let solver = ConjugateResiduals::new(SquareMagnitudeTermination {
        max_iterations: size,
        tolerance: 1e-6,
    });
    let report = solver.solve(&a, &b, &mut x);

    assert!(report.converged);
    assert_eq!(report.iterations, 0);
    for (xi, ti) in x.iter().zip(&x_true) {
        assert!((*xi - *ti).length() < 1e-5);
    }
}
