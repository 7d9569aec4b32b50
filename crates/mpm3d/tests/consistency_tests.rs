//! Finite-difference consistency checks between the energy, the forces and
//! the force differentials.
//!
//! The forces must be the negative gradient of the stored energy with
//! respect to node displacements, and the force differentials must linearize
//! the forces. Both are probed by perturbing grid nodes, replaying the
//! deformation update on a copy of the particles and re-measuring.

use glam::{IVec3, Mat3, Vec3};
use mpm3d::forces::{calculate_energy, calculate_force_differentials, calculate_forces};
use mpm3d::grid::Grid;
use mpm3d::particle::ParticleSet;
use mpm3d::snow::{ConstitutiveModel, SnowModel};
use mpm3d::transfer::velocity_gradients;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const DT: f32 = 0.01;
const H: f32 = 0.1;

/// A few particles with non-trivial deformation, plasticity off so the
/// energy is smooth.
fn deformed_scene() -> (Grid, ParticleSet, SnowModel) {
    let model = SnowModel::new(1.4e5, 0.2, 10.0, 2.5e-2, 7.5e-3, false);
    let mut particles = ParticleSet::new();
    particles.spawn(Vec3::new(0.02, 0.03, -0.01), Vec3::ZERO, 0.5);
    particles.spawn(Vec3::new(0.14, 0.02, 0.05), Vec3::ZERO, 0.5);
    particles.spawn(Vec3::new(0.07, 0.12, 0.02), Vec3::ZERO, 0.5);
    model.init_particles(&mut particles);

    particles.set_deformation_gradient(
        0,
        Mat3::from_cols(
            Vec3::new(1.03, 0.01, -0.02),
            Vec3::new(0.02, 0.96, 0.01),
            Vec3::new(-0.01, 0.02, 1.04),
        ),
    );
    particles.set_deformation_gradient(
        1,
        Mat3::from_cols(
            Vec3::new(0.98, -0.03, 0.0),
            Vec3::new(0.01, 1.02, 0.02),
            Vec3::new(0.02, 0.0, 0.97),
        ),
    );
    for p in 0..particles.len() {
        particles.volume[p] = 1e-3;
    }

    let mut grid = Grid::from_particles(&particles, H).unwrap();
    particles.build_scatter_partition(grid.origin, grid.h);
    grid.splat_mass_and_momentum(&particles);
    (grid, particles, model)
}

/// Energy after displacing one grid node by `delta` along `axis`, obtained
/// by replaying the deformation update with the matching velocity field.
fn energy_after_node_displacement(
    grid: &Grid,
    particles: &ParticleSet,
    model: &SnowModel,
    node: usize,
    axis: usize,
    delta: f32,
) -> f32 {
    let mut moved = grid.velocity.clone();
    moved.iter_mut().for_each(|v| *v = Vec3::ZERO);
    moved[node][axis] = delta / DT;

    let mut shifted = Grid::from_particles(particles, H).unwrap();
    shifted.velocity = moved;

    let mut trial = particles.clone();
    let gradients = velocity_gradients(&shifted, &trial);
    model.update_deformation(&mut trial, DT, &gradients);
    calculate_energy(&trial, model)
}

#[test]
fn test_forces_match_energy_gradient() {
    let (grid, particles, model) = deformed_scene();

    let mut forces = Vec::new();
    calculate_forces(&grid, &particles, &model, Vec3::ZERO, &mut forces);

    // Probe nodes inside the first particle's stencil.
    let weights = grid.weights(particles.position[0]);
    let probes = [
        grid.node_index(weights.node(IVec3::new(0, 0, 0))),
        grid.node_index(weights.node(IVec3::new(1, 1, 0))),
        grid.node_index(weights.node(IVec3::new(0, 1, 1))),
    ];

    let delta = 1e-2 * H;
    for &node in &probes {
        for axis in 0..3 {
            let e_plus =
                energy_after_node_displacement(&grid, &particles, &model, node, axis, delta);
            let e_minus =
                energy_after_node_displacement(&grid, &particles, &model, node, axis, -delta);

            // force = -dE/dx, central difference.
            let fd = (e_minus - e_plus) / (2.0 * delta);
            let analytic = forces[node][axis];

            if analytic.abs() < 1e-3 {
                continue;
            }
            let rel = (fd - analytic).abs() / analytic.abs();
            assert!(
                rel < 1e-2,
                "node {} axis {}: finite difference {} vs force {} (rel {})",
                node,
                axis,
                fd,
                analytic,
                rel
            );
        }
    }
}

#[test]
fn test_force_differentials_linearize_the_forces() {
    let (grid, particles, model) = deformed_scene();
    let n = grid.node_count();

    let mut rng = ChaCha8Rng::seed_from_u64(41);
    let dx: Vec<Vec3> = (0..n)
        .map(|_| {
            Vec3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            ) * 1e-4
        })
        .collect();

    let mut df = Vec::new();
    calculate_force_differentials(&grid, &particles, &model, &dx, &mut df);

    // Replay: move the nodes by dx through the deformation update and
    // re-measure the forces at the unchanged particle positions.
    let mut moved_grid = Grid::from_particles(&particles, H).unwrap();
    moved_grid.velocity = dx.iter().map(|d| *d / DT).collect();
    let mut moved = particles.clone();
    let gradients = velocity_gradients(&moved_grid, &moved);
    model.update_deformation(&mut moved, DT, &gradients);

    let mut f0 = Vec::new();
    let mut f1 = Vec::new();
    calculate_forces(&grid, &particles, &model, Vec3::ZERO, &mut f0);
    calculate_forces(&grid, &moved, &model, Vec3::ZERO, &mut f1);

    let mut num = 0.0f32;
    let mut den = 0.0f32;
    for i in 0..n {
        let actual = f1[i] - f0[i];
        num += (df[i] - actual).length_squared();
        den += actual.length_squared();
    }
    let rel = (num / den.max(1e-20)).sqrt();
    assert!(
        rel < 1e-2,
        "force differential mismatch: relative error {}",
        rel
    );
}

#[test]
fn test_energy_decreases_along_force_direction() {
    // Moving the nodes a little along the forces must lower the energy.
    let (grid, particles, model) = deformed_scene();

    let mut forces = Vec::new();
    calculate_forces(&grid, &particles, &model, Vec3::ZERO, &mut forces);
    let scale = 1e-6
        / forces
            .iter()
            .map(|f| f.length())
            .fold(0.0f32, f32::max)
            .max(1e-12);

    let mut moved_grid = Grid::from_particles(&particles, H).unwrap();
    moved_grid.velocity = forces.iter().map(|f| *f * (scale / DT)).collect();
    let mut moved = particles.clone();
    let gradients = velocity_gradients(&moved_grid, &moved);
    model.update_deformation(&mut moved, DT, &gradients);

    let e0 = calculate_energy(&particles, &model);
    let e1 = calculate_energy(&moved, &model);
    assert!(
        e1 < e0,
        "energy should drop along the force direction: {} -> {}",
        e0,
        e1
    );
}
