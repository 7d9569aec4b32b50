//! Grid force assembly: gravity, internal elastic forces, the total elastic
//! energy, and the force differentials that back the implicit solve.
//!
//! Internal forces and their differentials scatter per particle with the
//! same color-sequential partition as the mass splat.

use std::sync::atomic::{AtomicPtr, Ordering};

use glam::{Mat3, Vec3};
use rayon::prelude::*;

use crate::grid::Grid;
use crate::kernels::NodeWeights;
use crate::math::outer;
use crate::particle::{ParticleSet, SCATTER_COLORS};
use crate::snow::ConstitutiveModel;

/// Assemble per-node forces: f_i = m_i * g - sum_p V_p * dpsi/dF * F^T * grad w.
pub fn calculate_forces(
    grid: &Grid,
    particles: &ParticleSet,
    model: &dyn ConstitutiveModel,
    gravity: Vec3,
    forces: &mut Vec<Vec3>,
) {
    forces.clear();
    forces.resize(grid.node_count(), Vec3::ZERO);

    forces
        .par_iter_mut()
        .zip(grid.mass.par_iter())
        .for_each(|(f, &m)| *f = m * gravity);

    let node_count = forces.len();
    let target = &AtomicPtr::new(forces.as_mut_ptr());

    for color in 0..SCATTER_COLORS {
        particles.scatter_blocks().par_iter().for_each(|block| {
            if block.color() != color {
                return;
            }
            let forces: &mut [Vec3] =
                unsafe { std::slice::from_raw_parts_mut(target.load(Ordering::Relaxed), node_count) };

            for &p in &particles.scatter_order()[block.particles.clone()] {
                let stress = model.dpsi_df(particles, p);
                let force_matrix =
                    stress * particles.deformation[p].transpose() * particles.volume[p];

                let weights = grid.weights(particles.position[p]);
                NodeWeights::for_each_offset(|offset| {
                    let idx = grid.node_index(weights.node(offset));
                    forces[idx] -= force_matrix * weights.weight_gradient(offset);
                });
            }
        });
    }
}

/// Change in node forces when the nodes are displaced by `dx`.
///
/// Per particle: dF = (sum_i dx_i grad w_i^T) F, then the stress differential
/// from the model, scattered back exactly like the forces. The resulting
/// linear map dx -> df is the (negated) energy Hessian and therefore
/// symmetric.
pub fn calculate_force_differentials(
    grid: &Grid,
    particles: &ParticleSet,
    model: &dyn ConstitutiveModel,
    dx: &[Vec3],
    df: &mut Vec<Vec3>,
) {
    df.clear();
    df.resize(grid.node_count(), Vec3::ZERO);

    let node_count = df.len();
    let target = &AtomicPtr::new(df.as_mut_ptr());

    for color in 0..SCATTER_COLORS {
        particles.scatter_blocks().par_iter().for_each(|block| {
            if block.color() != color {
                return;
            }
            let df: &mut [Vec3] =
                unsafe { std::slice::from_raw_parts_mut(target.load(Ordering::Relaxed), node_count) };

            for &p in &particles.scatter_order()[block.particles.clone()] {
                let weights = grid.weights(particles.position[p]);

                let mut d_deform = Mat3::ZERO;
                NodeWeights::for_each_offset(|offset| {
                    let idx = grid.node_index(weights.node(offset));
                    d_deform += outer(dx[idx], weights.weight_gradient(offset));
                });
                d_deform = d_deform * particles.deformation[p];

                let d_stress = model.dpsi_df_differential(particles, p, &d_deform);
                let force_matrix =
                    d_stress * particles.deformation[p].transpose() * particles.volume[p];

                NodeWeights::for_each_offset(|offset| {
                    let idx = grid.node_index(weights.node(offset));
                    df[idx] -= force_matrix * weights.weight_gradient(offset);
                });
            }
        });
    }
}

/// Total elastic energy stored in the particles. Validation only.
pub fn calculate_energy(particles: &ParticleSet, model: &dyn ConstitutiveModel) -> f32 {
    (0..particles.len())
        .filter(|&p| particles.is_active(p))
        .map(|p| particles.volume[p] * model.energy_density(particles, p))
        .sum()
}
