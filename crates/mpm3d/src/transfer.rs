//! Grid-to-particle transfer: FLIP velocity update, particle-side collision
//! resolution, advection, and the velocity-gradient gather that feeds the
//! deformation update.
//!
//! All loops here write only per-particle state and parallelize freely.

use glam::{Mat3, Vec3};
use rayon::prelude::*;

use crate::collision::{apply_collision, CollisionSurface};
use crate::grid::Grid;
use crate::kernels::NodeWeights;
use crate::math::outer;
use crate::particle::ParticleSet;

/// Gather the grid velocity gradient at every particle:
/// grad v_p = sum_i v_i * grad w_i^T.
pub fn velocity_gradients(grid: &Grid, particles: &ParticleSet) -> Vec<Mat3> {
    (0..particles.len())
        .into_par_iter()
        .map(|p| {
            if !particles.is_active(p) {
                return Mat3::ZERO;
            }
            let weights = grid.weights(particles.position[p]);
            let mut grad = Mat3::ZERO;
            NodeWeights::for_each_offset(|offset| {
                let idx = grid.node_index(weights.node(offset));
                grad += outer(grid.velocity[idx], weights.weight_gradient(offset));
            });
            grad
        })
        .collect()
}

/// FLIP velocity update: each particle accumulates the change of the grid
/// velocity field over the step, then resolves collisions at its position.
pub fn update_particle_velocities(
    grid: &Grid,
    particles: &mut ParticleSet,
    surfaces: &[Box<dyn CollisionSurface>],
    friction: f32,
) {
    let ParticleSet {
        position,
        velocity,
        dead,
        ..
    } = particles;

    position
        .par_iter()
        .zip(velocity.par_iter_mut())
        .zip(dead.par_iter())
        .for_each(|((pos, v), &is_dead)| {
            if is_dead {
                return;
            }
            let weights = grid.weights(*pos);
            let mut delta = Vec3::ZERO;
            NodeWeights::for_each_offset(|offset| {
                let idx = grid.node_index(weights.node(offset));
                delta += weights.weight(offset) * (grid.velocity[idx] - grid.prev_velocity[idx]);
            });
            *v += delta;

            apply_collision(v, *pos, surfaces, friction);
        });
}

/// Move particles along their post-collision velocities.
pub fn advect_particles(particles: &mut ParticleSet, dt: f32) {
    let ParticleSet {
        position,
        velocity,
        dead,
        ..
    } = particles;

    position
        .par_iter_mut()
        .zip(velocity.par_iter())
        .zip(dead.par_iter())
        .for_each(|((pos, v), &is_dead)| {
            if is_dead {
                return;
            }
            *pos += *v * dt;
        });
}
