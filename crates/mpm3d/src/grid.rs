//! Background grid: rebuilt around the particles every step, it receives
//! scattered mass and momentum, carries the velocity solve, and is discarded.
//!
//! The particle-to-grid scatter is the only write-race hazard of the
//! pipeline. It runs one partition color at a time; blocks of one color own
//! disjoint node stencils, so they splat in parallel through a shared
//! pointer without ever touching the same node.

use std::sync::atomic::{AtomicPtr, Ordering};

use glam::{IVec3, Vec3};
use rayon::prelude::*;

use crate::collision::{apply_collision, CollisionSurface};
use crate::error::{SimError, SimResult};
use crate::kernels::NodeWeights;
use crate::particle::{ParticleSet, SCATTER_COLORS};

/// Node-centered background grid.
///
/// Nodes are indexed `ix + nx * (iy + ny * iz)`. The origin is placed so the
/// particle bounding box, padded by 1.5 cells, sits strictly inside the grid;
/// the extra margin keeps every particle's 4x4x4 stencil in bounds.
pub struct Grid {
    /// World position of node (0, 0, 0).
    pub origin: Vec3,
    /// Cell size.
    pub h: f32,
    /// Node counts per axis.
    pub size: [usize; 3],

    /// Node masses.
    pub mass: Vec<f32>,
    /// Node velocities (momentum during scatter, velocity afterwards).
    pub velocity: Vec<Vec3>,
    /// Node velocities before the force and solve phases, for the FLIP delta.
    pub prev_velocity: Vec<Vec3>,
    /// Whether the explicit predictor collided this node.
    pub collided: Vec<bool>,
    /// Unit contact normal for collided nodes.
    pub collision_normal: Vec<Vec3>,
}

impl Grid {
    /// Size a fresh grid around the live particles.
    ///
    /// Fails without touching any state when a particle position is
    /// non-finite or when no live particle remains.
    pub fn from_particles(particles: &ParticleSet, h: f32) -> SimResult<Self> {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        let mut any = false;

        for p in 0..particles.len() {
            if !particles.is_active(p) {
                continue;
            }
            let x = particles.position[p];
            if !x.is_finite() {
                return Err(SimError::GridOutOfBounds { particle: p });
            }
            min = min.min(x);
            max = max.max(x);
            any = true;
        }
        if !any {
            return Err(SimError::EmptyParticleSet);
        }

        // Pad by 1.5 cells on each side, then one extra node so the last
        // stencil row stays inside.
        let origin = min - Vec3::splat(1.5 * h);
        let span = max + Vec3::splat(1.5 * h) - origin;
        let size = [
            (span.x / h).ceil() as usize + 1,
            (span.y / h).ceil() as usize + 1,
            (span.z / h).ceil() as usize + 1,
        ];

        let node_count = size[0] * size[1] * size[2];
        Ok(Self {
            origin,
            h,
            size,
            mass: vec![0.0; node_count],
            velocity: vec![Vec3::ZERO; node_count],
            prev_velocity: vec![Vec3::ZERO; node_count],
            collided: vec![false; node_count],
            collision_normal: vec![Vec3::ZERO; node_count],
        })
    }

    /// Total number of nodes.
    pub fn node_count(&self) -> usize {
        self.mass.len()
    }

    /// Linear index of a node.
    #[inline]
    pub fn node_index(&self, node: IVec3) -> usize {
        debug_assert!(
            node.x >= 0
                && (node.x as usize) < self.size[0]
                && node.y >= 0
                && (node.y as usize) < self.size[1]
                && node.z >= 0
                && (node.z as usize) < self.size[2],
            "node {node} outside grid {:?}",
            self.size
        );
        node.x as usize + self.size[0] * (node.y as usize + self.size[1] * node.z as usize)
    }

    /// World position of the node with the given linear index.
    #[inline]
    pub fn node_position(&self, idx: usize) -> Vec3 {
        let nx = self.size[0];
        let ny = self.size[1];
        let i = idx % nx;
        let j = (idx / nx) % ny;
        let k = idx / (nx * ny);
        self.origin + self.h * Vec3::new(i as f32, j as f32, k as f32)
    }

    /// Whether the full stencil of a particle in `cell` is inside the grid.
    #[inline]
    pub fn contains_stencil(&self, cell: IVec3) -> bool {
        cell.x >= 1
            && cell.y >= 1
            && cell.z >= 1
            && (cell.x as usize) + 2 < self.size[0]
            && (cell.y as usize) + 2 < self.size[1]
            && (cell.z as usize) + 2 < self.size[2]
    }

    /// Interpolation stencil for a particle position on this grid.
    #[inline]
    pub fn weights(&self, pos: Vec3) -> NodeWeights {
        NodeWeights::new(pos, self.origin, self.h)
    }

    /// Scatter particle mass and momentum onto the nodes, then normalize to
    /// velocities and snapshot them for the FLIP delta. Nodes that receive
    /// no mass stay at zero velocity and are inert for the step.
    pub fn splat_mass_and_momentum(&mut self, particles: &ParticleSet) {
        self.mass.fill(0.0);
        self.velocity.fill(Vec3::ZERO);

        let grid = &AtomicPtr::new(self as *mut Grid);
        for color in 0..SCATTER_COLORS {
            particles.scatter_blocks().par_iter().for_each(|block| {
                if block.color() != color {
                    return;
                }
                let grid: &mut Grid = unsafe { &mut *grid.load(Ordering::Relaxed) };

                for &p in &particles.scatter_order()[block.particles.clone()] {
                    let weights = grid.weights(particles.position[p]);
                    debug_assert!(grid.contains_stencil(weights.cell));

                    let momentum = particles.mass[p] * particles.velocity[p];
                    NodeWeights::for_each_offset(|offset| {
                        let idx = grid.node_index(weights.node(offset));
                        let w = weights.weight(offset);
                        grid.mass[idx] += particles.mass[p] * w;
                        grid.velocity[idx] += momentum * w;
                    });
                }
            });
        }

        self.velocity
            .par_iter_mut()
            .zip(self.mass.par_iter())
            .for_each(|(v, &m)| {
                if m > 0.0 {
                    *v /= m;
                } else {
                    *v = Vec3::ZERO;
                }
            });
        self.prev_velocity.copy_from_slice(&self.velocity);

        debug_assert!(
            {
                let grid_mass: f64 = self.mass.iter().map(|&m| m as f64).sum();
                let particle_mass: f64 = (0..particles.len())
                    .filter(|&p| particles.is_active(p))
                    .map(|p| particles.mass[p] as f64)
                    .sum();
                (grid_mass - particle_mass).abs() <= 1e-5 * particle_mass.max(1e-12)
            },
            "mass not conserved across the particle-to-grid scatter"
        );
    }

    /// Gather node mass back onto the particles as a density estimate.
    /// Only used once, to seed rest volumes.
    pub fn compute_densities(&self, particles: &mut ParticleSet) {
        let cell_volume = self.h * self.h * self.h;
        let ParticleSet {
            position, density, ..
        } = particles;

        position
            .par_iter()
            .zip(density.par_iter_mut())
            .for_each(|(&pos, rho)| {
                let weights = self.weights(pos);
                let mut acc = 0.0;
                NodeWeights::for_each_offset(|offset| {
                    let idx = self.node_index(weights.node(offset));
                    acc += weights.weight(offset) * self.mass[idx];
                });
                *rho = acc / cell_volume;
            });
    }

    /// Explicit predictor: integrate forces, resolve collisions against the
    /// surfaces, and emit the implicit right-hand side as node momentum.
    ///
    /// Marks collided nodes and stores their contact normals so the implicit
    /// operator can keep the solution in the contact tangent plane.
    pub fn explicit_velocity_update(
        &mut self,
        forces: &[Vec3],
        dt: f32,
        surfaces: &[Box<dyn CollisionSurface>],
        friction: f32,
        rhs: &mut Vec<Vec3>,
    ) {
        rhs.clear();
        rhs.resize(self.node_count(), Vec3::ZERO);

        let origin = self.origin;
        let h = self.h;
        let nx = self.size[0];
        let ny = self.size[1];

        let mass = &self.mass;
        let velocity = &self.velocity;
        let collided = &mut self.collided;
        let collision_normal = &mut self.collision_normal;

        rhs.par_iter_mut()
            .zip(collided.par_iter_mut())
            .zip(collision_normal.par_iter_mut())
            .enumerate()
            .for_each(|(idx, ((rhs_i, collided_i), normal_i))| {
                *collided_i = false;
                *normal_i = Vec3::ZERO;

                let m = mass[idx];
                if m <= 0.0 {
                    *rhs_i = Vec3::ZERO;
                    return;
                }

                let mut v_star = velocity[idx] + dt * forces[idx] / m;

                let i = idx % nx;
                let j = (idx / nx) % ny;
                let k = idx / (nx * ny);
                let x = origin + h * Vec3::new(i as f32, j as f32, k as f32);

                if let Some(normal) = apply_collision(&mut v_star, x, surfaces, friction) {
                    *collided_i = true;
                    *normal_i = normal;
                }

                *rhs_i = m * v_star;
            });
    }
}
