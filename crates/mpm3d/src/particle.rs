//! Particle storage and the spatial partition used for race-free scatter.
//!
//! Attributes live in parallel arrays indexed by particle id. For the
//! particle-to-grid scatter phases, active particles are bucketed by the
//! 4x4x4-cell block containing them; blocks are 2-colored per axis (eight
//! colors total). Two blocks of the same color are at least eight cells apart
//! on every axis where they differ, so their 4-wide B-spline stencils can
//! never touch the same grid node and one color can be scattered in parallel.

use std::ops::Range;

use glam::{IVec3, Mat3, Vec3};

/// Cells per partition block edge. Must be at least the stencil diameter
/// so that same-colored blocks write disjoint node sets.
pub(crate) const BLOCK_EDGE: i32 = 4;

/// Number of color classes (2 per axis).
pub(crate) const SCATTER_COLORS: usize = 8;

/// One bucket of the scatter partition: a block of cells and the range of
/// `scatter_order` holding the particles inside it.
#[derive(Clone, Debug)]
pub(crate) struct ScatterBlock {
    pub block: IVec3,
    pub particles: Range<usize>,
}

impl ScatterBlock {
    /// Color class from per-axis block parity.
    #[inline]
    pub fn color(&self) -> usize {
        ((self.block.x & 1) | ((self.block.y & 1) << 1) | ((self.block.z & 1) << 2)) as usize
    }
}

/// Per-particle state of the simulation, stored as parallel arrays.
///
/// `deformation` holds the elastic deformation gradient; the plastic part is
/// tracked separately so the total gradient is their product. The polar
/// factors, inverse transpose and determinant are caches refreshed by the
/// deformation update.
#[derive(Clone, Default)]
pub struct ParticleSet {
    /// World position.
    pub position: Vec<Vec3>,
    /// Velocity.
    pub velocity: Vec<Vec3>,
    /// Mass (constant).
    pub mass: Vec<f32>,
    /// Rest volume, seeded from the gathered density at startup.
    pub volume: Vec<f32>,
    /// Gathered density; only used to seed `volume`.
    pub density: Vec<f32>,
    /// Elastic deformation gradient F.
    pub deformation: Vec<Mat3>,
    /// Plastic deformation gradient Fp.
    pub plastic_deformation: Vec<Mat3>,
    /// Rotation factor R of the polar decomposition of F.
    pub rotation: Vec<Mat3>,
    /// Symmetric stretch factor S of the polar decomposition of F.
    pub stretch: Vec<Mat3>,
    /// Cached F^-T.
    pub f_inv_transpose: Vec<Mat3>,
    /// Cached det F.
    pub jacobian: Vec<f32>,
    /// Per-particle Lamé mu (hardened).
    pub mu: Vec<f32>,
    /// Per-particle Lamé lambda (hardened).
    pub lambda: Vec<f32>,

    pub(crate) degenerate_steps: Vec<u8>,
    pub(crate) dead: Vec<bool>,

    scatter_order: Vec<usize>,
    blocks: Vec<ScatterBlock>,
}

impl ParticleSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a particle. Deformation state starts at identity; volume and
    /// the Lamé parameters are filled in by the constitutive model and the
    /// density seeding pass.
    pub fn spawn(&mut self, position: Vec3, velocity: Vec3, mass: f32) {
        self.position.push(position);
        self.velocity.push(velocity);
        self.mass.push(mass);
        self.volume.push(0.0);
        self.density.push(0.0);
        self.deformation.push(Mat3::IDENTITY);
        self.plastic_deformation.push(Mat3::IDENTITY);
        self.rotation.push(Mat3::IDENTITY);
        self.stretch.push(Mat3::IDENTITY);
        self.f_inv_transpose.push(Mat3::IDENTITY);
        self.jacobian.push(1.0);
        self.mu.push(0.0);
        self.lambda.push(0.0);
        self.degenerate_steps.push(0);
        self.dead.push(false);
    }

    /// Number of particles, dead ones included.
    pub fn len(&self) -> usize {
        self.position.len()
    }

    /// Whether the set holds no particles at all.
    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }

    /// Whether particle `p` still participates in the simulation.
    #[inline]
    pub fn is_active(&self, p: usize) -> bool {
        !self.dead[p]
    }

    /// Number of live particles.
    pub fn active_count(&self) -> usize {
        self.dead.iter().filter(|d| !**d).count()
    }

    /// Total mass of live particles.
    pub fn total_mass(&self) -> f32 {
        (0..self.len())
            .filter(|&p| self.is_active(p))
            .map(|p| self.mass[p])
            .sum()
    }

    /// Overwrite particle `p`'s elastic deformation gradient and refresh the
    /// cached polar factors, inverse transpose and determinant.
    pub fn set_deformation_gradient(&mut self, p: usize, f: Mat3) {
        let polar = crate::math::polar_decomposition(&f);
        self.deformation[p] = f;
        self.rotation[p] = polar.rotation;
        self.stretch[p] = polar.stretch;
        self.f_inv_transpose[p] = f.inverse().transpose();
        self.jacobian[p] = f.determinant();
    }

    /// Record a degenerate step for particle `p`. Returns true when the
    /// particle just crossed `limit` consecutive bad steps and was retired.
    pub(crate) fn mark_degenerate(&mut self, p: usize, limit: u8) -> bool {
        self.degenerate_steps[p] = self.degenerate_steps[p].saturating_add(1);
        if self.degenerate_steps[p] >= limit && !self.dead[p] {
            self.dead[p] = true;
            return true;
        }
        false
    }

    /// Clear the degeneracy streak after a successful update.
    #[inline]
    pub(crate) fn mark_healthy(&mut self, p: usize) {
        self.degenerate_steps[p] = 0;
    }

    /// Rebuild the scatter partition for a grid with the given origin and
    /// cell size. Must run after every grid rebuild, before any scatter.
    /// Bucketing is deterministic: blocks are ordered by (z, y, x) and
    /// particles inside a block by index.
    pub fn build_scatter_partition(&mut self, origin: Vec3, h: f32) {
        let mut keyed: Vec<(IVec3, usize)> = (0..self.len())
            .filter(|&p| self.is_active(p))
            .map(|p| {
                let cell = ((self.position[p] - origin) / h).floor().as_ivec3();
                let block = IVec3::new(
                    cell.x.div_euclid(BLOCK_EDGE),
                    cell.y.div_euclid(BLOCK_EDGE),
                    cell.z.div_euclid(BLOCK_EDGE),
                );
                (block, p)
            })
            .collect();
        keyed.sort_unstable_by_key(|(b, p)| (b.z, b.y, b.x, *p));

        self.scatter_order.clear();
        self.blocks.clear();

        let mut start = 0;
        for (i, (block, p)) in keyed.iter().enumerate() {
            self.scatter_order.push(*p);
            let is_last = i + 1 == keyed.len();
            if is_last || keyed[i + 1].0 != *block {
                self.blocks.push(ScatterBlock {
                    block: *block,
                    particles: start..i + 1,
                });
                start = i + 1;
            }
        }
    }

    /// Blocks of the current scatter partition.
    pub(crate) fn scatter_blocks(&self) -> &[ScatterBlock] {
        &self.blocks
    }

    /// Particle ids ordered by scatter block.
    pub(crate) fn scatter_order(&self) -> &[usize] {
        &self.scatter_order
    }
}
