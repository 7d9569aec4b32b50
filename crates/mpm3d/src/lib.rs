//! Implicit MPM snow simulation on the CPU.
//!
//! Particles carry the persistent material state (mass, volume, velocity and
//! the elastic/plastic deformation gradients); a background grid is rebuilt
//! around them every step to solve the momentum equations. One step runs:
//!
//! 1. **P2G**: scatter particle mass and momentum onto the grid
//! 2. **Forces**: gravity plus corotated elastic forces on the nodes
//! 3. **Predictor**: explicit velocity update with collision response
//! 4. **Implicit solve**: conjugate residuals on (M - dt^2 K) v = M v*
//! 5. **Deformation**: velocity-gradient gather, plastic yield, hardening
//! 6. **G2P**: FLIP velocity update, particle collisions, advection
//!
//! # Example
//!
//! ```
//! use glam::Vec3;
//! use mpm3d::{ParticleSet, SimulationParams, Simulation, SnowModel};
//!
//! let mut particles = ParticleSet::new();
//! for i in 0..4 {
//!     for j in 0..4 {
//!         for k in 0..4 {
//!             particles.spawn(
//!                 Vec3::new(i as f32, j as f32, k as f32) * 0.05,
//!                 Vec3::ZERO,
//!                 0.01,
//!             );
//!         }
//!     }
//! }
//!
//! let params = SimulationParams::default();
//! let model = Box::new(SnowModel::from_params(&params));
//! let mut sim = Simulation::new(particles, model, params).unwrap();
//! sim.step().unwrap();
//! ```

pub mod collision;
pub mod error;
pub mod forces;
pub mod grid;
pub mod kernels;
pub mod math;
pub mod params;
pub mod particle;
pub mod snow;
pub mod solver;
pub mod transfer;

pub use collision::{Ball, CollisionSurface, HalfSpace};
pub use error::{SimError, SimResult};
pub use glam::{Mat3, Vec3};
pub use grid::Grid;
pub use params::SimulationParams;
pub use particle::ParticleSet;
pub use snow::{ConstitutiveModel, SnowModel};
pub use solver::{
    ConjugateResiduals, ConvergenceReport, ImplicitOperator, SquareMagnitudeTermination,
    SymmetricOperator, Termination,
};

/// What one step did.
#[derive(Clone, Debug)]
pub struct StepReport {
    /// Convergence of the implicit velocity solve.
    pub solve: ConvergenceReport,
    /// Live particles after the step.
    pub active_particles: usize,
}

/// Owns the particles, material, collision surfaces and scratch buffers, and
/// advances them step by step.
pub struct Simulation {
    /// Particle state.
    pub particles: ParticleSet,
    /// Tunables, fixed at construction.
    pub params: SimulationParams,
    model: Box<dyn ConstitutiveModel>,
    surfaces: Vec<Box<dyn CollisionSurface>>,
    // Per-step scratch, reused across steps.
    forces: Vec<Vec3>,
    rhs: Vec<Vec3>,
}

impl Simulation {
    /// Set up a simulation: initializes the material state and seeds the
    /// particle rest volumes from the density gathered off a first grid.
    pub fn new(
        mut particles: ParticleSet,
        model: Box<dyn ConstitutiveModel>,
        params: SimulationParams,
    ) -> SimResult<Self> {
        model.init_particles(&mut particles);

        let mut grid = Grid::from_particles(&particles, params.grid_h)?;
        particles.build_scatter_partition(grid.origin, grid.h);
        grid.splat_mass_and_momentum(&particles);
        grid.compute_densities(&mut particles);

        for p in 0..particles.len() {
            // Rest volume from the gathered density, falling back to the
            // nominal material density for particles the gather missed.
            let density = if particles.density[p] > 0.0 {
                particles.density[p]
            } else {
                params.initial_density
            };
            particles.volume[p] = particles.mass[p] / density;
        }

        Ok(Self {
            particles,
            params,
            model,
            surfaces: Vec::new(),
            forces: Vec::new(),
            rhs: Vec::new(),
        })
    }

    /// Register a collision surface.
    pub fn add_surface(&mut self, surface: Box<dyn CollisionSurface>) {
        self.surfaces.push(surface);
    }

    /// The registered collision surfaces.
    pub fn surfaces(&self) -> &[Box<dyn CollisionSurface>] {
        &self.surfaces
    }

    /// The constitutive model.
    pub fn model(&self) -> &dyn ConstitutiveModel {
        self.model.as_ref()
    }

    /// Total elastic energy of the particles. Validation only.
    pub fn elastic_energy(&self) -> f32 {
        forces::calculate_energy(&self.particles, self.model.as_ref())
    }

    /// Total kinetic energy of the live particles.
    pub fn kinetic_energy(&self) -> f32 {
        (0..self.particles.len())
            .filter(|&p| self.particles.is_active(p))
            .map(|p| 0.5 * self.particles.mass[p] * self.particles.velocity[p].length_squared())
            .sum()
    }

    /// Advance the system by one timestep.
    ///
    /// All fatal checks happen while the grid is sized, before any particle
    /// state is written, so a failed step leaves the state untouched.
    pub fn step(&mut self) -> SimResult<StepReport> {
        let dt = self.params.dt;
        let friction = self.params.coulomb_friction;

        // Grid construction and P2G.
        let mut grid = Grid::from_particles(&self.particles, self.params.grid_h)?;
        self.particles.build_scatter_partition(grid.origin, grid.h);
        grid.splat_mass_and_momentum(&self.particles);

        // Forces and the explicit predictor with grid-side collisions.
        forces::calculate_forces(
            &grid,
            &self.particles,
            self.model.as_ref(),
            self.params.gravity,
            &mut self.forces,
        );
        grid.explicit_velocity_update(&self.forces, dt, &self.surfaces, friction, &mut self.rhs);

        // Implicit correction, warm-started from the pre-force velocities.
        let mut v_next = grid.velocity.clone();
        let solve = {
            let operator = ImplicitOperator {
                grid: &grid,
                particles: &self.particles,
                model: self.model.as_ref(),
                dt,
            };
            operator.project(&mut v_next);
            operator.project(&mut self.rhs);

            let solver = ConjugateResiduals::new(SquareMagnitudeTermination {
                max_iterations: self.params.solver_max_iters,
                tolerance: self.params.solver_tol,
            });
            solver.solve(&operator, &self.rhs, &mut v_next)
        };
        grid.velocity = v_next;

        // Deformation update first: the gather must see the pre-advection
        // particle positions.
        let gradients = transfer::velocity_gradients(&grid, &self.particles);
        self.model
            .update_deformation(&mut self.particles, dt, &gradients);

        // FLIP transfer, particle collisions, advection.
        transfer::update_particle_velocities(&grid, &mut self.particles, &self.surfaces, friction);
        transfer::advect_particles(&mut self.particles, dt);

        Ok(StepReport {
            solve,
            active_particles: self.particles.active_count(),
        })
    }
}
