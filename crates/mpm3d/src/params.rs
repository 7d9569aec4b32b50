//! Simulation parameters.
//!
//! Every tunable lives here; there is no global state. Defaults follow the
//! usual snow setup: a 0.1 m grid, 10 ms steps and stiff hardening.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// All tunables for one simulation, constructed once and passed by reference.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Grid cell size (m).
    pub grid_h: f32,
    /// Timestep (s).
    pub dt: f32,
    /// Rest density used to seed particle volumes (kg/m³).
    pub initial_density: f32,
    /// Gravity acceleration vector (m/s²).
    pub gravity: Vec3,
    /// Coulomb friction coefficient for collision surfaces.
    pub coulomb_friction: f32,
    /// Critical compression: singular values of F may not drop below 1 - theta_c.
    pub theta_c: f32,
    /// Critical stretch: singular values of F may not exceed 1 + theta_s.
    pub theta_s: f32,
    /// Hardening coefficient xi in mu = mu0 * exp(xi * (1 - det Fp)).
    pub hardening: f32,
    /// Young's modulus (Pa).
    pub youngs_modulus: f32,
    /// Poisson's ratio.
    pub poisson_ratio: f32,
    /// Implicit solver residual tolerance (on the residual norm).
    pub solver_tol: f32,
    /// Implicit solver iteration cap.
    pub solver_max_iters: usize,
    /// Whether the plastic yield / hardening update runs.
    pub plasticity_enabled: bool,
    /// Consecutive degenerate steps before a particle is marked dead.
    pub degenerate_step_limit: u8,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            grid_h: 0.1,
            dt: 0.01,
            initial_density: 400.0,
            gravity: Vec3::new(0.0, -9.8, 0.0),
            coulomb_friction: 0.5,
            theta_c: 2.5e-2,
            theta_s: 7.5e-3,
            hardening: 10.0,
            youngs_modulus: 1.4e5,
            poisson_ratio: 0.2,
            solver_tol: 1e-7,
            solver_max_iters: 30,
            plasticity_enabled: true,
            degenerate_step_limit: 3,
        }
    }
}

impl SimulationParams {
    /// First Lamé parameter mu from (E, nu).
    pub fn mu(&self) -> f32 {
        self.youngs_modulus / (2.0 * (1.0 + self.poisson_ratio))
    }

    /// Second Lamé parameter lambda from (E, nu).
    pub fn lambda(&self) -> f32 {
        self.youngs_modulus * self.poisson_ratio
            / ((1.0 + self.poisson_ratio) * (1.0 - 2.0 * self.poisson_ratio))
    }
}
