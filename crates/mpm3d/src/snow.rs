//! Snow constitutive model: fixed-corotated elasticity with singular-value
//! plastic yield and exponential hardening.
//!
//! Energy density: psi = mu * |F - R|_F^2 + lambda/2 * (J - 1)^2
//! Stress:         dpsi/dF = 2 mu (F - R) + lambda (J - 1) J F^-T

use glam::Mat3;
use rayon::prelude::*;

use crate::math::{double_dot, polar_decomposition, rotation_differential, svd3};
use crate::params::SimulationParams;
use crate::particle::ParticleSet;

/// Material capability consumed by the force and deformation phases.
pub trait ConstitutiveModel: Send + Sync {
    /// Reset deformation state and Lamé parameters on every particle.
    fn init_particles(&self, particles: &mut ParticleSet);

    /// Advance each particle's deformation gradient given the velocity
    /// gradient gathered from the grid, applying yield and hardening.
    fn update_deformation(&self, particles: &mut ParticleSet, dt: f32, velocity_gradients: &[Mat3]);

    /// Elastic energy per unit volume at particle `p`.
    fn energy_density(&self, particles: &ParticleSet, p: usize) -> f32;

    /// First Piola-Kirchhoff stress dpsi/dF at particle `p`.
    fn dpsi_df(&self, particles: &ParticleSet, p: usize) -> Mat3;

    /// Change of dpsi/dF at particle `p` under the perturbation `df` of the
    /// deformation gradient.
    fn dpsi_df_differential(&self, particles: &ParticleSet, p: usize, df: &Mat3) -> Mat3;
}

/// The snow material of the simulator.
#[derive(Clone, Copy, Debug)]
pub struct SnowModel {
    mu0: f32,
    lambda0: f32,
    hardening: f32,
    theta_c: f32,
    theta_s: f32,
    plasticity_enabled: bool,
    degenerate_step_limit: u8,
}

/// Outcome of one particle's deformation update; `None` marks a degenerate
/// gradient whose contribution is skipped for the step.
struct DeformationUpdate {
    deformation: Mat3,
    plastic: Mat3,
    rotation: Mat3,
    stretch: Mat3,
    f_inv_transpose: Mat3,
    jacobian: f32,
    hardening_factor: f32,
}

impl SnowModel {
    /// Build the model from explicit material constants.
    pub fn new(
        youngs_modulus: f32,
        poisson_ratio: f32,
        hardening: f32,
        theta_c: f32,
        theta_s: f32,
        plasticity_enabled: bool,
    ) -> Self {
        Self {
            mu0: youngs_modulus / (2.0 * (1.0 + poisson_ratio)),
            lambda0: youngs_modulus * poisson_ratio
                / ((1.0 + poisson_ratio) * (1.0 - 2.0 * poisson_ratio)),
            hardening,
            theta_c,
            theta_s,
            plasticity_enabled,
            degenerate_step_limit: 3,
        }
    }

    /// Build the model from the simulation parameter block.
    pub fn from_params(params: &SimulationParams) -> Self {
        let mut model = Self::new(
            params.youngs_modulus,
            params.poisson_ratio,
            params.hardening,
            params.theta_c,
            params.theta_s,
            params.plasticity_enabled,
        );
        model.degenerate_step_limit = params.degenerate_step_limit;
        model
    }

    /// Unhardened Lamé mu.
    pub fn mu0(&self) -> f32 {
        self.mu0
    }

    /// Unhardened Lamé lambda.
    pub fn lambda0(&self) -> f32 {
        self.lambda0
    }

    fn mat_finite(m: &Mat3) -> bool {
        m.x_axis.is_finite() && m.y_axis.is_finite() && m.z_axis.is_finite()
    }

    /// Evolve one particle's gradients from the trial elastic gradient.
    fn evolve(&self, trial: Mat3, plastic_old: &Mat3) -> Option<DeformationUpdate> {
        if !Self::mat_finite(&trial) || trial.determinant() <= 0.0 {
            return None;
        }

        let (deformation, plastic, rotation, stretch) = if self.plasticity_enabled {
            let svd = svd3(&trial);

            let mut clamped = svd.sigma;
            for i in 0..3 {
                clamped[i] = clamped[i].clamp(1.0 - self.theta_c, 1.0 + self.theta_s);
            }

            let deformation = svd.u * Mat3::from_diagonal(clamped) * svd.v.transpose();

            // Fold the clamped-away part into the plastic gradient so that
            // the trial total F_e_trial * Fp is preserved:
            //   Fp <- V diag(sigma / sigma_hat) V^T Fp
            let flow = glam::Vec3::new(
                svd.sigma.x / clamped.x,
                svd.sigma.y / clamped.y,
                svd.sigma.z / clamped.z,
            );
            let plastic = svd.v * Mat3::from_diagonal(flow) * svd.v.transpose() * *plastic_old;

            let rotation = svd.u * svd.v.transpose();
            let stretch = svd.v * Mat3::from_diagonal(clamped) * svd.v.transpose();

            (deformation, plastic, rotation, stretch)
        } else {
            let polar = polar_decomposition(&trial);
            (trial, *plastic_old, polar.rotation, polar.stretch)
        };

        let jacobian = deformation.determinant();
        if jacobian <= 1e-10 {
            return None;
        }

        let f_inv_transpose = deformation.inverse().transpose();
        if !Self::mat_finite(&f_inv_transpose) {
            return None;
        }

        let hardening_factor = if self.plasticity_enabled {
            (self.hardening * (1.0 - plastic.determinant())).exp()
        } else {
            1.0
        };
        if !hardening_factor.is_finite() {
            return None;
        }

        Some(DeformationUpdate {
            deformation,
            plastic,
            rotation,
            stretch,
            f_inv_transpose,
            jacobian,
            hardening_factor,
        })
    }
}

impl ConstitutiveModel for SnowModel {
    fn init_particles(&self, particles: &mut ParticleSet) {
        for p in 0..particles.len() {
            particles.deformation[p] = Mat3::IDENTITY;
            particles.plastic_deformation[p] = Mat3::IDENTITY;
            particles.rotation[p] = Mat3::IDENTITY;
            particles.stretch[p] = Mat3::IDENTITY;
            particles.f_inv_transpose[p] = Mat3::IDENTITY;
            particles.jacobian[p] = 1.0;
            particles.mu[p] = self.mu0;
            particles.lambda[p] = self.lambda0;
        }
    }

    fn update_deformation(
        &self,
        particles: &mut ParticleSet,
        dt: f32,
        velocity_gradients: &[Mat3],
    ) {
        let updates: Vec<Option<DeformationUpdate>> = {
            let read = &*particles;
            (0..read.len())
                .into_par_iter()
                .map(|p| {
                    if !read.is_active(p) {
                        return None;
                    }
                    let trial =
                        (Mat3::IDENTITY + velocity_gradients[p] * dt) * read.deformation[p];
                    self.evolve(trial, &read.plastic_deformation[p])
                })
                .collect()
        };

        for (p, update) in updates.into_iter().enumerate() {
            if !particles.is_active(p) {
                continue;
            }
            match update {
                Some(u) => {
                    particles.deformation[p] = u.deformation;
                    particles.plastic_deformation[p] = u.plastic;
                    particles.rotation[p] = u.rotation;
                    particles.stretch[p] = u.stretch;
                    particles.f_inv_transpose[p] = u.f_inv_transpose;
                    particles.jacobian[p] = u.jacobian;
                    particles.mu[p] = self.mu0 * u.hardening_factor;
                    particles.lambda[p] = self.lambda0 * u.hardening_factor;
                    particles.mark_healthy(p);

                    debug_assert!(
                        double_dot(
                            &(u.rotation * u.rotation.transpose() - Mat3::IDENTITY),
                            &(u.rotation * u.rotation.transpose() - Mat3::IDENTITY)
                        ) < 1e-8,
                        "rotation factor drifted from orthonormal at particle {p}"
                    );
                }
                None => {
                    log::warn!("particle {p}: degenerate deformation gradient, skipping update");
                    if particles.mark_degenerate(p, self.degenerate_step_limit) {
                        log::warn!("particle {p}: degenerate for too long, retiring it");
                    }
                }
            }
        }
    }

    fn energy_density(&self, particles: &ParticleSet, p: usize) -> f32 {
        let deviation = particles.deformation[p] - particles.rotation[p];
        let j_minus_one = particles.jacobian[p] - 1.0;
        particles.mu[p] * double_dot(&deviation, &deviation)
            + 0.5 * particles.lambda[p] * j_minus_one * j_minus_one
    }

    fn dpsi_df(&self, particles: &ParticleSet, p: usize) -> Mat3 {
        let j = particles.jacobian[p];
        (particles.deformation[p] - particles.rotation[p]) * (2.0 * particles.mu[p])
            + particles.f_inv_transpose[p] * (particles.lambda[p] * (j - 1.0) * j)
    }

    fn dpsi_df_differential(&self, particles: &ParticleSet, p: usize, df: &Mat3) -> Mat3 {
        let j = particles.jacobian[p];
        let f_inv_t = particles.f_inv_transpose[p];

        let dj = j * double_dot(&f_inv_t, df);
        let df_inv_t = -(f_inv_t * df.transpose() * f_inv_t);
        let dr = rotation_differential(df, &particles.rotation[p], &particles.stretch[p]);

        (*df - dr) * (2.0 * particles.mu[p])
            + (f_inv_t * (dj * j) + (f_inv_t * dj + df_inv_t * j) * (j - 1.0))
                * particles.lambda[p]
    }
}
