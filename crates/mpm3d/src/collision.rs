//! Collision surfaces as signed distance fields, plus the Coulomb response
//! shared by grid nodes and particles.

use glam::Vec3;

/// An implicit collision surface: signed distance and its gradient.
/// Negative distance means inside the obstacle. The gradient points outward
/// and does not have to be unit length.
pub trait CollisionSurface: Send + Sync {
    /// Signed distance at `x`.
    fn phi(&self, x: Vec3) -> f32;
    /// Gradient of the signed distance at `x`.
    fn grad(&self, x: Vec3) -> Vec3;
}

/// Solid half-space: everything with `normal . x < offset` is inside.
#[derive(Clone, Copy, Debug)]
pub struct HalfSpace {
    /// Outward normal of the bounding plane.
    pub normal: Vec3,
    /// Plane offset along the normal.
    pub offset: f32,
}

impl HalfSpace {
    /// Floor plane at the given height with +Y normal.
    pub fn floor(height: f32) -> Self {
        Self {
            normal: Vec3::Y,
            offset: height,
        }
    }
}

impl CollisionSurface for HalfSpace {
    fn phi(&self, x: Vec3) -> f32 {
        self.normal.dot(x) - self.offset
    }

    fn grad(&self, _x: Vec3) -> Vec3 {
        self.normal
    }
}

/// Solid ball.
#[derive(Clone, Copy, Debug)]
pub struct Ball {
    /// Center of the ball.
    pub center: Vec3,
    /// Radius of the ball.
    pub radius: f32,
}

impl CollisionSurface for Ball {
    fn phi(&self, x: Vec3) -> f32 {
        (x - self.center).length() - self.radius
    }

    fn grad(&self, x: Vec3) -> Vec3 {
        (x - self.center).normalize_or_zero()
    }
}

/// Apply the Coulomb collision response at position `x` to velocity `v`.
///
/// For every surface containing `x`, the inward-moving normal component is
/// removed and the tangential remainder is scaled by the friction factor
/// `1 + friction * (n . v) / |v_tan|`, clamped at zero so full arrest never
/// reverses the slip direction.
///
/// Returns the unit normal of the last surface that fired, if any.
pub fn apply_collision(
    v: &mut Vec3,
    x: Vec3,
    surfaces: &[Box<dyn CollisionSurface>],
    friction: f32,
) -> Option<Vec3> {
    let mut hit_normal = None;

    for surface in surfaces {
        if surface.phi(x) > 0.0 {
            continue;
        }
        let normal = surface.grad(x).normalize_or_zero();
        let n_dot_v = normal.dot(*v);
        if n_dot_v >= 0.0 {
            // Inside but separating; leave it alone.
            continue;
        }

        let v_perp = n_dot_v * normal;
        let v_tan = *v - v_perp;
        let tan_len = v_tan.length();

        if tan_len <= 1e-8 {
            *v = Vec3::ZERO;
        } else {
            let factor = (1.0 + friction * n_dot_v / tan_len).max(0.0);
            *v = v_tan * factor;
        }
        hit_normal = Some(normal);
    }

    hit_normal
}
