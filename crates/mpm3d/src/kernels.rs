//! Cubic B-spline shape functions for particle/grid interpolation.
//!
//! Each particle influences a 4x4x4 block of grid nodes offset by [-1, 2]
//! from the cell that contains it. Weights are separable products of the 1D
//! kernel evaluated per axis.

use glam::{IVec3, Vec3};

/// Stencil offsets covered by the cubic kernel, relative to the particle's cell.
pub const STENCIL_OFFSETS: std::ops::RangeInclusive<i32> = -1..=2;

/// 1D cubic B-spline weight.
/// Support: [-2, 2] (covers 4 grid nodes).
#[inline]
pub fn bspline(x: f32) -> f32 {
    let ax = x.abs();
    if ax < 1.0 {
        0.5 * ax * ax * ax - ax * ax + 2.0 / 3.0
    } else if ax < 2.0 {
        -ax * ax * ax / 6.0 + ax * ax - 2.0 * ax + 4.0 / 3.0
    } else {
        0.0
    }
}

/// Derivative of the 1D cubic B-spline, with the sign carried from `x`.
#[inline]
pub fn bspline_deriv(x: f32) -> f32 {
    if x < 0.0 {
        return -bspline_deriv(-x);
    }
    if x < 1.0 {
        x * (1.5 * x - 2.0)
    } else if x < 2.0 {
        let t = x - 2.0;
        -0.5 * t * t
    } else {
        0.0
    }
}

/// Per-particle interpolation stencil: the containing cell plus per-axis
/// weights and weight derivatives for the offsets in [`STENCIL_OFFSETS`].
///
/// Replaces pointer-offset weight buffers with offset-indexed accessors:
/// `weight(offset)` and `weight_gradient(offset)` take offsets in [-1, 2].
#[derive(Clone, Copy, Debug)]
pub struct NodeWeights {
    /// Cell containing the particle: floor((x - origin) / h).
    pub cell: IVec3,
    w: [[f32; 4]; 3],
    dw: [[f32; 4]; 3],
}

impl NodeWeights {
    /// Build the stencil for a particle at `pos` on a grid with the given
    /// origin and cell size.
    pub fn new(pos: Vec3, origin: Vec3, h: f32) -> Self {
        let local = (pos - origin) / h;
        let cell = local.floor();
        let frac = local - cell;

        let mut w = [[0.0; 4]; 3];
        let mut dw = [[0.0; 4]; 3];
        for axis in 0..3 {
            let f = frac[axis];
            for k in STENCIL_OFFSETS {
                w[axis][(k + 1) as usize] = bspline(f - k as f32);
                dw[axis][(k + 1) as usize] = bspline_deriv(f - k as f32) / h;
            }
        }

        Self {
            cell: cell.as_ivec3(),
            w,
            dw,
        }
    }

    /// Grid node at the given stencil offset.
    #[inline]
    pub fn node(&self, offset: IVec3) -> IVec3 {
        self.cell + offset
    }

    /// Interpolation weight for the node at `offset` (each component in [-1, 2]).
    #[inline]
    pub fn weight(&self, offset: IVec3) -> f32 {
        self.w[0][(offset.x + 1) as usize]
            * self.w[1][(offset.y + 1) as usize]
            * self.w[2][(offset.z + 1) as usize]
    }

    /// Gradient of the interpolation weight for the node at `offset`.
    #[inline]
    pub fn weight_gradient(&self, offset: IVec3) -> Vec3 {
        let wx = self.w[0][(offset.x + 1) as usize];
        let wy = self.w[1][(offset.y + 1) as usize];
        let wz = self.w[2][(offset.z + 1) as usize];
        let dwx = self.dw[0][(offset.x + 1) as usize];
        let dwy = self.dw[1][(offset.y + 1) as usize];
        let dwz = self.dw[2][(offset.z + 1) as usize];
        Vec3::new(dwx * wy * wz, wx * dwy * wz, wx * wy * dwz)
    }

    /// Visit every stencil offset in deterministic (z, y, x) order.
    #[inline]
    pub fn for_each_offset(mut visit: impl FnMut(IVec3)) {
        for dk in STENCIL_OFFSETS {
            for dj in STENCIL_OFFSETS {
                for di in STENCIL_OFFSETS {
                    visit(IVec3::new(di, dj, dk));
                }
            }
        }
    }
}
