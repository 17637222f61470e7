#![warn(missing_docs)]

//! Math types for the lumen ray-tracing engine.
//!
//! Thin wrappers around nalgebra providing the single-precision types the
//! engine works with: vectors, points, 4x4 affine matrices, and the
//! scale/rotation/position transform record used by scene descriptions.
//! Rotations are Euler angles in degrees; the engine classifies transforms
//! as *trivial* (axis remap plus sign flips) or not, so the degree-exact
//! trigonometry helpers here matter for correctness, not just precision.

use nalgebra::Matrix4;

/// Scalar type used throughout the engine.
pub type Real = f32;

/// A vector in 3D space.
pub type Vec3 = nalgebra::Vector3<f32>;

/// A point in 3D space.
pub type Pnt3 = nalgebra::Point3<f32>;

/// A 4x4 affine transformation matrix (column-major, `M * v` convention).
pub type Mat4 = Matrix4<f32>;

/// Positive infinity, used as the "unbounded" clipper coordinate.
pub const INF: Real = f32::INFINITY;

/// Minimum distance from the camera at which geometry is considered.
///
/// The camera's focal distance is clamped to at least twice this value.
pub const CLIP_THRESHOLD: Real = 0.01;

/// Scale, rotation and position of an object relative to its parent.
///
/// Rotation components are Euler angles in degrees, applied extrinsically
/// in X, then Y, then Z order. Each component is kept in `(-180, +180]`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transform3d {
    /// Per-axis scale factors.
    pub scl: [Real; 3],
    /// Euler rotation in degrees, X/Y/Z extrinsic.
    pub rot: [Real; 3],
    /// Translation.
    pub pos: [Real; 3],
}

impl Default for Transform3d {
    fn default() -> Self {
        Self {
            scl: [1.0; 3],
            rot: [0.0; 3],
            pos: [0.0; 3],
        }
    }
}

impl Transform3d {
    /// Identity transform.
    pub fn identity() -> Self {
        Self::default()
    }

    /// True if every scale component is exactly `-1` or `+1`.
    pub fn has_trivial_scale(&self) -> bool {
        self.scl.iter().all(|s| *s == 1.0 || *s == -1.0)
    }

    /// True if every rotation component is a multiple of 90 degrees
    /// within `[-270, +270]`.
    pub fn has_trivial_rot(&self) -> bool {
        const ROTS: [Real; 7] = [-270.0, -180.0, -90.0, 0.0, 90.0, 180.0, 270.0];
        self.rot.iter().all(|r| ROTS.contains(r))
    }
}

/// Sine of an angle given in degrees, exact for multiples of 90.
///
/// Trivial-transform detection relies on rotation matrices for multiples of
/// 90 degrees having exact zero/one entries; `f32::sin(PI)` does not give
/// an exact zero, so the quadrant cases are special-cased.
pub fn sind(deg: Real) -> Real {
    let r = deg.rem_euclid(360.0);
    match r {
        0.0 | 180.0 => 0.0,
        90.0 => 1.0,
        270.0 => -1.0,
        _ => deg.to_radians().sin(),
    }
}

/// Cosine of an angle given in degrees, exact for multiples of 90.
pub fn cosd(deg: Real) -> Real {
    let r = deg.rem_euclid(360.0);
    match r {
        0.0 => 1.0,
        90.0 | 270.0 => 0.0,
        180.0 => -1.0,
        _ => deg.to_radians().cos(),
    }
}

/// Normalize an angle in degrees to `(-180, +180]`.
pub fn norm_angle(deg: Real) -> Real {
    let mut a = deg.rem_euclid(360.0);
    if a > 180.0 {
        a -= 360.0;
    }
    a
}

/// Build the affine matrix for a transform record.
///
/// Scale is applied first, then rotation about X, Y, Z, then translation.
pub fn mat_from_transform(trm: &Transform3d) -> Mat4 {
    let (sx, cx) = (sind(trm.rot[0]), cosd(trm.rot[0]));
    let (sy, cy) = (sind(trm.rot[1]), cosd(trm.rot[1]));
    let (sz, cz) = (sind(trm.rot[2]), cosd(trm.rot[2]));

    let rx = Mat4::new(
        1.0, 0.0, 0.0, 0.0, //
        0.0, cx, -sx, 0.0, //
        0.0, sx, cx, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    );
    let ry = Mat4::new(
        cy, 0.0, sy, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        -sy, 0.0, cy, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    );
    let rz = Mat4::new(
        cz, -sz, 0.0, 0.0, //
        sz, cz, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    );
    let scl = Mat4::new(
        trm.scl[0], 0.0, 0.0, 0.0, //
        0.0, trm.scl[1], 0.0, 0.0, //
        0.0, 0.0, trm.scl[2], 0.0, //
        0.0, 0.0, 0.0, 1.0,
    );
    let mut m = rz * ry * rx * scl;
    m[(0, 3)] = trm.pos[0];
    m[(1, 3)] = trm.pos[1];
    m[(2, 3)] = trm.pos[2];
    m
}

/// Transform a point by the full affine matrix.
#[inline]
pub fn mul_point(m: &Mat4, p: Vec3) -> Vec3 {
    let v = m * nalgebra::Vector4::new(p.x, p.y, p.z, 1.0);
    Vec3::new(v.x, v.y, v.z)
}

/// Transform a direction by the linear part of the matrix.
#[inline]
pub fn mul_dir(m: &Mat4, d: Vec3) -> Vec3 {
    let v = m * nalgebra::Vector4::new(d.x, d.y, d.z, 0.0);
    Vec3::new(v.x, v.y, v.z)
}

/// Translation part of the matrix.
#[inline]
pub fn translation(m: &Mat4) -> Vec3 {
    Vec3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)])
}

/// A signed axis permutation: which world axis each local axis maps to,
/// with a sign, and the absolute per-axis scale left on the diagonal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisMap {
    /// `map[i]` is the world axis local axis `i` maps to.
    pub map: [usize; 3],
    /// `sgn[i]` is the sign of that mapping, `+1` or `-1`.
    pub sgn: [i32; 3],
    /// Absolute scale along each local axis.
    pub scl: [Real; 3],
}

impl Default for AxisMap {
    fn default() -> Self {
        Self {
            map: [0, 1, 2],
            sgn: [1; 3],
            scl: [1.0; 3],
        }
    }
}

/// Extract the signed axis permutation from an axis-aligned matrix.
///
/// Returns `None` when any basis column is not a (possibly scaled) signed
/// standard basis vector, i.e. when the linear part mixes axes.
pub fn axis_map(m: &Mat4) -> Option<AxisMap> {
    let mut out = AxisMap::default();
    for i in 0..3 {
        let col = [m[(0, i)], m[(1, i)], m[(2, i)]];
        let mut hit = None;
        for (j, c) in col.iter().enumerate() {
            if *c != 0.0 {
                if hit.is_some() {
                    return None;
                }
                hit = Some(j);
            }
        }
        let j = hit?;
        out.map[i] = j;
        out.sgn[i] = if col[j] > 0.0 { 1 } else { -1 };
        out.scl[i] = col[j].abs();
    }
    // a permutation hits each world axis exactly once
    let mut seen = [false; 3];
    for j in out.map {
        if seen[j] {
            return None;
        }
        seen[j] = true;
    }
    Some(out)
}

/// Invert an affine matrix.
///
/// Returns `None` for singular matrices (zero scale).
pub fn invert(m: &Mat4) -> Option<Mat4> {
    m.try_inverse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trivial_classification() {
        let mut t = Transform3d::identity();
        assert!(t.has_trivial_scale());
        assert!(t.has_trivial_rot());

        t.scl = [1.0, -1.0, 1.0];
        assert!(t.has_trivial_scale());
        t.scl = [2.0, 1.0, 1.0];
        assert!(!t.has_trivial_scale());

        t.rot = [-270.0, 90.0, 180.0];
        assert!(t.has_trivial_rot());
        t.rot = [45.0, 0.0, 0.0];
        assert!(!t.has_trivial_rot());
    }

    #[test]
    fn test_exact_quadrant_trig() {
        assert_eq!(sind(180.0), 0.0);
        assert_eq!(sind(-90.0), -1.0);
        assert_eq!(cosd(90.0), 0.0);
        assert_eq!(cosd(-180.0), -1.0);
        assert!((sind(30.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_norm_angle() {
        assert_eq!(norm_angle(190.0), -170.0);
        assert_eq!(norm_angle(-190.0), 170.0);
        assert_eq!(norm_angle(180.0), 180.0);
        assert_eq!(norm_angle(360.0), 0.0);
    }

    #[test]
    fn test_matrix_translation_only() {
        let mut t = Transform3d::identity();
        t.pos = [1.0, 2.0, 3.0];
        let m = mat_from_transform(&t);
        let p = mul_point(&m, Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(p, Vec3::new(2.0, 3.0, 4.0));
    }

    #[test]
    fn test_matrix_rot_z_90_is_exact() {
        let mut t = Transform3d::identity();
        t.rot = [0.0, 0.0, 90.0];
        let m = mat_from_transform(&t);
        let p = mul_point(&m, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(p, Vec3::new(0.0, 1.0, 0.0));
        // exact entries keep the matrix axis-aligned
        assert!(axis_map(&m).is_some());
    }

    #[test]
    fn test_axis_map_rot_90() {
        let mut t = Transform3d::identity();
        t.rot = [0.0, 0.0, 90.0];
        let m = mat_from_transform(&t);
        let am = axis_map(&m).unwrap();
        // local X maps to world Y, local Y to world -X
        assert_eq!(am.map[0], 1);
        assert_eq!(am.sgn[0], 1);
        assert_eq!(am.map[1], 0);
        assert_eq!(am.sgn[1], -1);
        assert_eq!(am.map[2], 2);
    }

    #[test]
    fn test_axis_map_rejects_general_rotation() {
        let mut t = Transform3d::identity();
        t.rot = [0.0, 0.0, 45.0];
        let m = mat_from_transform(&t);
        assert!(axis_map(&m).is_none());
    }

    #[test]
    fn test_axis_map_scale() {
        let mut t = Transform3d::identity();
        t.scl = [2.0, 3.0, 4.0];
        let m = mat_from_transform(&t);
        let am = axis_map(&m).unwrap();
        assert_eq!(am.map, [0, 1, 2]);
        assert_eq!(am.scl, [2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_invert_roundtrip() {
        let t = Transform3d {
            scl: [2.0, 1.0, 1.0],
            rot: [10.0, 20.0, 30.0],
            pos: [1.0, -2.0, 3.0],
        };
        let m = mat_from_transform(&t);
        let inv = invert(&m).unwrap();
        let p = Vec3::new(0.3, -0.7, 1.1);
        let q = mul_point(&inv, mul_point(&m, p));
        assert!((q - p).norm() < 1e-4);
    }
}
