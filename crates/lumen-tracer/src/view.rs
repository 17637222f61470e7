//! Backend-facing view of a scene.
//!
//! The engine's update pipeline flattens the scene graph into the plain
//! index-linked arrays defined here, once per frame, so the tracing hot
//! loop never touches the graph itself. All weak links are indices.

use lumen_math::Real;

/// Material property bits derived from the material description.
pub mod props {
    /// Texture is larger than a single texel.
    pub const TEXTURE: u32 = 1 << 0;
    /// Non-zero reflection coefficient.
    pub const REFLECT: u32 = 1 << 1;
    /// Refraction index differs from 1.
    pub const REFRACT: u32 = 1 << 2;
    /// Non-zero specular coefficient.
    pub const SPECULAR: u32 = 1 << 3;
    /// Fully opaque.
    pub const OPAQUE: u32 = 1 << 4;
    /// Fully transparent.
    pub const TRANSP: u32 = 1 << 5;
    /// Emissive material; no shading.
    pub const LIGHT: u32 = 1 << 6;
    /// Regular shaded material.
    pub const NORMAL: u32 = 1 << 7;
    /// Specular highlights tinted by the texture color.
    pub const METAL: u32 = 1 << 8;
}

/// World-to-local affine transform, row form: `l = lin * w + pos`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvXform {
    /// Linear part rows.
    pub lin: [[Real; 3]; 3],
    /// Translation part.
    pub pos: [Real; 3],
}

impl InvXform {
    /// Apply to a point.
    #[inline]
    pub fn point(&self, p: [Real; 3]) -> [Real; 3] {
        let l = &self.lin;
        [
            l[0][0] * p[0] + l[0][1] * p[1] + l[0][2] * p[2] + self.pos[0],
            l[1][0] * p[0] + l[1][1] * p[1] + l[1][2] * p[2] + self.pos[1],
            l[2][0] * p[0] + l[2][1] * p[1] + l[2][2] * p[2] + self.pos[2],
        ]
    }

    /// Apply the linear part to a direction.
    #[inline]
    pub fn dir(&self, d: [Real; 3]) -> [Real; 3] {
        let l = &self.lin;
        [
            l[0][0] * d[0] + l[0][1] * d[1] + l[0][2] * d[2],
            l[1][0] * d[0] + l[1][1] * d[1] + l[1][2] * d[2],
            l[2][0] * d[0] + l[2][1] * d[1] + l[2][2] * d[2],
        ]
    }
}

/// Analytic shape of a surface in its local frame.
///
/// Quadrics are expressed as `sci·(i², j², k²) - sck·k - sqw = 0`; the
/// plane is the linear special case `k = 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShapeRec {
    /// Plane `k = 0`.
    Plane,
    /// General axis-K quadric.
    Quadric {
        /// Quadratic coefficients for the local I/J/K axes.
        sci: [Real; 3],
        /// Linear coefficient for the local K axis.
        sck: Real,
        /// Constant term.
        sqw: Real,
    },
}

/// Flat per-surface record consumed by the tracer.
#[derive(Debug, Clone)]
pub struct SurfaceRec {
    /// Shape equation.
    pub shape: ShapeRec,
    /// Optional transform into the surface's caching frame. `None` means
    /// the surface is axis-aligned in world space and `map`/`sgn`/`pos`
    /// alone bring world coordinates into the local frame.
    pub inv: Option<InvXform>,
    /// Which frame axis each local axis reads from.
    pub map: [usize; 3],
    /// Sign applied per local axis.
    pub sgn: [Real; 3],
    /// Origin of the local frame within the caching frame.
    pub pos: [Real; 3],
    /// Local clipper box minimum; `-inf` means unbounded.
    pub cmin: [Real; 3],
    /// Local clipper box maximum; `+inf` means unbounded.
    pub cmax: [Real; 3],
    /// Custom clipper list: range into [`SceneView::clips`].
    pub clip_off: u32,
    /// Custom clipper list length.
    pub clip_len: u32,
    /// Outer and inner material indices into [`SceneView::materials`].
    pub mat: [u32; 2],
}

impl SurfaceRec {
    /// Transform a world point into this surface's local frame.
    #[inline]
    pub fn to_local(&self, w: [Real; 3]) -> [Real; 3] {
        let f = match &self.inv {
            Some(inv) => inv.point(w),
            None => w,
        };
        [
            self.sgn[0] * (f[self.map[0]] - self.pos[self.map[0]]),
            self.sgn[1] * (f[self.map[1]] - self.pos[self.map[1]]),
            self.sgn[2] * (f[self.map[2]] - self.pos[self.map[2]]),
        ]
    }

    /// Transform a world direction into this surface's local frame.
    #[inline]
    pub fn dir_to_local(&self, d: [Real; 3]) -> [Real; 3] {
        let f = match &self.inv {
            Some(inv) => inv.dir(d),
            None => d,
        };
        [
            self.sgn[0] * f[self.map[0]],
            self.sgn[1] * f[self.map[1]],
            self.sgn[2] * f[self.map[2]],
        ]
    }

    /// Transform a local-frame direction back to world space.
    ///
    /// For the axis-mapped path this is the inverse permutation; for the
    /// transformed path it uses the rows of the inverse matrix (the
    /// inverse-transpose of the forward linear part), so the result must
    /// be normalized by the caller.
    #[inline]
    pub fn dir_to_world(&self, l: [Real; 3]) -> [Real; 3] {
        let mut f = [0.0; 3];
        for a in 0..3 {
            f[self.map[a]] = self.sgn[a] * l[a];
        }
        match &self.inv {
            Some(inv) => {
                let m = &inv.lin;
                [
                    m[0][0] * f[0] + m[1][0] * f[1] + m[2][0] * f[2],
                    m[0][1] * f[0] + m[1][1] * f[1] + m[2][1] * f[2],
                    m[0][2] * f[0] + m[1][2] * f[1] + m[2][2] * f[2],
                ]
            }
            None => f,
        }
    }

    /// Signed value of the shape equation at a local point.
    ///
    /// Negative inside, positive outside (plane: below/above).
    #[inline]
    pub fn eval(&self, l: [Real; 3]) -> Real {
        match self.shape {
            ShapeRec::Plane => l[2],
            ShapeRec::Quadric { sci, sck, sqw } => {
                sci[0] * l[0] * l[0] + sci[1] * l[1] * l[1] + sci[2] * l[2] * l[2]
                    - sck * l[2]
                    - sqw
            }
        }
    }

    /// Local-frame gradient of the shape equation (unnormalized normal).
    #[inline]
    pub fn gradient(&self, l: [Real; 3]) -> [Real; 3] {
        match self.shape {
            ShapeRec::Plane => [0.0, 0.0, 1.0],
            ShapeRec::Quadric { sci, sck, .. } => [
                2.0 * sci[0] * l[0],
                2.0 * sci[1] * l[1],
                2.0 * sci[2] * l[2] - sck,
            ],
        }
    }

    /// True when the local point is inside the surface's own clipper box.
    #[inline]
    pub fn in_clip_box(&self, l: [Real; 3]) -> bool {
        (0..3).all(|a| l[a] >= self.cmin[a] && l[a] <= self.cmax[a])
    }
}

/// One element of a surface's custom clipper list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClipRec {
    /// Open an accumulation segment: the following clippers up to the
    /// matching [`ClipRec::AccumLeave`] form one boolean group that keeps
    /// a point when any member keeps it.
    AccumEnter,
    /// Close an accumulation segment.
    AccumLeave,
    /// Transform-group marker: the next `count` surface elements share one
    /// caching transform, so a backend can hoist the inverse once for the
    /// whole group.
    Trnode {
        /// Number of following surface elements under this marker.
        count: u32,
    },
    /// An actual clipper surface.
    Surface {
        /// Index into [`SceneView::surfaces`].
        srf: u32,
        /// True for minus-outer (keep the inside of the clipper),
        /// false for minus-inner (keep the outside).
        outer: bool,
    },
}

/// Flat per-light record.
#[derive(Debug, Clone, Copy)]
pub struct LightRec {
    /// World position.
    pub pos: [Real; 3],
    /// Color premultiplied by the source intensity.
    pub col: [Real; 3],
    /// Maximum range; `0` means unlimited.
    pub rng: Real,
    /// Constant attenuation term (includes the implicit `+1`).
    pub cnt: Real,
    /// Linear attenuation term.
    pub lnr: Real,
    /// Quadratic attenuation term.
    pub qdr: Real,
}

/// Flat per-material record.
#[derive(Debug, Clone, Copy)]
pub struct MaterialRec {
    /// Property bits from [`props`].
    pub props: u32,
    /// Texel range start in [`SceneView::texels`].
    pub tex_off: u32,
    /// Texture width, power of two.
    pub tex_w: u32,
    /// Texture height, power of two.
    pub tex_h: u32,
    /// `tex_w - 1`.
    pub xmask: i32,
    /// `tex_h - 1`.
    pub ymask: i32,
    /// `log2(tex_w)`.
    pub yshift: u32,
    /// Which UV component feeds texture X/Y (trivial side rotations only).
    pub uv_map: [usize; 2],
    /// UV scale including texture dimensions and mapping sign.
    pub xscal: Real,
    /// UV scale including texture dimensions and mapping sign.
    pub yscal: Real,
    /// UV offset.
    pub xoffs: Real,
    /// UV offset.
    pub yoffs: Real,
    /// Diffuse coefficient.
    pub dff: Real,
    /// Specular coefficient.
    pub spc: Real,
    /// Specular power.
    pub pow: Real,
    /// Reflection coefficient.
    pub rfl: Real,
    /// Transparency (opacity complement) in `[0, 1]`.
    pub trn: Real,
    /// Refraction index ratio.
    pub rfr: Real,
}

impl MaterialRec {
    /// Sample the texture at surface-local UV coordinates.
    #[inline]
    pub fn sample(&self, texels: &[u32], uv: [Real; 2]) -> u32 {
        let u = uv[self.uv_map[0]] * self.xscal + self.xoffs;
        let v = uv[self.uv_map[1]] * self.yscal + self.yoffs;
        let x = (u.floor() as i64 as i32) & self.xmask;
        let y = (v.floor() as i64 as i32) & self.ymask;
        texels[self.tex_off as usize + ((y as usize) << self.yshift) + x as usize]
    }
}

/// Complete flat scene view handed to the tracing backend each frame.
pub struct SceneView<'a> {
    /// All surfaces, indexed by the lists below.
    pub surfaces: &'a [SurfaceRec],
    /// Global surface list in deterministic draw order.
    pub slist: &'a [u32],
    /// Lights, sorted closest/brightest first.
    pub lights: &'a [LightRec],
    /// Custom clipper element pool.
    pub clips: &'a [ClipRec],
    /// Materials.
    pub materials: &'a [MaterialRec],
    /// Shared texel pool.
    pub texels: &'a [u32],
    /// Global ambient color (camera ambient plus light ambient terms).
    pub ambient: [Real; 3],
    /// Maximum number of secondary bounces.
    pub depth: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere(rad: Real) -> SurfaceRec {
        SurfaceRec {
            shape: ShapeRec::Quadric {
                sci: [1.0, 1.0, 1.0],
                sck: 0.0,
                sqw: rad * rad,
            },
            inv: None,
            map: [0, 1, 2],
            sgn: [1.0; 3],
            pos: [0.0; 3],
            cmin: [-lumen_math::INF; 3],
            cmax: [lumen_math::INF; 3],
            clip_off: 0,
            clip_len: 0,
            mat: [0, 0],
        }
    }

    #[test]
    fn test_sphere_eval_sign() {
        let s = sphere(2.0);
        assert!(s.eval([0.0, 0.0, 0.0]) < 0.0);
        assert!(s.eval([3.0, 0.0, 0.0]) > 0.0);
        assert_eq!(s.eval([2.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_to_local_axis_map() {
        let mut s = sphere(1.0);
        // local I reads world Y negated, local J reads world X
        s.map = [1, 0, 2];
        s.sgn = [-1.0, 1.0, 1.0];
        s.pos = [10.0, 20.0, 30.0];
        let l = s.to_local([11.0, 25.0, 33.0]);
        assert_eq!(l, [-5.0, 1.0, 3.0]);
    }

    #[test]
    fn test_dir_roundtrip_with_inv() {
        // 90 degree rotation about Z as an inverse transform
        let inv = InvXform {
            lin: [[0.0, 1.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
            pos: [0.0; 3],
        };
        let mut s = sphere(1.0);
        s.inv = Some(inv);
        let d = s.dir_to_local([1.0, 0.0, 0.0]);
        assert_eq!(d, [0.0, -1.0, 0.0]);
        let back = s.dir_to_world(d);
        assert!((back[0] - 1.0).abs() < 1e-6);
        assert!(back[1].abs() < 1e-6);
    }

    #[test]
    fn test_material_sample_single_texel() {
        let m = MaterialRec {
            props: props::TEXTURE,
            tex_off: 0,
            tex_w: 1,
            tex_h: 1,
            xmask: 0,
            ymask: 0,
            yshift: 0,
            uv_map: [0, 1],
            xscal: 1.0,
            yscal: 1.0,
            xoffs: 0.0,
            yoffs: 0.0,
            dff: 1.0,
            spc: 0.0,
            pow: 1.0,
            rfl: 0.0,
            trn: 0.0,
            rfr: 1.0,
        };
        let texels = [0x00AB_CDEF];
        assert_eq!(m.sample(&texels, [123.4, -56.7]), 0x00AB_CDEF);
    }

    #[test]
    fn test_material_sample_tiles() {
        let texels = [0x1, 0x2, 0x3, 0x4]; // 2x2
        let m = MaterialRec {
            props: props::TEXTURE,
            tex_off: 0,
            tex_w: 2,
            tex_h: 2,
            xmask: 1,
            ymask: 1,
            yshift: 1,
            uv_map: [0, 1],
            xscal: 1.0,
            yscal: 1.0,
            xoffs: 0.0,
            yoffs: 0.0,
            dff: 1.0,
            spc: 0.0,
            pow: 1.0,
            rfl: 0.0,
            trn: 0.0,
            rfr: 1.0,
        };
        assert_eq!(m.sample(&texels, [0.0, 0.0]), 0x1);
        assert_eq!(m.sample(&texels, [1.0, 0.0]), 0x2);
        assert_eq!(m.sample(&texels, [0.0, 1.0]), 0x3);
        // wraps around
        assert_eq!(m.sample(&texels, [2.0, 2.0]), 0x1);
        assert_eq!(m.sample(&texels, [-1.0, 0.0]), 0x2);
    }
}
