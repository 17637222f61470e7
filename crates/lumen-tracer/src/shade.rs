//! Scalar ray evaluation: closest-hit search, custom clipper tests, and
//! the recursive material/light shading used for every lane once the
//! packet stage has found its primary hit.

use lumen_math::{Real, INF};

use crate::view::{props, ClipRec, SceneView, SurfaceRec};

/// Minimum accepted ray parameter; rejects self-intersections.
pub const T_EPS: Real = 1e-3;

/// Offset applied along the surface normal when spawning secondary rays.
const N_EPS: Real = 1e-4;

/// A resolved ray-surface intersection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    /// Ray parameter.
    pub t: Real,
    /// Surface index.
    pub srf: u32,
    /// True when the ray hit the outer side.
    pub outer: bool,
}

#[inline]
fn add3(a: [Real; 3], b: [Real; 3]) -> [Real; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
fn sub3(a: [Real; 3], b: [Real; 3]) -> [Real; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
fn scale3(a: [Real; 3], s: Real) -> [Real; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

#[inline]
fn dot3(a: [Real; 3], b: [Real; 3]) -> Real {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
fn mul3(a: [Real; 3], b: [Real; 3]) -> [Real; 3] {
    [a[0] * b[0], a[1] * b[1], a[2] * b[2]]
}

#[inline]
fn norm3(a: [Real; 3]) -> [Real; 3] {
    let len = dot3(a, a).sqrt();
    if len > 0.0 {
        scale3(a, 1.0 / len)
    } else {
        a
    }
}

/// Evaluate a surface's custom clipper list at a world point.
///
/// Independent clippers must all keep the point; an accumulation segment
/// keeps it when any of its members does. Transform-group markers are
/// grouping hints and carry no boolean of their own.
pub fn clip_point(view: &SceneView, rec: &SurfaceRec, w: [Real; 3]) -> bool {
    let clips = &view.clips[rec.clip_off as usize..(rec.clip_off + rec.clip_len) as usize];
    let mut i = 0;
    while i < clips.len() {
        match clips[i] {
            ClipRec::AccumEnter => {
                let mut kept = false;
                i += 1;
                while i < clips.len() && clips[i] != ClipRec::AccumLeave {
                    if let ClipRec::Surface { srf, outer } = clips[i] {
                        // short-circuit: one keeper decides the segment
                        if !kept && clip_one(view, srf, outer, w) {
                            kept = true;
                        }
                    }
                    i += 1;
                }
                if !kept {
                    return false;
                }
            }
            ClipRec::Surface { srf, outer } => {
                if !clip_one(view, srf, outer, w) {
                    return false;
                }
            }
            ClipRec::AccumLeave | ClipRec::Trnode { .. } => {}
        }
        i += 1;
    }
    true
}

#[inline]
fn clip_one(view: &SceneView, srf: u32, outer: bool, w: [Real; 3]) -> bool {
    let clip = &view.surfaces[srf as usize];
    let f = clip.eval(clip.to_local(w));
    // minus-outer subtracts the clipper's outer subspace (keeps the inside)
    if outer {
        f <= 0.0
    } else {
        f >= 0.0
    }
}

/// Nearest valid intersection of a ray with one surface in `(T_EPS, t_max)`.
///
/// Validity means the hit passes the surface's own clipper box and its
/// custom clipper list.
pub fn intersect_one(
    view: &SceneView,
    srf: u32,
    o: [Real; 3],
    d: [Real; 3],
    t_max: Real,
) -> Option<Hit> {
    let rec = &view.surfaces[srf as usize];
    let ol = rec.to_local(o);
    let dl = rec.dir_to_local(d);

    let accept = |t: Real| -> Option<Hit> {
        if !(t > T_EPS && t < t_max) {
            return None;
        }
        let l = [ol[0] + dl[0] * t, ol[1] + dl[1] * t, ol[2] + dl[2] * t];
        if !rec.in_clip_box(l) {
            return None;
        }
        if rec.clip_len > 0 && !clip_point(view, rec, add3(o, scale3(d, t))) {
            return None;
        }
        let outer = dot3(dl, rec.gradient(l)) < 0.0;
        Some(Hit { t, srf, outer })
    };

    match rec.shape {
        crate::view::ShapeRec::Plane => {
            if dl[2] == 0.0 {
                return None;
            }
            accept(-ol[2] / dl[2])
        }
        crate::view::ShapeRec::Quadric { sci, sck, .. } => {
            let a = sci[0] * dl[0] * dl[0] + sci[1] * dl[1] * dl[1] + sci[2] * dl[2] * dl[2];
            let b = 2.0 * (sci[0] * ol[0] * dl[0] + sci[1] * ol[1] * dl[1] + sci[2] * ol[2] * dl[2])
                - sck * dl[2];
            let c = rec.eval(ol);
            if a == 0.0 {
                // degenerate linear case (e.g. paraboloid axis rays)
                if b == 0.0 {
                    return None;
                }
                return accept(-c / b);
            }
            let disc = b * b - 4.0 * a * c;
            if disc < 0.0 {
                return None;
            }
            let sq = disc.sqrt();
            let (t1, t2) = ((-b - sq) / (2.0 * a), (-b + sq) / (2.0 * a));
            let (t1, t2) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
            accept(t1).or_else(|| accept(t2))
        }
    }
}

/// Closest hit of a ray against an ordered surface list.
pub fn closest_hit(
    view: &SceneView,
    list: &[u32],
    o: [Real; 3],
    d: [Real; 3],
    t_max: Real,
) -> Option<Hit> {
    let mut best: Option<Hit> = None;
    let mut t_best = t_max;
    for &srf in list {
        if let Some(hit) = intersect_one(view, srf, o, d, t_best) {
            t_best = hit.t;
            best = Some(hit);
        }
    }
    best
}

/// True when an occluder blocks the segment `o + t*d`, `t` in
/// `(T_EPS, 1)`. Used for shadow rays, whose direction spans the full
/// distance to the light. Fully transparent surfaces and emissive
/// shells (the bulbs enclosing light sources) pass light through.
pub fn occluded(view: &SceneView, o: [Real; 3], d: [Real; 3]) -> bool {
    for &srf in view.slist {
        if let Some(hit) = intersect_one(view, srf, o, d, 1.0 - T_EPS) {
            let rec = &view.surfaces[hit.srf as usize];
            let mat = &view.materials[rec.mat[if hit.outer { 0 } else { 1 }] as usize];
            if mat.props & (props::TRANSP | props::LIGHT) == 0 {
                return true;
            }
        }
    }
    false
}

#[inline]
fn reflect(d: [Real; 3], n: [Real; 3]) -> [Real; 3] {
    sub3(d, scale3(n, 2.0 * dot3(d, n)))
}

/// Refract `d` (unit) through the oriented normal `n`; falls back to
/// reflection at total internal reflection.
fn refract(d: [Real; 3], n: [Real; 3], eta: Real) -> [Real; 3] {
    let cos_i = -dot3(d, n);
    let sin2_t = eta * eta * (1.0 - cos_i * cos_i);
    if sin2_t > 1.0 {
        return reflect(d, n);
    }
    add3(scale3(d, eta), scale3(n, eta * cos_i - (1.0 - sin2_t).sqrt()))
}

/// Shade a resolved hit, recursing through reflection and refraction up
/// to `depth` additional bounces.
pub fn shade_hit(
    view: &SceneView,
    o: [Real; 3],
    d: [Real; 3],
    hit: Hit,
    depth: u32,
) -> [Real; 3] {
    let rec = &view.surfaces[hit.srf as usize];
    let w = add3(o, scale3(d, hit.t));
    let l = rec.to_local(w);
    let mat = &view.materials[rec.mat[if hit.outer { 0 } else { 1 }] as usize];
    let base = unpack_xrgb(mat.sample(view.texels, [l[0], l[1]]));

    if mat.props & props::LIGHT != 0 {
        return base;
    }

    let dn = norm3(d);
    let mut n = norm3(rec.dir_to_world(rec.gradient(l)));
    if dot3(n, dn) > 0.0 {
        n = scale3(n, -1.0);
    }

    let mut col = mul3(base, view.ambient);
    let shadow_org = add3(w, scale3(n, N_EPS));

    for light in view.lights {
        let lv = sub3(light.pos, w);
        let dist2 = dot3(lv, lv);
        let dist = dist2.sqrt();
        if light.rng > 0.0 && dist > light.rng {
            continue;
        }
        if occluded(view, shadow_org, lv) {
            continue;
        }
        let ln = scale3(lv, 1.0 / dist);
        let att = 1.0 / (light.cnt + light.lnr * dist + light.qdr * dist2);

        let diff = dot3(n, ln).max(0.0) * mat.dff * att;
        col = add3(col, scale3(mul3(base, light.col), diff));

        if mat.props & props::SPECULAR != 0 {
            let r = reflect(scale3(ln, -1.0), n);
            let spec = dot3(r, scale3(dn, -1.0)).max(0.0).powf(mat.pow) * mat.spc * att;
            let tint = if mat.props & props::METAL != 0 {
                mul3(base, light.col)
            } else {
                light.col
            };
            col = add3(col, scale3(tint, spec));
        }
    }

    if depth > 0 {
        if mat.props & props::REFLECT != 0 {
            let rd = reflect(dn, n);
            let rc = shade_ray(view, add3(w, scale3(n, N_EPS)), rd, depth - 1);
            col = add3(scale3(col, 1.0 - mat.rfl), scale3(rc, mat.rfl));
        }
        if mat.trn > 0.0 {
            let eta = if hit.outer { 1.0 / mat.rfr } else { mat.rfr };
            let td = refract(dn, n, eta);
            let tc = shade_ray(view, sub3(w, scale3(n, N_EPS)), td, depth - 1);
            col = add3(scale3(col, 1.0 - mat.trn), scale3(tc, mat.trn));
        }
    }

    col
}

/// Trace one ray to completion: closest hit plus shading, or the global
/// ambient color on a miss.
pub fn shade_ray(view: &SceneView, o: [Real; 3], d: [Real; 3], depth: u32) -> [Real; 3] {
    match closest_hit(view, view.slist, o, d, INF) {
        Some(hit) => shade_hit(view, o, d, hit, depth),
        None => view.ambient,
    }
}

/// Clamp an HDR color to packed 8-bit XRGB.
#[inline]
pub fn pack_xrgb(c: [Real; 3]) -> u32 {
    let q = |v: Real| -> u32 { (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u32 };
    (q(c[0]) << 16) | (q(c[1]) << 8) | q(c[2])
}

/// Expand packed XRGB to an HDR color.
#[inline]
pub fn unpack_xrgb(v: u32) -> [Real; 3] {
    [
        ((v >> 16) & 0xFF) as Real / 255.0,
        ((v >> 8) & 0xFF) as Real / 255.0,
        (v & 0xFF) as Real / 255.0,
    ]
}
