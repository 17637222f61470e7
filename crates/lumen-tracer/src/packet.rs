//! Packetized primary-ray stage.
//!
//! A packet is `W` adjacent pixels traced in lockstep: one shared origin,
//! `W` directions, per-lane `t`/winner masks. The packet stage resolves the
//! nearest surface per lane against a tile's sorted surface list; shading
//! then runs per lane through the scalar path in [`crate::shade`].

use lumen_math::{Real, INF};

use crate::lanes::{Lanes, Vec3l};
use crate::shade::{self, Hit, T_EPS};
use crate::view::{ClipRec, SceneView, ShapeRec, SurfaceRec};

/// Ray grid for one frame: `dir(x, y) = dir0 + x*hstep + y*vstep` where
/// `(x, y)` are pixel indices and `dir0` points at the center of pixel
/// `(0, 0)` on the image plane.
#[derive(Debug, Clone, Copy)]
pub struct RayGrid {
    /// Shared ray origin (the camera position).
    pub pos: [Real; 3],
    /// Direction to the center of pixel (0, 0).
    pub dir0: [Real; 3],
    /// Direction increment per pixel column.
    pub hstep: [Real; 3],
    /// Direction increment per pixel row.
    pub vstep: [Real; 3],
}

impl RayGrid {
    /// Scalar direction for a (sub)pixel position.
    #[inline]
    pub fn dir_at(&self, x: Real, y: Real) -> [Real; 3] {
        [
            self.dir0[0] + x * self.hstep[0] + y * self.vstep[0],
            self.dir0[1] + x * self.hstep[1] + y * self.vstep[1],
            self.dir0[2] + x * self.hstep[2] + y * self.vstep[2],
        ]
    }
}

/// Transform a packet of world directions into a surface's local frame.
#[inline]
fn packet_dir_to_local<L: Lanes>(rec: &SurfaceRec, d: Vec3l<L>) -> Vec3l<L> {
    let f = match &rec.inv {
        Some(inv) => {
            let l = &inv.lin;
            Vec3l {
                x: L::splat(l[0][0]) * d.x + L::splat(l[0][1]) * d.y + L::splat(l[0][2]) * d.z,
                y: L::splat(l[1][0]) * d.x + L::splat(l[1][1]) * d.y + L::splat(l[1][2]) * d.z,
                z: L::splat(l[2][0]) * d.x + L::splat(l[2][1]) * d.y + L::splat(l[2][2]) * d.z,
            }
        }
        None => d,
    };
    Vec3l {
        x: L::splat(rec.sgn[0]) * f.comp(rec.map[0]),
        y: L::splat(rec.sgn[1]) * f.comp(rec.map[1]),
        z: L::splat(rec.sgn[2]) * f.comp(rec.map[2]),
    }
}

/// Transform a packet of world points into a clipper's local frame.
#[inline]
fn packet_point_to_local<L: Lanes>(rec: &SurfaceRec, w: Vec3l<L>) -> Vec3l<L> {
    let f = match &rec.inv {
        Some(inv) => {
            let l = &inv.lin;
            Vec3l {
                x: L::splat(l[0][0]) * w.x
                    + L::splat(l[0][1]) * w.y
                    + L::splat(l[0][2]) * w.z
                    + L::splat(inv.pos[0]),
                y: L::splat(l[1][0]) * w.x
                    + L::splat(l[1][1]) * w.y
                    + L::splat(l[1][2]) * w.z
                    + L::splat(inv.pos[1]),
                z: L::splat(l[2][0]) * w.x
                    + L::splat(l[2][1]) * w.y
                    + L::splat(l[2][2]) * w.z
                    + L::splat(inv.pos[2]),
            }
        }
        None => w,
    };
    Vec3l {
        x: L::splat(rec.sgn[0]) * (f.comp(rec.map[0]) - L::splat(rec.pos[rec.map[0]])),
        y: L::splat(rec.sgn[1]) * (f.comp(rec.map[1]) - L::splat(rec.pos[rec.map[1]])),
        z: L::splat(rec.sgn[2]) * (f.comp(rec.map[2]) - L::splat(rec.pos[rec.map[2]])),
    }
}

/// Per-lane value of a surface's shape equation at local points.
#[inline]
fn packet_eval<L: Lanes>(rec: &SurfaceRec, l: Vec3l<L>) -> L {
    match rec.shape {
        ShapeRec::Plane => l.z,
        ShapeRec::Quadric { sci, sck, sqw } => {
            L::splat(sci[0]) * l.x * l.x + L::splat(sci[1]) * l.y * l.y
                + L::splat(sci[2]) * l.z * l.z
                - L::splat(sck) * l.z
                - L::splat(sqw)
        }
    }
}

/// Per-lane custom clipper evaluation; returns the keep mask.
fn packet_clip<L: Lanes>(view: &SceneView, rec: &SurfaceRec, w: Vec3l<L>, mut m: L) -> L {
    let clips = &view.clips[rec.clip_off as usize..(rec.clip_off + rec.clip_len) as usize];
    let zero = L::splat(0.0);
    let mut i = 0;
    while i < clips.len() {
        match clips[i] {
            ClipRec::AccumEnter => {
                let mut kept = zero.lt(zero); // all-false
                i += 1;
                while i < clips.len() && clips[i] != ClipRec::AccumLeave {
                    if let ClipRec::Surface { srf, outer } = clips[i] {
                        kept = kept | packet_clip_one(view, srf, outer, w);
                    }
                    i += 1;
                }
                m = m & kept;
            }
            ClipRec::Surface { srf, outer } => {
                m = m & packet_clip_one(view, srf, outer, w);
            }
            ClipRec::AccumLeave | ClipRec::Trnode { .. } => {}
        }
        if !L::any(m) {
            return m;
        }
        i += 1;
    }
    m
}

#[inline]
fn packet_clip_one<L: Lanes>(view: &SceneView, srf: u32, outer: bool, w: Vec3l<L>) -> L {
    let clip = &view.surfaces[srf as usize];
    let f = packet_eval(clip, packet_point_to_local(clip, w));
    let zero = L::splat(0.0);
    if outer {
        f.le(zero)
    } else {
        f.ge(zero)
    }
}

/// Per-lane nearest-hit state for a packet.
pub struct PacketState<L: Lanes> {
    /// Best `t` per lane.
    pub t: L,
    /// Winning surface index per lane, `-1` for a miss.
    pub idx: L,
}

impl<L: Lanes> PacketState<L> {
    /// Fresh state: all lanes miss at `t = inf`.
    pub fn new() -> Self {
        Self {
            t: L::splat(INF),
            idx: L::splat(-1.0),
        }
    }

    /// Resolved hit for one lane, if any.
    pub fn lane_hit(&self, lane: usize) -> Option<(Real, u32)> {
        let idx = self.idx.lane(lane);
        if idx < 0.0 {
            None
        } else {
            Some((self.t.lane(lane), idx as u32))
        }
    }
}

impl<L: Lanes> Default for PacketState<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Intersect a packet with one surface, updating per-lane winners.
pub fn intersect_packet<L: Lanes>(
    view: &SceneView,
    srf: u32,
    o: [Real; 3],
    d: Vec3l<L>,
    state: &mut PacketState<L>,
) {
    let rec = &view.surfaces[srf as usize];
    let ol = rec.to_local(o);
    let dl = packet_dir_to_local(rec, d);
    let olx = Vec3l {
        x: L::splat(ol[0]),
        y: L::splat(ol[1]),
        z: L::splat(ol[2]),
    };

    let try_accept = |t: L, valid: L, state: &mut PacketState<L>| {
        let mut m = valid & t.gt(L::splat(T_EPS)) & t.lt(state.t);
        if !L::any(m) {
            return;
        }
        // surface's own clipper box, in the local frame
        let lh = olx.mul_add(dl, t);
        m = m & lh.x.ge(L::splat(rec.cmin[0])) & lh.x.le(L::splat(rec.cmax[0]));
        m = m & lh.y.ge(L::splat(rec.cmin[1])) & lh.y.le(L::splat(rec.cmax[1]));
        m = m & lh.z.ge(L::splat(rec.cmin[2])) & lh.z.le(L::splat(rec.cmax[2]));
        if !L::any(m) {
            return;
        }
        if rec.clip_len > 0 {
            let w = Vec3l::splat(o).mul_add(d, t);
            m = packet_clip(view, rec, w, m);
            if !L::any(m) {
                return;
            }
        }
        state.t = L::select(m, t, state.t);
        state.idx = L::select(m, L::splat(srf as Real), state.idx);
    };

    match rec.shape {
        ShapeRec::Plane => {
            let t = -olx.z / dl.z;
            // lanes parallel to the plane produce inf/nan and fail the cmp
            let valid = t.gt(L::splat(-INF)) & t.lt(L::splat(INF));
            try_accept(t, valid, state);
        }
        ShapeRec::Quadric { sci, sck, .. } => {
            let csi = [L::splat(sci[0]), L::splat(sci[1]), L::splat(sci[2])];
            let a = csi[0] * dl.x * dl.x + csi[1] * dl.y * dl.y + csi[2] * dl.z * dl.z;
            let b = L::splat(2.0)
                * (csi[0] * olx.x * dl.x + csi[1] * olx.y * dl.y + csi[2] * olx.z * dl.z)
                - L::splat(sck) * dl.z;
            let c = L::splat(rec.eval(ol));
            let disc = b * b - L::splat(4.0) * a * c;
            let valid = disc.ge(L::splat(0.0));
            if !L::any(valid) {
                return;
            }
            let sq = disc.max(L::splat(0.0)).sqrt();
            let inv2a = L::splat(0.5) / a;
            let t1 = (-b - sq) * inv2a;
            let t2 = (-b + sq) * inv2a;
            // near root first so it wins the per-lane minimum
            try_accept(t1.min(t2), valid, state);
            try_accept(t1.max(t2), valid, state);
        }
    }
}

/// Resolve the per-lane winner into a scalar [`Hit`] and shade it.
pub fn shade_lane<L: Lanes>(
    view: &SceneView,
    grid: &RayGrid,
    state: &PacketState<L>,
    d: Vec3l<L>,
    lane: usize,
) -> [Real; 3] {
    match state.lane_hit(lane) {
        None => view.ambient,
        Some((t, srf)) => {
            let dir = [d.x.lane(lane), d.y.lane(lane), d.z.lane(lane)];
            let rec = &view.surfaces[srf as usize];
            let w = [
                grid.pos[0] + dir[0] * t,
                grid.pos[1] + dir[1] * t,
                grid.pos[2] + dir[2] * t,
            ];
            let l = rec.to_local(w);
            let dl = rec.dir_to_local(dir);
            let outer = dl[0] * rec.gradient(l)[0]
                + dl[1] * rec.gradient(l)[1]
                + dl[2] * rec.gradient(l)[2]
                < 0.0;
            shade::shade_hit(view, grid.pos, dir, Hit { t, srf, outer }, view.depth)
        }
    }
}
