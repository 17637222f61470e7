//! Per-surface parallel update phase.
//!
//! Phase 1 recomputes, for every surface independently: the bounding box
//! `bbox` (tight, finite) and clipping box `cbox` (may keep ±inf on
//! unclipped axes), the bounding polyhedron vertices/edges/faces, the
//! bounding sphere, and the flat backend record the tracer consumes.
//!
//! Box recalculation runs in the surface's *caching frame*: world space
//! for trivially-transformed surfaces, the trnode's local space otherwise.
//! Custom minus-outer clippers sharing the same trnode accumulate their
//! own shape clamps into the surface's cbox, which is how constructive
//! subtraction tightens bounds (a cylinder minus a sphere shrinks to the
//! sphere-occupied segment).

use std::sync::Mutex;

use lumen_math::{Real, INF};
use lumen_tracer::view::{ClipRec, InvXform, LightRec, ShapeRec, SurfaceRec};

use crate::error::{EngineError, Result};
use crate::object::{
    ClipElem, Graph, Node, NodeBody, NodeId, SurfKind, EDGES_LIMIT, FACES_LIMIT, OPT_ADJUST,
    VERTS_LIMIT,
};
use crate::registry::Registry;

/// One polyhedron edge with its dominant local axis (3 = none).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    /// First vertex index.
    pub v0: usize,
    /// Second vertex index.
    pub v1: usize,
    /// Dominant axis label.
    pub k: usize,
}

/// One polyhedron face with its axis labels (3 = none).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Face {
    /// Vertex indices, counter-clockwise.
    pub v: [usize; 4],
    /// Normal axis label.
    pub k: usize,
    /// First in-plane axis label.
    pub i: usize,
    /// Second in-plane axis label.
    pub j: usize,
}

/// Mutable per-surface state produced by phase 1.
#[derive(Debug, Clone)]
pub struct ShapeState {
    /// Frame-space bounding box.
    pub bmin: [Real; 3],
    /// Frame-space bounding box.
    pub bmax: [Real; 3],
    /// Frame-space clipping box.
    pub cmin: [Real; 3],
    /// Frame-space clipping box.
    pub cmax: [Real; 3],
    /// Local-frame bounding box.
    pub lbmin: [Real; 3],
    /// Local-frame bounding box.
    pub lbmax: [Real; 3],
    /// Local-frame clipping box.
    pub lcmin: [Real; 3],
    /// Local-frame clipping box.
    pub lcmax: [Real; 3],
    /// Bounding polyhedron vertices, world space.
    pub verts: Vec<[Real; 3]>,
    /// Polyhedron edges.
    pub edges: Vec<Edge>,
    /// Polyhedron faces.
    pub faces: Vec<Face>,
    /// Bounding sphere center.
    pub mid: [Real; 3],
    /// Bounding sphere radius.
    pub rad: Real,
    /// Surface geometry changed this frame.
    pub srf_changed: bool,
}

impl Default for ShapeState {
    fn default() -> Self {
        Self {
            bmin: [0.0; 3],
            bmax: [0.0; 3],
            cmin: [-INF; 3],
            cmax: [INF; 3],
            lbmin: [0.0; 3],
            lbmax: [0.0; 3],
            lcmin: [-INF; 3],
            lcmax: [INF; 3],
            verts: Vec::new(),
            edges: Vec::new(),
            faces: Vec::new(),
            mid: [0.0; 3],
            rad: 0.0,
            srf_changed: false,
        }
    }
}

/// Immutable view of the node fields the box math needs.
#[derive(Debug, Clone, Copy)]
struct SurfCtx {
    kind: SurfKind,
    smin: [Real; 3],
    smax: [Real; 3],
    map: [usize; 3],
    sgn: [i32; 3],
    pos: [Real; 3],
    self_trnode: bool,
}

impl SurfCtx {
    fn of(node: &Node, id: NodeId) -> Option<SurfCtx> {
        let srf = node.surface()?;
        Some(SurfCtx {
            kind: srf.kind,
            smin: srf.smin,
            smax: srf.smax,
            map: node.map,
            sgn: node.sgn,
            pos: node.pos,
            self_trnode: node.trnode == Some(id),
        })
    }

    fn pps(&self) -> [Real; 3] {
        if self.self_trnode {
            [0.0; 3]
        } else {
            self.pos
        }
    }
}

/// Frame-space box to local-space through the signed axis map.
fn invert_minmax(ctx: &SurfCtx, smin: [Real; 3], smax: [Real; 3]) -> ([Real; 3], [Real; 3]) {
    let pps = ctx.pps();
    let mut tmin = [0.0; 3];
    let mut tmax = [0.0; 3];
    for a in 0..3 {
        tmin[a] = if smin[a] == -INF { -INF } else { smin[a] - pps[a] };
        tmax[a] = if smax[a] == INF { INF } else { smax[a] - pps[a] };
    }
    let mut dmin = [0.0; 3];
    let mut dmax = [0.0; 3];
    for i in 0..3 {
        let m = ctx.map[i];
        if ctx.sgn[i] > 0 {
            dmin[i] = tmin[m];
            dmax[i] = tmax[m];
        } else {
            dmin[i] = -tmax[m];
            dmax[i] = -tmin[m];
        }
    }
    (dmin, dmax)
}

/// Local-space box to frame-space through the signed axis map.
fn direct_minmax(ctx: &SurfCtx, smin: [Real; 3], smax: [Real; 3]) -> ([Real; 3], [Real; 3]) {
    let pps = ctx.pps();
    let mut tmin = [0.0; 3];
    let mut tmax = [0.0; 3];
    for i in 0..3 {
        let m = ctx.map[i];
        if ctx.sgn[i] > 0 {
            tmin[m] = smin[i];
            tmax[m] = smax[i];
        } else {
            tmin[m] = -smax[i];
            tmax[m] = -smin[i];
        }
    }
    let mut dmin = [0.0; 3];
    let mut dmax = [0.0; 3];
    for a in 0..3 {
        dmin[a] = if tmin[a] == -INF { -INF } else { tmin[a] + pps[a] };
        dmax[a] = if tmax[a] == INF { INF } else { tmax[a] + pps[a] };
    }
    (dmin, dmax)
}

type BoxPair = ([Real; 3], [Real; 3]);

/// Shape-specific clamp of a source box into bbox and/or cbox, in the
/// surface's local frame.
fn adjust_minmax(
    ctx: &SurfCtx,
    smin: [Real; 3],
    smax: [Real; 3],
    want_b: bool,
    want_c: bool,
) -> (Option<BoxPair>, Option<BoxPair>) {
    let mut b = if want_b { Some((smin, smax)) } else { None };
    let mut c = if want_c {
        // the per-axis clip only applies where the declared box clips;
        // tighter bounds from custom clippers are tested exactly at trace
        // time, so the cbox opens to infinity there
        let mut cmin = [0.0; 3];
        let mut cmax = [0.0; 3];
        for a in 0..3 {
            cmin[a] = if smin[a] > ctx.smin[a] { -INF } else { smin[a] };
            cmax[a] = if smax[a] < ctx.smax[a] { INF } else { smax[a] };
        }
        Some((cmin, cmax))
    } else {
        None
    };

    // radius of the surface of revolution over the source K span
    let clamp_ij = |b: &mut Option<BoxPair>, c: &mut Option<BoxPair>, rad: [Real; 3], with_k: bool| {
        if let Some((bmin, bmax)) = b {
            for a in 0..if with_k { 3 } else { 2 } {
                bmin[a] = smin[a].max(-rad[a]);
                bmax[a] = smax[a].min(rad[a]);
            }
        }
        if let Some((cmin, cmax)) = c {
            for a in 0..if with_k { 3 } else { 2 } {
                if cmin[a] <= -rad[a] {
                    cmin[a] = -INF;
                }
                if cmax[a] >= rad[a] {
                    cmax[a] = INF;
                }
            }
        }
    };

    match ctx.kind {
        SurfKind::Plane => {
            if let Some((bmin, bmax)) = &mut b {
                bmin[2] = 0.0;
                bmax[2] = 0.0;
            }
            if let Some((cmin, cmax)) = &mut c {
                cmin[2] = -INF;
                cmax[2] = INF;
            }
        }
        SurfKind::Cylinder { rad } => {
            let r = rad.abs();
            clamp_ij(&mut b, &mut c, [r, r, 0.0], false);
        }
        SurfKind::Sphere { rad } => {
            let r = rad.abs();
            let mut radv = [r, r, r];
            for k in 0..3 {
                let top = if smin[k] > 0.0 {
                    smin[k]
                } else if smax[k] < 0.0 {
                    -smax[k]
                } else {
                    0.0
                };
                let rr = (r * r - top * top).max(0.0).sqrt();
                for other in [(k + 1) % 3, (k + 2) % 3] {
                    if radv[other] > rr {
                        radv[other] = rr;
                    }
                }
            }
            clamp_ij(&mut b, &mut c, radv, true);
        }
        SurfKind::Cone { rat } => {
            let top = smin[2].abs().max(smax[2].abs());
            let r = top * rat.abs();
            clamp_ij(&mut b, &mut c, [r, r, 0.0], false);
        }
        SurfKind::Paraboloid { par } => {
            let top = if par < 0.0 { -smin[2] } else { smax[2] }.max(0.0);
            let r = (top * par.abs()).sqrt();
            clamp_ij(&mut b, &mut c, [r, r, 0.0], false);
            if let Some((bmin, bmax)) = &mut b {
                if bmin[2] <= 0.0 && par > 0.0 {
                    bmin[2] = 0.0;
                }
                if bmax[2] >= 0.0 && par < 0.0 {
                    bmax[2] = 0.0;
                }
            }
            if let Some((cmin, cmax)) = &mut c {
                if cmin[2] <= 0.0 && par > 0.0 {
                    cmin[2] = -INF;
                }
                if cmax[2] >= 0.0 && par < 0.0 {
                    cmax[2] = INF;
                }
            }
        }
        SurfKind::Hyperboloid { rat, hyp } => {
            let top = smin[2].abs().max(smax[2].abs());
            let r = (top * top * rat * rat + hyp).max(0.0).sqrt();
            clamp_ij(&mut b, &mut c, [r, r, 0.0], false);
        }
    }
    (b, c)
}

/// Direct recomputation of bbox and cbox from the declared clipper box.
fn recalc_direct(ctx: &SurfCtx) -> (BoxPair, BoxPair, BoxPair, BoxPair) {
    let (b, c) = adjust_minmax(ctx, ctx.smin, ctx.smax, true, true);
    let (lb, lc) = (b.unwrap_or((ctx.smin, ctx.smax)), c.unwrap_or(([-INF; 3], [INF; 3])));
    (direct_minmax(ctx, lb.0, lb.1), direct_minmax(ctx, lc.0, lc.1), lb, lc)
}

/// Accumulate one clipper's bbox adjustments, in frame space.
///
/// Components the clipper leaves unconstrained come back as ±inf so the
/// caller's running intersection ignores them.
fn recalc_accum(clip_ctx: &SurfCtx, src: BoxPair) -> BoxPair {
    let (tmin, tmax) = invert_minmax(clip_ctx, src.0, src.1);
    let (b, _) = adjust_minmax(clip_ctx, tmin, tmax, true, false);
    let (bmin, bmax) = b.unwrap_or((tmin, tmax));
    let mut amin = [0.0; 3];
    let mut amax = [0.0; 3];
    for a in 0..3 {
        amin[a] = if tmin[a] == bmin[a] { -INF } else { bmin[a] };
        amax[a] = if tmax[a] == bmax[a] { INF } else { bmax[a] };
    }
    direct_minmax(clip_ctx, amin, amax)
}

/// Final recomputation from an accumulated frame-space source box.
fn recalc_final(ctx: &SurfCtx, src: BoxPair) -> (BoxPair, BoxPair, BoxPair, BoxPair) {
    let (mut tmin, mut tmax) = invert_minmax(ctx, src.0, src.1);
    for a in 0..3 {
        tmin[a] = tmin[a].max(ctx.smin[a]);
        tmax[a] = tmax[a].min(ctx.smax[a]);
    }
    let (b, c) = adjust_minmax(ctx, tmin, tmax, true, true);
    let (lb, lc) = (b.unwrap_or((tmin, tmax)), c.unwrap_or(([-INF; 3], [INF; 3])));
    (direct_minmax(ctx, lb.0, lb.1), direct_minmax(ctx, lc.0, lc.1), lb, lc)
}

/// Recompute a surface's bounding and clipping boxes.
pub fn update_minmax(graph: &Graph, opts: u32, id: NodeId, shape: &mut ShapeState) {
    let node = &graph.nodes[id];
    let Some(ctx) = SurfCtx::of(node, id) else { return };
    let srf = node.surface().expect("surface node");

    let mut srf_changed = node.obj_changed;

    let clip_qualifies = |elem: &ClipElem| -> Option<NodeId> {
        // only same-frame outer clippers of curved surfaces can tighten
        // this surface's boxes
        let ClipElem::Surface { node: cid, outer: true } = elem else {
            return None;
        };
        let c = &graph.nodes[*cid];
        match c.surface().map(|s| s.kind) {
            None | Some(SurfKind::Plane) => return None,
            _ => {}
        }
        if c.trnode != node.trnode {
            return None;
        }
        Some(*cid)
    };

    if srf.clip.is_empty() || ctx.self_trnode || opts & OPT_ADJUST == 0 {
        let (b, c, lb, lc) = recalc_direct(&ctx);
        (shape.bmin, shape.bmax) = b;
        (shape.cmin, shape.cmax) = c;
        (shape.lbmin, shape.lbmax) = lb;
        (shape.lcmin, shape.lcmax) = lc;
        shape.srf_changed = srf_changed;
        return;
    }

    for elem in &srf.clip {
        if let Some(cid) = clip_qualifies(elem) {
            srf_changed |= graph.nodes[cid].obj_changed;
        }
    }
    shape.srf_changed = srf_changed;
    if !srf_changed {
        return;
    }

    // baseline bbox from the shape alone
    let (b, _) = adjust_minmax(&ctx, ctx.smin, ctx.smax, true, false);
    let lb = b.unwrap_or((ctx.smin, ctx.smax));
    (shape.bmin, shape.bmax) = direct_minmax(&ctx, lb.0, lb.1);

    // accumulate clipper clamps into a frame-space box
    let mut acc: BoxPair = ([-INF; 3], [INF; 3]);
    let mut skip = false;
    for elem in &srf.clip {
        if matches!(elem, ClipElem::AccumEnter | ClipElem::AccumLeave) {
            skip = !skip;
            continue;
        }
        if skip {
            continue;
        }
        let Some(cid) = clip_qualifies(elem) else { continue };
        let cnode = &graph.nodes[cid];
        let Some(cctx) = SurfCtx::of(cnode, cid) else { continue };
        let adj = recalc_accum(&cctx, (shape.bmin, shape.bmax));
        for a in 0..3 {
            acc.0[a] = acc.0[a].max(adj.0[a]);
            acc.1[a] = acc.1[a].min(adj.1[a]);
        }
    }

    let (b, c, lb, lc) = recalc_final(&ctx, acc);
    (shape.bmin, shape.bmax) = b;
    (shape.cmin, shape.cmax) = c;
    (shape.lbmin, shape.lbmax) = lb;
    (shape.lcmin, shape.lcmax) = lc;
}

const QD_EDGES: [(usize, usize); 12] = [
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 0),
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
    (7, 6),
    (6, 5),
    (5, 4),
    (4, 7),
];

const QD_FACES: [[usize; 4]; 6] = [
    [0, 1, 2, 3],
    [0, 4, 5, 1],
    [1, 5, 6, 2],
    [2, 6, 7, 3],
    [3, 7, 4, 0],
    [7, 6, 5, 4],
];

/// True when the declared clipper box leaves the surface analytically
/// unbounded, so no polyhedron can enclose it.
fn verts_impossible(kind: SurfKind, smin: [Real; 3], smax: [Real; 3]) -> bool {
    match kind {
        SurfKind::Plane => {
            smin[0] == -INF || smin[1] == -INF || smax[0] == INF || smax[1] == INF
        }
        SurfKind::Sphere { .. } => false,
        SurfKind::Paraboloid { par } => {
            (smin[2] == -INF && par < 0.0) || (smax[2] == INF && par > 0.0)
        }
        _ => smin[2] == -INF || smax[2] == INF,
    }
}

/// Rebuild a surface's bounding polyhedron and bounding sphere.
pub fn update_verts(graph: &Graph, id: NodeId, shape: &mut ShapeState) -> Result<()> {
    let node = &graph.nodes[id];
    let Some(srf) = node.surface() else { return Ok(()) };

    if verts_impossible(srf.kind, srf.smin, srf.smax) {
        shape.verts.clear();
        shape.edges.clear();
        shape.faces.clear();
        shape.mid = [0.0; 3];
        shape.rad = 0.0;
        return Ok(());
    }

    let plane = matches!(srf.kind, SurfKind::Plane);
    let mp = node.map;
    let bmin = shape.bmin;
    let bmax = shape.bmax;

    // frame-space corners: 0-3 on the K top, 4-7 on the K bottom
    let corner = |ci: bool, cj: bool, ck: bool| -> [Real; 3] {
        let mut v = [0.0; 3];
        v[mp[0]] = if ci { bmax[mp[0]] } else { bmin[mp[0]] };
        v[mp[1]] = if cj { bmax[mp[1]] } else { bmin[mp[1]] };
        v[mp[2]] = if ck { bmax[mp[2]] } else { bmin[mp[2]] };
        v
    };
    let top = [
        corner(true, true, true),
        corner(false, true, true),
        corner(false, false, true),
        corner(true, false, true),
    ];
    let bot = [
        corner(true, true, false),
        corner(false, true, false),
        corner(false, false, false),
        corner(true, false, false),
    ];

    shape.verts.clear();
    shape.edges.clear();
    shape.faces.clear();

    let transformed = node.trnode.is_some();
    let pmtx = match node.trnode {
        Some(t) if t != id => Some(graph.nodes[t].mtx),
        Some(_) => Some(node.mtx),
        None => None,
    };

    let push_vert = |shape: &mut ShapeState, v: [Real; 3]| {
        let w = match &pmtx {
            Some(m) => {
                let p = lumen_math::mul_point(m, lumen_math::Vec3::new(v[0], v[1], v[2]));
                [p.x, p.y, p.z]
            }
            None => v,
        };
        shape.verts.push(w);
    };

    for v in top {
        push_vert(shape, v);
    }
    if !plane {
        for v in bot {
            push_vert(shape, v);
        }
    }

    // axis labels feed the tile projector; under a transform no world
    // axis dominates
    let lbl = |axis: usize| if transformed { 3 } else { mp[axis] };
    if plane {
        for (n, (v0, v1)) in QD_EDGES[..4].iter().enumerate() {
            shape.edges.push(Edge {
                v0: *v0,
                v1: *v1,
                k: lbl([0, 1, 0, 1][n]),
            });
        }
        shape.faces.push(Face {
            v: QD_FACES[0],
            k: lbl(2),
            i: lbl(0),
            j: lbl(1),
        });
    } else {
        const EDGE_AXIS: [usize; 12] = [0, 1, 0, 1, 2, 2, 2, 2, 0, 1, 0, 1];
        const FACE_AXIS: [(usize, usize, usize); 6] = [
            (2, 0, 1),
            (1, 2, 0),
            (0, 2, 1),
            (1, 2, 0),
            (0, 2, 1),
            (2, 0, 1),
        ];
        for (n, (v0, v1)) in QD_EDGES.iter().enumerate() {
            shape.edges.push(Edge {
                v0: *v0,
                v1: *v1,
                k: lbl(EDGE_AXIS[n]),
            });
        }
        for (n, vs) in QD_FACES.iter().enumerate() {
            let (k, i, j) = FACE_AXIS[n];
            shape.faces.push(Face {
                v: *vs,
                k: lbl(k),
                i: lbl(i),
                j: lbl(j),
            });
        }
    }

    if shape.verts.len() > VERTS_LIMIT
        || shape.edges.len() > EDGES_LIMIT
        || shape.faces.len() > FACES_LIMIT
    {
        return Err(EngineError::LimitExceeded(format!(
            "{} verts / {} edges / {} faces",
            shape.verts.len(),
            shape.edges.len(),
            shape.faces.len()
        )));
    }

    // bounding sphere: vertex centroid, max distance
    let n = shape.verts.len() as Real;
    let mut mid = [0.0; 3];
    for v in &shape.verts {
        for a in 0..3 {
            mid[a] += v[a] / n;
        }
    }
    let mut rad2: Real = 0.0;
    for v in &shape.verts {
        let d = [v[0] - mid[0], v[1] - mid[1], v[2] - mid[2]];
        rad2 = rad2.max(d[0] * d[0] + d[1] * d[1] + d[2] * d[2]);
    }
    shape.mid = mid;
    shape.rad = rad2.sqrt();
    Ok(())
}

/// Phase-1 body for one surface: boxes, polyhedron, sphere.
pub fn update_surface(graph: &Graph, opts: u32, id: NodeId, shape: &mut ShapeState) -> Result<()> {
    update_minmax(graph, opts, id, shape);
    if shape.srf_changed {
        update_verts(graph, id, shape)?;
    }
    Ok(())
}

/// Sequential post-phase-1 pass: array bounding spheres, widened by any
/// children grouped under them as bounding volumes.
pub fn update_array_bounds(graph: &mut Graph, shapes: &[Mutex<ShapeState>]) {
    update_array_bounds_rec(graph, shapes, graph.root);
}

fn update_array_bounds_rec(graph: &mut Graph, shapes: &[Mutex<ShapeState>], id: NodeId) {
    let children = match &graph.nodes[id].body {
        NodeBody::Array(arr) => arr.children.clone(),
        _ => return,
    };

    let mut mid = graph.nodes[id].pos;
    if let Some(t) = graph.nodes[id].trnode.filter(|t| *t != id) {
        for a in 0..3 {
            mid[a] += graph.nodes[t].pos[a];
        }
    }
    {
        let node = &mut graph.nodes[id];
        node.mid = mid;
        node.rad = 0.0;
    }

    for child in children {
        let (cmid, crad) = if graph.nodes[child].is_array() {
            update_array_bounds_rec(graph, shapes, child);
            (graph.nodes[child].mid, graph.nodes[child].rad)
        } else if let Some(ord) = graph.nodes[child].surface().map(|s| s.ord as usize) {
            let shape = shapes[ord].lock().expect("shape lock");
            (shape.mid, shape.rad)
        } else {
            continue;
        };
        let Some(bv) = graph.nodes[child].bvnode else { continue };
        let bmid = graph.nodes[bv].mid;
        let d = [cmid[0] - bmid[0], cmid[1] - bmid[1], cmid[2] - bmid[2]];
        let dist = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
        if graph.nodes[bv].rad < dist + crad {
            graph.nodes[bv].rad = dist + crad;
        }
    }
}

/// Assemble the flat backend records for the whole scene.
///
/// Runs on the coordinator after phase 1; the clipper element pool and
/// the per-surface records are rebuilt from scratch each frame.
pub fn build_backend(
    graph: &Graph,
    reg: &Registry,
    shapes: &[Mutex<ShapeState>],
) -> Result<(Vec<SurfaceRec>, Vec<ClipRec>)> {
    let mut recs = Vec::with_capacity(reg.surfaces.len());
    let mut clips = Vec::new();

    for (ord, &id) in reg.surfaces.iter().enumerate() {
        let node = &graph.nodes[id];
        let srf = node.surface().expect("surface node");
        let shape = shapes[ord].lock().expect("shape lock");

        let inv = match node.trnode {
            None => None,
            Some(t) => {
                let m = graph.nodes[t].inv.ok_or_else(|| {
                    EngineError::MalformedScene("singular transform on caching node".into())
                })?;
                Some(InvXform {
                    lin: [
                        [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
                        [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
                        [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
                    ],
                    pos: [m[(0, 3)], m[(1, 3)], m[(2, 3)]],
                })
            }
        };

        let shape_rec = match srf.kind {
            SurfKind::Plane => ShapeRec::Plane,
            SurfKind::Cylinder { rad } => ShapeRec::Quadric {
                sci: [1.0, 1.0, 0.0],
                sck: 0.0,
                sqw: rad * rad,
            },
            SurfKind::Sphere { rad } => ShapeRec::Quadric {
                sci: [1.0, 1.0, 1.0],
                sck: 0.0,
                sqw: rad * rad,
            },
            SurfKind::Cone { rat } => ShapeRec::Quadric {
                sci: [1.0, 1.0, -(rat * rat)],
                sck: 0.0,
                sqw: 0.0,
            },
            SurfKind::Paraboloid { par } => ShapeRec::Quadric {
                sci: [1.0, 1.0, 0.0],
                sck: par,
                sqw: 0.0,
            },
            SurfKind::Hyperboloid { rat, hyp } => ShapeRec::Quadric {
                sci: [1.0, 1.0, -(rat * rat)],
                sck: 0.0,
                sqw: hyp,
            },
        };

        // axis clip: test only where the cbox is finite, with the tighter
        // bbox values
        let mut cmin = [0.0; 3];
        let mut cmax = [0.0; 3];
        for a in 0..3 {
            cmin[a] = if shape.lcmin[a] == -INF { -INF } else { shape.lbmin[a] };
            cmax[a] = if shape.lcmax[a] == INF { INF } else { shape.lbmax[a] };
        }

        let clip_off = clips.len() as u32;
        for elem in &srf.clip {
            match elem {
                ClipElem::AccumEnter => clips.push(ClipRec::AccumEnter),
                ClipElem::AccumLeave => clips.push(ClipRec::AccumLeave),
                ClipElem::Trnode { count, .. } => {
                    clips.push(ClipRec::Trnode { count: *count as u32 })
                }
                ClipElem::Surface { node: cid, outer } => {
                    if let Some(csrf) = graph.nodes[*cid].surface() {
                        clips.push(ClipRec::Surface { srf: csrf.ord, outer: *outer });
                    }
                }
            }
        }
        let clip_len = clips.len() as u32 - clip_off;

        recs.push(SurfaceRec {
            shape: shape_rec,
            inv,
            map: node.map,
            sgn: [node.sgn[0] as Real, node.sgn[1] as Real, node.sgn[2] as Real],
            pos: if node.trnode == Some(id) { [0.0; 3] } else { node.pos },
            cmin,
            cmax,
            clip_off,
            clip_len,
            mat: srf.mat,
        });
    }

    Ok((recs, clips))
}

/// Build the flat light records, camera ambient included.
pub fn build_lights(graph: &Graph, reg: &Registry) -> (Vec<LightRec>, [Real; 3]) {
    let mut lights = Vec::with_capacity(reg.lights.len());
    let mut ambient = [0.0; 3];
    for &id in &reg.lights {
        let node = &graph.nodes[id];
        let NodeBody::Light(lgt) = &node.body else { continue };
        let col = lumen_tracer::unpack_xrgb(lgt.desc.col);
        for a in 0..3 {
            ambient[a] += col[a] * lgt.desc.lum_ambient;
        }
        lights.push(LightRec {
            pos: node.pos,
            col: [
                col[0] * lgt.desc.lum_source,
                col[1] * lgt.desc.lum_source,
                col[2] * lgt.desc.lum_source,
            ],
            rng: lgt.desc.atn[0],
            cnt: lgt.desc.atn[1] + 1.0,
            lnr: lgt.desc.atn[2],
            qdr: lgt.desc.atn[3],
        });
    }
    (lights, ambient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Graph, OPT_ALL};
    use lumen_math::{Transform3d, INF};
    use lumen_scene::{Body, MaterialDesc, ObjectDesc, RelKind, Relation, SceneDesc, SurfaceDesc};
    use std::sync::Arc;

    fn mat() -> Arc<MaterialDesc> {
        Arc::new(MaterialDesc::plain(0x00808080))
    }

    fn scene(children: Vec<ObjectDesc>, relations: Vec<Relation>) -> (Graph, Registry) {
        let desc = SceneDesc {
            root: ObjectDesc::new(Body::Array { children, relations }),
        };
        let mut reg = Registry::new(1 << 16, None);
        let mut graph = Graph::build(&desc, &mut reg).unwrap();
        graph.update(OPT_ALL, 0, true).unwrap();
        (graph, reg)
    }

    fn run_phase1(graph: &Graph, reg: &Registry) -> Vec<ShapeState> {
        reg.surfaces
            .iter()
            .map(|&id| {
                let mut shape = ShapeState::default();
                update_surface(graph, OPT_ALL, id, &mut shape).unwrap();
                shape
            })
            .collect()
    }

    #[test]
    fn test_plane_boxes() {
        let (graph, reg) = scene(
            vec![ObjectDesc::new(Body::Plane(
                SurfaceDesc::unbounded(mat()).clipped([-5.0, -5.0, -INF], [5.0, 5.0, INF]),
            ))],
            vec![],
        );
        let shapes = run_phase1(&graph, &reg);
        let s = &shapes[0];
        assert_eq!(s.bmin, [-5.0, -5.0, 0.0]);
        assert_eq!(s.bmax, [5.0, 5.0, 0.0]);
        assert_eq!(s.cmin[2], -INF);
        assert_eq!(s.cmax[2], INF);
        assert_eq!(s.verts.len(), 4);
        assert_eq!(s.edges.len(), 4);
        assert_eq!(s.faces.len(), 1);
        // bbox within cbox, sphere encloses bbox
        for a in 0..3 {
            assert!(s.bmin[a] >= s.cmin[a] && s.bmax[a] <= s.cmax[a]);
        }
        assert!(s.rad >= 5.0 * (2.0f32).sqrt() - 1e-3);
    }

    #[test]
    fn test_sphere_boxes_clamped_by_radius() {
        let (graph, reg) = scene(
            vec![ObjectDesc::new(Body::Sphere {
                srf: SurfaceDesc::unbounded(mat()),
                rad: 2.0,
            })],
            vec![],
        );
        let shapes = run_phase1(&graph, &reg);
        let s = &shapes[0];
        assert_eq!(s.bmin, [-2.0, -2.0, -2.0]);
        assert_eq!(s.bmax, [2.0, 2.0, 2.0]);
        // unbounded source: the cbox opens up everywhere
        assert_eq!(s.cmin, [-INF; 3]);
        assert_eq!(s.cmax, [INF; 3]);
        assert_eq!(s.verts.len(), 8);
        assert_eq!(s.edges.len(), 12);
        assert_eq!(s.faces.len(), 6);
    }

    #[test]
    fn test_sphere_cap_effective_radius() {
        // keep only the cap above k = 1: the I/J extent shrinks to
        // sqrt(4 - 1) = sqrt(3)
        let (graph, reg) = scene(
            vec![ObjectDesc::new(Body::Sphere {
                srf: SurfaceDesc::unbounded(mat()).clipped([-INF, -INF, 1.0], [INF, INF, INF]),
                rad: 2.0,
            })],
            vec![],
        );
        let shapes = run_phase1(&graph, &reg);
        let s = &shapes[0];
        let r3 = 3.0f32.sqrt();
        assert!((s.bmax[0] - r3).abs() < 1e-5);
        assert!((s.bmin[1] + r3).abs() < 1e-5);
        assert_eq!(s.bmin[2], 1.0);
        assert_eq!(s.bmax[2], 2.0);
        // the k clip stays active, i/j open up
        assert_eq!(s.cmin[2], 1.0);
        assert_eq!(s.cmin[0], -INF);
    }

    #[test]
    fn test_cylinder_minus_sphere_shrinks_k() {
        // cylinder r=1.5, k in [-4.5, 4.5], minus the outer space of a
        // unit sphere: the cylinder keeps only the sphere-occupied band
        let (graph, reg) = scene(
            vec![
                ObjectDesc::new(Body::Sphere {
                    srf: SurfaceDesc::unbounded(mat()),
                    rad: 1.0,
                }),
                ObjectDesc::new(Body::Cylinder {
                    srf: SurfaceDesc::unbounded(mat())
                        .clipped([-INF, -INF, -4.5], [INF, INF, 4.5]),
                    rad: 1.5,
                }),
            ],
            vec![Relation::new(1, RelKind::MinusOuter, 0)],
        );
        let shapes = run_phase1(&graph, &reg);
        let cyl = &shapes[1];
        assert!((cyl.bmin[2] + 1.0).abs() < 1e-5, "bmin {:?}", cyl.bmin);
        assert!((cyl.bmax[2] - 1.0).abs() < 1e-5, "bmax {:?}", cyl.bmax);
        // radial extent also tightens to the sphere's
        assert!((cyl.bmax[0] - 1.0).abs() < 1e-5);
        // the sphere itself is untouched
        let sph = &shapes[0];
        assert_eq!(sph.bmax, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_paraboloid_boxes() {
        let (graph, reg) = scene(
            vec![ObjectDesc::new(Body::Paraboloid {
                srf: SurfaceDesc::unbounded(mat()).clipped([-INF, -INF, -1.0], [INF, INF, 4.0]),
                par: 1.0,
            })],
            vec![],
        );
        let shapes = run_phase1(&graph, &reg);
        let s = &shapes[0];
        // radius at the rim: sqrt(top * par) = 2; k clamps at the apex
        assert_eq!(s.bmin[2], 0.0);
        assert_eq!(s.bmax[2], 4.0);
        assert!((s.bmax[0] - 2.0).abs() < 1e-5);
        assert_eq!(s.verts.len(), 8);
    }

    #[test]
    fn test_hyperboloid_boxes() {
        let (graph, reg) = scene(
            vec![ObjectDesc::new(Body::Hyperboloid {
                srf: SurfaceDesc::unbounded(mat()).clipped([-INF, -INF, -2.0], [INF, INF, 2.0]),
                rat: 0.5,
                hyp: 1.0,
            })],
            vec![],
        );
        let shapes = run_phase1(&graph, &reg);
        let s = &shapes[0];
        let r = (2.0f32 * 2.0 * 0.25 + 1.0).sqrt();
        assert!((s.bmax[0] - r).abs() < 1e-5);
        assert_eq!(s.bmin[2], -2.0);
        assert_eq!(s.verts.len(), 8);
    }

    #[test]
    fn test_open_clip_box_gives_no_polyhedron() {
        let (graph, reg) = scene(
            vec![ObjectDesc::new(Body::Cylinder {
                srf: SurfaceDesc::unbounded(mat()),
                rad: 1.0,
            })],
            vec![],
        );
        let shapes = run_phase1(&graph, &reg);
        assert!(shapes[0].verts.is_empty());
        assert!(shapes[0].edges.is_empty());
        assert_eq!(shapes[0].rad, 0.0);
    }

    #[test]
    fn test_transformed_surface_world_verts() {
        let trm = Transform3d {
            scl: [1.0; 3],
            rot: [0.0, 0.0, 45.0],
            pos: [10.0, 0.0, 0.0],
        };
        let (graph, reg) = scene(
            vec![ObjectDesc::with_trm(
                trm,
                Body::Sphere {
                    srf: SurfaceDesc::unbounded(mat()),
                    rad: 1.0,
                },
            )],
            vec![],
        );
        let shapes = run_phase1(&graph, &reg);
        let s = &shapes[0];
        assert_eq!(s.verts.len(), 8);
        // vertices carry world coordinates around (10, 0, 0)
        assert!((s.mid[0] - 10.0).abs() < 1e-4, "mid {:?}", s.mid);
        // under a transform the axis labels carry the sentinel
        assert!(s.edges.iter().all(|e| e.k == 3));
        assert!(s.faces.iter().all(|f| f.k == 3));
    }

    #[test]
    fn test_bvnode_widens_array_sphere() {
        let far_sphere = ObjectDesc::with_trm(
            Transform3d {
                scl: [1.0; 3],
                rot: [0.0; 3],
                pos: [5.0, 0.0, 0.0],
            },
            Body::Sphere {
                srf: SurfaceDesc::unbounded(mat()).clipped([-1.0, -1.0, -1.0], [1.0, 1.0, 1.0]),
                rad: 1.0,
            },
        );
        let (mut graph, reg) = scene(
            vec![far_sphere],
            vec![Relation::new(-1, RelKind::BoundIndex, 0)],
        );
        let shapes: Vec<Mutex<ShapeState>> = run_phase1(&graph, &reg)
            .into_iter()
            .map(Mutex::new)
            .collect();
        update_array_bounds(&mut graph, &shapes);
        let root = graph.root;
        // the root array's sphere must reach the far child
        let d = 5.0 + shapes[0].lock().unwrap().rad;
        assert!((graph.nodes[root].rad - d).abs() < 1e-4);
    }

    #[test]
    fn test_backend_records() {
        let (graph, reg) = scene(
            vec![
                ObjectDesc::new(Body::Sphere {
                    srf: SurfaceDesc::unbounded(mat()),
                    rad: 1.0,
                }),
                ObjectDesc::new(Body::Cylinder {
                    srf: SurfaceDesc::unbounded(mat())
                        .clipped([-INF, -INF, -2.0], [INF, INF, 2.0]),
                    rad: 1.5,
                }),
            ],
            vec![Relation::new(1, RelKind::MinusOuter, 0)],
        );
        let shapes: Vec<Mutex<ShapeState>> = run_phase1(&graph, &reg)
            .into_iter()
            .map(Mutex::new)
            .collect();
        let (recs, clips) = build_backend(&graph, &reg, &shapes).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0], ClipRec::Surface { srf: 0, outer: true });
        assert_eq!(recs[1].clip_len, 1);
        assert!(recs[0].inv.is_none());
        match recs[0].shape {
            ShapeRec::Quadric { sqw, .. } => assert_eq!(sqw, 1.0),
            _ => panic!("sphere must be a quadric"),
        }
    }
}
