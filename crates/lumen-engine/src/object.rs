//! Objects hierarchy and the sequential update phase.
//!
//! Phase 0 walks the tree from the root: it fires animation hooks, composes
//! transform matrices, chooses transform-caching nodes (*trnodes*), and
//! rebuilds each surface's custom clipper list from the arrays' relation
//! lists. It runs on the coordinator only; everything it builds is read-only
//! for the parallel phases that follow.
//!
//! A trnode is the nearest ancestor-or-self whose own transform is
//! non-trivial. Objects below a trnode keep matrices *relative* to it, so
//! the backend applies one inverse transform for the whole group; objects
//! with trivial transforms all the way up carry a signed axis permutation
//! instead of a matrix.

use lumen_math::{
    axis_map, invert, mat_from_transform, translation, Mat4, Real, Transform3d, CLIP_THRESHOLD,
};
use lumen_scene::{
    AnimFn, Body, CameraDesc, LightDesc, ObjectDesc, RelKind, Relation, SceneDesc,
};

use crate::error::{EngineError, Result};
use crate::registry::Registry;

/// Index of a node in the scene graph slab.
pub type NodeId = usize;

/// Non-trivial scale present.
pub const FLAG_SCL: u8 = 1 << 0;
/// Non-trivial rotation present.
pub const FLAG_ROT: u8 = 1 << 1;

/// Allow scale-only transforms to keep the axis-mapped fast path.
pub const OPT_FSCALE: u32 = 1 << 0;
/// Enable transform caching through array trnodes.
pub const OPT_TARRAY: u32 = 1 << 1;
/// Enable clipper-driven bounding box tightening.
pub const OPT_ADJUST: u32 = 1 << 2;
/// Enable bounding-volume array grouping.
pub const OPT_VARRAY: u32 = 1 << 3;
/// Enable incremental (changed-subtree-only) updates.
pub const OPT_UPDATE: u32 = 1 << 4;

/// All option bits the engine understands.
pub const OPT_ALL: u32 = OPT_FSCALE | OPT_TARRAY | OPT_ADJUST | OPT_VARRAY | OPT_UPDATE;

/// Hard cap on generated polyhedron vertices per surface.
pub const VERTS_LIMIT: usize = 8;
/// Hard cap on generated polyhedron edges per surface.
pub const EDGES_LIMIT: usize = 12;
/// Hard cap on generated polyhedron faces per surface.
pub const FACES_LIMIT: usize = 6;

/// Analytic surface variant with its shape scalars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurfKind {
    /// Plane `k = 0`.
    Plane,
    /// Cylinder of the given radius along K.
    Cylinder {
        /// Radius.
        rad: Real,
    },
    /// Sphere of the given radius.
    Sphere {
        /// Radius.
        rad: Real,
    },
    /// Cone with the given radius-to-height ratio.
    Cone {
        /// Ratio.
        rat: Real,
    },
    /// Paraboloid with the given focal parameter.
    Paraboloid {
        /// Parameter; sign selects the opening direction.
        par: Real,
    },
    /// Hyperboloid of one sheet.
    Hyperboloid {
        /// Asymptote slope.
        rat: Real,
        /// Waist radius squared.
        hyp: Real,
    },
}

/// One element of a surface's custom clipper list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClipElem {
    /// Open an accumulation segment.
    AccumEnter,
    /// Close an accumulation segment.
    AccumLeave,
    /// Transform-group marker for the `count` clippers that follow.
    Trnode {
        /// The shared trnode.
        node: NodeId,
        /// Clippers grouped under this marker.
        count: usize,
    },
    /// A clipper surface; `outer` selects which subspace is subtracted.
    Surface {
        /// Clipper node.
        node: NodeId,
        /// True for minus-outer.
        outer: bool,
    },
}

/// Surface-specific node payload.
#[derive(Debug, Clone)]
pub struct SurfaceData {
    /// Shape variant.
    pub kind: SurfKind,
    /// Declared local clipper box minimum.
    pub smin: [Real; 3],
    /// Declared local clipper box maximum.
    pub smax: [Real; 3],
    /// Outer/inner material indices.
    pub mat: [u32; 2],
    /// Ordinal in the registry's surface list.
    pub ord: u32,
    /// Custom clipper list, rebuilt every phase 0.
    pub clip: Vec<ClipElem>,
}

/// Array-specific node payload.
#[derive(Debug, Clone)]
pub struct ArrayData {
    /// Children in draw order.
    pub children: Vec<NodeId>,
    /// Relations between immediate children.
    pub relations: Vec<Relation>,
    /// Separated axis-remap matrix passed to children when this array's
    /// only non-trivial transform is scaling.
    pub axm: Mat4,
}

/// Camera-specific node payload.
#[derive(Debug, Clone)]
pub struct CameraData {
    /// Description.
    pub desc: CameraDesc,
    /// Focal distance after clamping.
    pub pov: Real,
    /// Sine of the current heading, for heading-relative movement.
    pub hor_sin: Real,
    /// Cosine of the current heading.
    pub hor_cos: Real,
    /// Set by interactive actions; folded into the next update.
    pub changed: bool,
}

/// Light-specific node payload.
#[derive(Debug, Clone)]
pub struct LightData {
    /// Description.
    pub desc: LightDesc,
}

/// Tag-dependent node payload.
#[derive(Debug, Clone)]
pub enum NodeBody {
    /// Interior array node.
    Array(ArrayData),
    /// Camera.
    Camera(CameraData),
    /// Point light.
    Light(LightData),
    /// Analytic surface.
    Surface(SurfaceData),
}

/// One scene-graph node.
#[derive(Clone)]
pub struct Node {
    /// Parent link; `None` for the root.
    pub parent: Option<NodeId>,
    /// Payload.
    pub body: NodeBody,
    /// Working copy of the transform; animation mutates this.
    pub trm: Transform3d,
    /// Animation hook.
    pub anim: Option<AnimFn>,
    /// Last seen time, `-1` before the first update.
    pub time: i64,
    /// Changed in the current phase 0.
    pub obj_changed: bool,
    /// This node's own transform flags.
    pub obj_has_trm: u8,
    /// Full-matrix transform flags including ancestor contributions.
    pub mtx_has_trm: u8,
    /// Transform matrix; world-space, or relative to the trnode when
    /// transform caching applies.
    pub mtx: Mat4,
    /// Inverse matrix, kept for self-trnode nodes.
    pub inv: Option<Mat4>,
    /// Nearest ancestor-or-self with a non-trivial own transform.
    pub trnode: Option<NodeId>,
    /// Bounding-volume array this node was grouped under.
    pub bvnode: Option<NodeId>,
    /// Axis map: which frame axis each local axis reads.
    pub map: [usize; 3],
    /// Axis map signs.
    pub sgn: [i32; 3],
    /// Translation part of `mtx`.
    pub pos: [Real; 3],
    /// Bounding sphere center (arrays only; surfaces keep theirs in the
    /// per-surface shape state).
    pub mid: [Real; 3],
    /// Bounding sphere radius (arrays only).
    pub rad: Real,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("parent", &self.parent)
            .field("body", &self.body)
            .field("trm", &self.trm)
            .field("anim", &self.anim.as_ref().map(|_| "<fn>"))
            .field("time", &self.time)
            .field("obj_changed", &self.obj_changed)
            .field("obj_has_trm", &self.obj_has_trm)
            .field("mtx_has_trm", &self.mtx_has_trm)
            .field("mtx", &self.mtx)
            .field("inv", &self.inv)
            .field("trnode", &self.trnode)
            .field("bvnode", &self.bvnode)
            .field("map", &self.map)
            .field("sgn", &self.sgn)
            .field("pos", &self.pos)
            .field("mid", &self.mid)
            .field("rad", &self.rad)
            .finish()
    }
}

impl Node {
    fn new(parent: Option<NodeId>, trm: Transform3d, anim: Option<AnimFn>, body: NodeBody) -> Self {
        Self {
            parent,
            body,
            trm,
            anim,
            time: -1,
            obj_changed: false,
            obj_has_trm: 0,
            mtx_has_trm: 0,
            mtx: Mat4::identity(),
            inv: None,
            trnode: None,
            bvnode: None,
            map: [0, 1, 2],
            sgn: [1; 3],
            pos: [0.0; 3],
            mid: [0.0; 3],
            rad: 0.0,
        }
    }

    /// True for surface nodes.
    pub fn is_surface(&self) -> bool {
        matches!(self.body, NodeBody::Surface(_))
    }

    /// True for array nodes.
    pub fn is_array(&self) -> bool {
        matches!(self.body, NodeBody::Array(_))
    }

    /// Surface payload accessor.
    pub fn surface(&self) -> Option<&SurfaceData> {
        match &self.body {
            NodeBody::Surface(s) => Some(s),
            _ => None,
        }
    }
}

/// The scene graph: a slab of nodes plus the root id.
pub struct Graph {
    /// Node slab; all weak links index into it.
    pub nodes: Vec<Node>,
    /// Root array.
    pub root: NodeId,
}

impl Graph {
    /// Build the graph from a scene description, registering cameras,
    /// lights, surfaces, arrays and materials along the way.
    ///
    /// Children with unsupported tags are skipped and the effective child
    /// count shrinks accordingly.
    pub fn build(desc: &SceneDesc, reg: &mut Registry) -> Result<Graph> {
        let mut nodes = Vec::new();
        let root = build_object(&desc.root, None, &mut nodes, reg)?
            .ok_or_else(|| EngineError::MalformedScene("root object unsupported".into()))?;
        if !nodes[root].is_array() {
            return Err(EngineError::MalformedScene("scene root must be an array".into()));
        }
        Ok(Graph { nodes, root })
    }

    /// Phase 0: sequential update of the whole hierarchy.
    ///
    /// `force` marks the root subtree changed regardless of animation, as
    /// on the first frame or when incremental updates are disabled.
    pub fn update(&mut self, opts: u32, time: i64, force: bool) -> Result<()> {
        let iden = Mat4::identity();
        update_object(&mut self.nodes, opts, self.root, time, &iden, 0, force)
    }
}

fn build_object(
    desc: &ObjectDesc,
    parent: Option<NodeId>,
    nodes: &mut Vec<Node>,
    reg: &mut Registry,
) -> Result<Option<NodeId>> {
    if nodes.len() >= reg.max_nodes {
        return Err(EngineError::AllocExhausted(nodes.len()));
    }

    let id = nodes.len();
    let body = match &desc.body {
        Body::Other(tag) => {
            log::warn!("skipping unsupported object tag '{tag}'");
            return Ok(None);
        }
        Body::Array { children, relations } => {
            nodes.push(Node::new(
                parent,
                desc.trm,
                desc.anim.clone(),
                NodeBody::Array(ArrayData {
                    children: Vec::new(),
                    relations: relations.clone(),
                    axm: Mat4::identity(),
                }),
            ));
            reg.arrays.push(id);
            let mut ids = Vec::with_capacity(children.len());
            for child in children {
                if let Some(cid) = build_object(child, Some(id), nodes, reg)? {
                    ids.push(cid);
                }
            }
            if let NodeBody::Array(arr) = &mut nodes[id].body {
                arr.children = ids;
            }
            return Ok(Some(id));
        }
        Body::Camera(cam) => {
            reg.cameras.push(id);
            let pov = if cam.pov <= 0.0 {
                1.0
            } else {
                cam.pov.max(2.0 * CLIP_THRESHOLD)
            };
            NodeBody::Camera(CameraData {
                desc: cam.clone(),
                pov,
                hor_sin: 0.0,
                hor_cos: 1.0,
                changed: false,
            })
        }
        Body::Light(lgt) => {
            reg.lights.push(id);
            NodeBody::Light(LightData { desc: lgt.clone() })
        }
        surface => {
            let (kind, srf) = match surface {
                Body::Plane(s) => (SurfKind::Plane, s),
                Body::Cylinder { srf, rad } => (SurfKind::Cylinder { rad: *rad }, srf),
                Body::Sphere { srf, rad } => (SurfKind::Sphere { rad: *rad }, srf),
                Body::Cone { srf, rat } => (SurfKind::Cone { rat: *rat }, srf),
                Body::Paraboloid { srf, par } => (SurfKind::Paraboloid { par: *par }, srf),
                Body::Hyperboloid { srf, rat, hyp } => {
                    (SurfKind::Hyperboloid { rat: *rat, hyp: *hyp }, srf)
                }
                _ => unreachable!("array/camera/light handled above"),
            };
            if let SurfKind::Cylinder { rad } | SurfKind::Sphere { rad } = kind {
                if rad == 0.0 {
                    return Err(EngineError::MalformedScene("zero surface radius".into()));
                }
            }
            let outer = reg.add_material(&srf.outer)?;
            let inner = reg.add_material(&srf.inner)?;
            let ord = reg.surfaces.len() as u32;
            reg.surfaces.push(id);
            NodeBody::Surface(SurfaceData {
                kind,
                smin: srf.cmin,
                smax: srf.cmax,
                mat: [outer, inner],
                ord,
                clip: Vec::new(),
            })
        }
    };
    nodes.push(Node::new(parent, desc.trm, desc.anim.clone(), body));
    Ok(Some(id))
}

/// Phase-0 update of one object and, for arrays, its subtree.
fn update_object(
    nodes: &mut Vec<Node>,
    opts: u32,
    id: NodeId,
    time: i64,
    pmtx: &Mat4,
    pflags: u8,
    pchanged: bool,
) -> Result<()> {
    // animation fires only when the time actually moved
    let obj_changed = {
        let node = &mut nodes[id];
        if let Some(anim) = node.anim.clone() {
            if node.time != time {
                anim(time, node.time.max(0), &mut node.trm);
            }
        }
        let mut changed = pchanged || node.anim.is_some();
        if let NodeBody::Camera(cam) = &node.body {
            changed = changed || cam.changed;
        }
        node.time = time;
        node.bvnode = None;
        node.obj_changed = changed;
        changed
    };

    if obj_changed {
        update_transform(nodes, opts, id, pmtx, pflags);
    }

    // per-body continuation
    match kind_of(nodes, id) {
        Kind::Camera => {
            if obj_changed {
                let rot_z = nodes[id].trm.rot[2];
                if let NodeBody::Camera(cam) = &mut nodes[id].body {
                    cam.hor_sin = lumen_math::sind(rot_z);
                    cam.hor_cos = lumen_math::cosd(rot_z);
                    cam.changed = false;
                }
            }
        }
        Kind::Light => {}
        Kind::Surface => {
            // the clipper list is rebuilt by the owning arrays below
            if let NodeBody::Surface(srf) = &mut nodes[id].body {
                srf.clip.clear();
            }
            if obj_changed
                && nodes[id].trnode == Some(id)
                && nodes[id].mtx_has_trm & FLAG_ROT != 0
            {
                // all rotation lives in the matrix now
                nodes[id].map = [0, 1, 2];
                nodes[id].sgn = [1; 3];
            }
        }
        Kind::Array => {
            let children = array_children(nodes, id);
            let own_flags = nodes[id].obj_has_trm;

            // pass the separated axis remap when scaling is the array's
            // only non-trivial transform
            let scale_only =
                nodes[id].trnode == Some(id) && nodes[id].mtx_has_trm == FLAG_SCL;
            let child_mtx = if scale_only {
                if obj_changed {
                    let (map, sgn) = (nodes[id].map, nodes[id].sgn);
                    let mut axm = Mat4::zeros();
                    axm[(3, 3)] = 1.0;
                    for i in 0..3 {
                        axm[(map[i], i)] = sgn[i] as Real;
                    }
                    if let NodeBody::Array(arr) = &mut nodes[id].body {
                        arr.axm = axm;
                    }
                }
                match &nodes[id].body {
                    NodeBody::Array(arr) => arr.axm,
                    _ => unreachable!("array node"),
                }
            } else {
                nodes[id].mtx
            };

            for child in children {
                update_object(
                    nodes,
                    opts,
                    child,
                    time,
                    &child_mtx,
                    pflags | own_flags,
                    obj_changed,
                )?;
            }

            // rebuild relations after the whole subtree settled its
            // transform flags, so trnode markers resolve correctly
            process_relations(nodes, opts, id);
        }
    }

    Ok(())
}

/// Coarse node kind, used to sidestep holding a body borrow across
/// subtree mutation.
#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Array,
    Camera,
    Light,
    Surface,
}

fn kind_of(nodes: &[Node], id: NodeId) -> Kind {
    match &nodes[id].body {
        NodeBody::Array(_) => Kind::Array,
        NodeBody::Camera(_) => Kind::Camera,
        NodeBody::Light(_) => Kind::Light,
        NodeBody::Surface(_) => Kind::Surface,
    }
}

/// Transform-flag computation, trnode resolution and matrix composition.
fn update_transform(nodes: &mut Vec<Node>, opts: u32, id: NodeId, pmtx: &Mat4, pflags: u8) {
    let parent = nodes[id].parent;

    let mut obj_has = 0u8;
    if !nodes[id].trm.has_trivial_scale() {
        obj_has |= FLAG_SCL;
    }
    if !nodes[id].trm.has_trivial_rot() {
        obj_has |= FLAG_ROT;
    }
    // without free scaling, any non-trivial scale takes the full matrix path
    if obj_has != 0 && opts & OPT_FSCALE == 0 {
        obj_has = FLAG_SCL | FLAG_ROT;
    }
    let mtx_has = obj_has | pflags;

    // nearest ancestor with a non-trivial own transform
    let mut trnode = parent;
    while let Some(t) = trnode {
        if nodes[t].obj_has_trm != 0 {
            break;
        }
        trnode = nodes[t].parent;
    }

    let local = mat_from_transform(&nodes[id].trm);
    let mtx = if trnode.is_some() && trnode == parent && obj_has == 0 && mtx_has & FLAG_ROT != 0 {
        // the parent already carries the subtree transform: cache by
        // keeping this matrix relative to it
        local
    } else if let Some(t) = trnode.filter(|t| Some(*t) != parent && obj_has != 0) {
        // own non-trivial transform below a cached chain: recombine
        // through the trnode for the full matrix
        nodes[t].mtx * *pmtx * local
    } else {
        *pmtx * local
    };

    let mut trnode = if obj_has != 0 { Some(id) } else { trnode };
    let mut mtx = mtx;

    // non-surface, non-array objects (and everything when caching is off)
    // always collapse to a full world-space matrix
    let cacheable = nodes[id].is_surface() || nodes[id].is_array();
    if let Some(t) = trnode.filter(|t| *t != id) {
        if opts & OPT_TARRAY == 0 || !cacheable {
            mtx = nodes[t].mtx * mtx;
            trnode = Some(id);
        }
    }

    {
        let node = &mut nodes[id];
        node.obj_has_trm = obj_has;
        node.mtx_has_trm = mtx_has;
        node.mtx = mtx;
        node.trnode = trnode;
        node.pos = translation(&mtx).into();
    }

    // axis mapping for trivially-transformed nodes and the scale-only case
    if cacheable {
        let node = &nodes[id];
        if node.trnode != Some(id) || node.mtx_has_trm == FLAG_SCL {
            if let Some(am) = axis_map(&node.mtx) {
                let scale_only = node.trnode == Some(id) && node.mtx_has_trm == FLAG_SCL;
                let node = &mut nodes[id];
                node.map = am.map;
                node.sgn = am.sgn;
                if scale_only {
                    // the permutation moves into map/sgn; the matrix keeps
                    // only the absolute scale on its diagonal
                    for col in 0..3 {
                        for row in 0..3 {
                            node.mtx[(row, col)] = 0.0;
                        }
                    }
                    for i in 0..3 {
                        node.mtx[(am.map[i], am.map[i])] = am.scl[i];
                    }
                }
            }
        }
        // self-trnodes carry their inverse for the backend
        if nodes[id].trnode == Some(id) {
            let m = nodes[id].mtx;
            nodes[id].inv = invert(&m);
        }
    }
}

/// Template element produced by an array's relation walk.
#[derive(Debug, Clone, Copy)]
enum TmplElem {
    Enter,
    Leave,
    Clip { node: NodeId, outer: bool },
}

fn array_children(nodes: &[Node], id: NodeId) -> Vec<NodeId> {
    match &nodes[id].body {
        NodeBody::Array(arr) => arr.children.clone(),
        _ => Vec::new(),
    }
}

/// Walk an array's relation list, delivering clipper templates to the
/// left-hand surfaces and bounding-volume edits to the named children.
fn process_relations(nodes: &mut Vec<Node>, opts: u32, id: NodeId) {
    let relations = match &nodes[id].body {
        NodeBody::Array(arr) if !arr.relations.is_empty() => arr.relations.clone(),
        _ => return,
    };
    let children = array_children(nodes, id);

    let mut left = children.clone();
    let mut right = children.clone();
    let mut pending: Vec<TmplElem> = Vec::new();
    let mut acc = false;

    for rel in relations {
        if rel.obj1 >= left.len() as i32 || rel.obj2 >= right.len() as i32 || rel.obj1 < -1 || rel.obj2 < -1 {
            continue;
        }
        let o1 = rel.obj1;
        let o2 = rel.obj2;

        match rel.kind {
            RelKind::IndexArray => {
                if o1 >= 0 && nodes[left[o1 as usize]].is_array() {
                    left = array_children(nodes, left[o1 as usize]);
                }
                if o2 >= 0 && nodes[right[o2 as usize]].is_array() {
                    right = array_children(nodes, right[o2 as usize]);
                }
            }

            RelKind::MinusInner | RelKind::MinusOuter => {
                if o2 < 0 {
                    continue;
                }
                let outer = rel.kind == RelKind::MinusOuter;
                if o1 == -1 && !acc {
                    acc = true;
                    pending.push(TmplElem::Enter);
                }
                let elem = TmplElem::Clip {
                    node: right[o2 as usize],
                    outer,
                };
                right = children.clone();
                if o1 == -1 {
                    pending.push(elem);
                } else {
                    add_relation(nodes, left[o1 as usize], &[elem]);
                    left = children.clone();
                }
            }

            RelKind::MinusAccum => {
                if o1 >= 0 && o2 == -1 && acc {
                    acc = false;
                    pending.push(TmplElem::Leave);
                    add_relation(nodes, left[o1 as usize], &pending);
                    pending.clear();
                    left = children.clone();
                }
            }

            RelKind::BoundArray | RelKind::UntieArray => {
                let mode = rel.kind == RelKind::BoundArray;
                let target = if o1 == -1 && o2 == -1 {
                    Some(id)
                } else if o1 == -1 && o2 >= 0 && nodes[right[o2 as usize]].is_array() {
                    Some(right[o2 as usize])
                } else {
                    None
                };
                if let Some(arr) = target {
                    if opts & OPT_VARRAY != 0 {
                        update_bvnode(nodes, arr, arr, mode);
                    }
                    if o2 >= 0 {
                        right = children.clone();
                    }
                }
            }

            RelKind::BoundIndex | RelKind::UntieIndex => {
                let mode = rel.kind == RelKind::BoundIndex;
                if o2 < 0 {
                    continue;
                }
                let obj = right[o2 as usize];
                let arr = if o1 == -1 {
                    Some(id)
                } else if nodes[left[o1 as usize]].is_array() {
                    Some(left[o1 as usize])
                } else {
                    None
                };
                if let Some(arr) = arr {
                    if opts & OPT_VARRAY != 0 {
                        update_bvnode(nodes, obj, arr, mode);
                    }
                    if o1 >= 0 {
                        left = children.clone();
                    }
                    right = children.clone();
                }
            }
        }
    }
}

/// Attach or detach a bounding-volume array on a node (and, for arrays,
/// its whole subtree). Cameras and lights are not grouped.
fn update_bvnode(nodes: &mut Vec<Node>, target: NodeId, bv: NodeId, mode: bool) {
    match kind_of(nodes, target) {
        Kind::Camera | Kind::Light => return,
        Kind::Array | Kind::Surface => {}
    }
    if bv != target {
        if mode && nodes[target].bvnode.is_none() {
            nodes[target].bvnode = Some(bv);
        }
        if !mode && nodes[target].bvnode == Some(bv) {
            nodes[target].bvnode = None;
        }
    }
    if kind_of(nodes, target) == Kind::Array {
        for child in array_children(nodes, target) {
            update_bvnode(nodes, child, bv, mode);
        }
    }
}

/// Deliver a clipper template to a node: arrays forward it to their whole
/// subtree, surfaces merge it into their custom clipper list.
fn add_relation(nodes: &mut Vec<Node>, id: NodeId, tmpl: &[TmplElem]) {
    match kind_of(nodes, id) {
        Kind::Array => {
            for child in array_children(nodes, id) {
                add_relation(nodes, child, tmpl);
            }
        }
        Kind::Surface => {
            let mut seg_start: Option<usize> = None;
            for elem in tmpl {
                match *elem {
                    TmplElem::Enter => {
                        push_clip(nodes, id, ClipElem::AccumEnter);
                        seg_start = Some(clip_len(nodes, id) - 1);
                    }
                    TmplElem::Leave => {
                        push_clip(nodes, id, ClipElem::AccumLeave);
                        seg_start = None;
                    }
                    TmplElem::Clip { node, outer } => {
                        insert_clipper(nodes, id, node, outer, seg_start);
                    }
                }
            }
        }
        _ => {}
    }
}

fn clip_len(nodes: &[Node], id: NodeId) -> usize {
    nodes[id].surface().map(|s| s.clip.len()).unwrap_or(0)
}

fn push_clip(nodes: &mut [Node], id: NodeId, elem: ClipElem) {
    if let NodeBody::Surface(srf) = &mut nodes[id].body {
        srf.clip.push(elem);
    }
}

/// Insert one clipper into a surface's list.
///
/// Array targets expand into their surfaces. A clipper living under a
/// foreign trnode goes below a trnode marker, reusing an existing marker
/// when one is visible in the current accumulation segment (or outside
/// any segment), so the backend can hoist the shared inverse.
fn insert_clipper(
    nodes: &mut Vec<Node>,
    id: NodeId,
    target: NodeId,
    outer: bool,
    seg_start: Option<usize>,
) {
    match kind_of(nodes, target) {
        Kind::Array => {
            for child in array_children(nodes, target) {
                insert_clipper(nodes, id, child, outer, seg_start);
            }
            return;
        }
        Kind::Surface => {}
        _ => return,
    }

    let trnode = nodes[target].trnode.filter(|t| *t != target);
    let elem = ClipElem::Surface { node: target, outer };

    let Some(tr) = trnode else {
        push_clip(nodes, id, elem);
        return;
    };

    // look for a reusable marker for the same trnode
    let marker_pos = {
        let Some(srf) = nodes[id].surface() else { return };
        let mut found = None;
        let mut depth = 0usize;
        for (i, c) in srf.clip.iter().enumerate() {
            match c {
                ClipElem::AccumEnter => depth += 1,
                ClipElem::AccumLeave => depth = depth.saturating_sub(1),
                ClipElem::Trnode { node, .. } if *node == tr => {
                    let in_open_segment = seg_start.map(|s| i > s).unwrap_or(false);
                    let outside_segments = depth == 0 && seg_start.is_none();
                    if in_open_segment || outside_segments {
                        found = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        found
    };

    if let NodeBody::Surface(srf) = &mut nodes[id].body {
        match marker_pos {
            Some(m) => {
                srf.clip.insert(m + 1, elem);
                if let ClipElem::Trnode { count, .. } = &mut srf.clip[m] {
                    *count += 1;
                }
            }
            None => {
                srf.clip.push(ClipElem::Trnode { node: tr, count: 1 });
                srf.clip.push(elem);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_scene::{MaterialDesc, SurfaceDesc};
    use std::sync::Arc;

    fn mat() -> Arc<MaterialDesc> {
        Arc::new(MaterialDesc::plain(0x00808080))
    }

    fn sphere(trm: Transform3d) -> ObjectDesc {
        ObjectDesc::with_trm(
            trm,
            Body::Sphere {
                srf: SurfaceDesc::unbounded(mat()),
                rad: 1.0,
            },
        )
    }

    fn array(trm: Transform3d, children: Vec<ObjectDesc>, relations: Vec<Relation>) -> ObjectDesc {
        ObjectDesc::with_trm(trm, Body::Array { children, relations })
    }

    fn build(desc: &SceneDesc) -> (Graph, Registry) {
        let mut reg = Registry::new(1 << 16, None);
        let graph = Graph::build(desc, &mut reg).unwrap();
        (graph, reg)
    }

    fn trm(scl: [Real; 3], rot: [Real; 3], pos: [Real; 3]) -> Transform3d {
        Transform3d { scl, rot, pos }
    }

    #[test]
    fn test_trivial_chain_has_no_trnode() {
        let desc = SceneDesc {
            root: array(
                trm([1.0; 3], [0.0, 0.0, 90.0], [1.0, 0.0, 0.0]),
                vec![sphere(trm([1.0; 3], [0.0; 3], [2.0, 0.0, 0.0]))],
                vec![],
            ),
        };
        let (mut graph, reg) = build(&desc);
        graph.update(OPT_ALL, 0, true).unwrap();
        let srf = reg.surfaces[0];
        assert_eq!(graph.nodes[srf].trnode, None);
        // world position: rotate (2,0,0) by 90 about z, then offset
        let p = graph.nodes[srf].pos;
        assert!((p[0] - 1.0).abs() < 1e-5 && (p[1] - 2.0).abs() < 1e-5);
        // the 90-degree chain folds into the axis map
        assert_eq!(graph.nodes[srf].map, [1, 0, 2]);
        assert_eq!(graph.nodes[srf].sgn, [1, -1, 1]);
    }

    #[test]
    fn test_nontrivial_array_becomes_trnode_of_children() {
        let desc = SceneDesc {
            root: array(
                Transform3d::identity(),
                vec![array(
                    trm([1.0; 3], [0.0, 0.0, 45.0], [0.0; 3]),
                    vec![sphere(Transform3d::identity())],
                    vec![],
                )],
                vec![],
            ),
        };
        let (mut graph, reg) = build(&desc);
        graph.update(OPT_ALL, 0, true).unwrap();
        let inner = reg.arrays[1];
        let srf = reg.surfaces[0];
        assert_eq!(graph.nodes[inner].trnode, Some(inner));
        assert!(graph.nodes[inner].inv.is_some());
        // the surface caches through the array
        assert_eq!(graph.nodes[srf].trnode, Some(inner));
        assert_eq!(graph.nodes[srf].obj_has_trm, 0);
    }

    #[test]
    fn test_tarray_off_collapses_to_world() {
        let desc = SceneDesc {
            root: array(
                Transform3d::identity(),
                vec![array(
                    trm([1.0; 3], [0.0, 0.0, 45.0], [0.0; 3]),
                    vec![sphere(trm([1.0; 3], [0.0; 3], [1.0, 0.0, 0.0]))],
                    vec![],
                )],
                vec![],
            ),
        };
        let (mut graph, reg) = build(&desc);
        graph.update(OPT_ALL & !OPT_TARRAY, 0, true).unwrap();
        let srf = reg.surfaces[0];
        // the surface is its own trnode with a fully composed matrix
        assert_eq!(graph.nodes[srf].trnode, Some(srf));
        let p = graph.nodes[srf].pos;
        let r = (2.0f32).sqrt() / 2.0;
        assert!((p[0] - r).abs() < 1e-5 && (p[1] - r).abs() < 1e-5);
    }

    #[test]
    fn test_own_transform_is_own_trnode() {
        let desc = SceneDesc {
            root: array(
                Transform3d::identity(),
                vec![sphere(trm([2.0, 1.0, 1.0], [0.0; 3], [0.0; 3]))],
                vec![],
            ),
        };
        let (mut graph, reg) = build(&desc);
        graph.update(OPT_ALL, 0, true).unwrap();
        let srf = reg.surfaces[0];
        assert_eq!(graph.nodes[srf].trnode, Some(srf));
        // scale-only with FSCALE: the matrix collapses to its diagonal
        assert_eq!(graph.nodes[srf].mtx_has_trm, FLAG_SCL);
        assert_eq!(graph.nodes[srf].mtx[(0, 0)], 2.0);
        assert_eq!(graph.nodes[srf].mtx[(0, 1)], 0.0);
    }

    #[test]
    fn test_fscale_off_promotes_scale_to_full_matrix() {
        let desc = SceneDesc {
            root: array(
                Transform3d::identity(),
                vec![sphere(trm([2.0, 1.0, 1.0], [0.0; 3], [0.0; 3]))],
                vec![],
            ),
        };
        let (mut graph, reg) = build(&desc);
        graph.update(OPT_ALL & !OPT_FSCALE, 0, true).unwrap();
        let srf = reg.surfaces[0];
        assert_eq!(graph.nodes[srf].obj_has_trm, FLAG_SCL | FLAG_ROT);
    }

    #[test]
    fn test_minus_relation_builds_clip_list() {
        // cylinder (child 1) minus the sphere's outer subspace (child 0)
        let desc = SceneDesc {
            root: array(
                Transform3d::identity(),
                vec![
                    sphere(Transform3d::identity()),
                    ObjectDesc::new(Body::Cylinder {
                        srf: SurfaceDesc::unbounded(mat())
                            .clipped([-lumen_math::INF, -lumen_math::INF, -4.5], [lumen_math::INF, lumen_math::INF, 4.5]),
                        rad: 1.5,
                    }),
                ],
                vec![Relation::new(1, RelKind::MinusOuter, 0)],
            ),
        };
        let (mut graph, reg) = build(&desc);
        graph.update(OPT_ALL, 0, true).unwrap();
        let sph = reg.surfaces[0];
        let cyl = reg.surfaces[1];
        let clip = &graph.nodes[cyl].surface().unwrap().clip;
        assert_eq!(clip.len(), 1);
        assert_eq!(clip[0], ClipElem::Surface { node: sph, outer: true });
        assert!(graph.nodes[sph].surface().unwrap().clip.is_empty());
    }

    #[test]
    fn test_mutual_minus_relations() {
        let desc = SceneDesc {
            root: array(
                Transform3d::identity(),
                vec![sphere(Transform3d::identity()), sphere(Transform3d::identity())],
                vec![
                    Relation::new(1, RelKind::MinusOuter, 0),
                    Relation::new(0, RelKind::MinusInner, 1),
                ],
            ),
        };
        let (mut graph, reg) = build(&desc);
        graph.update(OPT_ALL, 0, true).unwrap();
        let a = reg.surfaces[0];
        let b = reg.surfaces[1];
        assert_eq!(
            graph.nodes[b].surface().unwrap().clip,
            vec![ClipElem::Surface { node: a, outer: true }]
        );
        assert_eq!(
            graph.nodes[a].surface().unwrap().clip,
            vec![ClipElem::Surface { node: b, outer: false }]
        );
    }

    #[test]
    fn test_accum_segment_brackets() {
        // subtract the pair (0, 1) from surface 2 as one boolean group
        let desc = SceneDesc {
            root: array(
                Transform3d::identity(),
                vec![
                    sphere(Transform3d::identity()),
                    sphere(Transform3d::identity()),
                    sphere(Transform3d::identity()),
                ],
                vec![
                    Relation::new(-1, RelKind::MinusInner, 0),
                    Relation::new(-1, RelKind::MinusInner, 1),
                    Relation::new(2, RelKind::MinusAccum, -1),
                ],
            ),
        };
        let (mut graph, reg) = build(&desc);
        graph.update(OPT_ALL, 0, true).unwrap();
        let s2 = reg.surfaces[2];
        let clip = &graph.nodes[s2].surface().unwrap().clip;
        assert_eq!(clip.len(), 4);
        assert_eq!(clip[0], ClipElem::AccumEnter);
        assert_eq!(clip[3], ClipElem::AccumLeave);
        assert!(matches!(clip[1], ClipElem::Surface { outer: false, .. }));
    }

    #[test]
    fn test_clipper_under_trnode_gets_marker() {
        // the clipper lives under a rotated array; the clipped surface
        // does not, so a trnode marker must precede the clipper
        let desc = SceneDesc {
            root: array(
                Transform3d::identity(),
                vec![
                    array(
                        trm([1.0; 3], [0.0, 0.0, 30.0], [0.0; 3]),
                        vec![sphere(Transform3d::identity())],
                        vec![],
                    ),
                    sphere(Transform3d::identity()),
                ],
                vec![Relation::new(1, RelKind::MinusOuter, 0)],
            ),
        };
        let (mut graph, reg) = build(&desc);
        graph.update(OPT_ALL, 0, true).unwrap();
        let rot_arr = reg.arrays[1];
        let inner_sphere = reg.surfaces[0];
        let outer_sphere = reg.surfaces[1];
        let clip = &graph.nodes[outer_sphere].surface().unwrap().clip;
        assert_eq!(
            clip.as_slice(),
            &[
                ClipElem::Trnode { node: rot_arr, count: 1 },
                ClipElem::Surface { node: inner_sphere, outer: true },
            ]
        );
    }

    #[test]
    fn test_bound_index_sets_bvnode() {
        let desc = SceneDesc {
            root: array(
                Transform3d::identity(),
                vec![sphere(Transform3d::identity())],
                vec![Relation::new(-1, RelKind::BoundIndex, 0)],
            ),
        };
        let (mut graph, reg) = build(&desc);
        graph.update(OPT_ALL, 0, true).unwrap();
        let srf = reg.surfaces[0];
        assert_eq!(graph.nodes[srf].bvnode, Some(graph.root));
        // VARRAY off leaves bvnodes untouched
        graph.update(OPT_ALL & !OPT_VARRAY, 1, true).unwrap();
        assert_eq!(graph.nodes[srf].bvnode, None);
    }

    #[test]
    fn test_update_same_time_is_noop_for_anim() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let anim: AnimFn = Arc::new(move |_, _, _| {
            f.fetch_add(1, Ordering::Relaxed);
        });
        let desc = SceneDesc {
            root: array(
                Transform3d::identity(),
                vec![sphere(Transform3d::identity()).animated(anim)],
                vec![],
            ),
        };
        let (mut graph, _) = build(&desc);
        graph.update(OPT_ALL, 5, true).unwrap();
        graph.update(OPT_ALL, 5, false).unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 1);
        graph.update(OPT_ALL, 6, false).unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 2);
    }

    #[test]
    fn test_unsupported_tag_skipped() {
        let desc = SceneDesc {
            root: array(
                Transform3d::identity(),
                vec![
                    ObjectDesc::new(Body::Other("torus".into())),
                    sphere(Transform3d::identity()),
                ],
                vec![],
            ),
        };
        let (graph, reg) = build(&desc);
        let NodeBody::Array(arr) = &graph.nodes[graph.root].body else {
            panic!()
        };
        assert_eq!(arr.children.len(), 1);
        assert_eq!(reg.surfaces.len(), 1);
    }

    #[test]
    fn test_alloc_exhausted() {
        let mut reg = Registry::new(2, None);
        let desc = SceneDesc {
            root: array(
                Transform3d::identity(),
                vec![sphere(Transform3d::identity()), sphere(Transform3d::identity())],
                vec![],
            ),
        };
        assert!(matches!(
            Graph::build(&desc, &mut reg),
            Err(EngineError::AllocExhausted(_))
        ));
    }
}
