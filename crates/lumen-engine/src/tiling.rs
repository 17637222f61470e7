//! Screen tiling: projecting surface bounding polyhedra into per-tile
//! surface lists, and the deterministic per-frame orderings.
//!
//! The screen is cut into fixed-size tiles. Every surface's bounding
//! polyhedron is projected onto the screen and rasterized face by face
//! into inclusive tile-column ranges per tile row; surfaces with no
//! polyhedron (analytically unbounded) cover every tile. The per-tile
//! lists keep scene order during collection and are then sorted front to
//! back, so the tracer's per-lane minimum converges early.

use lumen_math::{Real, CLIP_THRESHOLD};
use lumen_tracer::packet::RayGrid;

use crate::surface::ShapeState;

/// Tile width in pixels, matched to the widest packet.
pub const TILE_W: u32 = 8;
/// Tile height in pixels.
pub const TILE_H: u32 = 8;

/// Camera-derived screen basis for one frame.
#[derive(Debug, Clone, Copy)]
pub struct Screen {
    /// Eye position.
    pub pos: [Real; 3],
    /// Unit vector along pixel columns.
    pub hor: [Real; 3],
    /// Unit vector along pixel rows.
    pub ver: [Real; 3],
    /// Unit view normal.
    pub nrm: [Real; 3],
    /// Focal distance to the image plane.
    pub pov: Real,
    /// Pixel size on the image plane (`1 / xres`).
    pub factor: Real,
    /// Horizontal resolution.
    pub xres: u32,
    /// Vertical resolution.
    pub yres: u32,
}

#[inline]
fn dot3(a: [Real; 3], b: [Real; 3]) -> Real {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

impl Screen {
    /// Primary-ray grid matching this screen's projection.
    pub fn ray_grid(&self) -> RayGrid {
        let f = self.factor;
        let hx = self.xres as Real * f * 0.5;
        let hy = self.yres as Real * f * 0.5;
        let mut dir0 = [0.0; 3];
        for a in 0..3 {
            dir0[a] = self.pov * self.nrm[a] + (0.5 * f - hx) * self.hor[a]
                + (0.5 * f - hy) * self.ver[a];
        }
        RayGrid {
            pos: self.pos,
            dir0,
            hstep: [f * self.hor[0], f * self.hor[1], f * self.hor[2]],
            vstep: [f * self.ver[0], f * self.ver[1], f * self.ver[2]],
        }
    }

    /// Depth of a world point along the view normal.
    fn depth(&self, p: [Real; 3]) -> Real {
        let rel = [p[0] - self.pos[0], p[1] - self.pos[1], p[2] - self.pos[2]];
        dot3(rel, self.nrm)
    }

    /// Project a world point with known positive depth to pixel coordinates.
    fn project(&self, p: [Real; 3], d: Real) -> (Real, Real) {
        let rel = [p[0] - self.pos[0], p[1] - self.pos[1], p[2] - self.pos[2]];
        let s = self.pov / d / self.factor;
        (
            dot3(rel, self.hor) * s + self.xres as Real * 0.5,
            dot3(rel, self.ver) * s + self.yres as Real * 0.5,
        )
    }
}

/// Projected footprint of one surface: inclusive tile-column ranges per
/// tile row, or blanket coverage.
#[derive(Debug, Clone, PartialEq)]
pub enum Footprint {
    /// No tiles touched.
    Empty,
    /// Every tile touched (unbounded surfaces, eye inside the bounds, or
    /// geometry crossing the near plane).
    Full,
    /// Per-tile-row `(txmin, txmax)` ranges; `(1, 0)` marks an untouched
    /// row.
    Rows(Vec<(i32, i32)>),
}

/// Compute a surface's footprint on the tile grid.
pub fn surface_footprint(screen: &Screen, shape: &ShapeState, rows: u32, cols: u32) -> Footprint {
    if shape.verts.is_empty() {
        return Footprint::Full;
    }

    // eye inside the bounding sphere: the polyhedron surrounds the camera
    let dc = [
        shape.mid[0] - screen.pos[0],
        shape.mid[1] - screen.pos[1],
        shape.mid[2] - screen.pos[2],
    ];
    if dot3(dc, dc) <= shape.rad * shape.rad {
        return Footprint::Full;
    }

    let depths: Vec<Real> = shape.verts.iter().map(|v| screen.depth(*v)).collect();
    if depths.iter().all(|d| *d < CLIP_THRESHOLD) {
        return Footprint::Empty;
    }
    if depths.iter().any(|d| *d < CLIP_THRESHOLD) {
        // the polyhedron crosses the near plane; its projection is open
        return Footprint::Full;
    }

    let px: Vec<(Real, Real)> = shape
        .verts
        .iter()
        .zip(&depths)
        .map(|(v, d)| screen.project(*v, *d))
        .collect();

    let mut spans = vec![(i32::MAX, i32::MIN); rows as usize];
    let mut touched = false;

    // fill face by face: the projection of the polyhedron is the union
    // of its face projections
    for face in &shape.faces {
        face_spans(&px, &face.v, rows, cols, &mut spans, &mut touched);
    }

    if !touched {
        return Footprint::Empty;
    }
    Footprint::Rows(
        spans
            .into_iter()
            .map(|(lo, hi)| if lo > hi { (1, 0) } else { (lo, hi) })
            .collect(),
    )
}

/// Accumulate the tile spans of one projected face.
fn face_spans(
    px: &[(Real, Real)],
    verts: &[usize; 4],
    rows: u32,
    cols: u32,
    spans: &mut [(i32, i32)],
    touched: &mut bool,
) {
    // per pixel-row x extents of the face's boundary, then the convex
    // interior fills between them
    for e in 0..4 {
        let p0 = px[verts[e]];
        let p1 = px[verts[(e + 1) % 4]];
        edge_spans(p0, p1, rows, cols, spans, touched);
    }
}

/// Rasterize one projected edge into tile spans.
fn edge_spans(
    p0: (Real, Real),
    p1: (Real, Real),
    rows: u32,
    cols: u32,
    spans: &mut [(i32, i32)],
    touched: &mut bool,
) {
    let th = TILE_H as Real;
    let tw = TILE_W as Real;
    let (mut a, mut b) = (p0, p1);
    if a.1 > b.1 {
        std::mem::swap(&mut a, &mut b);
    }
    let row_lo = (a.1 / th).floor() as i64;
    let row_hi = (b.1 / th).floor() as i64;
    for row in row_lo..=row_hi {
        if row < 0 || row >= rows as i64 {
            continue;
        }
        // clip the segment to this tile row's y band
        let y0 = (row as Real * th).max(a.1);
        let y1 = ((row + 1) as Real * th).min(b.1);
        let (x0, x1) = if (b.1 - a.1).abs() < 1e-6 {
            (a.0.min(b.0), a.0.max(b.0))
        } else {
            let t0 = (y0 - a.1) / (b.1 - a.1);
            let t1 = (y1 - a.1) / (b.1 - a.1);
            let xa = a.0 + (b.0 - a.0) * t0;
            let xb = a.0 + (b.0 - a.0) * t1;
            (xa.min(xb), xa.max(xb))
        };
        let c0 = (x0 / tw).floor() as i64;
        let c1 = (x1 / tw).floor() as i64;
        if c1 < 0 || c0 >= cols as i64 {
            continue;
        }
        let c0 = c0.max(0) as i32;
        let c1 = c1.min(cols as i64 - 1) as i32;
        let s = &mut spans[row as usize];
        s.0 = s.0.min(c0);
        s.1 = s.1.max(c1);
        *touched = true;
    }
}

/// The per-frame tile grid: one surface list per tile.
pub struct TileGrid {
    /// Tiles per row.
    pub cols: u32,
    /// Tile rows.
    pub rows: u32,
    /// Per-tile surface ordinals, row-major.
    pub buckets: Vec<Vec<u32>>,
}

impl TileGrid {
    /// Empty grid for a framebuffer size.
    pub fn new(xres: u32, yres: u32) -> Self {
        let cols = xres.div_ceil(TILE_W);
        let rows = yres.div_ceil(TILE_H);
        Self {
            cols,
            rows,
            buckets: vec![Vec::new(); (cols * rows) as usize],
        }
    }

    /// Reset all buckets, keeping their capacity.
    pub fn clear(&mut self) {
        for b in &mut self.buckets {
            b.clear();
        }
    }

    /// Insert one surface's footprint; called in scene order so the
    /// bucket contents stay deterministic.
    pub fn insert(&mut self, ord: u32, footprint: &Footprint) {
        match footprint {
            Footprint::Empty => {}
            Footprint::Full => {
                for b in &mut self.buckets {
                    b.push(ord);
                }
            }
            Footprint::Rows(rows) => {
                for (row, (lo, hi)) in rows.iter().enumerate() {
                    for col in *lo..=*hi {
                        self.buckets[row * self.cols as usize + col as usize].push(ord);
                    }
                }
            }
        }
    }

    /// Sort every bucket front to back along the view direction, using
    /// the surfaces' bounding spheres; unbounded surfaces sort first.
    pub fn ssort(&mut self, screen: &Screen, shapes: &[(Real, [Real; 3])]) {
        let key = |ord: u32| -> Real {
            let (rad, mid) = shapes[ord as usize];
            if rad == 0.0 {
                return -Real::INFINITY;
            }
            let rel = [
                mid[0] - screen.pos[0],
                mid[1] - screen.pos[1],
                mid[2] - screen.pos[2],
            ];
            dot3(rel, screen.nrm) - rad
        };
        for bucket in &mut self.buckets {
            bucket.sort_by(|a, b| key(*a).total_cmp(&key(*b)).then(a.cmp(b)));
        }
    }
}

/// Order lights closest-first from the eye; ties break on registry order.
pub fn lsort(screen: &Screen, light_pos: &[[Real; 3]]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..light_pos.len()).collect();
    let key = |i: usize| -> Real {
        let p = light_pos[i];
        let rel = [p[0] - screen.pos[0], p[1] - screen.pos[1], p[2] - screen.pos[2]];
        dot3(rel, rel)
    };
    order.sort_by(|a, b| key(*a).total_cmp(&key(*b)).then(a.cmp(b)));
    order
}
