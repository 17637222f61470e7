#![warn(missing_docs)]

//! Packetized SIMD ray-tracing backend for the lumen engine.
//!
//! The engine flattens its scene graph into a [`SceneView`] once per frame
//! and hands tiles to a [`PacketTracer`]. A tracer owns one SIMD width and
//! processes `width` adjacent pixels per packet; implementations for 4 and
//! 8 lanes (over `wide`'s `f32x4`/`f32x8`) register by default, and width
//! selection resolves a request to the closest registered instance.
//!
//! Only the packet *contract* is fixed: shared origin, `width` directions,
//! bounce budget, tile surface list, light list, FSAA mode in; `width`
//! packed XRGB pixels out. The instruction schedule is whatever the lane
//! type compiles to.

pub mod lanes;
pub mod packet;
pub mod shade;
pub mod view;

use std::marker::PhantomData;

use wide::{f32x4, f32x8};

use lanes::{Lanes, Vec3l};
use lumen_math::Real;
use packet::{intersect_packet, shade_lane, PacketState, RayGrid};
use view::SceneView;

pub use shade::{pack_xrgb, unpack_xrgb};

/// Fullscreen anti-aliasing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fsaa {
    /// One sample per pixel.
    No,
    /// Four sub-pixel samples averaged.
    X4,
}

/// One screen tile to trace.
#[derive(Debug, Clone, Copy)]
pub struct Tile<'a> {
    /// Leftmost pixel column.
    pub x0: u32,
    /// Topmost pixel row.
    pub y0: u32,
    /// Tile width in pixels.
    pub w: u32,
    /// Tile height in pixels.
    pub h: u32,
    /// Surfaces whose projected bounds touch this tile, sorted
    /// front to back.
    pub sfcs: &'a [u32],
    /// Anti-aliasing mode.
    pub fsaa: Fsaa,
}

/// A ray-packet tracing backend of one SIMD width.
pub trait PacketTracer: Send + Sync {
    /// Packet width in rays.
    fn width(&self) -> usize;

    /// Trace every pixel of `tile`, writing `tile.w * tile.h` packed XRGB
    /// values into `out` in row-major order.
    fn trace_tile(&self, view: &SceneView, grid: &RayGrid, tile: &Tile, out: &mut [u32]);
}

/// Generic packet tracer over a SIMD lane type.
pub struct SimdTracer<L: Lanes> {
    _lanes: PhantomData<L>,
}

impl<L: Lanes> SimdTracer<L> {
    /// Construct a tracer of this width.
    pub fn new() -> Self {
        Self { _lanes: PhantomData }
    }

    fn trace_packet(
        &self,
        view: &SceneView,
        grid: &RayGrid,
        tile: &Tile,
        px: u32,
        py: u32,
        dx: Real,
        dy: Real,
        colors: &mut [[Real; 3]],
    ) {
        let mut xs = [0.0; 16];
        for (i, x) in xs.iter_mut().take(L::WIDTH).enumerate() {
            *x = (px + i as u32) as Real + dx;
        }
        let xl = L::from_slice(&xs[..L::WIDTH]);
        let yl = L::splat(py as Real + dy);
        let d = Vec3l {
            x: L::splat(grid.dir0[0])
                + xl * L::splat(grid.hstep[0])
                + yl * L::splat(grid.vstep[0]),
            y: L::splat(grid.dir0[1])
                + xl * L::splat(grid.hstep[1])
                + yl * L::splat(grid.vstep[1]),
            z: L::splat(grid.dir0[2])
                + xl * L::splat(grid.hstep[2])
                + yl * L::splat(grid.vstep[2]),
        };

        let mut state = PacketState::<L>::new();
        for &srf in tile.sfcs {
            intersect_packet(view, srf, grid.pos, d, &mut state);
        }
        for (lane, c) in colors.iter_mut().enumerate() {
            *c = shade_lane(view, grid, &state, d, lane);
        }
    }
}

impl<L: Lanes> Default for SimdTracer<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Lanes> PacketTracer for SimdTracer<L> {
    fn width(&self) -> usize {
        L::WIDTH
    }

    fn trace_tile(&self, view: &SceneView, grid: &RayGrid, tile: &Tile, out: &mut [u32]) {
        // sub-pixel offsets relative to the pixel center baked into dir0
        const FSAA_OFFS: [(Real, Real); 4] =
            [(-0.25, -0.25), (0.25, -0.25), (-0.25, 0.25), (0.25, 0.25)];

        let mut colors = vec![[0.0; 3]; L::WIDTH];
        let mut accum = vec![[0.0; 3]; L::WIDTH];

        for row in 0..tile.h {
            let py = tile.y0 + row;
            let mut col = 0;
            while col < tile.w {
                let px = tile.x0 + col;
                match tile.fsaa {
                    Fsaa::No => {
                        self.trace_packet(view, grid, tile, px, py, 0.0, 0.0, &mut colors);
                    }
                    Fsaa::X4 => {
                        for a in accum.iter_mut() {
                            *a = [0.0; 3];
                        }
                        for (dx, dy) in FSAA_OFFS {
                            self.trace_packet(view, grid, tile, px, py, dx, dy, &mut colors);
                            for (a, c) in accum.iter_mut().zip(&colors) {
                                a[0] += c[0];
                                a[1] += c[1];
                                a[2] += c[2];
                            }
                        }
                        for (c, a) in colors.iter_mut().zip(&accum) {
                            *c = [a[0] * 0.25, a[1] * 0.25, a[2] * 0.25];
                        }
                    }
                }
                for lane in 0..L::WIDTH as u32 {
                    if col + lane >= tile.w {
                        break;
                    }
                    out[(row * tile.w + col + lane) as usize] =
                        pack_xrgb(colors[lane as usize]);
                }
                col += L::WIDTH as u32;
            }
        }
    }
}

/// Registry of available packet tracers, in insertion order.
pub struct TracerRegistry {
    tracers: Vec<Box<dyn PacketTracer>>,
}

impl TracerRegistry {
    /// Registry with the built-in 4- and 8-lane tracers.
    pub fn with_defaults() -> Self {
        Self {
            tracers: vec![
                Box::new(SimdTracer::<f32x4>::new()),
                Box::new(SimdTracer::<f32x8>::new()),
            ],
        }
    }

    /// Empty registry for custom backend sets.
    pub fn new() -> Self {
        Self { tracers: Vec::new() }
    }

    /// Register an additional backend.
    pub fn register(&mut self, tracer: Box<dyn PacketTracer>) {
        self.tracers.push(tracer);
    }

    /// Registered widths in insertion order.
    pub fn widths(&self) -> Vec<usize> {
        self.tracers.iter().map(|t| t.width()).collect()
    }

    /// Select the backend whose width is closest to the request, preferring
    /// the wider one on ties. Returns the tracer and its actual width.
    pub fn select(&self, width: usize) -> Option<(&dyn PacketTracer, usize)> {
        let mut best: Option<(&dyn PacketTracer, usize)> = None;
        for t in &self.tracers {
            let w = t.width();
            let d = w.abs_diff(width);
            let better = match best {
                None => true,
                Some((b, _)) => {
                    let bd = b.width().abs_diff(width);
                    d < bd || (d == bd && w > b.width())
                }
            };
            if better {
                best = Some((t.as_ref(), w));
            }
        }
        best
    }
}

impl Default for TracerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
