//! The scene manager: construction, per-frame update/render drive, and
//! the interactive surface (camera actions, FSAA/SIMD/options switches,
//! frame capture).
//!
//! A frame runs as a fixed sequence of barrier-ordered phases:
//! phase 0 (coordinator): graph update and clipper-list rebuild;
//! phase 1 (workers): per-surface bounds and backend records;
//! tiling (workers): projected footprints, then coordinator-side bucket
//! assembly and sorting; tracing (workers): packet tracing per tile into
//! the framebuffer. Worker failures abort the frame, never the scene.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lumen_math::{norm_angle, Real};
use lumen_scene::SceneDesc;
use lumen_tracer::view::SceneView;
use lumen_tracer::{Fsaa, Tile, TracerRegistry};

use crate::error::{EngineError, Result};
use crate::frame::FrameBuffer;
use crate::object::{Graph, NodeBody, OPT_ALL, OPT_UPDATE};
use crate::registry::{Registry, TextureLoadFn};
use crate::surface::{
    build_backend, build_lights, update_array_bounds, update_surface, ShapeState,
};
use crate::threads::{RayonPool, ThreadPool, WorkerErrors};
use crate::tiling::{lsort, surface_footprint, Footprint, Screen, TileGrid, TILE_H, TILE_W};

/// Interactive camera actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraAction {
    /// Move along +Z.
    MoveUp,
    /// Move along -Z.
    MoveDown,
    /// Strafe left relative to the heading.
    MoveLeft,
    /// Strafe right relative to the heading.
    MoveRight,
    /// Move backward relative to the heading.
    MoveBack,
    /// Move forward relative to the heading.
    MoveForward,
    /// Yaw left.
    RotateLeft,
    /// Yaw right.
    RotateRight,
    /// Pitch up, clamped at level.
    RotateUp,
    /// Pitch down, clamped at straight down.
    RotateDown,
}

/// Scene construction options.
#[derive(Clone)]
pub struct SceneOptions {
    /// Worker count; `0` selects the machine's parallelism.
    pub thnum: usize,
    /// Maximum secondary-ray bounces.
    pub depth: u32,
    /// Anti-aliasing mode.
    pub fsaa: Fsaa,
    /// Engine option bits.
    pub opts: u32,
    /// Requested SIMD width; resolved to the closest registered backend.
    pub simd_width: usize,
    /// Node allocation budget.
    pub max_nodes: usize,
    /// Texture loader collaborator.
    pub tex_loader: Option<TextureLoadFn>,
    /// Thread pool collaborator; defaults to a rayon pool.
    pub pool: Option<Arc<dyn ThreadPool>>,
}

impl Default for SceneOptions {
    fn default() -> Self {
        Self {
            thnum: 0,
            depth: 3,
            fsaa: Fsaa::No,
            opts: OPT_ALL,
            simd_width: 8,
            max_nodes: 1 << 16,
            tex_loader: None,
            pool: None,
        }
    }
}

struct TileScratch {
    pix: Vec<u32>,
}

/// A renderable scene: graph, registries, framebuffer and thread pool.
pub struct Scene {
    graph: Graph,
    reg: Registry,
    opts: u32,
    depth: u32,
    fsaa: Fsaa,
    simd_width: usize,
    tracers: TracerRegistry,
    pool: Arc<dyn ThreadPool>,
    errors: WorkerErrors,
    fb: FrameBuffer,
    tiles: TileGrid,
    shapes: Vec<Mutex<ShapeState>>,
    scratch: Vec<Mutex<TileScratch>>,
    cam_idx: usize,
    time: i64,
    show_fps: bool,
    last_frame: Option<Instant>,
}

impl Scene {
    /// Construct a scene for the given framebuffer resolution.
    ///
    /// Fails when the description is malformed (no camera, bad root, bad
    /// textures) or exceeds the allocation budget; no partial scene
    /// survives a failure.
    pub fn new(desc: &SceneDesc, xres: u32, yres: u32, opt: SceneOptions) -> Result<Scene> {
        if xres == 0 || yres == 0 {
            return Err(EngineError::MalformedScene("zero resolution".into()));
        }
        desc.validate()
            .map_err(|e| EngineError::MalformedScene(e.to_string()))?;

        let mut reg = Registry::new(opt.max_nodes, opt.tex_loader.clone());
        let graph = Graph::build(desc, &mut reg)?;
        if reg.cameras.is_empty() {
            return Err(EngineError::MalformedScene("scene has no camera".into()));
        }

        let tracers = TracerRegistry::with_defaults();
        let (_, simd_width) = tracers
            .select(opt.simd_width)
            .ok_or_else(|| EngineError::UnsupportedTarget("no tracer backends".into()))?;

        let pool: Arc<dyn ThreadPool> = match opt.pool {
            Some(p) => p,
            None => Arc::new(RayonPool::new(opt.thnum)?),
        };
        let thnum = pool.thnum();

        let align = tracers.widths().iter().copied().max().unwrap_or(8) as u32;
        let fb = FrameBuffer::new(xres, yres, align);
        let tiles = TileGrid::new(xres, yres);
        let shapes = (0..reg.surfaces.len())
            .map(|_| Mutex::new(ShapeState::default()))
            .collect();
        let scratch = (0..thnum)
            .map(|_| {
                Mutex::new(TileScratch {
                    pix: vec![0; (TILE_W * TILE_H) as usize],
                })
            })
            .collect();

        log::info!(
            "scene: {} surfaces, {} lights, {} cameras, {} materials, {thnum} workers",
            reg.surfaces.len(),
            reg.lights.len(),
            reg.cameras.len(),
            reg.materials.len()
        );

        Ok(Scene {
            graph,
            reg,
            opts: opt.opts & OPT_ALL,
            depth: opt.depth,
            fsaa: opt.fsaa,
            simd_width,
            tracers,
            pool,
            errors: WorkerErrors::new(thnum),
            fb,
            tiles,
            shapes,
            scratch,
            cam_idx: 0,
            time: -1,
            show_fps: false,
            last_frame: None,
        })
    }

    /// Apply one interactive camera action at the given time.
    pub fn update(&mut self, time: i64, action: CameraAction) {
        let cam_id = self.reg.cameras[self.cam_idx];
        let (dps, drt, hor_sin, hor_cos) = {
            let NodeBody::Camera(cam) = &self.graph.nodes[cam_id].body else {
                return;
            };
            (cam.desc.dps, cam.desc.drt, cam.hor_sin, cam.hor_cos)
        };
        let node = &mut self.graph.nodes[cam_id];
        let t = (time - node.time) as Real / 50.0;
        let trm = &mut node.trm;

        match action {
            CameraAction::MoveUp => trm.pos[2] += dps[2] * t,
            CameraAction::MoveDown => trm.pos[2] -= dps[2] * t,
            CameraAction::MoveLeft => {
                trm.pos[0] -= dps[0] * t * hor_cos;
                trm.pos[1] -= dps[0] * t * hor_sin;
            }
            CameraAction::MoveRight => {
                trm.pos[0] += dps[0] * t * hor_cos;
                trm.pos[1] += dps[0] * t * hor_sin;
            }
            CameraAction::MoveBack => {
                trm.pos[0] += dps[1] * t * hor_sin;
                trm.pos[1] -= dps[1] * t * hor_cos;
            }
            CameraAction::MoveForward => {
                trm.pos[0] -= dps[1] * t * hor_sin;
                trm.pos[1] += dps[1] * t * hor_cos;
            }
            CameraAction::RotateLeft => {
                trm.rot[2] = norm_angle(trm.rot[2] + drt[0] * t);
            }
            CameraAction::RotateRight => {
                trm.rot[2] = norm_angle(trm.rot[2] - drt[0] * t);
            }
            CameraAction::RotateUp => {
                if trm.rot[0] < 0.0 {
                    trm.rot[0] = (trm.rot[0] + drt[1] * t).min(0.0);
                }
            }
            CameraAction::RotateDown => {
                if trm.rot[0] > -180.0 {
                    trm.rot[0] = (trm.rot[0] - drt[1] * t).max(-180.0);
                }
            }
        }

        if let NodeBody::Camera(cam) = &mut self.graph.nodes[cam_id].body {
            cam.changed = true;
        }
    }

    /// Render one frame at the given time.
    pub fn render(&mut self, time: i64) -> Result<()> {
        let t0 = Instant::now();
        self.errors.reset();

        // phase 0: sequential graph update
        let force = self.time < 0 || self.opts & OPT_UPDATE == 0;
        self.graph.update(self.opts, time, force)?;
        self.time = time;

        let screen = self.screen();
        let thnum = self.pool.thnum();
        let nsrf = self.reg.surfaces.len();
        let pool = self.pool.clone();

        // phase 1: per-surface bounds, in parallel slices
        {
            let graph = &self.graph;
            let reg = &self.reg;
            let shapes = &self.shapes;
            let errors = &self.errors;
            let opts = self.opts;
            pool.dispatch(&|w| {
                errors.guard(w, || {
                    for ord in (w..nsrf).step_by(thnum) {
                        let id = reg.surfaces[ord];
                        let mut shape = shapes[ord].lock().expect("shape lock");
                        if let Err(e) = update_surface(graph, opts, id, &mut shape) {
                            drop(shape);
                            errors.record(w, e.to_string());
                            return;
                        }
                    }
                });
            });
        }
        self.errors.check()?;

        update_array_bounds(&mut self.graph, &self.shapes);

        let (surfaces, clips) = build_backend(&self.graph, &self.reg, &self.shapes)?;
        let (mut lights, mut ambient) = build_lights(&self.graph, &self.reg);
        {
            let order = lsort(&screen, &lights.iter().map(|l| l.pos).collect::<Vec<_>>());
            lights = order.into_iter().map(|i| lights[i]).collect();
        }
        if let NodeBody::Camera(cam) = &self.graph.nodes[self.reg.cameras[self.cam_idx]].body {
            let col = lumen_tracer::unpack_xrgb(cam.desc.col);
            for a in 0..3 {
                ambient[a] += col[a] * cam.desc.lum;
            }
        }

        // tiling: per-surface footprints in parallel, buckets sequential
        let footprints: Vec<Mutex<Footprint>> =
            (0..nsrf).map(|_| Mutex::new(Footprint::Empty)).collect();
        {
            let shapes = &self.shapes;
            let errors = &self.errors;
            let fps = &footprints;
            let rows = self.tiles.rows;
            let cols = self.tiles.cols;
            let screen = &screen;
            pool.dispatch(&|w| {
                errors.guard(w, || {
                    for ord in (w..nsrf).step_by(thnum) {
                        let shape = shapes[ord].lock().expect("shape lock");
                        let fp = surface_footprint(screen, &shape, rows, cols);
                        *fps[ord].lock().expect("footprint lock") = fp;
                    }
                });
            });
        }
        self.errors.check()?;

        self.tiles.clear();
        for (ord, fp) in footprints.iter().enumerate() {
            self.tiles
                .insert(ord as u32, &fp.lock().expect("footprint lock"));
        }
        let sort_keys: Vec<(Real, [Real; 3])> = (0..nsrf)
            .map(|ord| {
                let s = self.shapes[ord].lock().expect("shape lock");
                (s.rad, s.mid)
            })
            .collect();
        self.tiles.ssort(&screen, &sort_keys);

        // tracing: packet tracer over tiles, in parallel slices
        let slist: Vec<u32> = (0..nsrf as u32).collect();
        let view = SceneView {
            surfaces: &surfaces,
            slist: &slist,
            lights: &lights,
            clips: &clips,
            materials: &self.reg.materials,
            texels: &self.reg.texels,
            ambient,
            depth: self.depth,
        };
        let grid = screen.ray_grid();
        let (tracer, _) = self
            .tracers
            .select(self.simd_width)
            .ok_or_else(|| EngineError::UnsupportedTarget("no tracer backends".into()))?;

        {
            let tiles = &self.tiles;
            let errors = &self.errors;
            let fb = &self.fb;
            let scratch = &self.scratch;
            let fsaa = self.fsaa;
            let view = &view;
            let ntiles = (tiles.cols * tiles.rows) as usize;
            let (xres, yres) = (fb.xres(), fb.yres());
            pool.dispatch(&|w| {
                errors.guard(w, || {
                    let mut sc = scratch[w].lock().expect("scratch lock");
                    for idx in (w..ntiles).step_by(thnum) {
                        let tx = idx as u32 % tiles.cols;
                        let ty = idx as u32 / tiles.cols;
                        let x0 = tx * TILE_W;
                        let y0 = ty * TILE_H;
                        let tile = Tile {
                            x0,
                            y0,
                            w: TILE_W.min(xres - x0),
                            h: TILE_H.min(yres - y0),
                            sfcs: &tiles.buckets[idx],
                            fsaa,
                        };
                        let n = (tile.w * tile.h) as usize;
                        tracer.trace_tile(view, &grid, &tile, &mut sc.pix[..n]);
                        for row in 0..tile.h {
                            for col in 0..tile.w {
                                fb.store(
                                    x0 + col,
                                    y0 + row,
                                    sc.pix[(row * tile.w + col) as usize],
                                );
                            }
                        }
                    }
                });
            });
        }
        self.errors.check()?;

        let elapsed = t0.elapsed();
        if self.show_fps {
            let fps = match self.last_frame {
                Some(prev) => {
                    let dt = prev.elapsed().as_secs_f64();
                    if dt > 0.0 {
                        (1.0 / dt).round() as u32
                    } else {
                        0
                    }
                }
                None => 0,
            };
            self.fb.draw_number(2, 2, fps);
        }
        self.last_frame = Some(t0);
        log::debug!("frame at t={time}ms rendered in {elapsed:?}");
        Ok(())
    }

    /// Screen basis of the current camera.
    fn screen(&self) -> Screen {
        let cam_id = self.reg.cameras[self.cam_idx];
        let node = &self.graph.nodes[cam_id];
        let m = &node.mtx;
        let col = |c: usize| -> [Real; 3] {
            let v = lumen_math::Vec3::new(m[(0, c)], m[(1, c)], m[(2, c)]);
            let n = v.norm();
            let v = if n > 0.0 { v / n } else { v };
            [v.x, v.y, v.z]
        };
        let pov = match &node.body {
            NodeBody::Camera(cam) => cam.pov,
            _ => 1.0,
        };
        Screen {
            pos: node.pos,
            hor: col(0),
            ver: col(1),
            nrm: col(2),
            pov,
            factor: 1.0 / self.fb.xres() as Real,
            xres: self.fb.xres(),
            yres: self.fb.yres(),
        }
    }

    /// Set the anti-aliasing mode; returns the mode actually selected.
    pub fn set_fsaa(&mut self, fsaa: Fsaa) -> Fsaa {
        self.fsaa = fsaa;
        self.fsaa
    }

    /// Current anti-aliasing mode.
    pub fn fsaa(&self) -> Fsaa {
        self.fsaa
    }

    /// Replace the engine option bits; returns the bits actually kept.
    pub fn set_opts(&mut self, opts: u32) -> u32 {
        self.opts = opts & OPT_ALL;
        // option changes invalidate cached update state
        self.time = -1;
        self.opts
    }

    /// Current option bits.
    pub fn opts(&self) -> u32 {
        self.opts
    }

    /// Request a SIMD width; returns the closest registered width, or
    /// fails when no backend is registered at all.
    pub fn set_simd(&mut self, width: usize) -> Result<usize> {
        let (_, w) = self
            .tracers
            .select(width)
            .ok_or_else(|| EngineError::UnsupportedTarget(format!("simd width {width}")))?;
        self.simd_width = w;
        Ok(w)
    }

    /// Currently selected SIMD width.
    pub fn simd_width(&self) -> usize {
        self.simd_width
    }

    /// Registered SIMD widths in registration order.
    pub fn simd_widths(&self) -> Vec<usize> {
        self.tracers.widths()
    }

    /// Cycle to the next camera in registry order.
    pub fn next_cam(&mut self) {
        self.cam_idx = (self.cam_idx + 1) % self.reg.cameras.len();
    }

    /// Snapshot of the framebuffer in row-stride layout.
    pub fn get_frame(&self) -> Vec<u32> {
        self.fb.snapshot()
    }

    /// Pixels per framebuffer row including SIMD padding.
    pub fn row_stride(&self) -> usize {
        self.fb.row_stride()
    }

    /// Direct framebuffer access.
    pub fn frame_buffer(&self) -> &FrameBuffer {
        &self.fb
    }

    /// Save the current frame as a numbered PNG; returns its path.
    pub fn save_frame(&self, index: u32) -> Result<PathBuf> {
        let path = FrameBuffer::frame_path(index);
        self.fb.write_png(&path)?;
        Ok(path)
    }

    /// Toggle the FPS overlay drawn after each frame.
    pub fn set_fps_overlay(&mut self, on: bool) {
        self.show_fps = on;
    }

    /// Log the camera transform and render settings.
    pub fn print_state(&self) {
        let cam_id = self.reg.cameras[self.cam_idx];
        let node = &self.graph.nodes[cam_id];
        log::info!(
            "camera {}: pos {:?} rot {:?}",
            self.cam_idx,
            node.trm.pos,
            node.trm.rot
        );
        log::info!(
            "fsaa {:?}, simd width {}, depth {}, opts {:#07b}, {} workers",
            self.fsaa,
            self.simd_width,
            self.depth,
            self.opts,
            self.pool.thnum()
        );
    }
}
