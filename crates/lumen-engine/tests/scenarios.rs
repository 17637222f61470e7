//! End-to-end scenarios: small scenes rendered through the full
//! update/tiling/tracing pipeline.

use std::sync::Arc;

use lumen_engine::{CameraAction, Fsaa, Scene, SceneOptions};
use lumen_math::{Transform3d, INF};
use lumen_scene::{
    Body, CameraDesc, LightDesc, MaterialDesc, ObjectDesc, RelKind, Relation, SceneDesc,
    SurfaceDesc,
};

const XRES: u32 = 160;
const YRES: u32 = 96;

fn mat(color: u32) -> Arc<MaterialDesc> {
    Arc::new(MaterialDesc::plain(color))
}

fn at(pos: [f32; 3]) -> Transform3d {
    Transform3d {
        scl: [1.0; 3],
        rot: [0.0; 3],
        pos,
    }
}

/// Camera at z = -5 looking along +Z, a light up front, a sphere at the
/// origin and a backdrop plane at z = +3.
fn demo_scene() -> SceneDesc {
    let camera = ObjectDesc::with_trm(
        at([0.0, 0.0, -5.0]),
        Body::Camera(CameraDesc {
            col: 0x0010_1010,
            lum: 1.0,
            pov: 1.0,
            ..CameraDesc::default()
        }),
    );
    let light = ObjectDesc::with_trm(
        at([2.0, 2.0, -3.0]),
        Body::Light(LightDesc {
            col: 0x00FF_FFFF,
            lum_ambient: 0.0,
            lum_source: 1.0,
            atn: [0.0, 0.0, 0.05, 0.005],
        }),
    );
    let sphere = ObjectDesc::new(Body::Sphere {
        srf: SurfaceDesc::unbounded(mat(0x00C0_4040)),
        rad: 1.0,
    });
    let plane = ObjectDesc::with_trm(
        at([0.0, 0.0, 3.0]),
        Body::Plane(SurfaceDesc::unbounded(mat(0x0040_40C0)).clipped(
            [-10.0, -10.0, -INF],
            [10.0, 10.0, INF],
        )),
    );
    SceneDesc {
        root: ObjectDesc::new(Body::Array {
            children: vec![camera, light, sphere, plane],
            relations: vec![],
        }),
    }
}

fn options(thnum: usize) -> SceneOptions {
    SceneOptions {
        thnum,
        depth: 1,
        ..SceneOptions::default()
    }
}

fn render_pixels(desc: &SceneDesc, opt: SceneOptions) -> Vec<u32> {
    let mut scene = Scene::new(desc, XRES, YRES, opt).unwrap();
    scene.render(0).unwrap();
    scene.get_frame()
}

#[test]
fn plane_and_sphere_under_light() {
    let desc = demo_scene();
    let mut scene = Scene::new(&desc, XRES, YRES, options(1)).unwrap();
    scene.render(0).unwrap();
    let frame = scene.get_frame();
    let stride = scene.row_stride();

    // the sphere covers the screen center and is lit red-dominant
    let center = frame[(YRES as usize / 2) * stride + XRES as usize / 2];
    let (r, g) = ((center >> 16) & 0xFF, (center >> 8) & 0xFF);
    assert!(r > 0x20, "center pixel too dark: {center:08x}");
    assert!(r > g, "sphere tint lost: {center:08x}");

    // the backdrop plane fills the lit lower-right corner with its blue
    // material (the opposite corner sits in the sphere's shadow)
    let corner = frame[(YRES as usize - 2) * stride + XRES as usize - 2];
    let b = corner & 0xFF;
    assert!(b > 0x10, "backdrop missing: {corner:08x}");
}

#[test]
fn rendering_is_deterministic() {
    let desc = demo_scene();
    let a = render_pixels(&desc, options(1));
    let b = render_pixels(&desc, options(1));
    assert_eq!(a, b);
}

#[test]
fn thread_counts_agree_pixel_for_pixel() {
    let desc = demo_scene();
    let a = render_pixels(&desc, options(1));
    for thnum in [2, 4] {
        let b = render_pixels(&desc, options(thnum));
        assert_eq!(a, b, "thnum={thnum} diverged");
    }
}

#[test]
fn simd_widths_agree_pixel_for_pixel() {
    let desc = demo_scene();
    let mut narrow = options(1);
    narrow.simd_width = 4;
    let mut wide = options(1);
    wide.simd_width = 8;
    assert_eq!(render_pixels(&desc, narrow), render_pixels(&desc, wide));
}

#[test]
fn set_simd_returns_closest_supported() {
    let desc = demo_scene();
    let mut scene = Scene::new(&desc, XRES, YRES, options(1)).unwrap();
    assert_eq!(scene.set_simd(16).unwrap(), 8);
    assert_eq!(scene.set_simd(4).unwrap(), 4);
    assert_eq!(scene.simd_width(), 4);
}

#[test]
fn repeated_update_same_time_is_noop() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let mut desc = demo_scene();
    if let Body::Array { children, .. } = &mut desc.root.body {
        children[2].anim = Some(Arc::new(move |_, _, _| {
            f.fetch_add(1, Ordering::Relaxed);
        }));
    }
    let mut scene = Scene::new(&desc, XRES, YRES, options(1)).unwrap();
    scene.render(10).unwrap();
    let first = scene.get_frame();
    scene.render(10).unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert_eq!(scene.get_frame(), first);
    scene.render(20).unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 2);
}

#[test]
fn set_fsaa_is_idempotent() {
    let desc = demo_scene();
    let mut scene = Scene::new(&desc, XRES, YRES, options(1)).unwrap();
    scene.render(0).unwrap();
    let frame = scene.get_frame();
    assert_eq!(scene.set_fsaa(Fsaa::No), Fsaa::No);
    assert_eq!(scene.set_fsaa(Fsaa::No), Fsaa::No);
    assert_eq!(scene.get_frame(), frame);
}

#[test]
fn fsaa_averages_silhouette_pixels() {
    let desc = demo_scene();
    let hard = render_pixels(&desc, options(1));
    let mut opt = options(1);
    opt.fsaa = Fsaa::X4;
    let soft = render_pixels(&desc, opt);
    assert_eq!(hard.len(), soft.len());
    assert_ne!(hard, soft);
    // averaging four sub-samples can shift a channel by at most the
    // full covered/uncovered contrast; most pixels barely move
    let moved = hard
        .iter()
        .zip(&soft)
        .filter(|(h, s)| {
            let dr = ((*h >> 16) & 0xFF).abs_diff((*s >> 16) & 0xFF);
            dr > 2
        })
        .count();
    assert!(moved > 0, "no silhouette pixels were averaged");
    assert!(
        moved < hard.len() / 4,
        "anti-aliasing rewrote flat regions: {moved} pixels moved"
    );
}

#[test]
fn depth_zero_disables_secondary_rays() {
    let mut desc = demo_scene();
    if let Body::Array { children, .. } = &mut desc.root.body {
        // make the sphere a mirror
        children[2] = ObjectDesc::new(Body::Sphere {
            srf: SurfaceDesc::unbounded(Arc::new(MaterialDesc::metal(0x00C0_4040, 0.8))),
            rad: 1.0,
        });
    }
    let mut shallow = options(1);
    shallow.depth = 0;
    let mut deep = options(1);
    deep.depth = 2;
    assert_ne!(render_pixels(&desc, shallow), render_pixels(&desc, deep));
}

#[test]
fn constructive_subtraction_renders() {
    // a cylinder minus the outer space of a sphere: only the band inside
    // the sphere survives
    let camera = ObjectDesc::with_trm(
        at([0.0, 0.0, -5.0]),
        Body::Camera(CameraDesc::default()),
    );
    let light = ObjectDesc::with_trm(at([0.0, 3.0, -4.0]), Body::Light(LightDesc::default()));
    let sphere = ObjectDesc::new(Body::Sphere {
        srf: SurfaceDesc::unbounded(mat(0x0080_8080)),
        rad: 1.0,
    });
    let cylinder = ObjectDesc::new(Body::Cylinder {
        srf: SurfaceDesc::unbounded(mat(0x00C0_C040))
            .clipped([-INF, -INF, -4.0], [INF, INF, 4.0]),
        rad: 0.5,
    });
    let desc = SceneDesc {
        root: ObjectDesc::new(Body::Array {
            children: vec![camera, light, sphere, cylinder],
            // the cylinder is child 3, the sphere child 2
            relations: vec![Relation::new(3, RelKind::MinusOuter, 2)],
        }),
    };
    let mut scene = Scene::new(&desc, XRES, YRES, options(1)).unwrap();
    scene.render(0).unwrap();
    // deterministic across repeated renders of the carved scene
    let a = scene.get_frame();
    scene.render(0).unwrap();
    assert_eq!(a, scene.get_frame());
}

#[test]
fn hyperboloid_mutual_subtraction_renders() {
    let camera = ObjectDesc::with_trm(
        at([0.0, 0.0, -6.0]),
        Body::Camera(CameraDesc::default()),
    );
    let light = ObjectDesc::with_trm(at([0.0, 2.0, -5.0]), Body::Light(LightDesc::default()));
    let hyp = |pos: [f32; 3], col: u32| {
        ObjectDesc::with_trm(
            at(pos),
            Body::Hyperboloid {
                srf: SurfaceDesc::unbounded(mat(col))
                    .clipped([-INF, -INF, -1.5], [INF, INF, 1.5]),
                rat: 0.6,
                hyp: 0.5,
            },
        )
    };
    let desc = SceneDesc {
        root: ObjectDesc::new(Body::Array {
            children: vec![camera, light, hyp([-0.5, 0.0, 0.0], 0x00C0_4040), hyp([0.5, 0.0, 0.0], 0x0040_C040)],
            relations: vec![
                Relation::new(3, RelKind::MinusOuter, 2),
                Relation::new(2, RelKind::MinusInner, 3),
            ],
        }),
    };
    let a = render_pixels(&desc, options(1));
    let b = render_pixels(&desc, options(2));
    assert_eq!(a, b);
    assert!(a.iter().any(|&p| p != a[0]), "nothing rendered");
}

#[test]
fn camera_actions_move_the_view() {
    let desc = demo_scene();
    let mut scene = Scene::new(&desc, XRES, YRES, options(1)).unwrap();
    scene.render(0).unwrap();
    let before = scene.get_frame();
    scene.update(50, CameraAction::MoveRight);
    scene.render(50).unwrap();
    assert_ne!(before, scene.get_frame());
}

#[test]
fn next_cam_cycles() {
    let mut desc = demo_scene();
    if let Body::Array { children, .. } = &mut desc.root.body {
        children.push(ObjectDesc::with_trm(
            at([0.0, 0.0, 8.0]),
            Body::Camera(CameraDesc {
                // the second camera looks at the scene from behind
                ..CameraDesc::default()
            }),
        ));
    }
    let mut scene = Scene::new(&desc, XRES, YRES, options(1)).unwrap();
    scene.render(0).unwrap();
    let front = scene.get_frame();
    scene.next_cam();
    scene.render(1).unwrap();
    let back = scene.get_frame();
    assert_ne!(front, back);
    scene.next_cam();
    scene.render(2).unwrap();
    assert_eq!(scene.get_frame(), front);
}

#[test]
fn save_frame_matches_framebuffer() {
    let desc = demo_scene();
    let mut scene = Scene::new(&desc, XRES, YRES, options(1)).unwrap();
    scene.render(0).unwrap();
    let path = scene.save_frame(7).unwrap();
    let img = image::open(&path).unwrap().to_rgb8();
    let frame = scene.get_frame();
    let stride = scene.row_stride();
    for y in 0..YRES {
        for x in 0..XRES {
            let v = frame[y as usize * stride + x as usize];
            let px = img.get_pixel(x, y).0;
            assert_eq!(px, [(v >> 16) as u8, (v >> 8) as u8, v as u8]);
        }
    }
    let _ = std::fs::remove_file(path);
}
