//! Built-in demo scenes.

use std::sync::Arc;

use lumen_math::{Real, Transform3d, INF};
use lumen_scene::{
    AnimFn, Body, CameraDesc, LightDesc, MaterialDesc, MaterialKind, ObjectDesc, RelKind,
    Relation, SceneDesc, SideDesc, SurfaceDesc, TextureDesc,
};

fn at(pos: [Real; 3]) -> Transform3d {
    Transform3d {
        scl: [1.0; 3],
        rot: [0.0; 3],
        pos,
    }
}

fn at_rot(pos: [Real; 3], rot: [Real; 3]) -> Transform3d {
    Transform3d {
        scl: [1.0; 3],
        rot,
        pos,
    }
}

/// 8x8 two-tone checker texture.
fn checker(a: u32, b: u32) -> TextureDesc {
    let mut pixels = Vec::with_capacity(64);
    for y in 0..8u32 {
        for x in 0..8u32 {
            pixels.push(if (x + y) % 2 == 0 { a } else { b });
        }
    }
    TextureDesc::Image {
        name: format!("checker-{a:06x}-{b:06x}"),
        width: 8,
        height: 8,
        pixels: Arc::new(pixels),
    }
}

fn tiled_floor() -> ObjectDesc {
    let mut mat = MaterialDesc::plain(0);
    mat.tex = checker(0x00D0_D0D0, 0x0030_3030);
    let mat = Arc::new(mat);
    let mut side = SideDesc::new(mat.clone());
    side.scl = [2.0, 2.0];
    ObjectDesc::with_trm(
        at([0.0, 0.0, -1.5]),
        Body::Plane(SurfaceDesc {
            cmin: [-12.0, -12.0, -INF],
            cmax: [12.0, 12.0, INF],
            outer: side.clone(),
            inner: side,
        }),
    )
}

fn bulb(pos: [Real; 3], color: u32) -> Vec<ObjectDesc> {
    let light = ObjectDesc::with_trm(
        at(pos),
        Body::Light(LightDesc {
            col: color,
            lum_ambient: 0.05,
            lum_source: 1.0,
            atn: [0.0, 0.0, 0.05, 0.004],
        }),
    );
    let shell = ObjectDesc::with_trm(
        at(pos),
        Body::Sphere {
            srf: SurfaceDesc::unbounded(Arc::new(MaterialDesc::light(color))),
            rad: 0.15,
        },
    );
    vec![light, shell]
}

fn camera(pos: [Real; 3], rot: [Real; 3]) -> ObjectDesc {
    ObjectDesc::with_trm(
        at_rot(pos, rot),
        Body::Camera(CameraDesc {
            col: 0x0018_1820,
            lum: 1.0,
            pov: 1.0,
            dps: [2.0, 2.0, 2.0],
            drt: [70.0, 70.0, 0.0],
        }),
    )
}

/// Demo 0: checker floor, an orbiting shaded sphere, a metal sphere and
/// two colored bulbs.
fn demo_spheres() -> SceneDesc {
    let orbit: AnimFn = Arc::new(|time, _prev, trm: &mut Transform3d| {
        let a = time as Real * 0.001;
        trm.pos[0] = 1.8 * a.cos();
        trm.pos[1] = 1.8 * a.sin();
    });
    let red = ObjectDesc::with_trm(
        at([1.8, 0.0, 0.0]),
        Body::Sphere {
            srf: SurfaceDesc::unbounded(Arc::new(MaterialDesc {
                spc: 0.6,
                pow: 16.0,
                ..MaterialDesc::plain(0x00C0_3030)
            })),
            rad: 0.8,
        },
    )
    .animated(orbit);
    let mirror = ObjectDesc::with_trm(
        at([-1.2, 0.8, 0.0]),
        Body::Sphere {
            srf: SurfaceDesc::unbounded(Arc::new(MaterialDesc::metal(0x00A0_A0B0, 0.5))),
            rad: 1.0,
        },
    );

    let mut children = vec![
        camera([0.0, -6.0, 1.5], [-100.0, 0.0, 0.0]),
        tiled_floor(),
        red,
        mirror,
    ];
    children.extend(bulb([3.0, -2.0, 2.5], 0x00FF_F0C0));
    children.extend(bulb([-3.0, -1.0, 2.0], 0x00C0_D0FF));

    SceneDesc {
        root: ObjectDesc::new(Body::Array {
            children,
            relations: vec![],
        }),
    }
}

/// Demo 1: constructive subtraction — a cylinder carved to the band
/// inside a sphere, and two hyperboloids with mutual carve-outs, over
/// the checker floor.
fn demo_csg() -> SceneDesc {
    let sphere = ObjectDesc::new(Body::Sphere {
        srf: SurfaceDesc::unbounded(Arc::new(MaterialDesc {
            kind: MaterialKind::Metal,
            spc: 0.8,
            pow: 24.0,
            rfl: 0.25,
            ..MaterialDesc::plain(0x0040_C0C0)
        })),
        rad: 1.0,
    });
    let tube = ObjectDesc::new(Body::Cylinder {
        srf: SurfaceDesc::unbounded(Arc::new(MaterialDesc::plain(0x00C0_C040)))
            .clipped([-INF, -INF, -4.5], [INF, INF, 4.5]),
        rad: 1.5,
    });

    let hyp = |pos: [Real; 3], col: u32| {
        ObjectDesc::with_trm(
            at(pos),
            Body::Hyperboloid {
                srf: SurfaceDesc::unbounded(Arc::new(MaterialDesc::plain(col)))
                    .clipped([-INF, -INF, -1.2], [INF, INF, 1.2]),
                rat: 0.7,
                hyp: 0.4,
            },
        )
    };

    let mut children = vec![
        camera([2.0, -6.0, 2.0], [-100.0, 0.0, 20.0]),
        tiled_floor(),
        sphere,
        tube,
        hyp([3.0, 1.0, 0.0], 0x00C0_60C0),
        hyp([3.8, 1.0, 0.0], 0x0060_C060),
    ];
    children.extend(bulb([0.0, -3.0, 3.0], 0x00FF_FFFF));

    SceneDesc {
        root: ObjectDesc::new(Body::Array {
            children,
            // the tube keeps what lies inside the sphere; the two
            // hyperboloids carve each other
            relations: vec![
                Relation::new(3, RelKind::MinusOuter, 2),
                Relation::new(5, RelKind::MinusOuter, 4),
                Relation::new(4, RelKind::MinusInner, 5),
            ],
        }),
    }
}

/// Demo 2: a paraboloid dish and a cone under one warm bulb.
fn demo_quadrics() -> SceneDesc {
    let dish = ObjectDesc::with_trm(
        at([-1.5, 0.5, -1.0]),
        Body::Paraboloid {
            srf: SurfaceDesc::unbounded(Arc::new(MaterialDesc {
                spc: 0.4,
                pow: 8.0,
                ..MaterialDesc::plain(0x0060_80C0)
            }))
            .clipped([-INF, -INF, 0.0], [INF, INF, 2.0]),
            par: 1.2,
        },
    );
    let cone = ObjectDesc::with_trm(
        at([1.5, 0.0, 0.5]),
        Body::Cone {
            srf: SurfaceDesc::unbounded(Arc::new(MaterialDesc::plain(0x00C0_8040)))
                .clipped([-INF, -INF, -2.0], [INF, INF, 0.0]),
            rat: 0.6,
        },
    );
    let mut children = vec![
        camera([0.0, -7.0, 2.0], [-100.0, 0.0, 0.0]),
        tiled_floor(),
        dish,
        cone,
    ];
    children.extend(bulb([2.0, -3.0, 3.5], 0x00FF_E8C0));
    SceneDesc {
        root: ObjectDesc::new(Body::Array {
            children,
            relations: vec![],
        }),
    }
}

/// Demo scene by index; unknown indices wrap around.
pub fn demo(index: usize) -> SceneDesc {
    match index % 3 {
        0 => demo_spheres(),
        1 => demo_csg(),
        _ => demo_quadrics(),
    }
}

/// Number of built-in demos.
pub const DEMO_COUNT: usize = 3;
